pub mod classify;
pub mod fixed_point;
pub mod format;

pub use classify::{classify, parse_outcome_symbol};
pub use fixed_point::FixedDecimal;
pub use format::{enrich_batch, format_trade, UNRESOLVED_SYMBOL};
