//! Token metadata: static market config, retry policy and symbol resolution

pub mod market_config;
pub mod resolver;
pub mod retry;

pub use market_config::{MarketConfig, SchemaVersion};
pub use resolver::{ResolverStatsSnapshot, SymbolResolver};
pub use retry::RetryPolicy;
