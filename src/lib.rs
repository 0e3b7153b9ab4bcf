//! Futarchy trade-history sync engine
//!
//! Resolves token symbols (static market config first, chain RPC with endpoint
//! rotation as fallback), enriches a wallet's raw swaps into display-ready
//! trades, and keeps them in sync through the store's push feed plus polling.

pub mod cache;
pub mod config;
pub mod enrich;
pub mod error;
pub mod metadata;
pub mod models;
pub mod pipeline;
pub mod realtime;
pub mod rpc;
pub mod store;

pub use config::EngineConfig;
pub use error::{FetchError, RpcError, TradeError};
pub use pipeline::{PipelineState, SyncServices, TradeHistoryPipeline, TradeLoader, TradeView};
