//! Error taxonomy for the sync engine.
//!
//! Resolution and enrichment failures are degraded locally (a missing symbol
//! renders as "N/A"); only store-level failures surface to the pipeline.

use std::sync::Arc;
use thiserror::Error;

/// Failure talking to a chain RPC endpoint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("rate limited by {endpoint}")]
    RateLimited { endpoint: String },

    #[error("transient failure at {endpoint}: {reason}")]
    Transient { endpoint: String, reason: String },

    #[error("permanent failure at {endpoint}: {reason}")]
    Permanent { endpoint: String, reason: String },

    #[error("invalid token address: {0}")]
    InvalidAddress(String),
}

impl RpcError {
    /// Retrying against another endpoint may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RpcError::RateLimited { .. } | RpcError::Transient { .. })
    }

    /// The endpoint should sit out a cooldown window.
    pub fn triggers_cooldown(&self) -> bool {
        self.is_retryable()
    }
}

/// Per-record failures. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TradeError {
    #[error("trade is missing identity fields (tx_hash={tx_hash:?}, event_id={event_id})")]
    MissingIdentity { tx_hash: String, event_id: i64 },

    #[error("invalid amount {value:?}: {reason}")]
    InvalidAmount { value: String, reason: &'static str },
}

/// Failure of a deduplicated fetch, shared by every caller that awaited it.
#[derive(Error, Debug, Clone)]
#[error("{0:#}")]
pub struct FetchError(Arc<anyhow::Error>);

impl FetchError {
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl From<anyhow::Error> for FetchError {
    fn from(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }
}
