use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::enrich::fixed_point::FixedDecimal;
use crate::error::TradeError;

/// Resolved symbols keyed by normalized token address. `None` = unresolved.
pub type SymbolMap = HashMap<String, Option<String>>;

/// Lower-cased, trimmed token or wallet address.
#[inline]
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

/// `0x` followed by 40 hex digits.
pub fn is_valid_address(address: &str) -> bool {
    let Some(hex_part) = address.strip_prefix("0x") else {
        return false;
    };
    hex_part.len() == 40 && hex_part.chars().all(|c| c.is_ascii_hexdigit())
}

/// (txHash, eventId) pair. Unique within a merged dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentityKey {
    pub tx_hash: String,
    pub event_id: i64,
}

impl IdentityKey {
    pub fn new(tx_hash: &str, event_id: i64) -> Self {
        Self {
            tx_hash: tx_hash.trim().to_lowercase(),
            event_id,
        }
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.tx_hash, self.event_id)
    }
}

/// Swap record as persisted by the trade store. Amounts are the user's signed
/// balance deltas as decimal strings (negative = tokens left the wallet).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTrade {
    pub event_id: i64,
    pub user_address: String,
    pub pool_address: String,
    pub token0: String,
    pub token1: String,
    pub amount0: String,
    pub amount1: String,
    pub block_timestamp: i64,
    pub tx_hash: String,
}

impl RawTrade {
    pub fn identity_key(&self) -> Result<IdentityKey, TradeError> {
        if self.tx_hash.trim().is_empty() || self.event_id < 0 {
            return Err(TradeError::MissingIdentity {
                tx_hash: self.tx_hash.clone(),
                event_id: self.event_id,
            });
        }
        Ok(IdentityKey::new(&self.tx_hash, self.event_id))
    }

    pub fn token_addresses(&self) -> [String; 2] {
        [
            normalize_address(&self.token0),
            normalize_address(&self.token1),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolType {
    YesPool,
    NoPool,
    UnknownPool,
}

impl PoolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolType::YesPool => "YES_POOL",
            PoolType::NoPool => "NO_POOL",
            PoolType::UnknownPool => "UNKNOWN_POOL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MarketCategory {
    Conditional,
    Prediction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Yes,
    No,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

/// Which of the pool's two tokens a role refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenSlot {
    Token0,
    Token1,
}

impl TokenSlot {
    pub fn other(self) -> Self {
        match self {
            TokenSlot::Token0 => TokenSlot::Token1,
            TokenSlot::Token1 => TokenSlot::Token0,
        }
    }
}

/// Delta patterns that do not look like a swap. Flagged, never relabelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeAnomaly {
    /// Both balances decreased (e.g. liquidity deposit).
    BothOutflow,
    /// Both balances increased (e.g. liquidity withdrawal).
    BothInflow,
    /// At least one side did not move.
    ZeroDelta,
}

/// Raw trade plus everything derived from resolved symbols.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichedTrade {
    pub raw: RawTrade,
    pub key: IdentityKey,
    pub token0_symbol: Option<String>,
    pub token1_symbol: Option<String>,
    pub amount0: FixedDecimal,
    pub amount1: FixedDecimal,
    pub pool_type: PoolType,
    pub market_category: MarketCategory,
    pub primary: TokenSlot,
    pub outcome: Outcome,
    pub side: TradeSide,
    pub price: FixedDecimal,
    pub anomaly: Option<TradeAnomaly>,
}

impl EnrichedTrade {
    pub fn symbol(&self, slot: TokenSlot) -> Option<&str> {
        match slot {
            TokenSlot::Token0 => self.token0_symbol.as_deref(),
            TokenSlot::Token1 => self.token1_symbol.as_deref(),
        }
    }

    pub fn amount(&self, slot: TokenSlot) -> &FixedDecimal {
        match slot {
            TokenSlot::Token0 => &self.amount0,
            TokenSlot::Token1 => &self.amount1,
        }
    }
}

/// One side of a trade as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeLeg {
    pub token: String,
    pub symbol: String,
    pub amount: FixedDecimal,
}

/// Display-ready projection handed to the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattedTrade {
    pub outcome: Outcome,
    pub side: TradeSide,
    pub price: FixedDecimal,
    /// Outflows, token0 first. Two entries only on a flagged trade.
    pub sent: Vec<TradeLeg>,
    /// Inflows, token0 first. Two entries only on a flagged trade.
    pub received: Vec<TradeLeg>,
    pub pool_type: PoolType,
    pub market_category: MarketCategory,
    pub pool_address: String,
    pub timestamp: i64,
    pub tx_hash: String,
    pub event_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anomaly: Option<TradeAnomaly>,
}

impl FormattedTrade {
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey::new(&self.tx_hash, self.event_id)
    }

    pub fn executed_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.timestamp, 0).single()
    }
}

/// Change delivered by the store's push feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "UPPERCASE")]
pub enum PushEvent {
    Insert { trade: RawTrade },
    Update { trade: RawTrade },
    Delete { key: IdentityKey, user_address: String },
}

impl PushEvent {
    pub fn user_address(&self) -> &str {
        match self {
            PushEvent::Insert { trade } | PushEvent::Update { trade } => &trade.user_address,
            PushEvent::Delete { user_address, .. } => user_address,
        }
    }
}
