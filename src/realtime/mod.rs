//! In-memory trade dataset with idempotent push merging
//!
//! - INSERT only lands if the identity key is new
//! - UPDATE / DELETE are no-ops for unknown keys
//! - Newest-first order is restored after every insert
//! - Snapshots merge into local state unless they are strictly larger

use serde::Serialize;
use std::collections::HashSet;
use tracing::debug;

use crate::enrich::{classify, format_trade};
use crate::error::TradeError;
use crate::models::{FormattedTrade, IdentityKey, PushEvent, SymbolMap};

/// A push event after enrichment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TradeChange {
    Insert(FormattedTrade),
    Update(FormattedTrade),
    Delete(IdentityKey),
}

impl TradeChange {
    /// Enriches the trade carried by `event` with already-resolved symbols.
    pub fn from_push(
        event: &PushEvent,
        symbols: &SymbolMap,
        base_currency: &str,
    ) -> Result<Self, TradeError> {
        Ok(match event {
            PushEvent::Insert { trade } => {
                TradeChange::Insert(format_trade(&classify(trade, symbols, base_currency)?))
            }
            PushEvent::Update { trade } => {
                TradeChange::Update(format_trade(&classify(trade, symbols, base_currency)?))
            }
            PushEvent::Delete { key, .. } => TradeChange::Delete(key.clone()),
        })
    }

    pub fn key(&self) -> IdentityKey {
        match self {
            TradeChange::Insert(t) | TradeChange::Update(t) => t.identity_key(),
            TradeChange::Delete(key) => key.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    Inserted,
    Updated,
    Removed,
    /// Duplicate insert, or update/delete of an unknown key.
    Ignored,
}

impl MergeOutcome {
    pub fn changed(self) -> bool {
        !matches!(self, MergeOutcome::Ignored)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ReconcileOutcome {
    /// Snapshot was larger than local state and replaced it.
    Replaced { len: usize },
    /// Only keys missing locally were added.
    Merged { added: usize },
}

#[derive(Debug, Clone, Default)]
pub struct TradeDataset {
    trades: Vec<FormattedTrade>,
    keys: HashSet<IdentityKey>,
}

impl TradeDataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dataset from a bulk load. Later duplicates of a key are dropped.
    pub fn from_trades(trades: Vec<FormattedTrade>) -> Self {
        let mut dataset = Self::new();
        dataset.replace(trades);
        dataset
    }

    pub fn trades(&self) -> &[FormattedTrade] {
        &self.trades
    }

    pub fn to_vec(&self) -> Vec<FormattedTrade> {
        self.trades.clone()
    }

    pub fn len(&self) -> usize {
        self.trades.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trades.is_empty()
    }

    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.keys.contains(key)
    }

    pub fn clear(&mut self) {
        self.trades.clear();
        self.keys.clear();
    }

    pub fn apply(&mut self, change: TradeChange) -> MergeOutcome {
        let outcome = match change {
            TradeChange::Insert(trade) => self.insert(trade),
            TradeChange::Update(trade) => self.update(trade),
            TradeChange::Delete(key) => self.remove(&key),
        };
        debug_assert_eq!(self.keys.len(), self.trades.len());
        outcome
    }

    /// Full snapshot from the store.
    pub fn reconcile(&mut self, bulk: Vec<FormattedTrade>) -> ReconcileOutcome {
        if bulk.len() > self.trades.len() {
            self.replace(bulk);
            return ReconcileOutcome::Replaced {
                len: self.trades.len(),
            };
        }

        let mut added = 0;
        for trade in bulk {
            let key = trade.identity_key();
            if self.keys.insert(key) {
                self.trades.push(trade);
                added += 1;
            }
        }
        if added > 0 {
            self.sort();
        }
        debug!(added, total = self.trades.len(), "snapshot_merged");
        ReconcileOutcome::Merged { added }
    }

    fn insert(&mut self, trade: FormattedTrade) -> MergeOutcome {
        let key = trade.identity_key();
        if !self.keys.insert(key.clone()) {
            debug!(key = %key, "duplicate_insert_ignored");
            return MergeOutcome::Ignored;
        }
        self.trades.insert(0, trade);
        self.sort();
        MergeOutcome::Inserted
    }

    fn update(&mut self, trade: FormattedTrade) -> MergeOutcome {
        let key = trade.identity_key();
        let Some(pos) = self.position(&key) else {
            debug!(key = %key, "update_for_unknown_trade");
            return MergeOutcome::Ignored;
        };
        let resort = self.trades[pos].timestamp != trade.timestamp;
        self.trades[pos] = trade;
        if resort {
            self.sort();
        }
        MergeOutcome::Updated
    }

    fn remove(&mut self, key: &IdentityKey) -> MergeOutcome {
        if !self.keys.remove(key) {
            return MergeOutcome::Ignored;
        }
        self.trades.retain(|t| &t.identity_key() != key);
        MergeOutcome::Removed
    }

    fn replace(&mut self, trades: Vec<FormattedTrade>) {
        self.clear();
        for trade in trades {
            if self.keys.insert(trade.identity_key()) {
                self.trades.push(trade);
            }
        }
        self.sort();
    }

    fn position(&self, key: &IdentityKey) -> Option<usize> {
        if !self.keys.contains(key) {
            return None;
        }
        self.trades.iter().position(|t| &t.identity_key() == key)
    }

    // Stable, so equal timestamps keep arrival order.
    fn sort(&mut self) {
        self.trades.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    }
}
