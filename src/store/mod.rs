//! Persisted trade store with a per-user change feed
//!
//! Key points:
//! - `trades` table keyed by (tx_hash, event_id), indexed by user and block time
//! - Writes publish a `PushEvent` on a broadcast channel after the row changes
//! - Subscribers see only their wallet's events, plus a lag marker when the
//!   channel dropped events they never received

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::models::{normalize_address, IdentityKey, PushEvent, RawTrade};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS trades (
    tx_hash TEXT NOT NULL,
    event_id INTEGER NOT NULL,
    user_address TEXT NOT NULL,
    pool_address TEXT NOT NULL,
    token0 TEXT NOT NULL,
    token1 TEXT NOT NULL,
    amount0 TEXT NOT NULL,
    amount1 TEXT NOT NULL,
    block_timestamp INTEGER NOT NULL,
    PRIMARY KEY (tx_hash, event_id)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_trades_user_time
    ON trades(user_address, block_timestamp DESC);

CREATE INDEX IF NOT EXISTS idx_trades_time
    ON trades(block_timestamp DESC);
"#;

const TRADE_COLUMNS: &str = "tx_hash, event_id, user_address, pool_address, token0, token1, \
                             amount0, amount1, block_timestamp";

pub const DEFAULT_FEED_CAPACITY: usize = 1024;

/// Message delivered to a [`TradeSubscription`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedMessage {
    Change(PushEvent),
    /// Events were dropped before this subscriber read them.
    Lagged(u64),
}

/// Change feed filtered to one wallet.
pub struct TradeSubscription {
    user_address: String,
    rx: broadcast::Receiver<PushEvent>,
}

impl TradeSubscription {
    pub fn new(user_address: &str, rx: broadcast::Receiver<PushEvent>) -> Self {
        Self {
            user_address: normalize_address(user_address),
            rx,
        }
    }

    pub fn user_address(&self) -> &str {
        &self.user_address
    }

    /// Next event for this wallet. `None` once the store is gone.
    pub async fn recv(&mut self) -> Option<FeedMessage> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if normalize_address(event.user_address()) == self.user_address {
                        return Some(FeedMessage::Change(event));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(user = %self.user_address, skipped, "trade_feed_lagged");
                    return Some(FeedMessage::Lagged(skipped));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
pub trait TradeStore: Send + Sync {
    /// Every trade for `user_address`, newest first.
    async fn query(&self, user_address: &str) -> Result<Vec<RawTrade>>;

    fn subscribe(&self, user_address: &str) -> TradeSubscription;
}

pub struct SqliteTradeStore {
    conn: Arc<Mutex<Connection>>,
    feed: broadcast::Sender<PushEvent>,
}

impl SqliteTradeStore {
    pub fn open(db_path: &str) -> Result<Self> {
        Self::open_with_capacity(db_path, DEFAULT_FEED_CAPACITY)
    }

    pub fn in_memory() -> Result<Self> {
        Self::open_with_capacity(":memory:", DEFAULT_FEED_CAPACITY)
    }

    pub fn open_with_capacity(db_path: &str, feed_capacity: usize) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open trade store at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize trade store schema")?;

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM trades", [], |row| row.get(0))
            .unwrap_or(0);
        info!("📊 Trade store ready at {} ({} trades)", db_path, count);

        let (feed, _) = broadcast::channel(feed_capacity.max(1));
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            feed,
        })
    }

    /// Inserts `trade`; returns false if its identity key already exists.
    pub fn insert(&self, trade: &RawTrade) -> Result<bool> {
        let trade = normalized(trade)?;
        let changes = {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT OR IGNORE INTO trades
                 (tx_hash, event_id, user_address, pool_address, token0, token1,
                  amount0, amount1, block_timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    &trade.tx_hash,
                    trade.event_id,
                    &trade.user_address,
                    &trade.pool_address,
                    &trade.token0,
                    &trade.token1,
                    &trade.amount0,
                    &trade.amount1,
                    trade.block_timestamp,
                ],
            )?
        };

        if changes == 0 {
            debug!(tx_hash = %trade.tx_hash, event_id = trade.event_id, "trade_already_stored");
            return Ok(false);
        }
        self.publish(PushEvent::Insert { trade });
        Ok(true)
    }

    /// Inserts every trade in one transaction. Returns how many were new.
    pub fn insert_batch(&self, trades: &[RawTrade]) -> Result<usize> {
        let normalized: Vec<RawTrade> = trades.iter().map(normalized).collect::<Result<_>>()?;
        let mut inserted = Vec::with_capacity(normalized.len());
        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT OR IGNORE INTO trades
                     (tx_hash, event_id, user_address, pool_address, token0, token1,
                      amount0, amount1, block_timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                )?;
                for trade in normalized {
                    let changes = stmt.execute(params![
                        &trade.tx_hash,
                        trade.event_id,
                        &trade.user_address,
                        &trade.pool_address,
                        &trade.token0,
                        &trade.token1,
                        &trade.amount0,
                        &trade.amount1,
                        trade.block_timestamp,
                    ])?;
                    if changes > 0 {
                        inserted.push(trade);
                    }
                }
            }
            tx.commit()?;
        }

        let count = inserted.len();
        for trade in inserted {
            self.publish(PushEvent::Insert { trade });
        }
        Ok(count)
    }

    /// Overwrites the stored trade with the same identity key.
    pub fn update(&self, trade: &RawTrade) -> Result<bool> {
        let trade = normalized(trade)?;
        let changes = {
            let conn = self.conn.lock();
            conn.execute(
                "UPDATE trades SET user_address = ?3, pool_address = ?4, token0 = ?5,
                 token1 = ?6, amount0 = ?7, amount1 = ?8, block_timestamp = ?9
                 WHERE tx_hash = ?1 AND event_id = ?2",
                params![
                    &trade.tx_hash,
                    trade.event_id,
                    &trade.user_address,
                    &trade.pool_address,
                    &trade.token0,
                    &trade.token1,
                    &trade.amount0,
                    &trade.amount1,
                    trade.block_timestamp,
                ],
            )?
        };

        if changes == 0 {
            return Ok(false);
        }
        self.publish(PushEvent::Update { trade });
        Ok(true)
    }

    pub fn delete(&self, key: &IdentityKey) -> Result<bool> {
        let user_address = {
            let conn = self.conn.lock();
            let user: Option<String> = conn
                .query_row(
                    "SELECT user_address FROM trades WHERE tx_hash = ?1 AND event_id = ?2",
                    params![&key.tx_hash, key.event_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(user) = user else {
                return Ok(false);
            };
            conn.execute(
                "DELETE FROM trades WHERE tx_hash = ?1 AND event_id = ?2",
                params![&key.tx_hash, key.event_id],
            )?;
            user
        };

        self.publish(PushEvent::Delete {
            key: key.clone(),
            user_address,
        });
        Ok(true)
    }

    pub fn count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM trades", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn publish(&self, event: PushEvent) {
        // No receivers is fine: nobody is watching this wallet.
        if self.feed.send(event).is_err() {
            debug!("trade_feed_no_subscribers");
        }
    }

    fn query_sync(&self, user_address: &str) -> Result<Vec<RawTrade>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM trades WHERE user_address = ?1
             ORDER BY block_timestamp DESC, tx_hash ASC, event_id ASC",
            TRADE_COLUMNS
        ))?;
        let rows = stmt.query_map(params![normalize_address(user_address)], row_to_trade)?;
        let trades = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(trades)
    }
}

#[async_trait]
impl TradeStore for SqliteTradeStore {
    async fn query(&self, user_address: &str) -> Result<Vec<RawTrade>> {
        self.query_sync(user_address)
            .with_context(|| format!("Failed to query trades for {}", user_address))
    }

    fn subscribe(&self, user_address: &str) -> TradeSubscription {
        TradeSubscription::new(user_address, self.feed.subscribe())
    }
}

fn normalized(trade: &RawTrade) -> Result<RawTrade> {
    let key = trade.identity_key()?;
    Ok(RawTrade {
        tx_hash: key.tx_hash,
        user_address: normalize_address(&trade.user_address),
        pool_address: normalize_address(&trade.pool_address),
        token0: normalize_address(&trade.token0),
        token1: normalize_address(&trade.token1),
        ..trade.clone()
    })
}

fn row_to_trade(row: &Row<'_>) -> rusqlite::Result<RawTrade> {
    Ok(RawTrade {
        tx_hash: row.get(0)?,
        event_id: row.get(1)?,
        user_address: row.get(2)?,
        pool_address: row.get(3)?,
        token0: row.get(4)?,
        token1: row.get(5)?,
        amount0: row.get(6)?,
        amount1: row.get(7)?,
        block_timestamp: row.get(8)?,
    })
}
