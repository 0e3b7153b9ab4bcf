//! End-to-end wallet sync against a file-backed SQLite store and a scripted
//! chain RPC.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use futarchy_sync::config::EngineConfig;
use futarchy_sync::enrich::UNRESOLVED_SYMBOL;
use futarchy_sync::models::{MarketCategory, PoolType, RawTrade, TradeSide};
use futarchy_sync::rpc::{ChainRpc, Endpoint};
use futarchy_sync::store::SqliteTradeStore;
use futarchy_sync::{
    PipelineState, RpcError, SyncServices, TradeHistoryPipeline, TradeLoader, TradeView,
};

const WALLET: &str = "0x7777777777777777777777777777777777777777";
const YES_GNO: &str = "0x1000000000000000000000000000000000000001";
const SDAI: &str = "0x1000000000000000000000000000000000000003";
const MYSTERY: &str = "0x1000000000000000000000000000000000000009";

/// Answers `symbol()` from a fixed table; unknown tokens revert.
struct ScriptedRpc {
    symbols: HashMap<String, String>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRpc {
    fn new() -> Self {
        let symbols = [(YES_GNO, "YES_GNO"), (SDAI, "sDAI")]
            .into_iter()
            .map(|(a, s)| (a.to_string(), s.to_string()))
            .collect();
        Self {
            symbols,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl ChainRpc for ScriptedRpc {
    async fn token_symbol(
        &self,
        endpoint: &Endpoint,
        token_address: &str,
    ) -> Result<String, RpcError> {
        self.calls.lock().push(token_address.to_string());
        self.symbols
            .get(token_address)
            .cloned()
            .ok_or_else(|| RpcError::Permanent {
                endpoint: endpoint.url.clone(),
                reason: "execution reverted".into(),
            })
    }
}

fn trade(tx: &str, token1: &str, amount0: &str, amount1: &str, ts: i64) -> RawTrade {
    RawTrade {
        event_id: 1,
        user_address: WALLET.into(),
        pool_address: "0x5000000000000000000000000000000000000001".into(),
        token0: YES_GNO.into(),
        token1: token1.into(),
        amount0: amount0.into(),
        amount1: amount1.into(),
        block_timestamp: ts,
        tx_hash: tx.into(),
    }
}

struct Harness {
    _dir: TempDir,
    store: Arc<SqliteTradeStore>,
    rpc: Arc<ScriptedRpc>,
    services: SyncServices,
    config: EngineConfig,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("trades.db");
        let store = Arc::new(SqliteTradeStore::open(db.to_str().unwrap()).unwrap());
        let rpc = Arc::new(ScriptedRpc::new());

        let mut config = EngineConfig::default();
        config.rpc.endpoints = vec!["https://rpc-a.test".into(), "https://rpc-b.test".into()];
        let services = SyncServices::new(&config, rpc.clone(), None).unwrap();

        Self {
            _dir: dir,
            store,
            rpc,
            services,
            config,
        }
    }

    fn pipeline(&self) -> TradeHistoryPipeline {
        let loader = TradeLoader::new(self.store.clone(), self.services.clone());
        TradeHistoryPipeline::new(loader, self.config.pipeline.clone())
    }
}

async fn wait_for(
    pipeline: &TradeHistoryPipeline,
    check: impl FnMut(&TradeView) -> bool,
) -> TradeView {
    let mut rx = pipeline.subscribe();
    let view = tokio::time::timeout(Duration::from_secs(120), rx.wait_for(check))
        .await
        .expect("timed out waiting for view")
        .expect("view channel closed")
        .clone();
    view
}

#[tokio::test(start_paused = true)]
async fn test_wallet_sync_end_to_end() {
    let h = Harness::new();
    h.store
        .insert_batch(&[
            trade("0xt1", SDAI, "100", "-250", 50),
            trade("0xt2", SDAI, "-40", "90", 100),
        ])
        .unwrap();

    let pipeline = h.pipeline();
    pipeline.connect(WALLET).unwrap();
    let view = wait_for(&pipeline, |v| v.state == PipelineState::Ready).await;

    assert_eq!(view.trades.len(), 2);
    let buy = &view.trades[1];
    assert_eq!(buy.tx_hash, "0xt1");
    assert_eq!(buy.side, TradeSide::Buy);
    assert_eq!(buy.price.to_string_fixed(2), "2.50");
    assert_eq!(buy.pool_type, PoolType::YesPool);
    assert_eq!(buy.market_category, MarketCategory::Prediction);
    assert_eq!(buy.sent[0].symbol, "sDAI");
    assert_eq!(buy.received[0].symbol, "YES_GNO");
    assert_eq!(view.trades[0].side, TradeSide::Sell);
    assert_eq!(h.rpc.calls(), 2);

    // push insert lands between the two, using cached symbols
    h.store
        .insert(&trade("0xt3", SDAI, "10", "-5", 75))
        .unwrap();
    let view = wait_for(&pipeline, |v| v.trades.len() == 3).await;
    let stamps: Vec<i64> = view.trades.iter().map(|t| t.timestamp).collect();
    assert_eq!(stamps, vec![100, 75, 50]);
    assert_eq!(h.rpc.calls(), 2);

    pipeline.disconnect();
    assert_eq!(pipeline.state(), PipelineState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_unresolved_symbol_degrades_to_placeholder() {
    let h = Harness::new();
    h.store
        .insert(&trade("0xt1", MYSTERY, "100", "-1", 10))
        .unwrap();

    let pipeline = h.pipeline();
    pipeline.connect(WALLET).unwrap();
    let view = wait_for(&pipeline, |v| v.state == PipelineState::Ready).await;

    let t = &view.trades[0];
    assert_eq!(t.sent[0].symbol, UNRESOLVED_SYMBOL);
    assert_eq!(t.pool_type, PoolType::YesPool);
    assert_eq!(t.market_category, MarketCategory::Conditional);
    assert_eq!(h.services.resolver.stats().negative_results, 1);
}

#[tokio::test(start_paused = true)]
async fn test_pipelines_share_symbol_and_trade_caches() {
    let h = Harness::new();
    h.store
        .insert(&trade("0xt1", SDAI, "100", "-250", 50))
        .unwrap();

    let first = h.pipeline();
    let second = h.pipeline();
    first.connect(WALLET).unwrap();
    second.connect(WALLET).unwrap();

    let a = wait_for(&first, |v| v.state == PipelineState::Ready).await;
    let b = wait_for(&second, |v| v.state == PipelineState::Ready).await;

    assert_eq!(a.trades, b.trades);
    assert_eq!(h.rpc.calls(), 2);
    assert_eq!(h.services.trade_cache.stats().producer_runs, 1);
}

#[tokio::test(start_paused = true)]
async fn test_poll_picks_up_rows_missed_by_feed() {
    let h = Harness::new();
    h.store
        .insert(&trade("0xt1", SDAI, "100", "-250", 50))
        .unwrap();

    let pipeline = h.pipeline();
    pipeline.connect(WALLET).unwrap();
    wait_for(&pipeline, |v| v.state == PipelineState::Ready).await;

    // A second store handle on the same file writes without notifying the
    // pipeline's feed; only polling can see it.
    let other = SqliteTradeStore::open(h._dir.path().join("trades.db").to_str().unwrap()).unwrap();
    other
        .insert(&trade("0xt2", SDAI, "5", "-10", 60))
        .unwrap();

    let view = wait_for(&pipeline, |v| v.trades.len() == 2).await;
    assert_eq!(view.trades[0].tx_hash, "0xt2");
    assert_eq!(view.state, PipelineState::Ready);
}
