//! Per-wallet trade history pipeline
//!
//! States: `Idle -> Fetching -> Ready | Error`, back to `Idle` on disconnect.
//!
//! - Connect starts a session and a driver task for that wallet
//! - Every fetch cycle runs on the driver, manual refreshes included
//! - Without a live feed, a cycle subscribes before querying and keeps the
//!   subscription once it loads
//! - A poll timer refetches (forced) on every tick, failed or not
//! - Fetch failures retry with increasing delay up to the configured attempt limit
//! - Results from an older session are discarded, never applied
//!
//! The consumer reads [`TradeView`] from a watch channel.

pub mod loader;
pub mod session;

pub use loader::{trade_cache_key, SyncServices, TradeLoader};
pub use session::{SessionCounter, SessionToken};

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cache::FetchOptions;
use crate::config::PipelineConfig;
use crate::error::FetchError;
use crate::models::{is_valid_address, normalize_address, FormattedTrade, PushEvent};
use crate::realtime::{MergeOutcome, ReconcileOutcome, TradeDataset};
use crate::store::{FeedMessage, TradeStore, TradeSubscription};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    #[default]
    Idle,
    Fetching,
    Ready,
    Error,
}

/// What the consumer renders.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TradeView {
    pub address: Option<String>,
    pub trades: Vec<FormattedTrade>,
    pub loading: bool,
    /// Set only when retries are exhausted and there is nothing to show.
    pub error: Option<String>,
    pub state: PipelineState,
}

#[derive(Debug, Default)]
pub struct PipelineStats {
    pub fetch_cycles: AtomicU64,
    pub fetch_failures: AtomicU64,
    pub push_applied: AtomicU64,
    pub push_ignored: AtomicU64,
    pub push_rejected: AtomicU64,
    pub stale_discarded: AtomicU64,
    pub resyncs: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatsSnapshot {
    pub fetch_cycles: u64,
    pub fetch_failures: u64,
    pub push_applied: u64,
    pub push_ignored: u64,
    pub push_rejected: u64,
    pub stale_discarded: u64,
    pub resyncs: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            fetch_cycles: self.fetch_cycles.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            push_applied: self.push_applied.load(Ordering::Relaxed),
            push_ignored: self.push_ignored.load(Ordering::Relaxed),
            push_rejected: self.push_rejected.load(Ordering::Relaxed),
            stale_discarded: self.stale_discarded.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
        }
    }
}

/// Result of one fetch cycle (all attempts).
#[derive(Debug, Clone)]
enum CycleOutcome {
    Loaded,
    Failed(FetchError),
    /// The session changed while fetching.
    Stale,
}

type RefreshReply = oneshot::Sender<Result<(), FetchError>>;

enum Wake {
    Poll,
    Refresh(Option<RefreshReply>),
    Feed(Option<FeedMessage>),
}

struct ActiveSession {
    address: String,
    token: SessionToken,
    refresh_tx: mpsc::UnboundedSender<RefreshReply>,
    driver: JoinHandle<()>,
}

struct PipelineInner {
    loader: TradeLoader,
    config: PipelineConfig,
    sessions: SessionCounter,
    active: Mutex<Option<ActiveSession>>,
    dataset: Mutex<TradeDataset>,
    view_tx: watch::Sender<TradeView>,
    stats: PipelineStats,
}

#[derive(Clone)]
pub struct TradeHistoryPipeline {
    inner: Arc<PipelineInner>,
}

impl TradeHistoryPipeline {
    pub fn new(loader: TradeLoader, config: PipelineConfig) -> Self {
        let (view_tx, _) = watch::channel(TradeView::default());
        Self {
            inner: Arc::new(PipelineInner {
                loader,
                config,
                sessions: SessionCounter::new(),
                active: Mutex::new(None),
                dataset: Mutex::new(TradeDataset::new()),
                view_tx,
                stats: PipelineStats::default(),
            }),
        }
    }

    /// Starts syncing `address`. Returns false if it is already connected.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self, address: &str) -> anyhow::Result<bool> {
        let address = normalize_address(address);
        if !is_valid_address(&address) {
            anyhow::bail!("invalid wallet address: {}", address);
        }

        let mut active = self.inner.active.lock();
        if active.as_ref().is_some_and(|s| s.address == address) {
            debug!(wallet = %address, "already_connected");
            return Ok(false);
        }
        if let Some(previous) = active.take() {
            self.inner.teardown(previous);
        }

        let token = self.inner.sessions.begin();
        {
            let _dataset = self.inner.dataset.lock();
            self.inner.view_tx.send_replace(TradeView {
                address: Some(address.clone()),
                trades: Vec::new(),
                loading: true,
                error: None,
                state: PipelineState::Fetching,
            });
        }
        info!(wallet = %address, session = token.generation(), "🔌 wallet connected");

        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(Arc::clone(&self.inner).drive(
            token.clone(),
            address.clone(),
            refresh_rx,
        ));
        *active = Some(ActiveSession {
            address,
            token,
            refresh_tx,
            driver,
        });
        Ok(true)
    }

    /// Stops syncing and clears the dataset. No-op when idle.
    pub fn disconnect(&self) {
        if let Some(previous) = self.inner.active.lock().take() {
            self.inner.teardown(previous);
        }
    }

    /// Forced refetch for the connected wallet, run by its driver. Returns
    /// once that cycle finishes.
    pub async fn refresh(&self) -> anyhow::Result<()> {
        let session = self
            .inner
            .active
            .lock()
            .as_ref()
            .map(|s| (s.address.clone(), s.refresh_tx.clone()));
        let Some((address, refresh_tx)) = session else {
            anyhow::bail!("no wallet connected");
        };
        info!(wallet = %address, "manual refresh");

        let (reply_tx, reply_rx) = oneshot::channel();
        if refresh_tx.send(reply_tx).is_err() {
            return Ok(());
        }
        match reply_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow::anyhow!(e)),
            // Session replaced before the cycle ran.
            Err(_) => Ok(()),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<TradeView> {
        self.inner.view_tx.subscribe()
    }

    pub fn view(&self) -> TradeView {
        self.inner.view_tx.borrow().clone()
    }

    pub fn state(&self) -> PipelineState {
        self.inner.view_tx.borrow().state
    }

    pub fn current_address(&self) -> Option<String> {
        self.inner.active.lock().as_ref().map(|s| s.address.clone())
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.inner.stats.snapshot()
    }
}

impl PipelineInner {
    fn teardown(&self, session: ActiveSession) {
        self.sessions.invalidate();
        session.driver.abort();

        let mut dataset = self.dataset.lock();
        dataset.clear();
        self.view_tx.send_replace(TradeView::default());
        info!(
            wallet = %session.address,
            session = session.token.generation(),
            "wallet disconnected"
        );
    }

    /// Runs `f` on the dataset only if `token` is still current.
    fn with_current<R>(
        &self,
        token: &SessionToken,
        f: impl FnOnce(&mut TradeDataset, &watch::Sender<TradeView>) -> R,
    ) -> Option<R> {
        let mut dataset = self.dataset.lock();
        if !token.is_current() {
            self.stats.stale_discarded.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        Some(f(&mut dataset, &self.view_tx))
    }

    async fn drive(
        self: Arc<Self>,
        token: SessionToken,
        address: String,
        mut refreshes: mpsc::UnboundedReceiver<RefreshReply>,
    ) {
        let mut feed = None;
        if let CycleOutcome::Stale = self.sync(&token, &address, &mut feed, false).await {
            return;
        }

        let period = self.config.poll_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if !token.is_current() {
                return;
            }
            let wake = tokio::select! {
                _ = ticker.tick() => Wake::Poll,
                request = refreshes.recv() => Wake::Refresh(request),
                message = next_message(&mut feed) => Wake::Feed(message),
            };

            let outcome = match wake {
                Wake::Poll => {
                    debug!(wallet = %address, "poll_tick");
                    self.sync(&token, &address, &mut feed, true).await
                }
                Wake::Refresh(Some(reply)) => {
                    let outcome = self.sync(&token, &address, &mut feed, true).await;
                    let result = match &outcome {
                        CycleOutcome::Failed(e) => Err(e.clone()),
                        CycleOutcome::Loaded | CycleOutcome::Stale => Ok(()),
                    };
                    let _ = reply.send(result);
                    outcome
                }
                Wake::Refresh(None) => return,
                Wake::Feed(Some(FeedMessage::Change(event))) => {
                    self.handle_push(&token, &address, event).await;
                    continue;
                }
                Wake::Feed(Some(FeedMessage::Lagged(skipped))) => {
                    self.stats.resyncs.fetch_add(1, Ordering::Relaxed);
                    warn!(wallet = %address, skipped, "feed lagged, resyncing");
                    let options = FetchOptions::forced().started_after(Instant::now());
                    self.fetch_cycle(&token, &address, options).await
                }
                Wake::Feed(None) => {
                    warn!(wallet = %address, "trade feed closed, polling only");
                    feed = None;
                    continue;
                }
            };
            if let CycleOutcome::Stale = outcome {
                return;
            }
        }
    }

    /// One fetch cycle. Without a live feed it subscribes before the first
    /// query, only accepts a snapshot started after that, and keeps the
    /// subscription if the cycle loads.
    async fn sync(
        &self,
        token: &SessionToken,
        address: &str,
        feed: &mut Option<TradeSubscription>,
        force: bool,
    ) -> CycleOutcome {
        let options = if force {
            FetchOptions::forced()
        } else {
            FetchOptions::default()
        };
        if feed.is_some() {
            return self.fetch_cycle(token, address, options).await;
        }

        let pending = self.loader.store().subscribe(address);
        let options = options.started_after(Instant::now());
        let outcome = self.fetch_cycle(token, address, options).await;
        if let CycleOutcome::Loaded = outcome {
            *feed = Some(pending);
            debug!(wallet = %address, "feed_subscribed");
        }
        outcome
    }

    async fn fetch_cycle(
        &self,
        token: &SessionToken,
        address: &str,
        options: FetchOptions,
    ) -> CycleOutcome {
        let policy = self.config.retry_policy();
        self.stats.fetch_cycles.fetch_add(1, Ordering::Relaxed);
        let mut attempt = 0;

        loop {
            let entered = self.with_current(token, |_, view| {
                view.send_modify(|v| {
                    v.state = PipelineState::Fetching;
                    v.loading = true;
                });
            });
            if entered.is_none() {
                return CycleOutcome::Stale;
            }

            let err = match self.loader.load(address, options).await {
                Ok(trades) => {
                    let count = trades.len();
                    let applied = self.with_current(token, |dataset, view| {
                        let outcome = dataset.reconcile(trades);
                        let snapshot = dataset.to_vec();
                        view.send_modify(|v| {
                            v.trades = snapshot;
                            v.state = PipelineState::Ready;
                            v.loading = false;
                            v.error = None;
                        });
                        outcome
                    });
                    return match applied {
                        Some(outcome) => {
                            match outcome {
                                ReconcileOutcome::Replaced { len } => {
                                    info!(wallet = %address, fetched = count, total = len, "✅ trades loaded")
                                }
                                ReconcileOutcome::Merged { added } => {
                                    info!(wallet = %address, fetched = count, added, "✅ trades merged")
                                }
                            }
                            CycleOutcome::Loaded
                        }
                        None => CycleOutcome::Stale,
                    };
                }
                Err(e) => e,
            };

            self.stats.fetch_failures.fetch_add(1, Ordering::Relaxed);
            let exhausted = !policy.has_next(attempt);
            let message = err.to_string();
            let recorded = self.with_current(token, |dataset, view| {
                let surface = exhausted && dataset.is_empty();
                view.send_modify(|v| {
                    v.state = PipelineState::Error;
                    v.loading = false;
                    v.error = surface.then(|| message.clone());
                });
            });
            if recorded.is_none() {
                return CycleOutcome::Stale;
            }

            if exhausted {
                error!(
                    wallet = %address,
                    attempts = attempt + 1,
                    error = %err,
                    "❌ trade fetch failed, waiting for next poll"
                );
                return CycleOutcome::Failed(err);
            }

            let delay = policy.delay_for(attempt);
            warn!(
                wallet = %address,
                attempt = attempt + 1,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "trade fetch failed, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    async fn handle_push(&self, token: &SessionToken, address: &str, event: PushEvent) {
        let key_hint = match &event {
            PushEvent::Insert { trade } | PushEvent::Update { trade } => {
                format!("{}#{}", trade.tx_hash, trade.event_id)
            }
            PushEvent::Delete { key, .. } => key.to_string(),
        };

        let change = match self.loader.enrich_event(&event).await {
            Ok(change) => change,
            Err(e) => {
                self.stats.push_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(wallet = %address, trade = %key_hint, error = %e, "push_event_rejected");
                return;
            }
        };

        let outcome = self.with_current(token, |dataset, view| {
            let outcome = dataset.apply(change);
            if outcome.changed() {
                let snapshot = dataset.to_vec();
                view.send_modify(|v| v.trades = snapshot);
            }
            outcome
        });

        match outcome {
            Some(MergeOutcome::Ignored) => {
                self.stats.push_ignored.fetch_add(1, Ordering::Relaxed);
                debug!(wallet = %address, trade = %key_hint, "push_event_ignored");
            }
            Some(outcome) => {
                self.stats.push_applied.fetch_add(1, Ordering::Relaxed);
                self.loader.invalidate(address);
                debug!(wallet = %address, trade = %key_hint, outcome = ?outcome, "push_event_applied");
            }
            None => {}
        }
    }
}

async fn next_message(feed: &mut Option<TradeSubscription>) -> Option<FeedMessage> {
    match feed {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::RpcError;
    use crate::metadata::MarketConfig;
    use crate::models::{IdentityKey, RawTrade, TradeSide};
    use crate::rpc::{ChainRpc, Endpoint};
    use crate::store::SqliteTradeStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, AtomicUsize};
    use std::time::Duration;

    const ALICE: &str = "0xa11ce00000000000000000000000000000000001";
    const BOB: &str = "0xb0b0000000000000000000000000000000000002";
    const YES_GNO: &str = "0x1000000000000000000000000000000000000001";
    const SDAI: &str = "0x1000000000000000000000000000000000000003";

    struct OfflineRpc;

    #[async_trait]
    impl ChainRpc for OfflineRpc {
        async fn token_symbol(
            &self,
            endpoint: &Endpoint,
            _token_address: &str,
        ) -> Result<String, RpcError> {
            Err(RpcError::Permanent {
                endpoint: endpoint.url.clone(),
                reason: "offline".into(),
            })
        }
    }

    /// Sqlite store whose first `failures` queries fail. A successful query
    /// reads its rows, then holds them for `hold_ms` before returning.
    struct FlakyStore {
        inner: SqliteTradeStore,
        failures: AtomicUsize,
        queries: AtomicUsize,
        delay: Duration,
        hold_ms: AtomicU64,
    }

    #[async_trait]
    impl TradeStore for FlakyStore {
        async fn query(&self, user_address: &str) -> anyhow::Result<Vec<RawTrade>> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("store unreachable");
            }
            let rows = self.inner.query(user_address).await?;
            let hold = self.hold_ms.load(Ordering::SeqCst);
            if hold > 0 {
                tokio::time::sleep(Duration::from_millis(hold)).await;
            }
            Ok(rows)
        }

        fn subscribe(&self, user_address: &str) -> TradeSubscription {
            self.inner.subscribe(user_address)
        }
    }

    fn raw(user: &str, tx: &str, ts: i64) -> RawTrade {
        RawTrade {
            event_id: 0,
            user_address: user.into(),
            pool_address: "0xpool".into(),
            token0: YES_GNO.into(),
            token1: SDAI.into(),
            amount0: "100".into(),
            amount1: "-250".into(),
            block_timestamp: ts,
            tx_hash: tx.into(),
        }
    }

    fn setup(failures: usize, delay: Duration) -> (TradeHistoryPipeline, Arc<FlakyStore>) {
        setup_with(SqliteTradeStore::in_memory().unwrap(), failures, delay)
    }

    fn setup_with(
        inner: SqliteTradeStore,
        failures: usize,
        delay: Duration,
    ) -> (TradeHistoryPipeline, Arc<FlakyStore>) {
        let market = MarketConfig::from_json(&format!(
            r#"{{
                "baseTokens": {{"currency": {{"address": "{SDAI}", "symbol": "sDAI"}}}},
                "positionTokens": [{{"address": "{YES_GNO}", "symbol": "YES_GNO"}}]
            }}"#
        ))
        .unwrap();
        let config = EngineConfig::default();
        let services = SyncServices::new(&config, Arc::new(OfflineRpc), Some(market)).unwrap();

        let store = Arc::new(FlakyStore {
            inner,
            failures: AtomicUsize::new(failures),
            queries: AtomicUsize::new(0),
            delay,
            hold_ms: AtomicU64::new(0),
        });
        let loader = TradeLoader::new(store.clone(), services);
        (TradeHistoryPipeline::new(loader, config.pipeline), store)
    }

    async fn wait_for_state(pipeline: &TradeHistoryPipeline, state: PipelineState) -> TradeView {
        let mut rx = pipeline.subscribe();
        let view = tokio::time::timeout(Duration::from_secs(60), rx.wait_for(|v| v.state == state))
            .await
            .expect("timed out waiting for state")
            .expect("view channel closed")
            .clone();
        view
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_loads_trades() {
        let (pipeline, store) = setup(0, Duration::ZERO);
        store
            .inner
            .insert_batch(&[raw(ALICE, "0x01", 50), raw(ALICE, "0x02", 100)])
            .unwrap();

        assert!(pipeline.connect(ALICE).unwrap());
        assert!(!pipeline.connect(ALICE).unwrap());

        let view = wait_for_state(&pipeline, PipelineState::Ready).await;
        assert_eq!(view.trades.len(), 2);
        assert_eq!(view.trades[0].timestamp, 100);
        assert_eq!(view.trades[0].side, TradeSide::Buy);
        assert!(!view.loading);
        assert_eq!(store.queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_events_merge_into_view() {
        let (pipeline, store) = setup(0, Duration::ZERO);
        store.inner.insert(&raw(ALICE, "0x01", 50)).unwrap();
        pipeline.connect(ALICE).unwrap();
        wait_for_state(&pipeline, PipelineState::Ready).await;

        let mut rx = pipeline.subscribe();
        store.inner.insert(&raw(ALICE, "0x02", 75)).unwrap();
        store.inner.insert(&raw(BOB, "0x03", 80)).unwrap();
        let view = rx.wait_for(|v| v.trades.len() == 2).await.unwrap().clone();
        assert_eq!(view.trades[0].tx_hash, "0x02");

        store.inner.delete(&IdentityKey::new("0x01", 0)).unwrap();
        let view = rx.wait_for(|v| v.trades.len() == 1).await.unwrap().clone();
        assert_eq!(view.trades[0].tx_hash, "0x02");
        assert_eq!(pipeline.stats().push_applied, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_recovers() {
        let (pipeline, store) = setup(2, Duration::ZERO);
        store.inner.insert(&raw(ALICE, "0x01", 50)).unwrap();

        pipeline.connect(ALICE).unwrap();
        let view = wait_for_state(&pipeline, PipelineState::Ready).await;

        assert_eq!(view.trades.len(), 1);
        assert!(view.error.is_none());
        assert_eq!(store.queries.load(Ordering::SeqCst), 3);
        assert_eq!(pipeline.stats().fetch_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_surface_error_when_empty() {
        let (pipeline, store) = setup(3, Duration::ZERO);
        pipeline.connect(ALICE).unwrap();

        let mut rx = pipeline.subscribe();
        let view = tokio::time::timeout(Duration::from_secs(20), rx.wait_for(|v| v.error.is_some()))
            .await
            .unwrap()
            .unwrap()
            .clone();
        assert_eq!(view.state, PipelineState::Error);
        assert!(view.error.unwrap().contains("store unreachable"));
        assert_eq!(store.queries.load(Ordering::SeqCst), 3);

        // next poll tick succeeds and clears the error
        store.inner.insert(&raw(ALICE, "0x01", 50)).unwrap();
        let view = wait_for_state(&pipeline, PipelineState::Ready).await;
        assert_eq!(view.trades.len(), 1);
        assert!(view.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_keeps_last_good_data() {
        let (pipeline, store) = setup(0, Duration::ZERO);
        store.inner.insert(&raw(ALICE, "0x01", 50)).unwrap();
        pipeline.connect(ALICE).unwrap();
        wait_for_state(&pipeline, PipelineState::Ready).await;

        store.failures.store(3, Ordering::SeqCst);
        assert!(pipeline.refresh().await.is_err());

        let view = pipeline.view();
        assert_eq!(view.state, PipelineState::Error);
        assert_eq!(view.trades.len(), 1);
        assert!(view.error.is_none());
    }

    async fn wait_for_error(pipeline: &TradeHistoryPipeline) -> TradeView {
        let mut rx = pipeline.subscribe();
        let view = tokio::time::timeout(Duration::from_secs(20), rx.wait_for(|v| v.error.is_some()))
            .await
            .expect("timed out waiting for error")
            .expect("view channel closed")
            .clone();
        view
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_refresh_after_failed_connect_follows_feed() {
        let (pipeline, store) = setup(3, Duration::ZERO);
        store.inner.insert(&raw(ALICE, "0x01", 50)).unwrap();
        pipeline.connect(ALICE).unwrap();
        wait_for_error(&pipeline).await;

        pipeline.refresh().await.unwrap();
        let view = pipeline.view();
        assert_eq!(view.state, PipelineState::Ready);
        assert_eq!(view.trades.len(), 1);

        // well inside the poll interval, so only the feed can deliver it
        let mut rx = pipeline.subscribe();
        store.inner.insert(&raw(ALICE, "0x02", 75)).unwrap();
        let view = tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|v| v.trades.len() == 2))
            .await
            .expect("push not delivered after refresh")
            .unwrap()
            .clone();
        assert_eq!(view.trades[0].tx_hash, "0x02");
        assert_eq!(pipeline.stats().push_applied, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_during_recovery_poll_is_applied() {
        let (pipeline, store) = setup(3, Duration::ZERO);
        store
            .inner
            .insert_batch(&[raw(ALICE, "0x01", 50), raw(ALICE, "0x02", 75)])
            .unwrap();
        pipeline.connect(ALICE).unwrap();
        wait_for_error(&pipeline).await;

        // next poll reads both rows, then the delete lands before it returns
        store.hold_ms.store(1_000, Ordering::SeqCst);
        let mut rx = pipeline.subscribe();
        tokio::time::timeout(Duration::from_secs(60), rx.wait_for(|v| v.loading))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(store.inner.delete(&IdentityKey::new("0x01", 0)).unwrap());

        let view = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|v| v.state == PipelineState::Ready && v.trades.len() == 1),
        )
        .await
        .expect("delete never reached the view")
        .unwrap()
        .clone();
        assert_eq!(view.trades[0].tx_hash, "0x02");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_ignores_snapshot_cached_before_subscribing() {
        let (pipeline, store) = setup(0, Duration::ZERO);
        store
            .inner
            .insert_batch(&[raw(ALICE, "0x01", 50), raw(ALICE, "0x02", 75)])
            .unwrap();

        // another pipeline cached ALICE's history, then a delete went by
        // with nobody subscribed
        let loader = pipeline.inner.loader.clone();
        let cached = loader.load(ALICE, FetchOptions::default()).await.unwrap();
        assert_eq!(cached.len(), 2);
        tokio::time::advance(Duration::from_secs(1)).await;
        store.inner.delete(&IdentityKey::new("0x01", 0)).unwrap();

        pipeline.connect(ALICE).unwrap();
        let view = wait_for_state(&pipeline, PipelineState::Ready).await;
        assert_eq!(view.trades.len(), 1);
        assert_eq!(view.trades[0].tx_hash, "0x02");
        assert_eq!(store.queries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_feed_lag_forces_resync() {
        let inner = SqliteTradeStore::open_with_capacity(":memory:", 1).unwrap();
        let (pipeline, store) = setup_with(inner, 0, Duration::ZERO);
        store.inner.insert(&raw(ALICE, "0x01", 50)).unwrap();
        pipeline.connect(ALICE).unwrap();
        wait_for_state(&pipeline, PipelineState::Ready).await;
        let queries = store.queries.load(Ordering::SeqCst);

        // written without yielding, so the driver's one-slot feed overflows
        let mut rx = pipeline.subscribe();
        store
            .inner
            .insert_batch(&[
                raw(ALICE, "0x02", 60),
                raw(ALICE, "0x03", 70),
                raw(ALICE, "0x04", 80),
            ])
            .unwrap();

        let view = tokio::time::timeout(
            Duration::from_secs(1),
            rx.wait_for(|v| v.state == PipelineState::Ready && v.trades.len() == 4),
        )
        .await
        .expect("view never converged after lag")
        .unwrap()
        .clone();
        let stamps: Vec<i64> = view.trades.iter().map(|t| t.timestamp).collect();
        assert_eq!(stamps, vec![80, 70, 60, 50]);
        assert_eq!(pipeline.stats().resyncs, 1);
        assert_eq!(store.queries.load(Ordering::SeqCst), queries + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_address_change_discards_stale_results() {
        let (pipeline, store) = setup(0, Duration::from_millis(500));
        store
            .inner
            .insert_batch(&[raw(ALICE, "0x0a", 10), raw(BOB, "0x0b", 20)])
            .unwrap();

        pipeline.connect(ALICE).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        pipeline.connect(BOB).unwrap();

        let view = wait_for_state(&pipeline, PipelineState::Ready).await;
        assert_eq!(view.address.as_deref(), Some(BOB));
        assert_eq!(view.trades.len(), 1);
        assert_eq!(view.trades[0].tx_hash, "0x0b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_returns_to_idle() {
        let (pipeline, store) = setup(0, Duration::ZERO);
        store.inner.insert(&raw(ALICE, "0x01", 50)).unwrap();
        pipeline.connect(ALICE).unwrap();
        wait_for_state(&pipeline, PipelineState::Ready).await;

        pipeline.disconnect();
        let view = pipeline.view();
        assert_eq!(view, TradeView::default());
        assert!(pipeline.current_address().is_none());
        assert!(pipeline.refresh().await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_invalid_wallet() {
        let (pipeline, _) = setup(0, Duration::ZERO);
        assert!(pipeline.connect("not-a-wallet").is_err());
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }
}
