//! Store query -> symbol resolution -> enrichment
//!
//! A wallet's formatted history is produced in one step so a partially
//! enriched batch is never visible. Loads are deduplicated per wallet through
//! the shared trade cache.

use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::{FetchCache, FetchOptions};
use crate::config::EngineConfig;
use crate::enrich::enrich_batch;
use crate::error::{FetchError, TradeError};
use crate::metadata::{MarketConfig, SymbolResolver};
use crate::models::{normalize_address, FormattedTrade, PushEvent, RawTrade, SymbolMap};
use crate::realtime::TradeChange;
use crate::rpc::{ChainRpc, EndpointRotator};
use crate::store::TradeStore;

/// Process-wide state shared by every wallet pipeline.
#[derive(Clone)]
pub struct SyncServices {
    pub rotator: Arc<EndpointRotator>,
    pub resolver: Arc<SymbolResolver>,
    pub trade_cache: FetchCache<Vec<FormattedTrade>>,
    pub market_config: Option<Arc<MarketConfig>>,
    pub base_currency: String,
}

impl SyncServices {
    pub fn new(
        config: &EngineConfig,
        rpc: Arc<dyn ChainRpc>,
        market_config: Option<MarketConfig>,
    ) -> anyhow::Result<Self> {
        let rotator = Arc::new(EndpointRotator::new(&config.rpc)?);
        let resolver = Arc::new(SymbolResolver::new(
            Arc::clone(&rotator),
            rpc,
            config.resolver.retry_policy(),
        ));

        // Market config wins over the engine default.
        let base_currency = market_config
            .as_ref()
            .and_then(|c| c.base_currency_symbol())
            .unwrap_or(config.pipeline.base_currency_symbol.as_str())
            .to_string();

        info!(
            endpoints = rotator.len(),
            base_currency = %base_currency,
            market_config = market_config.is_some(),
            "sync services ready"
        );

        Ok(Self {
            rotator,
            resolver,
            trade_cache: FetchCache::new("trades", Some(config.cache.trade_ttl())),
            market_config: market_config.map(Arc::new),
            base_currency,
        })
    }
}

pub fn trade_cache_key(address: &str) -> String {
    format!("trades:{}", normalize_address(address))
}

#[derive(Clone)]
pub struct TradeLoader {
    store: Arc<dyn TradeStore>,
    services: SyncServices,
}

impl TradeLoader {
    pub fn new(store: Arc<dyn TradeStore>, services: SyncServices) -> Self {
        Self { store, services }
    }

    pub fn services(&self) -> &SyncServices {
        &self.services
    }

    pub fn store(&self) -> &Arc<dyn TradeStore> {
        &self.store
    }

    /// Formatted history for `address`, deduplicated with every concurrent
    /// load of the same wallet.
    pub async fn load(
        &self,
        address: &str,
        options: FetchOptions,
    ) -> Result<Vec<FormattedTrade>, FetchError> {
        let address = normalize_address(address);
        let loader = self.clone();

        self.services
            .trade_cache
            .fetch(
                &trade_cache_key(&address),
                move || async move { loader.load_uncached(&address).await },
                options,
            )
            .await
    }

    pub async fn load_uncached(&self, address: &str) -> anyhow::Result<Vec<FormattedTrade>> {
        let raw = self.store.query(address).await?;
        let symbols = self.resolve_symbols(&raw).await;
        let trades = enrich_batch(&raw, &symbols, &self.services.base_currency);
        debug!(
            wallet = %address,
            raw = raw.len(),
            formatted = trades.len(),
            symbols = symbols.len(),
            "trades_enriched"
        );
        Ok(trades)
    }

    pub async fn resolve_symbols(&self, trades: &[RawTrade]) -> SymbolMap {
        let addresses = trades.iter().flat_map(|t| t.token_addresses());
        self.services
            .resolver
            .batch_resolve(addresses, self.services.market_config.as_deref())
            .await
    }

    /// Enriches a push event against freshly resolved symbols.
    pub async fn enrich_event(&self, event: &PushEvent) -> Result<TradeChange, TradeError> {
        let symbols = match event {
            PushEvent::Insert { trade } | PushEvent::Update { trade } => {
                self.resolve_symbols(std::slice::from_ref(trade)).await
            }
            PushEvent::Delete { .. } => SymbolMap::new(),
        };
        TradeChange::from_push(event, &symbols, &self.services.base_currency)
    }

    /// Drops the cached snapshot after a push changed the wallet's history.
    pub fn invalidate(&self, address: &str) {
        self.services.trade_cache.invalidate(&trade_cache_key(address));
    }
}
