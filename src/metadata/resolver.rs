//! Token address -> symbol resolution
//!
//! Precedence per address:
//! 1. symbol cache (positive or negative, never expires on its own)
//! 2. static market config
//! 3. chain RPC through the shared endpoint rotator, bounded by a retry policy
//!
//! Failures degrade to `None`; nothing here aborts the caller.

use futures_util::future::join_all;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{FetchCache, FetchOptions};
use crate::error::RpcError;
use crate::metadata::market_config::MarketConfig;
use crate::metadata::retry::RetryPolicy;
use crate::models::{is_valid_address, normalize_address, SymbolMap};
use crate::rpc::{ChainRpc, EndpointRotator};

#[derive(Debug, Default)]
pub struct ResolverStats {
    pub cache_hits: AtomicU64,
    pub config_hits: AtomicU64,
    pub rpc_hits: AtomicU64,
    pub rpc_failures: AtomicU64,
    pub negative_results: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolverStatsSnapshot {
    pub cache_hits: u64,
    pub config_hits: u64,
    pub rpc_hits: u64,
    pub rpc_failures: u64,
    pub negative_results: u64,
    pub cached_symbols: usize,
}

pub struct SymbolResolver {
    cache: FetchCache<Option<String>>,
    rotator: Arc<EndpointRotator>,
    rpc: Arc<dyn ChainRpc>,
    policy: RetryPolicy,
    stats: Arc<ResolverStats>,
}

impl SymbolResolver {
    pub fn new(rotator: Arc<EndpointRotator>, rpc: Arc<dyn ChainRpc>, policy: RetryPolicy) -> Self {
        Self {
            cache: FetchCache::new("symbols", None),
            rotator,
            rpc,
            policy,
            stats: Arc::new(ResolverStats::default()),
        }
    }

    /// Symbol for `address`, or `None` when no source knows it.
    pub async fn resolve_symbol(
        &self,
        address: &str,
        config: Option<&MarketConfig>,
    ) -> Option<String> {
        let key = normalize_address(address);

        if let Some(cached) = self.cache.get_fresh(&key) {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            return cached;
        }

        if let Some((schema, symbol)) = config.and_then(|c| c.lookup_symbol(&key)) {
            debug!(address = %key, symbol = %symbol, schema = ?schema, "symbol_from_config");
            self.stats.config_hits.fetch_add(1, Ordering::Relaxed);
            self.cache.insert(&key, Some(symbol.clone()), None);
            return Some(symbol);
        }

        if !is_valid_address(&key) {
            debug!(address = %key, "symbol_invalid_address");
            self.stats.negative_results.fetch_add(1, Ordering::Relaxed);
            self.cache.insert(&key, None, None);
            return None;
        }

        let rotator = Arc::clone(&self.rotator);
        let rpc = Arc::clone(&self.rpc);
        let policy = self.policy.clone();
        let stats = Arc::clone(&self.stats);
        let token = key.clone();

        let result = self
            .cache
            .fetch(
                &key,
                move || async move {
                    Ok(resolve_remote(&rotator, rpc.as_ref(), &policy, &stats, &token).await)
                },
                FetchOptions::never_expire(),
            )
            .await;

        match result {
            Ok(symbol) => symbol,
            Err(e) => {
                // Only reachable if the lookup task died; not cached.
                warn!(address = %key, error = %e, "symbol_lookup_aborted");
                None
            }
        }
    }

    /// Resolves every unique address concurrently. Keys are normalized.
    pub async fn batch_resolve<I, S>(&self, addresses: I, config: Option<&MarketConfig>) -> SymbolMap
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let unique: BTreeSet<String> = addresses
            .into_iter()
            .map(|a| normalize_address(a.as_ref()))
            .filter(|a| !a.is_empty())
            .collect();

        let lookups = unique.iter().map(|address| async move {
            (address.clone(), self.resolve_symbol(address, config).await)
        });

        join_all(lookups).await.into_iter().collect()
    }

    /// Drops the cached symbol so the next lookup goes back to the sources.
    pub fn invalidate(&self, address: &str) -> bool {
        self.cache.invalidate(&normalize_address(address))
    }

    pub fn stats(&self) -> ResolverStatsSnapshot {
        ResolverStatsSnapshot {
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            config_hits: self.stats.config_hits.load(Ordering::Relaxed),
            rpc_hits: self.stats.rpc_hits.load(Ordering::Relaxed),
            rpc_failures: self.stats.rpc_failures.load(Ordering::Relaxed),
            negative_results: self.stats.negative_results.load(Ordering::Relaxed),
            cached_symbols: self.cache.len(),
        }
    }
}

async fn resolve_remote(
    rotator: &EndpointRotator,
    rpc: &dyn ChainRpc,
    policy: &RetryPolicy,
    stats: &ResolverStats,
    address: &str,
) -> Option<String> {
    let mut last_error: Option<RpcError> = None;

    for attempt in 0..policy.max_attempts() {
        let endpoint = rotator.select();
        match rpc.token_symbol(&endpoint, address).await {
            Ok(symbol) => {
                rotator.record_success(&endpoint);
                stats.rpc_hits.fetch_add(1, Ordering::Relaxed);
                info!(address, symbol = %symbol, endpoint = %endpoint.url, "✅ symbol resolved");
                return Some(symbol);
            }
            Err(e) => {
                stats.rpc_failures.fetch_add(1, Ordering::Relaxed);
                rotator.record_failure(&endpoint, &e);
                let retryable = e.is_retryable();
                warn!(
                    address,
                    endpoint = %endpoint.url,
                    attempt = attempt + 1,
                    error = %e,
                    "symbol_lookup_failed"
                );
                last_error = Some(e);
                if !retryable || !policy.has_next(attempt) {
                    break;
                }
                tokio::time::sleep(policy.delay_for(attempt)).await;
            }
        }
    }

    stats.negative_results.fetch_add(1, Ordering::Relaxed);
    debug!(
        address,
        last_error = ?last_error.map(|e| e.to_string()),
        "symbol_unresolved"
    );
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RpcConfig;
    use crate::rpc::Endpoint;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;

    const GNO: &str = "0x9c58bacc331c9aa871afd802db6379a98e80cedb";
    const SDAI: &str = "0xaf204776c7245bf4147c2612bf6e5972ee483701";

    /// Replays canned responses; once exhausted every call returns `fallback`.
    struct ScriptedRpc {
        script: Mutex<VecDeque<Result<String, RpcError>>>,
        fallback: Result<String, RpcError>,
        calls: Mutex<Vec<(String, String)>>,
        delay: Duration,
    }

    impl ScriptedRpc {
        fn new(script: Vec<Result<String, RpcError>>, fallback: Result<String, RpcError>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback,
                calls: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
            }
        }

        fn call_count(&self) -> usize {
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
            self.calls
                .lock()
                .push((endpoint.url.clone(), token_address.to_string()));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().pop_front();
            next.unwrap_or_else(|| self.fallback.clone())
        }
    }

    fn resolver(rpc: Arc<ScriptedRpc>) -> (SymbolResolver, Arc<EndpointRotator>) {
        let rotator = Arc::new(
            EndpointRotator::new(&RpcConfig {
                endpoints: vec!["https://a".into(), "https://b".into()],
                cooldown_base_ms: 1_000,
                cooldown_jitter_ms: 0,
                ..RpcConfig::default()
            })
            .unwrap(),
        );
        let policy =
            RetryPolicy::exponential(3, Duration::from_millis(10), 2.0, Duration::from_millis(100));
        (
            SymbolResolver::new(Arc::clone(&rotator), rpc, policy),
            rotator,
        )
    }

    fn transient(url: &str) -> RpcError {
        RpcError::Transient {
            endpoint: url.into(),
            reason: "timeout".into(),
        }
    }

    #[tokio::test]
    async fn test_config_wins_over_rpc() {
        let rpc = Arc::new(ScriptedRpc::new(vec![], Ok("FROM_RPC".into())));
        let (resolver, _) = resolver(Arc::clone(&rpc));
        let config = MarketConfig::from_json(&format!(
            r#"{{"baseTokens": {{"company": {{"address": "{GNO}", "symbol": "GNO"}}}}}}"#
        ))
        .unwrap();

        let symbol = resolver.resolve_symbol(GNO, Some(&config)).await;
        assert_eq!(symbol.as_deref(), Some("GNO"));
        assert_eq!(rpc.call_count(), 0);
        assert_eq!(resolver.stats().config_hits, 1);

        // now cached; the config is no longer consulted
        assert_eq!(resolver.resolve_symbol(GNO, None).await.as_deref(), Some("GNO"));
        assert_eq!(resolver.stats().cache_hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_rotates_endpoint() {
        let rpc = Arc::new(ScriptedRpc::new(
            vec![
                Err(RpcError::RateLimited {
                    endpoint: "https://a".into(),
                }),
                Ok("sDAI".into()),
            ],
            Err(transient("unused")),
        ));
        let (resolver, rotator) = resolver(Arc::clone(&rpc));

        let symbol = resolver.resolve_symbol(SDAI, None).await;
        assert_eq!(symbol.as_deref(), Some("sDAI"));

        let calls = rpc.calls.lock().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "https://a");
        assert_eq!(calls[1].0, "https://b");
        assert!(rotator.cooldown_remaining(0).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_is_negative_cached() {
        let rpc = Arc::new(ScriptedRpc::new(vec![], Err(transient("any"))));
        let (resolver, _) = resolver(Arc::clone(&rpc));

        assert_eq!(resolver.resolve_symbol(GNO, None).await, None);
        assert_eq!(rpc.call_count(), 3);

        assert_eq!(resolver.resolve_symbol(GNO, None).await, None);
        assert_eq!(rpc.call_count(), 3);
        assert_eq!(resolver.stats().negative_results, 1);

        assert!(resolver.invalidate(GNO));
        resolver.resolve_symbol(GNO, None).await;
        assert_eq!(rpc.call_count(), 6);
    }

    #[tokio::test]
    async fn test_permanent_failure_stops_early() {
        let rpc = Arc::new(ScriptedRpc::new(
            vec![],
            Err(RpcError::Permanent {
                endpoint: "https://a".into(),
                reason: "execution reverted".into(),
            }),
        ));
        let (resolver, rotator) = resolver(Arc::clone(&rpc));

        assert_eq!(resolver.resolve_symbol(GNO, None).await, None);
        assert_eq!(rpc.call_count(), 1);
        assert!(rotator.cooldown_remaining(0).is_none());
    }

    #[tokio::test]
    async fn test_invalid_address_skips_rpc() {
        let rpc = Arc::new(ScriptedRpc::new(vec![], Ok("X".into())));
        let (resolver, _) = resolver(Arc::clone(&rpc));

        assert_eq!(resolver.resolve_symbol("0x1234", None).await, None);
        assert_eq!(rpc.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_resolves_unique_addresses_once() {
        let mut rpc = ScriptedRpc::new(vec![], Ok("TOKEN".into()));
        rpc.delay = Duration::from_millis(20);
        let rpc = Arc::new(rpc);
        let (resolver, _) = resolver(Arc::clone(&rpc));

        let upper = GNO.to_uppercase().replacen("0X", "0x", 1);
        let map = resolver
            .batch_resolve([GNO, upper.as_str(), SDAI, GNO], None)
            .await;

        assert_eq!(map.len(), 2);
        assert_eq!(map.get(GNO).cloned().flatten().as_deref(), Some("TOKEN"));
        assert_eq!(rpc.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_resolves_share_lookup() {
        let mut rpc = ScriptedRpc::new(vec![], Ok("GNO".into()));
        rpc.delay = Duration::from_millis(50);
        let rpc = Arc::new(rpc);
        let (resolver, _) = resolver(Arc::clone(&rpc));

        let (a, b) = tokio::join!(
            resolver.resolve_symbol(GNO, None),
            resolver.resolve_symbol(GNO, None)
        );
        assert_eq!(a, b);
        assert_eq!(rpc.call_count(), 1);
    }
}
