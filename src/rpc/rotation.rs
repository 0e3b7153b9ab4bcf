//! RPC endpoint rotation with self-expiring cooldowns.
//!
//! - Selection scans forward from a rotating pointer and skips endpoints in
//!   cooldown
//! - When every endpoint is cooling down the current one is returned anyway
//! - Cooldowns are bounded by `max_cooldown_ms` and expire on their own, so no
//!   endpoint is ever excluded permanently
//!
//! The rotator is shared by every wallet pipeline; all state sits behind one
//! short-lived lock.

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::RpcConfig;
use crate::error::RpcError;

/// Endpoint handed out by [`EndpointRotator::select`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub index: usize,
    pub url: String,
}

#[derive(Debug, Clone)]
struct EndpointRecord {
    url: String,
    cooldown_until: Option<Instant>,
}

impl EndpointRecord {
    fn cooling_down(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }
}

#[derive(Debug)]
struct RotationState {
    endpoints: Vec<EndpointRecord>,
    pointer: usize,
}

#[derive(Debug, Default)]
pub struct RotationStats {
    pub selections: AtomicU64,
    pub forced_selections: AtomicU64,
    pub failures: AtomicU64,
    pub cooldowns_applied: AtomicU64,
}

impl RotationStats {
    pub fn snapshot(&self) -> RotationStatsSnapshot {
        RotationStatsSnapshot {
            selections: self.selections.load(Ordering::Relaxed),
            forced_selections: self.forced_selections.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            cooldowns_applied: self.cooldowns_applied.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RotationStatsSnapshot {
    pub selections: u64,
    pub forced_selections: u64,
    pub failures: u64,
    pub cooldowns_applied: u64,
}

#[derive(Debug)]
pub struct EndpointRotator {
    state: Mutex<RotationState>,
    cooldown_base: Duration,
    cooldown_jitter_ms: u64,
    max_cooldown: Duration,
    stats: RotationStats,
}

impl EndpointRotator {
    pub fn new(config: &RpcConfig) -> anyhow::Result<Self> {
        if config.endpoints.is_empty() {
            anyhow::bail!("at least one RPC endpoint is required");
        }

        let endpoints = config
            .endpoints
            .iter()
            .map(|url| EndpointRecord {
                url: url.trim().to_string(),
                cooldown_until: None,
            })
            .collect();

        Ok(Self {
            state: Mutex::new(RotationState {
                endpoints,
                pointer: 0,
            }),
            cooldown_base: Duration::from_millis(config.cooldown_base_ms),
            cooldown_jitter_ms: config.cooldown_jitter_ms,
            max_cooldown: Duration::from_millis(config.max_cooldown_ms),
            stats: RotationStats::default(),
        })
    }

    pub fn len(&self) -> usize {
        self.state.lock().endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next endpoint not in cooldown, starting at the pointer. Never blocks.
    pub fn select(&self) -> Endpoint {
        let now = Instant::now();
        let mut state = self.state.lock();
        let count = state.endpoints.len();
        self.stats.selections.fetch_add(1, Ordering::Relaxed);

        for offset in 0..count {
            let idx = (state.pointer + offset) % count;
            let record = &mut state.endpoints[idx];
            if record.cooling_down(now) {
                continue;
            }
            if record.cooldown_until.take().is_some() {
                debug!(endpoint = %record.url, "cooldown_expired");
            }
            let url = record.url.clone();
            state.pointer = idx;
            return Endpoint { index: idx, url };
        }

        // All cooling down: hand out the current one rather than wait.
        self.stats.forced_selections.fetch_add(1, Ordering::Relaxed);
        let idx = state.pointer;
        debug!(endpoint = %state.endpoints[idx].url, "all_endpoints_cooling_down");
        Endpoint {
            index: idx,
            url: state.endpoints[idx].url.clone(),
        }
    }

    /// Advances the pointer past `endpoint`; retryable errors also start a
    /// cooldown of `base + jitter`, capped at `max_cooldown_ms`.
    pub fn record_failure(&self, endpoint: &Endpoint, error: &RpcError) {
        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock();
        let count = state.endpoints.len();
        let Some(record) = state.endpoints.get_mut(endpoint.index) else {
            return;
        };

        if error.triggers_cooldown() {
            let cooldown = self.next_cooldown();
            record.cooldown_until = Some(Instant::now() + cooldown);
            self.stats.cooldowns_applied.fetch_add(1, Ordering::Relaxed);
            warn!(
                endpoint = %record.url,
                cooldown_ms = cooldown.as_millis() as u64,
                error = %error,
                "endpoint_cooldown"
            );
        } else {
            debug!(endpoint = %record.url, error = %error, "endpoint_failure_no_cooldown");
        }

        state.pointer = (endpoint.index + 1) % count;
    }

    /// Clears any cooldown left on `endpoint`.
    pub fn record_success(&self, endpoint: &Endpoint) {
        let mut state = self.state.lock();
        if let Some(record) = state.endpoints.get_mut(endpoint.index) {
            record.cooldown_until = None;
        }
    }

    /// Time until `index` is selectable again, if it is cooling down.
    pub fn cooldown_remaining(&self, index: usize) -> Option<Duration> {
        let now = Instant::now();
        let state = self.state.lock();
        let until = state.endpoints.get(index)?.cooldown_until?;
        (now < until).then(|| until - now)
    }

    pub fn stats(&self) -> RotationStatsSnapshot {
        self.stats.snapshot()
    }

    fn next_cooldown(&self) -> Duration {
        let jitter = if self.cooldown_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.cooldown_jitter_ms)
        } else {
            0
        };
        (self.cooldown_base + Duration::from_millis(jitter)).min(self.max_cooldown)
    }
}
