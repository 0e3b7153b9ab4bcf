//! Futarchy Sync
//!
//! Follows one wallet's trade history and logs every change of the view.
//!
//! Usage:
//!   futarchy-sync 0xWALLET --db trades.db --market-config market.json
//!
//! Environment:
//!   FUTARCHY_SYNC_CONFIG - Engine TOML config (default: futarchy_sync.toml)
//!   FUTARCHY_RPC_URLS - Comma-separated RPC endpoints
//!   FUTARCHY_BASE_CURRENCY - Base currency symbol (default: sDAI)
//!   FUTARCHY_POLL_INTERVAL_SECS - Poll interval (default: 30)
//!   FUTARCHY_MARKET_CONFIG - Market token config JSON
//!
//! Type `r` + enter to force a refresh.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use futarchy_sync::metadata::MarketConfig;
use futarchy_sync::rpc::HttpChainRpc;
use futarchy_sync::store::SqliteTradeStore;
use futarchy_sync::{EngineConfig, SyncServices, TradeHistoryPipeline, TradeLoader, TradeView};

#[derive(Parser, Debug)]
#[command(name = "futarchy-sync")]
#[command(about = "Futarchy trade history sync - follow one wallet's trades")]
struct Args {
    /// Wallet address to follow
    #[arg(env = "FUTARCHY_WALLET")]
    wallet: String,

    /// SQLite trade store
    #[arg(long, env = "FUTARCHY_DB", default_value = "futarchy_trades.db")]
    db: String,

    /// Engine config (TOML); overrides FUTARCHY_SYNC_CONFIG
    #[arg(long)]
    config: Option<String>,

    /// Market token config (JSON)
    #[arg(long)]
    market_config: Option<String>,

    /// Stats log interval in seconds
    #[arg(long, env = "FUTARCHY_STATS_SECS", default_value = "60")]
    stats_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => {
            let mut config = EngineConfig::load(path)
                .with_context(|| format!("Failed to load engine config {}", path))?;
            config.apply_env_overrides();
            config
        }
        None => EngineConfig::from_env(),
    };

    let market_config = match args
        .market_config
        .as_ref()
        .or(config.pipeline.market_config_path.as_ref())
    {
        Some(path) => Some(MarketConfig::load(path)?),
        None => None,
    };

    info!("Starting futarchy sync");
    info!("  Wallet: {}", args.wallet);
    info!("  Store: {}", args.db);
    info!("  RPC endpoints: {}", config.rpc.endpoints.join(", "));
    info!("  Poll interval: {}s", config.pipeline.poll_interval().as_secs());

    let store = Arc::new(SqliteTradeStore::open(&args.db)?);
    let rpc = Arc::new(HttpChainRpc::new(Duration::from_millis(
        config.rpc.request_timeout_ms,
    ))?);
    let services = SyncServices::new(&config, rpc, market_config)?;
    let loader = TradeLoader::new(store, services.clone());
    let pipeline = TradeHistoryPipeline::new(loader, config.pipeline.clone());

    let mut view_rx = pipeline.subscribe();
    pipeline.connect(&args.wallet)?;

    let mut stats_ticker = tokio::time::interval(Duration::from_secs(args.stats_secs.max(1)));
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            changed = view_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = view_rx.borrow_and_update().clone();
                log_view(&view);
            }
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().eq_ignore_ascii_case("r") => {
                    if let Err(e) = pipeline.refresh().await {
                        warn!("refresh failed: {:#}", e);
                    }
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => stdin_open = false,
            },
            _ = stats_ticker.tick() => {
                let stats = serde_json::json!({
                    "pipeline": pipeline.stats(),
                    "resolver": services.resolver.stats(),
                    "rotation": services.rotator.stats(),
                    "trade_cache": services.trade_cache.stats(),
                });
                info!("📈 stats {}", stats);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    pipeline.disconnect();
    Ok(())
}

fn log_view(view: &TradeView) {
    if let Some(err) = &view.error {
        error!(state = ?view.state, "❌ {}", err);
        return;
    }
    info!(
        state = ?view.state,
        loading = view.loading,
        trades = view.trades.len(),
        "view updated"
    );
    if let Some(latest) = view.trades.first() {
        let when = latest
            .executed_at()
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| latest.timestamp.to_string());
        info!(
            "  latest: {:?} {:?} @ {} ({:?}, {}) {}",
            latest.side,
            latest.outcome,
            latest.price.to_string_fixed(4),
            latest.pool_type,
            latest.tx_hash,
            when
        );
    }
}

/// Initialize tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "futarchy_sync=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
