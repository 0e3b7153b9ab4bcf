//! Display projection of enriched trades.

use tracing::warn;

use crate::enrich::classify::classify;
use crate::models::{EnrichedTrade, FormattedTrade, RawTrade, SymbolMap, TokenSlot, TradeLeg};

/// Shown in place of a symbol that could not be resolved.
pub const UNRESOLVED_SYMBOL: &str = "N/A";

fn leg(trade: &EnrichedTrade, slot: TokenSlot) -> TradeLeg {
    let token = match slot {
        TokenSlot::Token0 => &trade.raw.token0,
        TokenSlot::Token1 => &trade.raw.token1,
    };
    TradeLeg {
        token: token.clone(),
        symbol: trade
            .symbol(slot)
            .unwrap_or(UNRESOLVED_SYMBOL)
            .to_string(),
        amount: trade.amount(slot).abs(),
    }
}

/// Sent/received legs come from each token's own delta, independent of the
/// primary/secondary roles. When both deltas share a sign both legs land on
/// the same side and the trade keeps its anomaly flag.
pub fn format_trade(trade: &EnrichedTrade) -> FormattedTrade {
    let slots = [TokenSlot::Token0, TokenSlot::Token1];
    let sent = slots
        .iter()
        .filter(|&&slot| trade.amount(slot).is_negative())
        .map(|&slot| leg(trade, slot))
        .collect();
    let received = slots
        .iter()
        .filter(|&&slot| trade.amount(slot).is_positive())
        .map(|&slot| leg(trade, slot))
        .collect();

    FormattedTrade {
        outcome: trade.outcome,
        side: trade.side,
        price: trade.price.clone(),
        sent,
        received,
        pool_type: trade.pool_type,
        market_category: trade.market_category,
        pool_address: trade.raw.pool_address.clone(),
        timestamp: trade.raw.block_timestamp,
        tx_hash: trade.key.tx_hash.clone(),
        event_id: trade.key.event_id,
        anomaly: trade.anomaly,
    }
}

/// Enriches a whole batch. Records with permanent errors are dropped with a
/// warning; the rest come back newest first.
pub fn enrich_batch(raw: &[RawTrade], symbols: &SymbolMap, base_currency: &str) -> Vec<FormattedTrade> {
    let mut out = Vec::with_capacity(raw.len());
    for trade in raw {
        match classify(trade, symbols, base_currency) {
            Ok(enriched) => out.push(format_trade(&enriched)),
            Err(e) => warn!(tx_hash = %trade.tx_hash, event_id = trade.event_id, error = %e, "trade_rejected"),
        }
    }
    out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    out
}
