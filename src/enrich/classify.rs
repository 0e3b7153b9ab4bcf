//! Trade classification.
//!
//! Outcome tokens follow the `PREFIX_BASE` naming convention (`YES_GNO`,
//! `NO_sDAI`). A pool is a prediction pool when one side is an outcome token
//! and the other is the plain base currency; otherwise it is a conditional
//! pool.

use tracing::warn;

use crate::enrich::fixed_point::FixedDecimal;
use crate::error::TradeError;
use crate::models::{
    normalize_address, EnrichedTrade, MarketCategory, Outcome, PoolType, RawTrade, SymbolMap,
    TokenSlot, TradeAnomaly, TradeSide,
};

const OUTCOME_SEPARATORS: &[char] = &['_', '-', ' '];

/// Splits an outcome-token symbol into its outcome and base symbol.
pub fn parse_outcome_symbol(symbol: &str) -> Option<(Outcome, &str)> {
    for (prefix, outcome) in [("YES", Outcome::Yes), ("NO", Outcome::No)] {
        let Some(head) = symbol.get(..prefix.len()) else {
            continue;
        };
        if !head.eq_ignore_ascii_case(prefix) {
            continue;
        }
        let rest = &symbol[prefix.len()..];
        if let Some(base) = rest.strip_prefix(OUTCOME_SEPARATORS) {
            return Some((outcome, base));
        }
    }
    None
}

fn outcome_of(symbol: Option<&str>) -> Option<(Outcome, &str)> {
    symbol.and_then(parse_outcome_symbol)
}

fn lookup<'a>(symbols: &'a SymbolMap, address: &str) -> Option<&'a str> {
    symbols
        .get(&normalize_address(address))
        .and_then(|s| s.as_deref())
}

/// Picks the token whose delta drives side and outcome.
///
/// An outcome token beats a plain token. Between two outcome tokens the one
/// not backed by the base currency (the company token) wins. Ties go to
/// token0.
fn primary_slot(symbol0: Option<&str>, symbol1: Option<&str>, base_currency: &str) -> TokenSlot {
    match (outcome_of(symbol0), outcome_of(symbol1)) {
        (Some(_), None) => TokenSlot::Token0,
        (None, Some(_)) => TokenSlot::Token1,
        (Some((_, base0)), Some((_, base1))) => {
            let currency0 = base0.eq_ignore_ascii_case(base_currency);
            let currency1 = base1.eq_ignore_ascii_case(base_currency);
            if currency0 && !currency1 {
                TokenSlot::Token1
            } else {
                TokenSlot::Token0
            }
        }
        (None, None) => TokenSlot::Token0,
    }
}

fn pool_type(symbol0: Option<&str>, symbol1: Option<&str>) -> PoolType {
    match outcome_of(symbol0).or_else(|| outcome_of(symbol1)) {
        Some((Outcome::Yes, _)) => PoolType::YesPool,
        Some((Outcome::No, _)) => PoolType::NoPool,
        _ => PoolType::UnknownPool,
    }
}

fn market_category(
    symbol0: Option<&str>,
    symbol1: Option<&str>,
    base_currency: &str,
) -> MarketCategory {
    let is_currency = |s: Option<&str>| s.is_some_and(|s| s.eq_ignore_ascii_case(base_currency));
    match (outcome_of(symbol0), outcome_of(symbol1)) {
        (Some(_), None) if is_currency(symbol1) => MarketCategory::Prediction,
        (None, Some(_)) if is_currency(symbol0) => MarketCategory::Prediction,
        _ => MarketCategory::Conditional,
    }
}

fn anomaly(amount0: &FixedDecimal, amount1: &FixedDecimal) -> Option<TradeAnomaly> {
    if amount0.is_zero() || amount1.is_zero() {
        Some(TradeAnomaly::ZeroDelta)
    } else if amount0.is_negative() && amount1.is_negative() {
        Some(TradeAnomaly::BothOutflow)
    } else if amount0.is_positive() && amount1.is_positive() {
        Some(TradeAnomaly::BothInflow)
    } else {
        None
    }
}

/// Classifies a raw trade using a pre-resolved symbol map.
///
/// Missing symbols degrade classification (unknown pool, conditional
/// category) but never fail it. Only missing identity fields or unparseable
/// amounts are errors.
pub fn classify(
    raw: &RawTrade,
    symbols: &SymbolMap,
    base_currency: &str,
) -> Result<EnrichedTrade, TradeError> {
    let key = raw.identity_key()?;
    let amount0 = FixedDecimal::parse(&raw.amount0)?;
    let amount1 = FixedDecimal::parse(&raw.amount1)?;

    let token0_symbol = lookup(symbols, &raw.token0).map(str::to_string);
    let token1_symbol = lookup(symbols, &raw.token1).map(str::to_string);
    let s0 = token0_symbol.as_deref();
    let s1 = token1_symbol.as_deref();

    let primary = primary_slot(s0, s1, base_currency);
    let (primary_amount, secondary_amount, primary_symbol, secondary_symbol) = match primary {
        TokenSlot::Token0 => (&amount0, &amount1, s0, s1),
        TokenSlot::Token1 => (&amount1, &amount0, s1, s0),
    };

    let side = if primary_amount.is_negative() {
        TradeSide::Sell
    } else {
        TradeSide::Buy
    };

    // Zero primary amount prices at 0 rather than failing.
    let price = secondary_amount
        .abs()
        .checked_div(&primary_amount.abs())
        .unwrap_or_default();

    let outcome = outcome_of(primary_symbol)
        .or_else(|| outcome_of(secondary_symbol))
        .map(|(o, _)| o)
        .unwrap_or(Outcome::Unknown);

    let anomaly = anomaly(&amount0, &amount1);
    if let Some(kind) = anomaly {
        warn!(
            trade = %key,
            amount0 = %amount0,
            amount1 = %amount1,
            anomaly = ?kind,
            "trade_deltas_not_a_swap"
        );
    }

    Ok(EnrichedTrade {
        raw: raw.clone(),
        key,
        pool_type: pool_type(s0, s1),
        market_category: market_category(s0, s1, base_currency),
        token0_symbol,
        token1_symbol,
        amount0,
        amount1,
        primary,
        outcome,
        side,
        price,
        anomaly,
    })
}
