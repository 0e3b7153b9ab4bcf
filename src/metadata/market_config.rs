//! Static token configuration for a futarchy market.
//!
//! Market configs have been published in several shapes over time. Each shape
//! is a [`SchemaVersion`]; lookups walk [`SchemaVersion::RESOLUTION_ORDER`]
//! and return the first match, so newer shapes shadow older ones.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEntry {
    pub address: String,
    pub symbol: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseTokens {
    #[serde(default)]
    pub currency: Option<TokenEntry>,
    #[serde(default)]
    pub company: Option<TokenEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrapInfo {
    pub wrapped_collateral_token_address: String,
    #[serde(default)]
    pub token_symbol: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedPosition {
    #[serde(default)]
    pub wrap: Option<WrapInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionPair {
    #[serde(default)]
    pub yes: Option<WrappedPosition>,
    #[serde(default)]
    pub no: Option<WrappedPosition>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyMergeConfig {
    #[serde(default)]
    pub currency_positions: Option<PositionPair>,
    #[serde(default)]
    pub company_positions: Option<PositionPair>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_tokens: Option<BaseTokens>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub position_tokens: Vec<TokenEntry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge_config: Option<LegacyMergeConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency_symbol: Option<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tokens: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaVersion {
    /// `baseTokens` + `positionTokens`
    Current,
    /// `mergeConfig.{currency,company}Positions.{yes,no}.wrap`
    LegacyMerge,
    /// flat `tokens` address -> symbol map
    LegacyTokenMap,
}

impl SchemaVersion {
    pub const RESOLUTION_ORDER: [SchemaVersion; 3] = [
        SchemaVersion::Current,
        SchemaVersion::LegacyMerge,
        SchemaVersion::LegacyTokenMap,
    ];

    pub fn lookup(self, config: &MarketConfig, address: &str) -> Option<String> {
        match self {
            SchemaVersion::Current => lookup_current(config, address),
            SchemaVersion::LegacyMerge => lookup_legacy_merge(config, address),
            SchemaVersion::LegacyTokenMap => config
                .tokens
                .iter()
                .find(|(addr, _)| same_address(addr, address))
                .map(|(_, symbol)| symbol.clone()),
        }
    }
}

#[inline]
fn same_address(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

fn non_empty(symbol: &str) -> Option<String> {
    let trimmed = symbol.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn lookup_current(config: &MarketConfig, address: &str) -> Option<String> {
    let base = config.base_tokens.as_ref();
    base.and_then(|b| b.currency.as_ref())
        .into_iter()
        .chain(base.and_then(|b| b.company.as_ref()))
        .chain(config.position_tokens.iter())
        .find(|entry| same_address(&entry.address, address))
        .and_then(|entry| non_empty(&entry.symbol))
}

fn lookup_legacy_merge(config: &MarketConfig, address: &str) -> Option<String> {
    let merge = config.merge_config.as_ref()?;
    // (pair, base symbol) so unlabeled wraps still get a PREFIX_BASE symbol
    let company_base = config
        .base_tokens
        .as_ref()
        .and_then(|b| b.company.as_ref())
        .map(|c| c.symbol.as_str());
    let currency_base = legacy_currency_symbol(config);

    let pairs = [
        (merge.currency_positions.as_ref(), currency_base),
        (merge.company_positions.as_ref(), company_base),
    ];

    for (pair, base) in pairs {
        let Some(pair) = pair else { continue };
        for (prefix, position) in [("YES", pair.yes.as_ref()), ("NO", pair.no.as_ref())] {
            let Some(wrap) = position.and_then(|p| p.wrap.as_ref()) else {
                continue;
            };
            if !same_address(&wrap.wrapped_collateral_token_address, address) {
                continue;
            }
            if let Some(symbol) = wrap.token_symbol.as_deref().and_then(non_empty) {
                return Some(symbol);
            }
            return base.map(|b| format!("{}_{}", prefix, b));
        }
    }
    None
}

fn legacy_currency_symbol(config: &MarketConfig) -> Option<&str> {
    config
        .currency_symbol
        .as_deref()
        .or_else(|| {
            config
                .base_tokens
                .as_ref()
                .and_then(|b| b.currency.as_ref())
                .map(|c| c.symbol.as_str())
        })
        .filter(|s| !s.trim().is_empty())
}

impl MarketConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read market config {}", path.display()))?;
        Self::from_json(&contents)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse market config JSON")
    }

    /// First schema (in resolution order) that knows `address`.
    pub fn lookup_symbol(&self, address: &str) -> Option<(SchemaVersion, String)> {
        SchemaVersion::RESOLUTION_ORDER
            .iter()
            .find_map(|schema| schema.lookup(self, address).map(|s| (*schema, s)))
    }

    /// Base currency symbol declared by the config, current schema first.
    pub fn base_currency_symbol(&self) -> Option<&str> {
        self.base_tokens
            .as_ref()
            .and_then(|b| b.currency.as_ref())
            .map(|c| c.symbol.as_str())
            .filter(|s| !s.trim().is_empty())
            .or_else(|| legacy_currency_symbol(self))
    }
}
