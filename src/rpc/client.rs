//! Chain RPC client for ERC-20 symbol lookups
//!
//! Issues `eth_call` against `symbol()` and decodes both the standard ABI
//! `string` return and the legacy `bytes32` form.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::error::RpcError;
use crate::rpc::rotation::Endpoint;

/// `keccak256("symbol()")[..4]`
pub const SYMBOL_SELECTOR: &str = "0x95d89b41";

#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Symbol of the ERC-20 at `token_address`, as reported by `endpoint`.
    async fn token_symbol(&self, endpoint: &Endpoint, token_address: &str)
        -> Result<String, RpcError>;
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Clone)]
pub struct HttpChainRpc {
    client: Client,
}

impl HttpChainRpc {
    pub fn new(request_timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .user_agent("futarchy-sync/0.1")
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ChainRpc for HttpChainRpc {
    async fn token_symbol(
        &self,
        endpoint: &Endpoint,
        token_address: &str,
    ) -> Result<String, RpcError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_call",
            "params": [{"to": token_address, "data": SYMBOL_SELECTOR}, "latest"],
        });

        let transient = |reason: String| RpcError::Transient {
            endpoint: endpoint.url.clone(),
            reason,
        };
        let permanent = |reason: String| RpcError::Permanent {
            endpoint: endpoint.url.clone(),
            reason,
        };

        let resp = self
            .client
            .post(&endpoint.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| transient(e.to_string()))?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(RpcError::RateLimited {
                endpoint: endpoint.url.clone(),
            });
        }
        if status.is_server_error() {
            return Err(transient(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(permanent(format!("HTTP {}", status)));
        }

        let parsed: JsonRpcResponse = resp
            .json()
            .await
            .map_err(|e| transient(format!("bad JSON-RPC body: {}", e)))?;

        if let Some(err) = parsed.error {
            debug!(endpoint = %endpoint.url, code = err.code, message = %err.message, "eth_call_error");
            return Err(classify_rpc_error(&endpoint.url, err.code, &err.message));
        }

        let result = parsed
            .result
            .ok_or_else(|| permanent("empty result".to_string()))?;
        decode_symbol(&result).ok_or_else(|| permanent(format!("undecodable symbol {}", result)))
    }
}

/// JSON-RPC error codes: -32005 and "rate limit" messages are throttling,
/// -32603/-32000 are node-side hiccups, everything else (reverts) is final.
fn classify_rpc_error(endpoint: &str, code: i64, message: &str) -> RpcError {
    let lower = message.to_lowercase();
    if code == -32005 || lower.contains("rate limit") || lower.contains("too many requests") {
        return RpcError::RateLimited {
            endpoint: endpoint.to_string(),
        };
    }
    if lower.contains("revert") || lower.contains("invalid") {
        return RpcError::Permanent {
            endpoint: endpoint.to_string(),
            reason: message.to_string(),
        };
    }
    if code == -32603 || code == -32000 {
        return RpcError::Transient {
            endpoint: endpoint.to_string(),
            reason: message.to_string(),
        };
    }
    RpcError::Permanent {
        endpoint: endpoint.to_string(),
        reason: message.to_string(),
    }
}

/// Decodes an `eth_call` result holding either an ABI-encoded `string` or a
/// right-padded `bytes32`.
pub fn decode_symbol(result: &str) -> Option<String> {
    let bytes = hex::decode(result.trim().trim_start_matches("0x")).ok()?;

    let text = if bytes.len() == 32 {
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(32);
        String::from_utf8(bytes[..end].to_vec()).ok()?
    } else if bytes.len() >= 64 {
        let offset = word_to_usize(&bytes[..32])?;
        let len_end = offset.checked_add(32)?;
        let len = word_to_usize(bytes.get(offset..len_end)?)?;
        let data = bytes.get(len_end..len_end.checked_add(len)?)?;
        String::from_utf8(data.to_vec()).ok()?
    } else {
        return None;
    };

    let symbol = text.trim_matches(char::from(0)).trim();
    (!symbol.is_empty()).then(|| symbol.to_string())
}

fn word_to_usize(word: &[u8]) -> Option<usize> {
    if word.len() != 32 || word[..24].iter().any(|&b| b != 0) {
        return None;
    }
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&word[24..]);
    usize::try_from(u64::from_be_bytes(buf)).ok()
}
