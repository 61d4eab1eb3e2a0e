//! EVM JSON-RPC client: the production [`ChainGateway`].
//!
//! ## Resilience
//!
//! * Exponential back-off is applied when the node is unreachable, rate-limits
//!   us, answers with a non-2xx status or a body that is not a JSON-RPC
//!   response, or returns a soft JSON-RPC error, up to [`MAX_BACKOFF_MS`].
//! * Every gateway call is bounded by `RPC_TIMEOUT_SECS`, retries included.
//!   An expired deadline surfaces as [`ChainError::RpcUnavailable`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::{Config, Network};
use crate::errors::{ChainError, Result};
use crate::gateway::{Block, ChainGateway, FeeEstimate, Log, Receipt, Transaction};

const INITIAL_BACKOFF_MS: u64 = 200;
const MAX_BACKOFF_MS: u64 = 2_000;

// ─────────────────────────────────────────────────────────
// JSON-RPC response shapes
// ─────────────────────────────────────────────────────────

/// `result` is `None` when the member is absent and `Some(Null)` when the
/// node answered `null`.
#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    error: Option<RpcError>,
}

fn present<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<Option<Value>, D::Error> {
    Value::deserialize(de).map(Some)
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTransaction {
    hash: String,
    from: String,
    to: Option<String>,
    block_number: Option<String>,
    #[serde(default)]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    transaction_hash: String,
    /// `0x1` on success, `0x0` when reverted. Absent on pre-Byzantium chains.
    status: Option<String>,
    from: String,
    to: Option<String>,
    block_number: String,
    gas_used: String,
    effective_gas_price: Option<String>,
    #[serde(default)]
    logs: Vec<RawLog>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLog {
    address: String,
    topics: Vec<String>,
    data: String,
    log_index: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawBlock {
    number: String,
    hash: String,
    timestamp: String,
}

impl TryFrom<RawTransaction> for Transaction {
    type Error = ChainError;

    fn try_from(raw: RawTransaction) -> std::result::Result<Self, ChainError> {
        Ok(Transaction {
            hash: raw.hash.to_ascii_lowercase(),
            from: raw.from.to_ascii_lowercase(),
            to: raw.to.map(|to| to.to_ascii_lowercase()),
            block_number: raw.block_number.as_deref().map(parse_u64).transpose()?,
            value: raw.value.as_deref().map(parse_quantity).transpose()?.unwrap_or(0),
        })
    }
}

impl TryFrom<RawLog> for Log {
    type Error = ChainError;

    fn try_from(raw: RawLog) -> std::result::Result<Self, ChainError> {
        Ok(Log {
            address: raw.address.to_ascii_lowercase(),
            topics: raw.topics.into_iter().map(|t| t.to_ascii_lowercase()).collect(),
            data: raw.data,
            log_index: raw.log_index.as_deref().map(parse_u64).transpose()?,
        })
    }
}

impl TryFrom<RawReceipt> for Receipt {
    type Error = ChainError;

    fn try_from(raw: RawReceipt) -> std::result::Result<Self, ChainError> {
        let success = match raw.status.as_deref() {
            Some(status) => parse_quantity(status)? == 1,
            None => true,
        };
        Ok(Receipt {
            transaction_hash: raw.transaction_hash.to_ascii_lowercase(),
            success,
            from: raw.from.to_ascii_lowercase(),
            to: raw.to.map(|to| to.to_ascii_lowercase()),
            block_number: parse_u64(&raw.block_number)?,
            gas_used: parse_quantity(&raw.gas_used)?,
            effective_gas_price: raw
                .effective_gas_price
                .as_deref()
                .map(parse_quantity)
                .transpose()?,
            logs: raw
                .logs
                .into_iter()
                .map(Log::try_from)
                .collect::<std::result::Result<_, _>>()?,
        })
    }
}

impl TryFrom<RawBlock> for Block {
    type Error = ChainError;

    fn try_from(raw: RawBlock) -> std::result::Result<Self, ChainError> {
        let timestamp = parse_u64(&raw.timestamp)?;
        Ok(Block {
            number: parse_u64(&raw.number)?,
            hash: raw.hash.to_ascii_lowercase(),
            timestamp: i64::try_from(timestamp).map_err(|_| {
                ChainError::DecodeFailure(format!("timestamp {timestamp} out of range"))
            })?,
        })
    }
}

/// Parse a hex `QUANTITY` such as `0x1a`.
pub fn parse_quantity(raw: &str) -> std::result::Result<u128, ChainError> {
    let digits = raw
        .strip_prefix("0x")
        .ok_or_else(|| ChainError::DecodeFailure(format!("quantity without 0x prefix: {raw}")))?;
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16)
        .map_err(|e| ChainError::DecodeFailure(format!("invalid quantity {raw}: {e}")))
}

fn parse_u64(raw: &str) -> std::result::Result<u64, ChainError> {
    let value = parse_quantity(raw)?;
    u64::try_from(value)
        .map_err(|_| ChainError::DecodeFailure(format!("{raw} does not fit in u64")))
}

// ─────────────────────────────────────────────────────────
// Gateway
// ─────────────────────────────────────────────────────────

pub struct RpcGateway {
    client: Client,
    endpoints: HashMap<Network, String>,
    timeout: Duration,
}

impl RpcGateway {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder().timeout(config.rpc_timeout).build()?;
        let endpoints = config
            .networks
            .iter()
            .map(|(network, cfg)| (*network, cfg.rpc_url.clone()))
            .collect();
        Ok(Self {
            client,
            endpoints,
            timeout: config.rpc_timeout,
        })
    }

    /// Issue one JSON-RPC call; `Ok(None)` when the node answers `null`.
    async fn call<T: DeserializeOwned>(
        &self,
        network: Network,
        method: &str,
        params: Value,
    ) -> std::result::Result<Option<T>, ChainError> {
        let url = self.endpoints.get(&network).ok_or_else(|| {
            ChainError::RpcUnavailable(format!("no RPC endpoint configured for {network}"))
        })?;

        let call = self.call_with_backoff(url, method, &params);
        let result = tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| {
                warn!(%network, method, "RPC deadline exceeded");
                ChainError::RpcUnavailable(format!(
                    "{method} on {network} exceeded {}ms",
                    self.timeout.as_millis()
                ))
            })??;

        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .map_err(|e| ChainError::DecodeFailure(format!("{method}: {e}")))
    }

    async fn call_with_backoff(
        &self,
        url: &str,
        method: &str,
        params: &Value,
    ) -> std::result::Result<Value, ChainError> {
        let mut backoff = INITIAL_BACKOFF_MS;

        loop {
            let response = self
                .client
                .post(url)
                .json(&json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "method": method,
                    "params": params,
                }))
                .send()
                .await;

            match response {
                Err(e) => {
                    warn!("RPC request failed (will retry in {backoff}ms): {e}");
                }
                Ok(resp) if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS => {
                    warn!("Rate-limited by RPC (will retry in {backoff}ms)");
                }
                Ok(resp) if !resp.status().is_success() => {
                    warn!(
                        method,
                        status = %resp.status(),
                        "RPC provider error (will retry in {backoff}ms)"
                    );
                }
                Ok(resp) => match resp.json::<RpcResponse>().await {
                    Err(e) => {
                        warn!(method, "Malformed RPC response (will retry in {backoff}ms): {e}");
                    }
                    Ok(RpcResponse {
                        error: Some(err), ..
                    }) => {
                        // -32600 / -32601 are hard failures; everything else is retried
                        if err.code == -32600 || err.code == -32601 {
                            return Err(ChainError::RpcUnavailable(format!(
                                "RPC hard error {}: {}",
                                err.code, err.message
                            )));
                        }
                        warn!(
                            "RPC soft error (will retry in {backoff}ms): {} {}",
                            err.code, err.message
                        );
                    }
                    Ok(RpcResponse {
                        result: Some(result),
                        ..
                    }) => {
                        debug!(method, "RPC call succeeded");
                        return Ok(result);
                    }
                    Ok(RpcResponse { result: None, .. }) => {
                        warn!(method, "RPC response without result (will retry in {backoff}ms)");
                    }
                },
            }

            tokio::time::sleep(Duration::from_millis(backoff)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF_MS);
        }
    }
}

#[async_trait]
impl ChainGateway for RpcGateway {
    async fn get_transaction(
        &self,
        hash: &str,
        network: Network,
    ) -> std::result::Result<Option<Transaction>, ChainError> {
        self.call::<RawTransaction>(network, "eth_getTransactionByHash", json!([hash]))
            .await?
            .map(Transaction::try_from)
            .transpose()
    }

    async fn get_receipt(
        &self,
        hash: &str,
        network: Network,
    ) -> std::result::Result<Option<Receipt>, ChainError> {
        self.call::<RawReceipt>(network, "eth_getTransactionReceipt", json!([hash]))
            .await?
            .map(Receipt::try_from)
            .transpose()
    }

    async fn get_block(
        &self,
        number: u64,
        network: Network,
    ) -> std::result::Result<Option<Block>, ChainError> {
        let params = json!([format!("{number:#x}"), false]);
        self.call::<RawBlock>(network, "eth_getBlockByNumber", params)
            .await?
            .map(Block::try_from)
            .transpose()
    }

    async fn estimate_fee(&self, network: Network) -> std::result::Result<FeeEstimate, ChainError> {
        let gas_price = self
            .call::<String>(network, "eth_gasPrice", json!([]))
            .await?
            .ok_or_else(|| ChainError::DecodeFailure("eth_gasPrice returned null".to_string()))?;

        // Legacy nodes do not implement the EIP-1559 tip endpoint.
        let max_priority_fee = match self
            .call::<String>(network, "eth_maxPriorityFeePerGas", json!([]))
            .await
        {
            Ok(tip) => tip.as_deref().map(parse_quantity).transpose()?,
            Err(e) => {
                debug!(%network, "No priority fee available: {e}");
                None
            }
        };

        Ok(FeeEstimate {
            network,
            gas_price: parse_quantity(&gas_price)?,
            max_priority_fee,
        })
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
