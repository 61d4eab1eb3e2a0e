//! Read-only access to the chain.
//!
//! [`ChainGateway`] is the only way the rest of the service touches a
//! blockchain. It is injected as an `Arc<dyn ChainGateway>`: production
//! wires in [`crate::rpc::RpcGateway`], tests a scripted fake.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Network;
use crate::errors::ChainError;
use crate::events::{self, ChainEvent, EventSchema};

/// A transaction as seen by the node; `block_number` is `None` while pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: String,
    pub from: String,
    pub to: Option<String>,
    pub block_number: Option<u64>,
    pub value: u128,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    pub log_index: Option<u64>,
}

/// Execution receipt of a mined transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub transaction_hash: String,
    /// `false` when the transaction reverted.
    pub success: bool,
    pub from: String,
    pub to: Option<String>,
    pub block_number: u64,
    pub gas_used: u128,
    pub effective_gas_price: Option<u128>,
    pub logs: Vec<Log>,
}

impl Receipt {
    /// Total fee paid in wei, when the node reports the effective gas price.
    pub fn fee_paid(&self) -> Option<u128> {
        self.effective_gas_price
            .and_then(|price| price.checked_mul(self.gas_used))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub number: u64,
    pub hash: String,
    pub timestamp: i64,
}

/// Current fee market, in wei.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeEstimate {
    pub network: Network,
    pub gas_price: u128,
    pub max_priority_fee: Option<u128>,
}

#[async_trait]
pub trait ChainGateway: Send + Sync {
    /// `Ok(None)` when the node does not know the hash.
    async fn get_transaction(
        &self,
        hash: &str,
        network: Network,
    ) -> Result<Option<Transaction>, ChainError>;

    /// `Ok(None)` until the transaction has been mined.
    async fn get_receipt(&self, hash: &str, network: Network)
        -> Result<Option<Receipt>, ChainError>;

    async fn get_block(&self, number: u64, network: Network) -> Result<Option<Block>, ChainError>;

    async fn estimate_fee(&self, network: Network) -> Result<FeeEstimate, ChainError>;

    /// Decode the receipt's logs against `schema`.
    fn decode_events(
        &self,
        receipt: &Receipt,
        schema: &EventSchema<'_>,
    ) -> Result<Vec<ChainEvent>, ChainError> {
        events::decode_events(receipt, schema)
    }
}

/// Fetch a receipt that must exist and have succeeded.
///
/// An unknown hash is `NotFound`, a known but unmined one `NotConfirmed`,
/// and a reverted one `TransactionFailed`.
pub async fn fetch_successful_receipt(
    gateway: &dyn ChainGateway,
    hash: &str,
    network: Network,
) -> Result<Receipt, ChainError> {
    let Some(receipt) = gateway.get_receipt(hash, network).await? else {
        return match gateway.get_transaction(hash, network).await? {
            Some(_) => Err(ChainError::NotConfirmed(hash.to_string())),
            None => Err(ChainError::NotFound(hash.to_string())),
        };
    };
    if !receipt.success {
        return Err(ChainError::TransactionFailed(hash.to_string()));
    }
    Ok(receipt)
}

/// Fail with `WrongContract` unless the receipt was sent to `expected`.
pub fn ensure_destination(receipt: &Receipt, expected: &str) -> Result<(), ChainError> {
    match receipt.to.as_deref() {
        Some(to) if to.eq_ignore_ascii_case(expected) => Ok(()),
        other => Err(ChainError::WrongContract {
            expected: expected.to_ascii_lowercase(),
            actual: other.unwrap_or("<contract creation>").to_ascii_lowercase(),
        }),
    }
}
