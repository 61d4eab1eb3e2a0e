//! Per-network deployment details and fee quotes for clients that are about
//! to send a donation or release transaction.

use serde::Serialize;
use tracing::debug;

use crate::app::AppState;
use crate::config::{Network, NetworkConfig};
use crate::errors::{invalid_input, Result};
use crate::gateway::FeeEstimate;

/// Public view of a [`NetworkConfig`]; the RPC endpoint is not exposed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInfo {
    pub network: Network,
    pub donation_contract: String,
    pub milestone_contract: String,
    pub audit_contract: String,
    pub token_decimals: u32,
}

impl From<&NetworkConfig> for NetworkInfo {
    fn from(cfg: &NetworkConfig) -> Self {
        Self {
            network: cfg.network,
            donation_contract: cfg.donation_contract.clone(),
            milestone_contract: cfg.milestone_contract.clone(),
            audit_contract: cfg.audit_contract.clone(),
            token_decimals: cfg.token_decimals,
        }
    }
}

fn enabled(state: &AppState, network: Network) -> Result<&NetworkConfig> {
    state
        .config
        .network(network)
        .map_err(|_| invalid_input(format!("network {network} is not supported")))
}

/// Every enabled network, in a stable order.
pub fn list(state: &AppState) -> Vec<NetworkInfo> {
    Network::ALL
        .iter()
        .filter_map(|n| state.config.networks.get(n))
        .map(NetworkInfo::from)
        .collect()
}

pub fn describe(state: &AppState, network: Network) -> Result<NetworkInfo> {
    enabled(state, network).map(NetworkInfo::from)
}

/// Current gas price (and EIP-1559 tip where supported) on `network`.
pub async fn estimate_fee(state: &AppState, network: Network) -> Result<FeeEstimate> {
    enabled(state, network)?;
    let fee = state.gateway.estimate_fee(network).await?;
    debug!(%network, gas_price = %fee.gas_price, "Fee estimated");
    Ok(fee)
}
