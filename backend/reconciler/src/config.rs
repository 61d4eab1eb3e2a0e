//! Application configuration loaded from environment variables.
//!
//! Network-specific values (RPC endpoint, custody contracts, token decimals)
//! live in one [`NetworkConfig`] per [`Network`], read from variables that
//! share the network's prefix (`POLYGON_RPC_URL`, `ETHEREUM_RPC_URL`, …).

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{AppError, Result};

/// Blockchain networks the platform accepts donations on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum Network {
    Polygon,
    Ethereum,
}

impl Network {
    pub const ALL: [Network; 2] = [Network::Polygon, Network::Ethereum];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Polygon => "polygon",
            Self::Ethereum => "ethereum",
        }
    }

    fn env_prefix(&self) -> &'static str {
        match self {
            Self::Polygon => "POLYGON",
            Self::Ethereum => "ETHEREUM",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "polygon" => Ok(Self::Polygon),
            "ethereum" => Ok(Self::Ethereum),
            other => Err(AppError::Config(format!("Unknown network: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub network: Network,
    /// JSON-RPC endpoint (e.g. https://rpc-amoy.polygon.technology)
    pub rpc_url: String,
    /// Contract that emits `DonationMade`
    pub donation_contract: String,
    /// Custody contract that emits `MilestoneVerified` / `FundsReleased`
    pub milestone_contract: String,
    /// Audit registry contract
    pub audit_contract: String,
    /// Fixed-point decimals of the donated asset
    pub token_decimals: u32,
}

impl NetworkConfig {
    fn from_env(network: Network) -> Result<Option<Self>> {
        let prefix = network.env_prefix();
        let Ok(rpc_url) = env_var(&format!("{prefix}_RPC_URL")) else {
            return Ok(None);
        };
        let contract = |name: &str| {
            env_var(&format!("{prefix}_{name}"))
                .map(|addr| addr.to_ascii_lowercase())
                .map_err(|_| {
                    AppError::Config(format!(
                        "{prefix}_{name} is required when {prefix}_RPC_URL is set"
                    ))
                })
        };
        Ok(Some(NetworkConfig {
            network,
            rpc_url,
            donation_contract: contract("DONATION_CONTRACT")?,
            milestone_contract: contract("MILESTONE_CONTRACT")?,
            audit_contract: contract("AUDIT_CONTRACT")?,
            token_decimals: env_var(&format!("{prefix}_TOKEN_DECIMALS"))
                .unwrap_or_else(|_| "18".to_string())
                .parse()
                .map_err(|_| AppError::Config(format!("Invalid {prefix}_TOKEN_DECIMALS")))?,
        }))
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// Deadline for every chain gateway call
    pub rpc_timeout: Duration,
    /// Absolute tolerance when comparing claimed and on-chain amounts
    pub amount_tolerance: f64,
    /// Days between an audit's completion and its advised follow-up
    pub audit_followup_days: i64,
    pub networks: HashMap<Network, NetworkConfig>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let mut networks = HashMap::new();
        for network in Network::ALL {
            if let Some(cfg) = NetworkConfig::from_env(network)? {
                networks.insert(network, cfg);
            }
        }
        if networks.is_empty() {
            return Err(AppError::Config(
                "At least one network must be configured (e.g. POLYGON_RPC_URL)".to_string(),
            ));
        }

        Ok(Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./reconciler.db".to_string()),
            api_port: env_var("API_PORT")
                .unwrap_or_else(|_| "3001".to_string())
                .parse()
                .map_err(|_| AppError::Config("Invalid API_PORT".to_string()))?,
            rpc_timeout: Duration::from_secs(
                env_var("RPC_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .map_err(|_| AppError::Config("Invalid RPC_TIMEOUT_SECS".to_string()))?,
            ),
            amount_tolerance: env_var("AMOUNT_TOLERANCE")
                .unwrap_or_else(|_| "0.0001".to_string())
                .parse()
                .map_err(|_| AppError::Config("Invalid AMOUNT_TOLERANCE".to_string()))?,
            audit_followup_days: env_var("AUDIT_FOLLOWUP_DAYS")
                .unwrap_or_else(|_| "90".to_string())
                .parse()
                .map_err(|_| AppError::Config("Invalid AUDIT_FOLLOWUP_DAYS".to_string()))?,
            networks,
        })
    }

    /// Look up the configuration for `network`.
    ///
    /// Fails with a configuration error when the network is not enabled.
    pub fn network(&self, network: Network) -> Result<&NetworkConfig> {
        self.networks
            .get(&network)
            .ok_or_else(|| AppError::Config(format!("Network {network} is not configured")))
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| AppError::Config(format!("Missing env var: {key}")))
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    let mut networks = HashMap::new();
    networks.insert(
        Network::Polygon,
        NetworkConfig {
            network: Network::Polygon,
            rpc_url: "http://localhost:8545".to_string(),
            donation_contract: crate::test_support::DONATION_CONTRACT.to_string(),
            milestone_contract: crate::test_support::MILESTONE_CONTRACT.to_string(),
            audit_contract: crate::test_support::AUDIT_CONTRACT.to_string(),
            token_decimals: 18,
        },
    );
    Config {
        database_url: "sqlite::memory:".to_string(),
        api_port: 0,
        rpc_timeout: Duration::from_secs(2),
        amount_tolerance: 0.0001,
        audit_followup_days: 90,
        networks,
    }
}
