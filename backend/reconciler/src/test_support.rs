//! Fixtures shared by the unit and scenario tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::SqlitePool;
use tempfile::TempDir;

use crate::app::AppState;
use crate::config::{test_config, Network};
use crate::db;
use crate::errors::ChainError;
use crate::gateway::{Block, ChainGateway, FeeEstimate, Log, Receipt, Transaction};
use crate::models::{Actor, CampaignStatus, Role};

pub const DONATION_CONTRACT: &str = "0x00000000000000000000000000000000000d0a7e";
pub const MILESTONE_CONTRACT: &str = "0x000000000000000000000000000000000000a11e";
pub const AUDIT_CONTRACT: &str = "0x00000000000000000000000000000000000a0d17";
pub const DONOR_ADDRESS: &str = "0x00000000000000000000000000000000000000d0";

pub const OWNER: &str = "charity-1";

/// One whole token in base units (18 decimals).
pub const UNIT: u128 = 1_000_000_000_000_000_000;

pub fn owner() -> Actor {
    Actor::new(OWNER, Role::Charity)
}

pub fn admin() -> Actor {
    Actor::new("admin-1", Role::Admin)
}

pub fn auditor() -> Actor {
    Actor::new("auditor-1", Role::Auditor)
}

pub fn donor(id: &str) -> Actor {
    Actor::new(id, Role::Donor)
}

pub fn tx_hash(n: u64) -> String {
    format!("0x{n:064x}")
}

/// Fresh migrated database in a temporary directory.
pub async fn setup_db() -> (TempDir, SqlitePool) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("test.db");
    let pool = db::init_pool(path.to_str().expect("utf-8 path"))
        .await
        .expect("init pool");
    (dir, pool)
}

pub async fn setup_state() -> (TempDir, AppState, Arc<FakeGateway>) {
    let (dir, pool) = setup_db().await;
    let gateway = Arc::new(FakeGateway::default());
    let state = AppState::new(pool, test_config(), gateway.clone());
    (dir, state, gateway)
}

/// Insert an `active` campaign owned by [`OWNER`] with no milestones.
pub async fn insert_active_campaign(pool: &SqlitePool, target: f64) -> i64 {
    let mut conn = pool.acquire().await.expect("conn");
    db::insert_campaign(&mut conn, OWNER, "Clean water", target, CampaignStatus::Active, 1)
        .await
        .expect("insert campaign")
}

/// Scripted in-memory chain.
#[derive(Default)]
pub struct FakeGateway {
    receipts: Mutex<HashMap<String, Receipt>>,
    pending: Mutex<HashSet<String>>,
    unavailable: AtomicBool,
    calls: AtomicUsize,
}

impl FakeGateway {
    pub fn receipt(hash: &str, to: &str, logs: Vec<Log>) -> Receipt {
        Receipt {
            transaction_hash: hash.to_string(),
            success: true,
            from: DONOR_ADDRESS.to_string(),
            to: Some(to.to_string()),
            block_number: 42,
            gas_used: 50_000,
            effective_gas_price: Some(30_000_000_000),
            logs,
        }
    }

    pub fn add_receipt(&self, receipt: Receipt) {
        self.receipts
            .lock()
            .unwrap()
            .insert(receipt.transaction_hash.clone(), receipt);
    }

    pub fn add_pending(&self, hash: &str) {
        self.pending.lock().unwrap().insert(hash.to_string());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of RPC-style calls served so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn enter(&self) -> Result<(), ChainError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ChainError::RpcUnavailable("deadline exceeded".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainGateway for FakeGateway {
    async fn get_transaction(
        &self,
        hash: &str,
        _network: Network,
    ) -> Result<Option<Transaction>, ChainError> {
        self.enter()?;
        if let Some(receipt) = self.receipts.lock().unwrap().get(hash) {
            return Ok(Some(Transaction {
                hash: hash.to_string(),
                from: receipt.from.clone(),
                to: receipt.to.clone(),
                block_number: Some(receipt.block_number),
                value: 0,
            }));
        }
        if self.pending.lock().unwrap().contains(hash) {
            return Ok(Some(Transaction {
                hash: hash.to_string(),
                from: DONOR_ADDRESS.to_string(),
                to: Some(DONATION_CONTRACT.to_string()),
                block_number: None,
                value: 0,
            }));
        }
        Ok(None)
    }

    async fn get_receipt(
        &self,
        hash: &str,
        _network: Network,
    ) -> Result<Option<Receipt>, ChainError> {
        self.enter()?;
        Ok(self.receipts.lock().unwrap().get(hash).cloned())
    }

    async fn get_block(&self, number: u64, _network: Network) -> Result<Option<Block>, ChainError> {
        self.enter()?;
        Ok(Some(Block {
            number,
            hash: tx_hash(number),
            timestamp: 1_700_000_000 + number as i64,
        }))
    }

    async fn estimate_fee(&self, network: Network) -> Result<FeeEstimate, ChainError> {
        self.enter()?;
        Ok(FeeEstimate {
            network,
            gas_price: 30_000_000_000,
            max_priority_fee: Some(1_500_000_000),
        })
    }
}
