//! Donation reconciler: matches off-chain donation claims against the chain.
//!
//! ## Flow
//!
//! 1. [`submit_claim`] applies the duplicate-transaction guard and creates (or
//!    reuses) a `pending` donation.
//! 2. [`reconcile`] checks the chain through [`verify_on_chain`]. A verdict
//!    confirms the donation and credits the campaign in one transaction.
//!    A definitive failure moves the donation to `failed`.
//! 3. Transient failures (`RpcUnavailable`, `NotConfirmed`) leave it
//!    `pending`, so the caller can retry [`reconcile`] later.
//!
//! Re-running [`reconcile`] on a confirmed or failed donation returns the
//! stored record and never touches the chain or the campaign aggregates.

use tracing::{debug, info, warn};

use crate::aggregator;
use crate::app::AppState;
use crate::config::Network;
use crate::db;
use crate::errors::{
    invalid_input, invalid_state, not_found, unauthorized, AppError, ChainError,
    ReconciliationError, Result,
};
use crate::events::{to_display_units, ChainEvent, EventKind, EventSchema};
use crate::gateway::{self, ChainGateway};
use crate::models::{Actor, CampaignStatus, Donation, DonationClaim, DonationStatus, Verdict};

/// Everything needed to check one transaction against the chain.
#[derive(Debug, Clone)]
pub struct VerificationRequest<'a> {
    pub campaign_id: i64,
    pub expected_amount: f64,
    pub transaction_hash: &'a str,
    pub network: Network,
    pub expected_contract: &'a str,
    pub token_decimals: u32,
    pub tolerance: f64,
}

// ─────────────────────────────────────────────────────────
// Operations
// ─────────────────────────────────────────────────────────

/// `POST donation.verify`: register a claim and reconcile it.
///
/// The duplicate-transaction guard runs before any campaign check, so a
/// reused hash is always reported as such.
pub async fn submit_claim(
    state: &AppState,
    actor: &Actor,
    mut claim: DonationClaim,
) -> Result<Donation> {
    claim.transaction_hash = normalize_tx_hash(&claim.transaction_hash)?;
    if !claim.amount.is_finite() || claim.amount <= 0.0 {
        return Err(invalid_input("donation amount must be positive"));
    }
    state
        .config
        .network(claim.network)
        .map_err(|_| invalid_input(format!("network {} is not supported", claim.network)))?;

    let donation_id = match db::get_donation_by_tx(&state.pool, &claim.transaction_hash).await? {
        Some(existing)
            if existing.status == DonationStatus::Pending
                && existing.donor_id == actor.id
                && existing.campaign_id == claim.campaign_id =>
        {
            if existing.network != claim.network
                || !amounts_match(claim.amount, existing.amount, state.config.amount_tolerance)
            {
                return Err(invalid_input(format!(
                    "donation {} was claimed as {} on {}",
                    existing.id, existing.amount, existing.network
                )));
            }
            debug!(donation_id = existing.id, "Retrying pending donation");
            existing.id
        }
        Some(existing) => {
            warn!(
                tx = %claim.transaction_hash,
                existing = existing.id,
                donor = %actor.id,
                "Rejected reuse of a transaction hash"
            );
            return Err(ReconciliationError::DuplicateTransaction(claim.transaction_hash).into());
        }
        None => {
            let campaign = db::get_campaign(&state.pool, claim.campaign_id)
                .await?
                .ok_or_else(|| not_found(format!("campaign {}", claim.campaign_id)))?;
            if campaign.status != CampaignStatus::Active {
                return Err(invalid_state(format!(
                    "campaign {} is {} and does not accept donations",
                    campaign.id,
                    campaign.status.as_str()
                )));
            }
            db::insert_donation(&state.pool, &actor.id, &claim, db::unix_now()).await?
        }
    };

    reconcile(state, donation_id).await
}

/// `POST donation.reconcile`: (re)verify a known donation.
pub async fn reconcile(state: &AppState, donation_id: i64) -> Result<Donation> {
    let donation = get_donation(state, donation_id).await?;
    if donation.status != DonationStatus::Pending {
        debug!(donation_id, status = ?donation.status, "Donation already settled");
        return Ok(donation);
    }

    let network = state.config.network(donation.network)?;
    let request = VerificationRequest {
        campaign_id: donation.campaign_id,
        expected_amount: donation.amount,
        transaction_hash: &donation.transaction_hash,
        network: donation.network,
        expected_contract: &network.donation_contract,
        token_decimals: network.token_decimals,
        tolerance: state.config.amount_tolerance,
    };

    match verify_on_chain(state.gateway.as_ref(), &request).await {
        Ok(verdict) => confirm(state, &donation, &verdict).await,
        Err(AppError::Chain(e)) if e.is_transient() => {
            warn!(donation_id, "Reconciliation deferred: {e}");
            Err(e.into())
        }
        Err(e) => {
            let failed = db::fail_donation(
                &state.pool,
                donation_id,
                false,
                e.code(),
                &e.to_string(),
                db::unix_now(),
            )
            .await?;
            warn!(
                donation_id,
                code = e.code(),
                transitioned = failed,
                "Donation verification failed: {e}"
            );
            Err(e)
        }
    }
}

/// Admin reversal of a confirmed donation (e.g. after a chain reorg).
pub async fn reverse(
    state: &AppState,
    actor: &Actor,
    donation_id: i64,
    reason: &str,
) -> Result<Donation> {
    if !actor.is_admin() {
        return Err(unauthorized("only admins can reverse donations"));
    }
    if reason.trim().is_empty() {
        return Err(invalid_input("a reversal reason is required"));
    }
    let donation = get_donation(state, donation_id).await?;

    let mut tx = state.pool.begin().await?;
    let reversed =
        db::fail_donation(&mut *tx, donation_id, true, "REVERSED", reason, db::unix_now()).await?;
    if !reversed {
        return Err(invalid_state(format!(
            "donation {donation_id} is not confirmed"
        )));
    }
    let amount = donation.onchain_amount.unwrap_or(donation.amount);
    aggregator::reverse_donation(&mut tx, donation.campaign_id, amount).await?;
    tx.commit().await?;

    info!(donation_id, by = %actor.id, "Donation reversed: {reason}");
    get_donation(state, donation_id).await
}

pub async fn get_donation(state: &AppState, donation_id: i64) -> Result<Donation> {
    db::get_donation(&state.pool, donation_id)
        .await?
        .ok_or_else(|| not_found(format!("donation {donation_id}")))
}

pub async fn list_for_campaign(state: &AppState, campaign_id: i64) -> Result<Vec<Donation>> {
    db::list_donations_for_campaign(&state.pool, campaign_id).await
}

async fn confirm(state: &AppState, donation: &Donation, verdict: &Verdict) -> Result<Donation> {
    let mut tx = state.pool.begin().await?;
    let confirmed = db::confirm_donation(&mut tx, donation.id, verdict, db::unix_now()).await?;
    if confirmed {
        aggregator::apply_confirmed_donation(&mut tx, donation.campaign_id, verdict.amount).await?;
    }
    tx.commit().await?;

    if confirmed {
        info!(
            donation_id = donation.id,
            campaign_id = donation.campaign_id,
            amount = verdict.amount,
            block = verdict.block_number,
            "Donation confirmed"
        );
    } else {
        // A concurrent reconcile settled it first; report what it stored.
        debug!(donation_id = donation.id, "Donation settled concurrently");
    }
    get_donation(state, donation.id).await
}

// ─────────────────────────────────────────────────────────
// Chain verification
// ─────────────────────────────────────────────────────────

/// Check a transaction against the chain and produce a verdict.
pub async fn verify_on_chain(
    gateway: &dyn ChainGateway,
    request: &VerificationRequest<'_>,
) -> Result<Verdict> {
    let hash = request.transaction_hash;
    let receipt = gateway::fetch_successful_receipt(gateway, hash, request.network).await?;
    gateway::ensure_destination(&receipt, request.expected_contract)?;

    let schema = EventSchema::new(request.expected_contract, &[EventKind::DonationMade]);
    let candidates: Vec<(String, f64)> = gateway
        .decode_events(&receipt, &schema)?
        .into_iter()
        .filter_map(|event| match event {
            ChainEvent::DonationMade {
                campaign_id,
                donor,
                amount,
                ..
            } if campaign_id == request.campaign_id => {
                Some((donor, to_display_units(amount, request.token_decimals)))
            }
            _ => None,
        })
        .collect();

    let Some((donor, amount)) = candidates
        .iter()
        .find(|(_, amount)| amounts_match(request.expected_amount, *amount, request.tolerance))
        .cloned()
    else {
        return Err(match candidates.first() {
            Some((_, onchain)) => ReconciliationError::AmountMismatch {
                claimed: request.expected_amount,
                onchain: *onchain,
            },
            None => ReconciliationError::NoMatchingEvent(request.campaign_id),
        }
        .into());
    };

    let block_number = i64::try_from(receipt.block_number).map_err(|_| {
        ChainError::DecodeFailure(format!("block number {} out of range", receipt.block_number))
    })?;
    let block_timestamp = match gateway.get_block(receipt.block_number, request.network).await {
        Ok(block) => block.map(|b| b.timestamp),
        Err(e) => {
            debug!(block = receipt.block_number, "Block lookup skipped: {e}");
            None
        }
    };

    Ok(Verdict {
        transaction_hash: hash.to_string(),
        donor_address: donor,
        amount,
        block_number,
        block_timestamp,
        gas_used: receipt.gas_used,
        gas_fee: receipt.fee_paid(),
    })
}

pub fn amounts_match(claimed: f64, onchain: f64, tolerance: f64) -> bool {
    (claimed - onchain).abs() <= tolerance
}

/// Lowercase `0x`-prefixed 32-byte hex hash.
pub fn normalize_tx_hash(raw: &str) -> Result<String> {
    let hash = raw.trim().to_ascii_lowercase();
    let valid = hash
        .strip_prefix("0x")
        .is_some_and(|hex| hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()));
    if !valid {
        return Err(invalid_input(format!("malformed transaction hash: {raw}")));
    }
    Ok(hash)
}
