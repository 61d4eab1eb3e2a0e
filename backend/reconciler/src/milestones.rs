//! Milestone funding state machine.
//!
//! ```text
//! pending ──submit──▶ submitted ──verify──▶ verified ──release──▶ funds_released
//!                          │
//!                          └──reject──▶ rejected
//! ```
//!
//! `rejected` and `funds_released` are terminal. Each edge is a conditional
//! update on the expected prior status, so of two concurrent reviews of the
//! same milestone exactly one succeeds.

use tracing::{info, warn};

use crate::aggregator;
use crate::app::AppState;
use crate::campaigns::ensure_dense_order;
use crate::db;
use crate::errors::{
    invalid_input, invalid_state, not_found, unauthorized, ReconciliationError, Result,
};
use crate::events::{to_display_units, ChainEvent, EventKind, EventSchema};
use crate::gateway;
use crate::models::{Actor, Campaign, Milestone, MilestoneRelease, MilestoneStatus};
use crate::reconciler::normalize_tx_hash;

/// Load the campaign and the milestone an operation targets.
async fn load(
    state: &AppState,
    campaign_id: i64,
    milestone_id: i64,
) -> Result<(Campaign, Milestone)> {
    let campaign = db::load_campaign(&state.pool, campaign_id).await?;
    ensure_dense_order(campaign_id, &campaign.milestones)?;
    let milestone = campaign
        .milestones
        .iter()
        .find(|m| m.id == milestone_id)
        .cloned()
        .ok_or_else(|| not_found(format!("milestone {milestone_id} of campaign {campaign_id}")))?;
    Ok((campaign, milestone))
}

fn expect_status(milestone: &Milestone, expected: MilestoneStatus, action: &str) -> Result<()> {
    if milestone.status != expected {
        return Err(invalid_state(format!(
            "cannot {action} milestone {} while it is {}",
            milestone.id,
            milestone.status.as_str()
        )));
    }
    Ok(())
}

async fn reload(state: &AppState, campaign_id: i64, milestone_id: i64) -> Result<Milestone> {
    db::get_milestone(&state.pool, campaign_id, milestone_id)
        .await?
        .ok_or_else(|| not_found(format!("milestone {milestone_id}")))
}

pub async fn get(state: &AppState, campaign_id: i64, milestone_id: i64) -> Result<Milestone> {
    reload(state, campaign_id, milestone_id).await
}

/// `pending → submitted`, by the campaign owner with at least one proof.
pub async fn submit(
    state: &AppState,
    actor: &Actor,
    campaign_id: i64,
    milestone_id: i64,
    proof_documents: Vec<String>,
) -> Result<Milestone> {
    let (campaign, milestone) = load(state, campaign_id, milestone_id).await?;
    if campaign.owner_id != actor.id {
        return Err(unauthorized("only the campaign owner can submit milestone proof"));
    }
    let proofs: Vec<String> = proof_documents
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect();
    if proofs.is_empty() {
        return Err(invalid_input("at least one proof document is required"));
    }
    expect_status(&milestone, MilestoneStatus::Pending, "submit")?;

    if !db::submit_milestone(&state.pool, milestone_id, &proofs, &actor.id, db::unix_now()).await? {
        return Err(invalid_state(format!(
            "milestone {milestone_id} is no longer pending"
        )));
    }
    info!(campaign_id, milestone_id, proofs = proofs.len(), "Milestone submitted");
    reload(state, campaign_id, milestone_id).await
}

/// `submitted → verified | rejected`, by an admin or auditor.
pub async fn verify(
    state: &AppState,
    actor: &Actor,
    campaign_id: i64,
    milestone_id: i64,
    approved: bool,
    rejection_reason: Option<String>,
) -> Result<Milestone> {
    if !actor.is_reviewer() {
        return Err(unauthorized("only admins and auditors can review milestones"));
    }
    let reason = rejection_reason
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty());
    if !approved && reason.is_none() {
        return Err(invalid_input("a rejection reason is required"));
    }
    let (_, milestone) = load(state, campaign_id, milestone_id).await?;
    expect_status(&milestone, MilestoneStatus::Submitted, "review")?;

    let reason = if approved { None } else { reason };
    let reviewed = db::review_milestone(
        &state.pool,
        milestone_id,
        approved,
        reason.as_deref(),
        &actor.id,
        db::unix_now(),
    )
    .await?;
    if !reviewed {
        return Err(invalid_state(format!(
            "milestone {milestone_id} was reviewed concurrently"
        )));
    }

    if approved {
        info!(campaign_id, milestone_id, by = %actor.id, "Milestone verified");
    } else {
        info!(campaign_id, milestone_id, by = %actor.id, reason = ?reason, "Milestone rejected");
    }
    reload(state, campaign_id, milestone_id).await
}

/// `verified → funds_released`, once the custody contract has paid out.
pub async fn release(
    state: &AppState,
    actor: &Actor,
    campaign_id: i64,
    milestone_id: i64,
    release: MilestoneRelease,
) -> Result<Milestone> {
    let hash = normalize_tx_hash(&release.transaction_hash)?;
    let (campaign, milestone) = load(state, campaign_id, milestone_id).await?;
    if !actor.is_admin() && campaign.owner_id != actor.id {
        return Err(unauthorized("only the campaign owner or an admin can record a release"));
    }
    expect_status(&milestone, MilestoneStatus::Verified, "release")?;
    if db::milestone_by_release_tx(&state.pool, &hash).await?.is_some() {
        return Err(ReconciliationError::DuplicateTransaction(hash).into());
    }

    let network = state
        .config
        .network(release.network)
        .map_err(|_| invalid_input(format!("network {} is not supported", release.network)))?;
    let receipt =
        gateway::fetch_successful_receipt(state.gateway.as_ref(), &hash, release.network).await?;
    gateway::ensure_destination(&receipt, &network.milestone_contract)?;

    let schema = EventSchema::new(&network.milestone_contract, &[EventKind::FundsReleased]);
    let amount = state
        .gateway
        .decode_events(&receipt, &schema)?
        .into_iter()
        .find_map(|event| match event {
            ChainEvent::FundsReleased {
                milestone_id: released,
                campaign_id: for_campaign,
                amount,
                ..
            } if released == milestone_id && for_campaign == campaign_id => Some(amount),
            _ => None,
        })
        .map(|amount| to_display_units(amount, network.token_decimals))
        .ok_or_else(|| {
            warn!(
                campaign_id,
                milestone_id,
                tx = %hash,
                "Release transaction has no FundsReleased event"
            );
            ReconciliationError::NoMatchingEvent(campaign_id)
        })?;

    let mut tx = state.pool.begin().await?;
    if !db::release_milestone(&mut tx, milestone_id, &hash, amount, db::unix_now()).await? {
        return Err(invalid_state(format!(
            "milestone {milestone_id} is no longer verified"
        )));
    }
    aggregator::apply_milestone_release(&mut tx, campaign_id, amount).await?;
    tx.commit().await?;

    info!(campaign_id, milestone_id, amount, tx = %hash, "Milestone funds released");
    reload(state, campaign_id, milestone_id).await
}
