//! Campaign lifecycle and milestone ordering.
//!
//! Only the parts of campaign management the funding core depends on live
//! here. `completed` is never set by hand; the aggregator reaches it when a
//! confirmed donation takes the campaign to its target.

use sqlx::SqliteConnection;
use tracing::info;

use crate::app::AppState;
use crate::db;
use crate::errors::{invalid_input, invalid_state, not_found, unauthorized, AppError, Result};
use crate::models::{
    Actor, Campaign, CampaignStatus, CampaignView, Milestone, NewCampaign, NewMilestone, Role,
};

/// Who may drive a campaign status edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Authority {
    OwnerOrAdmin,
    Admin,
}

/// Transition graph. `None` means the edge does not exist.
fn required_authority(from: CampaignStatus, to: CampaignStatus) -> Option<Authority> {
    use CampaignStatus::*;
    match (from, to) {
        (Draft, PendingApproval) => Some(Authority::OwnerOrAdmin),
        (PendingApproval, Active) | (PendingApproval, Draft) => Some(Authority::Admin),
        (Active, Paused) | (Paused, Active) => Some(Authority::OwnerOrAdmin),
        (Active | Paused, UnderReview) | (UnderReview, Active | Paused) => Some(Authority::Admin),
        (from, Cancelled) if !from.is_terminal() => Some(Authority::OwnerOrAdmin),
        _ => None,
    }
}

/// Funding progress in percent, capped at 100.
pub fn progress(campaign: &Campaign) -> f64 {
    if campaign.target_amount <= 0.0 {
        return 0.0;
    }
    (campaign.raised_amount / campaign.target_amount * 100.0).min(100.0)
}

/// Milestone `order` must run 1..n without gaps.
pub fn ensure_dense_order(campaign_id: i64, milestones: &[Milestone]) -> Result<()> {
    for (index, milestone) in milestones.iter().enumerate() {
        let expected = index as i64 + 1;
        if milestone.position != expected {
            return Err(AppError::Integrity(format!(
                "campaign {campaign_id}: milestone {} has order {}, expected {expected}",
                milestone.id, milestone.position
            )));
        }
    }
    Ok(())
}

fn validate_milestones(milestones: &[NewMilestone]) -> Result<()> {
    for (index, milestone) in milestones.iter().enumerate() {
        if milestone.title.trim().is_empty() {
            return Err(invalid_input(format!("milestone {} needs a title", index + 1)));
        }
        if !milestone.target_amount.is_finite() || milestone.target_amount <= 0.0 {
            return Err(invalid_input(format!(
                "milestone {} target amount must be positive",
                index + 1
            )));
        }
    }
    Ok(())
}

async fn insert_ordered(
    conn: &mut SqliteConnection,
    campaign_id: i64,
    milestones: &[NewMilestone],
) -> Result<()> {
    for (index, milestone) in milestones.iter().enumerate() {
        db::insert_milestone(&mut *conn, campaign_id, index as i64 + 1, milestone).await?;
    }
    let stored = db::list_milestones(&mut *conn, campaign_id).await?;
    ensure_dense_order(campaign_id, &stored)
}

// ─────────────────────────────────────────────────────────
// Operations
// ─────────────────────────────────────────────────────────

pub async fn create(state: &AppState, actor: &Actor, new: NewCampaign) -> Result<CampaignView> {
    if !matches!(actor.role, Role::Charity | Role::Admin) {
        return Err(unauthorized("only charities can create campaigns"));
    }
    if new.title.trim().is_empty() {
        return Err(invalid_input("campaign title is required"));
    }
    if !new.target_amount.is_finite() || new.target_amount <= 0.0 {
        return Err(invalid_input("campaign target amount must be positive"));
    }
    validate_milestones(&new.milestones)?;

    let status = if new.submit_for_approval {
        CampaignStatus::PendingApproval
    } else {
        CampaignStatus::Draft
    };

    let mut tx = state.pool.begin().await?;
    let id = db::insert_campaign(
        &mut tx,
        &actor.id,
        new.title.trim(),
        new.target_amount,
        status,
        db::unix_now(),
    )
    .await?;
    insert_ordered(&mut tx, id, &new.milestones).await?;
    tx.commit().await?;

    info!(
        campaign_id = id,
        owner = %actor.id,
        milestones = new.milestones.len(),
        "Campaign created"
    );
    get(state, id).await
}

/// Replace the whole milestone list while the campaign is still editable.
pub async fn replace_milestones(
    state: &AppState,
    actor: &Actor,
    campaign_id: i64,
    milestones: Vec<NewMilestone>,
) -> Result<CampaignView> {
    validate_milestones(&milestones)?;

    let mut tx = state.pool.begin().await?;
    let campaign = db::get_campaign(&mut *tx, campaign_id)
        .await?
        .ok_or_else(|| not_found(format!("campaign {campaign_id}")))?;
    if campaign.owner_id != actor.id {
        return Err(unauthorized("only the campaign owner can edit milestones"));
    }
    if !matches!(
        campaign.status,
        CampaignStatus::Draft | CampaignStatus::PendingApproval
    ) {
        return Err(invalid_state(format!(
            "milestones are fixed once a campaign is {}",
            campaign.status.as_str()
        )));
    }

    db::delete_milestones(&mut tx, campaign_id).await?;
    insert_ordered(&mut tx, campaign_id, &milestones).await?;
    db::touch_campaign(&mut *tx, campaign_id, db::unix_now()).await?;
    tx.commit().await?;

    info!(campaign_id, count = milestones.len(), "Milestones replaced");
    get(state, campaign_id).await
}

pub async fn transition(
    state: &AppState,
    actor: &Actor,
    campaign_id: i64,
    to: CampaignStatus,
) -> Result<CampaignView> {
    let campaign = db::load_campaign(&state.pool, campaign_id).await?;
    let from = campaign.status;

    let Some(authority) = required_authority(from, to) else {
        return Err(invalid_state(format!(
            "campaign cannot move from {} to {}",
            from.as_str(),
            to.as_str()
        )));
    };
    let permitted = match authority {
        Authority::Admin => actor.is_admin(),
        Authority::OwnerOrAdmin => actor.is_admin() || campaign.owner_id == actor.id,
    };
    if !permitted {
        return Err(unauthorized(format!(
            "{} cannot move campaign {campaign_id} to {}",
            actor.id,
            to.as_str()
        )));
    }
    ensure_dense_order(campaign_id, &campaign.milestones)?;

    if !db::update_campaign_status(&state.pool, campaign_id, from, to, db::unix_now()).await? {
        return Err(invalid_state(format!(
            "campaign {campaign_id} changed status concurrently"
        )));
    }
    info!(
        campaign_id,
        from = from.as_str(),
        to = to.as_str(),
        by = %actor.id,
        "Campaign status changed"
    );
    get(state, campaign_id).await
}

pub async fn set_verified(
    state: &AppState,
    actor: &Actor,
    campaign_id: i64,
    verified: bool,
) -> Result<CampaignView> {
    if !actor.is_reviewer() {
        return Err(unauthorized("only admins and auditors can verify campaigns"));
    }
    if !db::set_campaign_verified(&state.pool, campaign_id, verified, db::unix_now()).await? {
        return Err(not_found(format!("campaign {campaign_id}")));
    }
    info!(campaign_id, verified, by = %actor.id, "Campaign verification flag set");
    get(state, campaign_id).await
}

pub async fn get(state: &AppState, campaign_id: i64) -> Result<CampaignView> {
    let campaign = db::load_campaign(&state.pool, campaign_id).await?;
    ensure_dense_order(campaign_id, &campaign.milestones)?;
    Ok(CampaignView {
        progress: progress(&campaign),
        campaign,
    })
}
