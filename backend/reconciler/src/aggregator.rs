//! Campaign progress aggregator.
//!
//! Applies the effects of confirmed donations and released milestones onto
//! a campaign's counters. Every operation is a single in-place `UPDATE`, so
//! concurrent confirmations for one campaign never lose an increment.
//!
//! The aggregator does not deduplicate. Callers invoke it exactly once per
//! donation or milestone status transition, inside the same transaction as
//! that transition.

use sqlx::SqliteConnection;
use tracing::info;

use crate::db;
use crate::errors::{Result, StateError};
use crate::models::Campaign;

/// Slack, in display units, for float rounding when comparing a raised
/// total against its target.
const TARGET_EPSILON: f64 = 1e-6;

/// Credit one confirmed donation to a campaign.
///
/// An `active` campaign whose raised amount reaches its target becomes
/// `completed` in the same statement.
pub async fn apply_confirmed_donation(
    conn: &mut SqliteConnection,
    campaign_id: i64,
    amount: f64,
) -> Result<Campaign> {
    let now = db::unix_now();
    let rows = sqlx::query(
        r#"
        UPDATE campaigns
        SET    raised_amount = raised_amount + ?1,
               donor_count   = donor_count + 1,
               status        = CASE
                                   WHEN status = 'active'
                                        AND raised_amount + ?1 >= target_amount - ?4
                                   THEN 'completed'
                                   ELSE status
                               END,
               updated_at    = ?2
        WHERE  id = ?3
        "#,
    )
    .bind(amount)
    .bind(now)
    .bind(campaign_id)
    .bind(TARGET_EPSILON)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    if rows == 0 {
        return Err(StateError::NotFound(format!("campaign {campaign_id}")).into());
    }

    let campaign = reload(conn, campaign_id).await?;
    info!(
        campaign_id,
        amount,
        raised = campaign.raised_amount,
        donors = campaign.donor_count,
        status = campaign.status.as_str(),
        "Donation credited"
    );
    Ok(campaign)
}

/// Undo the effect of one previously confirmed donation.
///
/// A `completed` campaign that falls back below its target returns to `active`.
pub async fn reverse_donation(
    conn: &mut SqliteConnection,
    campaign_id: i64,
    amount: f64,
) -> Result<Campaign> {
    let now = db::unix_now();
    let rows = sqlx::query(
        r#"
        UPDATE campaigns
        SET    raised_amount = MAX(raised_amount - ?1, 0),
               donor_count   = MAX(donor_count - 1, 0),
               status        = CASE
                                   WHEN status = 'completed'
                                        AND raised_amount - ?1 < target_amount - ?4
                                   THEN 'active'
                                   ELSE status
                               END,
               updated_at    = ?2
        WHERE  id = ?3
        "#,
    )
    .bind(amount)
    .bind(now)
    .bind(campaign_id)
    .bind(TARGET_EPSILON)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    if rows == 0 {
        return Err(StateError::NotFound(format!("campaign {campaign_id}")).into());
    }

    let campaign = reload(conn, campaign_id).await?;
    info!(
        campaign_id,
        amount,
        raised = campaign.raised_amount,
        donors = campaign.donor_count,
        "Donation reversed"
    );
    Ok(campaign)
}

/// Record funds released for a milestone.
pub async fn apply_milestone_release(
    conn: &mut SqliteConnection,
    campaign_id: i64,
    amount: f64,
) -> Result<Campaign> {
    let rows = sqlx::query(
        r#"
        UPDATE campaigns
        SET    released_amount = released_amount + ?1, updated_at = ?2
        WHERE  id = ?3
        "#,
    )
    .bind(amount)
    .bind(db::unix_now())
    .bind(campaign_id)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    if rows == 0 {
        return Err(StateError::NotFound(format!("campaign {campaign_id}")).into());
    }

    let campaign = reload(conn, campaign_id).await?;
    info!(
        campaign_id,
        amount,
        released = campaign.released_amount,
        "Milestone release recorded"
    );
    Ok(campaign)
}

async fn reload(conn: &mut SqliteConnection, campaign_id: i64) -> Result<Campaign> {
    db::get_campaign(&mut *conn, campaign_id)
        .await?
        .ok_or_else(|| StateError::NotFound(format!("campaign {campaign_id}")).into())
}
