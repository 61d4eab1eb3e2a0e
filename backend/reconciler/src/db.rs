//! Database layer: pool setup, migrations and entity queries.
//!
//! Every status change is a conditional `UPDATE … WHERE status = <expected>`.
//! Callers treat zero affected rows as a lost race and report `InvalidState`
//! instead of overwriting a concurrent transition.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::{SqliteConnection, SqliteExecutor, SqlitePool};
use tracing::info;

use crate::errors::{is_unique_violation, ReconciliationError, Result, StateError};
use crate::models::{
    Audit, AuditType, Campaign, CampaignStatus, Donation, DonationClaim, Finding,
    Milestone, NewFinding, NewMilestone, Verdict,
};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    let options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

// ─────────────────────────────────────────────────────────
// Campaigns
// ─────────────────────────────────────────────────────────

pub async fn insert_campaign(
    conn: &mut SqliteConnection,
    owner_id: &str,
    title: &str,
    target_amount: f64,
    status: CampaignStatus,
    now: i64,
) -> Result<i64> {
    let id = sqlx::query(
        r#"
        INSERT INTO campaigns (owner_id, title, target_amount, status, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?5)
        "#,
    )
    .bind(owner_id)
    .bind(title)
    .bind(target_amount)
    .bind(status)
    .bind(now)
    .execute(conn)
    .await?
    .last_insert_rowid();
    Ok(id)
}

/// Fetch a campaign row without its milestones.
pub async fn get_campaign(executor: impl SqliteExecutor<'_>, id: i64) -> Result<Option<Campaign>> {
    let row = sqlx::query_as::<_, Campaign>(
        r#"
        SELECT id, owner_id, title, target_amount, raised_amount, released_amount,
               donor_count, status, is_verified, created_at, updated_at
        FROM   campaigns
        WHERE  id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await?;
    Ok(row)
}

/// Fetch a campaign together with its milestones in ascending order.
pub async fn load_campaign(pool: &SqlitePool, id: i64) -> Result<Campaign> {
    let mut campaign = get_campaign(pool, id)
        .await?
        .ok_or_else(|| StateError::NotFound(format!("campaign {id}")))?;
    campaign.milestones = list_milestones(pool, id).await?;
    Ok(campaign)
}

pub async fn update_campaign_status(
    executor: impl SqliteExecutor<'_>,
    id: i64,
    from: CampaignStatus,
    to: CampaignStatus,
    now: i64,
) -> Result<bool> {
    let rows = sqlx::query(
        "UPDATE campaigns SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
    )
    .bind(to)
    .bind(now)
    .bind(id)
    .bind(from)
    .execute(executor)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

pub async fn set_campaign_verified(
    executor: impl SqliteExecutor<'_>,
    id: i64,
    verified: bool,
    now: i64,
) -> Result<bool> {
    let rows = sqlx::query("UPDATE campaigns SET is_verified = ?1, updated_at = ?2 WHERE id = ?3")
        .bind(verified)
        .bind(now)
        .bind(id)
        .execute(executor)
        .await?
        .rows_affected();
    Ok(rows == 1)
}

pub async fn touch_campaign(executor: impl SqliteExecutor<'_>, id: i64, now: i64) -> Result<()> {
    sqlx::query("UPDATE campaigns SET updated_at = ?1 WHERE id = ?2")
        .bind(now)
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Milestones
// ─────────────────────────────────────────────────────────

const MILESTONE_COLUMNS: &str = r#"
    id, campaign_id, position, title, description, target_amount, deadline, status,
    proof_documents, submitted_at, submitted_by, verified_at, verified_by,
    rejection_reason, transaction_hash, released_amount, released_at
"#;

pub async fn insert_milestone(
    conn: &mut SqliteConnection,
    campaign_id: i64,
    position: i64,
    milestone: &NewMilestone,
) -> Result<i64> {
    let id = sqlx::query(
        r#"
        INSERT INTO milestones (campaign_id, position, title, description, target_amount, deadline)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(campaign_id)
    .bind(position)
    .bind(&milestone.title)
    .bind(&milestone.description)
    .bind(milestone.target_amount)
    .bind(milestone.deadline)
    .execute(conn)
    .await?
    .last_insert_rowid();
    Ok(id)
}

pub async fn delete_milestones(conn: &mut SqliteConnection, campaign_id: i64) -> Result<u64> {
    let rows = sqlx::query("DELETE FROM milestones WHERE campaign_id = ?1")
        .bind(campaign_id)
        .execute(conn)
        .await?
        .rows_affected();
    Ok(rows)
}

pub async fn list_milestones(
    executor: impl SqliteExecutor<'_>,
    campaign_id: i64,
) -> Result<Vec<Milestone>> {
    let sql = format!(
        "SELECT {MILESTONE_COLUMNS} FROM milestones WHERE campaign_id = ?1 ORDER BY position ASC"
    );
    let rows = sqlx::query_as::<_, Milestone>(&sql)
        .bind(campaign_id)
        .fetch_all(executor)
        .await?;
    Ok(rows)
}

pub async fn get_milestone(
    executor: impl SqliteExecutor<'_>,
    campaign_id: i64,
    milestone_id: i64,
) -> Result<Option<Milestone>> {
    let sql = format!(
        "SELECT {MILESTONE_COLUMNS} FROM milestones WHERE id = ?1 AND campaign_id = ?2"
    );
    let row = sqlx::query_as::<_, Milestone>(&sql)
        .bind(milestone_id)
        .bind(campaign_id)
        .fetch_optional(executor)
        .await?;
    Ok(row)
}

/// `pending → submitted`.
pub async fn submit_milestone(
    executor: impl SqliteExecutor<'_>,
    milestone_id: i64,
    proof_documents: &[String],
    actor_id: &str,
    now: i64,
) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE milestones
        SET    status = 'submitted', proof_documents = ?1, submitted_at = ?2, submitted_by = ?3
        WHERE  id = ?4 AND status = 'pending'
        "#,
    )
    .bind(Json(proof_documents))
    .bind(now)
    .bind(actor_id)
    .bind(milestone_id)
    .execute(executor)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

/// `submitted → verified | rejected`.
pub async fn review_milestone(
    executor: impl SqliteExecutor<'_>,
    milestone_id: i64,
    approved: bool,
    rejection_reason: Option<&str>,
    actor_id: &str,
    now: i64,
) -> Result<bool> {
    let to = if approved { "verified" } else { "rejected" };
    let rows = sqlx::query(
        r#"
        UPDATE milestones
        SET    status = ?1, verified_at = ?2, verified_by = ?3, rejection_reason = ?4
        WHERE  id = ?5 AND status = 'submitted'
        "#,
    )
    .bind(to)
    .bind(now)
    .bind(actor_id)
    .bind(rejection_reason)
    .bind(milestone_id)
    .execute(executor)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

/// `verified → funds_released`. A release hash already used by another
/// milestone is reported as a duplicate transaction.
pub async fn release_milestone(
    conn: &mut SqliteConnection,
    milestone_id: i64,
    transaction_hash: &str,
    amount: f64,
    now: i64,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE milestones
        SET    status = 'funds_released', transaction_hash = ?1, released_amount = ?2,
               released_at = ?3
        WHERE  id = ?4 AND status = 'verified'
        "#,
    )
    .bind(transaction_hash)
    .bind(amount)
    .bind(now)
    .bind(milestone_id)
    .execute(conn)
    .await;
    match result {
        Ok(done) => Ok(done.rows_affected() == 1),
        Err(e) if is_unique_violation(&e) => {
            Err(ReconciliationError::DuplicateTransaction(transaction_hash.to_string()).into())
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn milestone_by_release_tx(
    executor: impl SqliteExecutor<'_>,
    transaction_hash: &str,
) -> Result<Option<Milestone>> {
    let sql = format!("SELECT {MILESTONE_COLUMNS} FROM milestones WHERE transaction_hash = ?1");
    let row = sqlx::query_as::<_, Milestone>(&sql)
        .bind(transaction_hash)
        .fetch_optional(executor)
        .await?;
    Ok(row)
}

// ─────────────────────────────────────────────────────────
// Donations
// ─────────────────────────────────────────────────────────

const DONATION_COLUMNS: &str = r#"
    id, donor_id, campaign_id, amount, currency, network, transaction_hash, status,
    donor_address, onchain_amount, block_number, block_timestamp, gas_used, gas_fee,
    failure_code, failure_reason, created_at, confirmed_at, updated_at
"#;

/// Insert a pending donation. The UNIQUE hash constraint turns a racing
/// second claim into `DuplicateTransaction`.
pub async fn insert_donation(
    executor: impl SqliteExecutor<'_>,
    donor_id: &str,
    claim: &DonationClaim,
    now: i64,
) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO donations
            (donor_id, campaign_id, amount, currency, network, transaction_hash,
             created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
        "#,
    )
    .bind(donor_id)
    .bind(claim.campaign_id)
    .bind(claim.amount)
    .bind(&claim.currency)
    .bind(claim.network)
    .bind(&claim.transaction_hash)
    .bind(now)
    .execute(executor)
    .await;
    match result {
        Ok(done) => Ok(done.last_insert_rowid()),
        Err(e) if is_unique_violation(&e) => {
            Err(ReconciliationError::DuplicateTransaction(claim.transaction_hash.clone()).into())
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn get_donation(executor: impl SqliteExecutor<'_>, id: i64) -> Result<Option<Donation>> {
    let sql = format!("SELECT {DONATION_COLUMNS} FROM donations WHERE id = ?1");
    let row = sqlx::query_as::<_, Donation>(&sql)
        .bind(id)
        .fetch_optional(executor)
        .await?;
    Ok(row)
}

pub async fn get_donation_by_tx(
    executor: impl SqliteExecutor<'_>,
    transaction_hash: &str,
) -> Result<Option<Donation>> {
    let sql = format!("SELECT {DONATION_COLUMNS} FROM donations WHERE transaction_hash = ?1");
    let row = sqlx::query_as::<_, Donation>(&sql)
        .bind(transaction_hash)
        .fetch_optional(executor)
        .await?;
    Ok(row)
}

/// Fetch all donations for a campaign, newest first.
pub async fn list_donations_for_campaign(
    executor: impl SqliteExecutor<'_>,
    campaign_id: i64,
) -> Result<Vec<Donation>> {
    let sql = format!(
        "SELECT {DONATION_COLUMNS} FROM donations WHERE campaign_id = ?1 ORDER BY id DESC"
    );
    let rows = sqlx::query_as::<_, Donation>(&sql)
        .bind(campaign_id)
        .fetch_all(executor)
        .await?;
    Ok(rows)
}

/// `pending → confirmed`, recording the verdict.
pub async fn confirm_donation(
    conn: &mut SqliteConnection,
    id: i64,
    verdict: &Verdict,
    now: i64,
) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE donations
        SET    status = 'confirmed', donor_address = ?1, onchain_amount = ?2,
               block_number = ?3, block_timestamp = ?4, gas_used = ?5, gas_fee = ?6,
               confirmed_at = ?7, updated_at = ?7
        WHERE  id = ?8 AND status = 'pending'
        "#,
    )
    .bind(&verdict.donor_address)
    .bind(verdict.amount)
    .bind(verdict.block_number)
    .bind(verdict.block_timestamp)
    .bind(verdict.gas_used.to_string())
    .bind(verdict.gas_fee.map(|fee| fee.to_string()))
    .bind(now)
    .bind(id)
    .execute(conn)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

/// `pending → failed`, or `confirmed → failed` for a reversal.
pub async fn fail_donation(
    executor: impl SqliteExecutor<'_>,
    id: i64,
    from_confirmed: bool,
    code: &str,
    reason: &str,
    now: i64,
) -> Result<bool> {
    let from = if from_confirmed { "confirmed" } else { "pending" };
    let rows = sqlx::query(
        r#"
        UPDATE donations
        SET    status = 'failed', failure_code = ?1, failure_reason = ?2, updated_at = ?3
        WHERE  id = ?4 AND status = ?5
        "#,
    )
    .bind(code)
    .bind(reason)
    .bind(now)
    .bind(id)
    .bind(from)
    .execute(executor)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

// ─────────────────────────────────────────────────────────
// Audits
// ─────────────────────────────────────────────────────────

const AUDIT_COLUMNS: &str = r#"
    id, campaign_id, auditor_id, audit_type, status, scheduled_date, started_at,
    completed_date, overall_score, report, next_audit_date, failure_reason,
    created_by, created_at
"#;

const FINDING_COLUMNS: &str = r#"
    id, audit_id, severity, category, description, recommendation, resolved,
    resolved_at, resolved_by, created_at
"#;

pub async fn find_in_flight_audit(
    executor: impl SqliteExecutor<'_>,
    campaign_id: i64,
    audit_type: AuditType,
) -> Result<Option<Audit>> {
    let sql = format!(
        r#"
        SELECT {AUDIT_COLUMNS} FROM audits
        WHERE  campaign_id = ?1 AND audit_type = ?2 AND status IN ('scheduled', 'in_progress')
        "#
    );
    let row = sqlx::query_as::<_, Audit>(&sql)
        .bind(campaign_id)
        .bind(audit_type)
        .fetch_optional(executor)
        .await?;
    Ok(row)
}

/// Insert a scheduled audit. The partial UNIQUE index reports a racing
/// second in-flight audit of the same type as `AuditInFlight`.
pub async fn insert_audit(
    executor: impl SqliteExecutor<'_>,
    campaign_id: i64,
    audit_type: AuditType,
    auditor_id: &str,
    scheduled_date: i64,
    created_by: &str,
    now: i64,
) -> Result<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO audits
            (campaign_id, auditor_id, audit_type, status, scheduled_date, created_by, created_at)
        VALUES (?1, ?2, ?3, 'scheduled', ?4, ?5, ?6)
        "#,
    )
    .bind(campaign_id)
    .bind(auditor_id)
    .bind(audit_type)
    .bind(scheduled_date)
    .bind(created_by)
    .bind(now)
    .execute(executor)
    .await;
    match result {
        Ok(done) => Ok(done.last_insert_rowid()),
        Err(e) if is_unique_violation(&e) => {
            Err(StateError::AuditInFlight(audit_type.as_str().to_string()).into())
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn get_audit(executor: impl SqliteExecutor<'_>, id: i64) -> Result<Option<Audit>> {
    let sql = format!("SELECT {AUDIT_COLUMNS} FROM audits WHERE id = ?1");
    let row = sqlx::query_as::<_, Audit>(&sql)
        .bind(id)
        .fetch_optional(executor)
        .await?;
    Ok(row)
}

/// Fetch an audit with its findings.
pub async fn load_audit(pool: &SqlitePool, id: i64) -> Result<Audit> {
    let mut audit = get_audit(pool, id)
        .await?
        .ok_or_else(|| StateError::NotFound(format!("audit {id}")))?;
    audit.findings = list_findings(pool, id).await?;
    Ok(audit)
}

pub async fn list_audits_for_campaign(pool: &SqlitePool, campaign_id: i64) -> Result<Vec<Audit>> {
    let sql = format!(
        "SELECT {AUDIT_COLUMNS} FROM audits WHERE campaign_id = ?1 \
         ORDER BY scheduled_date ASC, id ASC"
    );
    let mut audits = sqlx::query_as::<_, Audit>(&sql)
        .bind(campaign_id)
        .fetch_all(pool)
        .await?;
    for audit in &mut audits {
        audit.findings = list_findings(pool, audit.id).await?;
    }
    Ok(audits)
}

pub async fn start_audit(executor: impl SqliteExecutor<'_>, id: i64, now: i64) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE audits SET status = 'in_progress', started_at = ?1
        WHERE  id = ?2 AND status = 'scheduled'
        "#,
    )
    .bind(now)
    .bind(id)
    .execute(executor)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

pub async fn complete_audit(
    conn: &mut SqliteConnection,
    id: i64,
    overall_score: i64,
    report: &str,
    next_audit_date: i64,
    now: i64,
) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE audits
        SET    status = 'completed', completed_date = ?1, overall_score = ?2, report = ?3,
               next_audit_date = ?4
        WHERE  id = ?5 AND status = 'in_progress'
        "#,
    )
    .bind(now)
    .bind(overall_score)
    .bind(report)
    .bind(next_audit_date)
    .bind(id)
    .execute(conn)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

pub async fn fail_audit(
    executor: impl SqliteExecutor<'_>,
    id: i64,
    reason: &str,
) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE audits SET status = 'failed', failure_reason = ?1
        WHERE  id = ?2 AND status IN ('scheduled', 'in_progress')
        "#,
    )
    .bind(reason)
    .bind(id)
    .execute(executor)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

/// Append a finding while the audit is still `in_progress`.
///
/// Returns `None` when the audit is in any other status.
pub async fn insert_finding(
    executor: impl SqliteExecutor<'_>,
    audit_id: i64,
    finding: &NewFinding,
    now: i64,
) -> Result<Option<i64>> {
    let done = sqlx::query(
        r#"
        INSERT INTO audit_findings
               (audit_id, severity, category, description, recommendation, created_at)
        SELECT ?1, ?2, ?3, ?4, ?5, ?6
        WHERE  EXISTS (SELECT 1 FROM audits WHERE id = ?1 AND status = 'in_progress')
        "#,
    )
    .bind(audit_id)
    .bind(finding.severity)
    .bind(&finding.category)
    .bind(&finding.description)
    .bind(&finding.recommendation)
    .bind(now)
    .execute(executor)
    .await?;
    Ok((done.rows_affected() == 1).then(|| done.last_insert_rowid()))
}

pub async fn list_findings(
    executor: impl SqliteExecutor<'_>,
    audit_id: i64,
) -> Result<Vec<Finding>> {
    let sql = format!(
        "SELECT {FINDING_COLUMNS} FROM audit_findings WHERE audit_id = ?1 ORDER BY id ASC"
    );
    let rows = sqlx::query_as::<_, Finding>(&sql)
        .bind(audit_id)
        .fetch_all(executor)
        .await?;
    Ok(rows)
}

pub async fn get_finding(
    executor: impl SqliteExecutor<'_>,
    audit_id: i64,
    finding_id: i64,
) -> Result<Option<Finding>> {
    let sql =
        format!("SELECT {FINDING_COLUMNS} FROM audit_findings WHERE id = ?1 AND audit_id = ?2");
    let row = sqlx::query_as::<_, Finding>(&sql)
        .bind(finding_id)
        .bind(audit_id)
        .fetch_optional(executor)
        .await?;
    Ok(row)
}

/// Mark a finding resolved; `false` when it already was.
pub async fn resolve_finding(
    executor: impl SqliteExecutor<'_>,
    finding_id: i64,
    actor_id: &str,
    now: i64,
) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE audit_findings SET resolved = 1, resolved_at = ?1, resolved_by = ?2
        WHERE  id = ?3 AND resolved = 0
        "#,
    )
    .bind(now)
    .bind(actor_id)
    .bind(finding_id)
    .execute(executor)
    .await?
    .rows_affected();
    Ok(rows == 1)
}
