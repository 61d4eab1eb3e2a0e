//! Audit state machine.
//!
//! `scheduled → in_progress → completed`, with `failed` reachable from either
//! non-terminal state as an admin override. At most one non-terminal audit of
//! each type may exist per campaign. Finding resolution is independent of the
//! audit's own status.

use tracing::info;

use crate::app::AppState;
use crate::db;
use crate::errors::{invalid_input, invalid_state, not_found, unauthorized, Result, StateError};
use crate::models::{
    Actor, Audit, AuditCompletion, AuditStatus, AuditView, Finding, NewAudit, NewFinding,
    RiskLevel, Role, Severity,
};

/// Derived risk over the unresolved findings. Never stored.
pub fn risk_level(findings: &[Finding], overall_score: Option<i64>) -> RiskLevel {
    let open = |severity: Severity| {
        findings
            .iter()
            .filter(|f| !f.resolved && f.severity == severity)
            .count()
    };

    let high = open(Severity::High);
    if open(Severity::Critical) > 0 {
        RiskLevel::Critical
    } else if high > 2 {
        RiskLevel::High
    } else if high > 0 || overall_score.is_some_and(|score| score < 70) {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

fn view(audit: Audit) -> AuditView {
    AuditView {
        risk_level: risk_level(&audit.findings, audit.overall_score),
        audit,
    }
}

fn ensure_assigned(actor: &Actor, audit: &Audit) -> Result<()> {
    if actor.id != audit.auditor_id {
        return Err(unauthorized(format!(
            "audit {} is assigned to another auditor",
            audit.id
        )));
    }
    Ok(())
}

fn expect_status(audit: &Audit, expected: AuditStatus) -> Result<()> {
    if audit.status != expected {
        return Err(invalid_state(format!(
            "audit {} is {:?}, expected {expected:?}",
            audit.id, audit.status
        )));
    }
    Ok(())
}

fn validate_finding(finding: &NewFinding) -> Result<()> {
    if finding.category.trim().is_empty() || finding.description.trim().is_empty() {
        return Err(invalid_input("a finding needs a category and a description"));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Operations
// ─────────────────────────────────────────────────────────

/// Schedule an audit. Admins must name the auditor; auditors schedule themselves.
pub async fn create(state: &AppState, actor: &Actor, new: NewAudit) -> Result<AuditView> {
    let auditor_id = match actor.role {
        Role::Admin => new
            .auditor_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                invalid_input("auditorId is required when an admin schedules an audit")
            })?,
        Role::Auditor => match new.auditor_id {
            Some(other) if other != actor.id => {
                return Err(unauthorized("auditors can only schedule their own audits"));
            }
            _ => actor.id.clone(),
        },
        _ => return Err(unauthorized("only admins and auditors can schedule audits")),
    };

    if db::get_campaign(&state.pool, new.campaign_id).await?.is_none() {
        return Err(not_found(format!("campaign {}", new.campaign_id)));
    }
    if let Some(existing) =
        db::find_in_flight_audit(&state.pool, new.campaign_id, new.audit_type).await?
    {
        info!(
            campaign_id = new.campaign_id,
            existing = existing.id,
            audit_type = new.audit_type.as_str(),
            "Audit already in flight"
        );
        return Err(StateError::AuditInFlight(new.audit_type.as_str().to_string()).into());
    }

    let now = db::unix_now();
    let id = db::insert_audit(
        &state.pool,
        new.campaign_id,
        new.audit_type,
        &auditor_id,
        new.scheduled_date.unwrap_or(now),
        &actor.id,
        now,
    )
    .await?;

    info!(
        audit_id = id,
        campaign_id = new.campaign_id,
        audit_type = new.audit_type.as_str(),
        auditor = %auditor_id,
        "Audit scheduled"
    );
    get(state, id).await
}

pub async fn start(state: &AppState, actor: &Actor, audit_id: i64) -> Result<AuditView> {
    let audit = db::load_audit(&state.pool, audit_id).await?;
    ensure_assigned(actor, &audit)?;
    expect_status(&audit, AuditStatus::Scheduled)?;

    if !db::start_audit(&state.pool, audit_id, db::unix_now()).await? {
        return Err(invalid_state(format!("audit {audit_id} is no longer scheduled")));
    }
    info!(audit_id, auditor = %actor.id, "Audit started");
    get(state, audit_id).await
}

pub async fn add_finding(
    state: &AppState,
    actor: &Actor,
    audit_id: i64,
    finding: NewFinding,
) -> Result<Finding> {
    validate_finding(&finding)?;
    let audit = db::load_audit(&state.pool, audit_id).await?;
    ensure_assigned(actor, &audit)?;
    expect_status(&audit, AuditStatus::InProgress)?;

    let Some(finding_id) =
        db::insert_finding(&state.pool, audit_id, &finding, db::unix_now()).await?
    else {
        return Err(invalid_state(format!("audit {audit_id} is no longer in progress")));
    };
    info!(audit_id, finding_id, severity = ?finding.severity, "Finding recorded");
    db::get_finding(&state.pool, audit_id, finding_id)
        .await?
        .ok_or_else(|| not_found(format!("finding {finding_id}")))
}

/// `in_progress → completed`. Findings passed here are appended to those
/// already collected.
pub async fn complete(
    state: &AppState,
    actor: &Actor,
    audit_id: i64,
    completion: AuditCompletion,
) -> Result<AuditView> {
    if !(0..=100).contains(&completion.overall_score) {
        return Err(invalid_input("overallScore must be between 0 and 100"));
    }
    for finding in &completion.findings {
        validate_finding(finding)?;
    }
    let audit = db::load_audit(&state.pool, audit_id).await?;
    ensure_assigned(actor, &audit)?;
    expect_status(&audit, AuditStatus::InProgress)?;

    let now = chrono::Utc::now();
    let next_audit_date =
        (now + chrono::Duration::days(state.config.audit_followup_days)).timestamp();

    let mut tx = state.pool.begin().await?;
    for finding in &completion.findings {
        if db::insert_finding(&mut *tx, audit_id, finding, now.timestamp())
            .await?
            .is_none()
        {
            return Err(invalid_state(format!("audit {audit_id} is no longer in progress")));
        }
    }
    let completed = db::complete_audit(
        &mut tx,
        audit_id,
        completion.overall_score,
        &completion.report,
        next_audit_date,
        now.timestamp(),
    )
    .await?;
    if !completed {
        return Err(invalid_state(format!("audit {audit_id} is no longer in progress")));
    }
    tx.commit().await?;

    let view = get(state, audit_id).await?;
    info!(
        audit_id,
        score = completion.overall_score,
        findings = view.audit.findings.len(),
        risk = ?view.risk_level,
        "Audit completed"
    );
    Ok(view)
}

/// Administrative abort from `scheduled` or `in_progress`.
pub async fn fail(
    state: &AppState,
    actor: &Actor,
    audit_id: i64,
    reason: &str,
) -> Result<AuditView> {
    if !actor.is_admin() {
        return Err(unauthorized("only admins can fail an audit"));
    }
    if reason.trim().is_empty() {
        return Err(invalid_input("a failure reason is required"));
    }
    let audit = db::get_audit(&state.pool, audit_id)
        .await?
        .ok_or_else(|| not_found(format!("audit {audit_id}")))?;
    if !db::fail_audit(&state.pool, audit_id, reason.trim()).await? {
        return Err(invalid_state(format!(
            "audit {audit_id} is already {:?}",
            audit.status
        )));
    }
    info!(audit_id, by = %actor.id, "Audit failed: {reason}");
    get(state, audit_id).await
}

/// Mark a finding resolved. Resolving it again returns it unchanged.
pub async fn resolve_finding(
    state: &AppState,
    actor: &Actor,
    audit_id: i64,
    finding_id: i64,
) -> Result<Finding> {
    let audit = db::get_audit(&state.pool, audit_id)
        .await?
        .ok_or_else(|| not_found(format!("audit {audit_id}")))?;
    let campaign = db::get_campaign(&state.pool, audit.campaign_id)
        .await?
        .ok_or_else(|| not_found(format!("campaign {}", audit.campaign_id)))?;
    if !actor.is_admin() && campaign.owner_id != actor.id {
        return Err(unauthorized("only the campaign owner or an admin can resolve findings"));
    }

    let finding = db::get_finding(&state.pool, audit_id, finding_id)
        .await?
        .ok_or_else(|| not_found(format!("finding {finding_id} of audit {audit_id}")))?;
    if finding.resolved {
        return Ok(finding);
    }

    if db::resolve_finding(&state.pool, finding_id, &actor.id, db::unix_now()).await? {
        info!(audit_id, finding_id, by = %actor.id, "Finding resolved");
    }
    db::get_finding(&state.pool, audit_id, finding_id)
        .await?
        .ok_or_else(|| not_found(format!("finding {finding_id}")))
}

pub async fn get(state: &AppState, audit_id: i64) -> Result<AuditView> {
    db::load_audit(&state.pool, audit_id).await.map(view)
}

pub async fn list_for_campaign(state: &AppState, campaign_id: i64) -> Result<Vec<AuditView>> {
    let audits = db::list_audits_for_campaign(&state.pool, campaign_id).await?;
    Ok(audits.into_iter().map(view).collect())
}
