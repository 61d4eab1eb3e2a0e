//! Audit lifecycle scenarios.

use crate::app::AppState;
use crate::audits::{add_finding, complete, create, fail, resolve_finding, start};
use crate::errors::{AppError, StateError};
use crate::models::{
    AuditCompletion, AuditStatus, AuditType, NewAudit, NewFinding, RiskLevel, Severity,
};
use crate::test_support::{admin, auditor, insert_active_campaign, owner, setup_state};

fn audit_of(campaign_id: i64, audit_type: AuditType) -> NewAudit {
    NewAudit {
        campaign_id,
        audit_type,
        scheduled_date: Some(1_700_000_000),
        auditor_id: None,
    }
}

fn finding(severity: Severity) -> NewFinding {
    NewFinding {
        severity,
        category: "financial".to_string(),
        description: "unreconciled transfer".to_string(),
        recommendation: Some("attach bank statement".to_string()),
    }
}

fn completion(score: i64, findings: Vec<NewFinding>) -> AuditCompletion {
    AuditCompletion {
        findings,
        overall_score: score,
        report: "ipfs://report".to_string(),
    }
}

async fn in_progress(state: &AppState, campaign_id: i64, audit_type: AuditType) -> i64 {
    let id = create(state, &auditor(), audit_of(campaign_id, audit_type))
        .await
        .unwrap()
        .audit
        .id;
    start(state, &auditor(), id).await.unwrap();
    id
}

#[tokio::test]
async fn one_in_flight_audit_per_type() {
    let (_dir, state, _) = setup_state().await;
    let campaign = insert_active_campaign(&state.pool, 100.0).await;

    let first = create(&state, &auditor(), audit_of(campaign, AuditType::Financial))
        .await
        .unwrap();
    assert_eq!(first.audit.status, AuditStatus::Scheduled);

    let err = create(&state, &auditor(), audit_of(campaign, AuditType::Financial))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::State(StateError::AuditInFlight(_))));
    assert_eq!(err.code(), "AUDIT_IN_FLIGHT");

    // Other types are independent.
    create(&state, &auditor(), audit_of(campaign, AuditType::Security))
        .await
        .unwrap();

    // Still blocked while in progress.
    start(&state, &auditor(), first.audit.id).await.unwrap();
    assert!(create(&state, &auditor(), audit_of(campaign, AuditType::Financial))
        .await
        .is_err());

    complete(&state, &auditor(), first.audit.id, completion(88, Vec::new()))
        .await
        .unwrap();
    let second = create(&state, &auditor(), audit_of(campaign, AuditType::Financial))
        .await
        .unwrap();
    assert_ne!(second.audit.id, first.audit.id);
}

#[tokio::test]
async fn failed_audit_frees_the_slot() {
    let (_dir, state, _) = setup_state().await;
    let campaign = insert_active_campaign(&state.pool, 100.0).await;
    let id = in_progress(&state, campaign, AuditType::Compliance).await;
    fail(&state, &admin(), id, "auditor withdrew").await.unwrap();
    create(&state, &auditor(), audit_of(campaign, AuditType::Compliance))
        .await
        .unwrap();
}

#[tokio::test]
async fn findings_only_while_in_progress() {
    let (_dir, state, _) = setup_state().await;
    let campaign = insert_active_campaign(&state.pool, 100.0).await;
    let id = create(&state, &auditor(), audit_of(campaign, AuditType::Milestone))
        .await
        .unwrap()
        .audit
        .id;

    let err = add_finding(&state, &auditor(), id, finding(Severity::Low))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::State(StateError::InvalidState(_))));

    start(&state, &auditor(), id).await.unwrap();
    let f = add_finding(&state, &auditor(), id, finding(Severity::Low))
        .await
        .unwrap();
    assert!(!f.resolved);
    assert_eq!(f.audit_id, id);

    complete(&state, &auditor(), id, completion(95, Vec::new()))
        .await
        .unwrap();
    let err = add_finding(&state, &auditor(), id, finding(Severity::Low))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::State(StateError::InvalidState(_))));
}

#[tokio::test]
async fn completion_appends_findings_and_schedules_follow_up() {
    let (_dir, state, _) = setup_state().await;
    let campaign = insert_active_campaign(&state.pool, 100.0).await;
    let id = in_progress(&state, campaign, AuditType::Financial).await;
    add_finding(&state, &auditor(), id, finding(Severity::Medium))
        .await
        .unwrap();

    let view = complete(
        &state,
        &auditor(),
        id,
        completion(82, vec![finding(Severity::Low), finding(Severity::High)]),
    )
    .await
    .unwrap();

    let audit = &view.audit;
    assert_eq!(audit.status, AuditStatus::Completed);
    assert_eq!(audit.overall_score, Some(82));
    assert_eq!(audit.report.as_deref(), Some("ipfs://report"));
    assert_eq!(audit.findings.len(), 3);
    let completed = audit.completed_date.unwrap();
    assert_eq!(audit.next_audit_date, Some(completed + 90 * 86_400));
    assert_eq!(view.risk_level, RiskLevel::Medium);
}

#[tokio::test]
async fn critical_finding_overrides_a_good_score() {
    let (_dir, state, _) = setup_state().await;
    let campaign = insert_active_campaign(&state.pool, 100.0).await;
    let id = in_progress(&state, campaign, AuditType::Security).await;

    let view = complete(&state, &auditor(), id, completion(90, vec![finding(Severity::Critical)]))
        .await
        .unwrap();
    assert_eq!(view.risk_level, RiskLevel::Critical);

    // Resolution works on a completed audit and lowers the derived risk.
    let finding_id = view.audit.findings[0].id;
    let resolved = resolve_finding(&state, &owner(), id, finding_id).await.unwrap();
    assert!(resolved.resolved);
    assert_eq!(resolved.resolved_by.as_deref(), Some(owner().id.as_str()));
    let view = crate::audits::get(&state, id).await.unwrap();
    assert_eq!(view.risk_level, RiskLevel::Low);
}

#[tokio::test]
async fn resolving_twice_is_a_no_op() {
    let (_dir, state, _) = setup_state().await;
    let campaign = insert_active_campaign(&state.pool, 100.0).await;
    let id = in_progress(&state, campaign, AuditType::Impact).await;
    let f = add_finding(&state, &auditor(), id, finding(Severity::High))
        .await
        .unwrap();

    let first = resolve_finding(&state, &admin(), id, f.id).await.unwrap();
    let again = resolve_finding(&state, &owner(), id, f.id).await.unwrap();
    assert!(again.resolved);
    assert_eq!(again.resolved_at, first.resolved_at);
    assert_eq!(again.resolved_by.as_deref(), Some("admin-1"));
}

#[tokio::test]
async fn auditors_cannot_resolve_findings() {
    let (_dir, state, _) = setup_state().await;
    let campaign = insert_active_campaign(&state.pool, 100.0).await;
    let id = in_progress(&state, campaign, AuditType::Financial).await;
    let f = add_finding(&state, &auditor(), id, finding(Severity::Low))
        .await
        .unwrap();

    let err = resolve_finding(&state, &auditor(), id, f.id).await.unwrap_err();
    assert!(matches!(err, AppError::State(StateError::Unauthorized(_))));

    let err = resolve_finding(&state, &owner(), id, f.id + 100).await.unwrap_err();
    assert!(matches!(err, AppError::State(StateError::NotFound(_))));
}
