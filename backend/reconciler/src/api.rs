//! Axum REST API handlers.
//!
//! Authentication happens upstream; the gateway forwards the caller's
//! identity in the `x-actor-id` and `x-actor-role` headers.

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, State},
    http::request::Parts,
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::app::AppState;
use crate::config::Network;
use crate::errors::{unauthorized, AppError, Result};
use crate::models::{
    Actor, AuditCompletion, AuditView, CampaignStatus, CampaignView, Donation, DonationClaim,
    Finding, Milestone, MilestoneRelease, NewAudit, NewCampaign, NewFinding, NewMilestone, Role,
};
use crate::gateway::FeeEstimate;
use crate::networks::{self, NetworkInfo};
use crate::{audits, campaigns, milestones, reconciler};

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_ROLE_HEADER: &str = "x-actor-role";

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Actor {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, AppError> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };
        let id = header(ACTOR_ID_HEADER)
            .ok_or_else(|| unauthorized(format!("missing {ACTOR_ID_HEADER} header")))?;
        let role = header(ACTOR_ROLE_HEADER)
            .and_then(Role::parse)
            .ok_or_else(|| {
                unauthorized(format!("missing or unknown {ACTOR_ROLE_HEADER} header"))
            })?;
        Ok(Actor::new(id, role))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/networks", get(list_networks))
        .route("/networks/:network", get(get_network))
        .route("/networks/:network/fee", get(estimate_fee))
        .route("/donations/verify", post(verify_donation))
        .route("/donations/:id", get(get_donation))
        .route("/donations/:id/reconcile", post(reconcile_donation))
        .route("/donations/:id/reverse", post(reverse_donation))
        .route("/campaigns", post(create_campaign))
        .route("/campaigns/:id", get(get_campaign))
        .route("/campaigns/:id/status", post(transition_campaign))
        .route("/campaigns/:id/verified", post(set_campaign_verified))
        .route("/campaigns/:id/milestones", put(replace_milestones))
        .route("/campaigns/:id/donations", get(list_campaign_donations))
        .route("/campaigns/:id/audits", get(list_campaign_audits))
        .route("/campaigns/:id/milestones/:milestone_id", get(get_milestone))
        .route("/campaigns/:id/milestones/:milestone_id/submit", post(submit_milestone))
        .route("/campaigns/:id/milestones/:milestone_id/verify", post(verify_milestone))
        .route("/campaigns/:id/milestones/:milestone_id/release", post(release_milestone))
        .route("/audits", post(create_audit))
        .route("/audits/:id", get(get_audit))
        .route("/audits/:id/start", post(start_audit))
        .route("/audits/:id/complete", post(complete_audit))
        .route("/audits/:id/fail", post(fail_audit))
        .route("/audits/:id/findings", post(add_finding))
        .route("/audits/:id/findings/:finding_id/resolve", post(resolve_finding))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DonationsResponse {
    pub campaign_id: i64,
    pub count: usize,
    pub donations: Vec<Donation>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditsResponse {
    pub campaign_id: i64,
    pub count: usize,
    pub audits: Vec<AuditView>,
}

#[derive(Deserialize)]
pub struct ReasonRequest {
    pub reason: String,
}

#[derive(Deserialize)]
pub struct StatusRequest {
    pub status: CampaignStatus,
}

#[derive(Deserialize)]
pub struct VerifiedRequest {
    pub verified: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub proof_documents: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRequest {
    pub approved: bool,
    #[serde(default)]
    pub rejection_reason: Option<String>,
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /networks`
pub async fn list_networks(State(state): State<AppState>) -> Json<Vec<NetworkInfo>> {
    Json(networks::list(&state))
}

/// `GET /networks/:network`
pub async fn get_network(
    State(state): State<AppState>,
    Path(network): Path<Network>,
) -> Result<Json<NetworkInfo>> {
    Ok(Json(networks::describe(&state, network)?))
}

/// `GET /networks/:network/fee`
pub async fn estimate_fee(
    State(state): State<AppState>,
    Path(network): Path<Network>,
) -> Result<Json<FeeEstimate>> {
    Ok(Json(networks::estimate_fee(&state, network).await?))
}

/// `POST /donations/verify`
pub async fn verify_donation(
    State(state): State<AppState>,
    actor: Actor,
    Json(claim): Json<DonationClaim>,
) -> Result<Json<Donation>> {
    reconciler::submit_claim(&state, &actor, claim).await.map(Json)
}

/// `GET /donations/:id`
pub async fn get_donation(
    State(state): State<AppState>,
    _actor: Actor,
    Path(id): Path<i64>,
) -> Result<Json<Donation>> {
    reconciler::get_donation(&state, id).await.map(Json)
}

/// `POST /donations/:id/reconcile`
///
/// Retry a donation left `pending` by a transient chain failure.
pub async fn reconcile_donation(
    State(state): State<AppState>,
    _actor: Actor,
    Path(id): Path<i64>,
) -> Result<Json<Donation>> {
    reconciler::reconcile(&state, id).await.map(Json)
}

/// `POST /donations/:id/reverse`
pub async fn reverse_donation(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
    Json(body): Json<ReasonRequest>,
) -> Result<Json<Donation>> {
    reconciler::reverse(&state, &actor, id, &body.reason).await.map(Json)
}

/// `POST /campaigns`
pub async fn create_campaign(
    State(state): State<AppState>,
    actor: Actor,
    Json(body): Json<NewCampaign>,
) -> Result<Json<CampaignView>> {
    campaigns::create(&state, &actor, body).await.map(Json)
}

/// `GET /campaigns/:id`
pub async fn get_campaign(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<CampaignView>> {
    campaigns::get(&state, id).await.map(Json)
}

/// `POST /campaigns/:id/status`
pub async fn transition_campaign(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
    Json(body): Json<StatusRequest>,
) -> Result<Json<CampaignView>> {
    campaigns::transition(&state, &actor, id, body.status).await.map(Json)
}

/// `POST /campaigns/:id/verified`
pub async fn set_campaign_verified(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
    Json(body): Json<VerifiedRequest>,
) -> Result<Json<CampaignView>> {
    campaigns::set_verified(&state, &actor, id, body.verified).await.map(Json)
}

/// `PUT /campaigns/:id/milestones`
pub async fn replace_milestones(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
    Json(body): Json<Vec<NewMilestone>>,
) -> Result<Json<CampaignView>> {
    campaigns::replace_milestones(&state, &actor, id, body).await.map(Json)
}

/// `GET /campaigns/:id/donations`
pub async fn list_campaign_donations(
    State(state): State<AppState>,
    Path(campaign_id): Path<i64>,
) -> Result<Json<DonationsResponse>> {
    let donations = reconciler::list_for_campaign(&state, campaign_id).await?;
    Ok(Json(DonationsResponse {
        campaign_id,
        count: donations.len(),
        donations,
    }))
}

/// `GET /campaigns/:id/audits`
pub async fn list_campaign_audits(
    State(state): State<AppState>,
    Path(campaign_id): Path<i64>,
) -> Result<Json<AuditsResponse>> {
    let audits = audits::list_for_campaign(&state, campaign_id).await?;
    Ok(Json(AuditsResponse {
        campaign_id,
        count: audits.len(),
        audits,
    }))
}

/// `GET /campaigns/:id/milestones/:milestone_id`
pub async fn get_milestone(
    State(state): State<AppState>,
    Path((campaign_id, milestone_id)): Path<(i64, i64)>,
) -> Result<Json<Milestone>> {
    milestones::get(&state, campaign_id, milestone_id).await.map(Json)
}

/// `POST /campaigns/:id/milestones/:milestone_id/submit`
pub async fn submit_milestone(
    State(state): State<AppState>,
    actor: Actor,
    Path((campaign_id, milestone_id)): Path<(i64, i64)>,
    Json(body): Json<SubmitRequest>,
) -> Result<Json<Milestone>> {
    milestones::submit(&state, &actor, campaign_id, milestone_id, body.proof_documents)
        .await
        .map(Json)
}

/// `POST /campaigns/:id/milestones/:milestone_id/verify`
pub async fn verify_milestone(
    State(state): State<AppState>,
    actor: Actor,
    Path((campaign_id, milestone_id)): Path<(i64, i64)>,
    Json(body): Json<ReviewRequest>,
) -> Result<Json<Milestone>> {
    milestones::verify(
        &state,
        &actor,
        campaign_id,
        milestone_id,
        body.approved,
        body.rejection_reason,
    )
    .await
    .map(Json)
}

/// `POST /campaigns/:id/milestones/:milestone_id/release`
pub async fn release_milestone(
    State(state): State<AppState>,
    actor: Actor,
    Path((campaign_id, milestone_id)): Path<(i64, i64)>,
    Json(body): Json<MilestoneRelease>,
) -> Result<Json<Milestone>> {
    milestones::release(&state, &actor, campaign_id, milestone_id, body)
        .await
        .map(Json)
}

/// `POST /audits`
pub async fn create_audit(
    State(state): State<AppState>,
    actor: Actor,
    Json(body): Json<NewAudit>,
) -> Result<Json<AuditView>> {
    audits::create(&state, &actor, body).await.map(Json)
}

/// `GET /audits/:id`
pub async fn get_audit(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<AuditView>> {
    audits::get(&state, id).await.map(Json)
}

/// `POST /audits/:id/start`
pub async fn start_audit(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
) -> Result<Json<AuditView>> {
    audits::start(&state, &actor, id).await.map(Json)
}

/// `POST /audits/:id/complete`
pub async fn complete_audit(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
    Json(body): Json<AuditCompletion>,
) -> Result<Json<AuditView>> {
    audits::complete(&state, &actor, id, body).await.map(Json)
}

/// `POST /audits/:id/fail`
pub async fn fail_audit(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
    Json(body): Json<ReasonRequest>,
) -> Result<Json<AuditView>> {
    audits::fail(&state, &actor, id, &body.reason).await.map(Json)
}

/// `POST /audits/:id/findings`
pub async fn add_finding(
    State(state): State<AppState>,
    actor: Actor,
    Path(id): Path<i64>,
    Json(body): Json<NewFinding>,
) -> Result<Json<Finding>> {
    audits::add_finding(&state, &actor, id, body).await.map(Json)
}

/// `POST /audits/:id/findings/:finding_id/resolve`
pub async fn resolve_finding(
    State(state): State<AppState>,
    actor: Actor,
    Path((audit_id, finding_id)): Path<(i64, i64)>,
) -> Result<Json<Finding>> {
    audits::resolve_finding(&state, &actor, audit_id, finding_id)
        .await
        .map(Json)
}
