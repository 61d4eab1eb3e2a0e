//! Persisted entities and the request shapes that create them.
//!
//! Status enums are stored as snake_case TEXT. Derived values (campaign
//! progress, audit risk level) are never stored; see [`crate::campaigns::progress`]
//! and [`crate::audits::risk_level`].

use serde::{Deserialize, Serialize};
use sqlx::types::Json;

use crate::config::Network;

// ─────────────────────────────────────────────────────────
// Actors
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Donor,
    Charity,
    Auditor,
    Admin,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "donor" => Some(Self::Donor),
            "charity" => Some(Self::Charity),
            "auditor" => Some(Self::Auditor),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

/// The authenticated caller of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn is_reviewer(&self) -> bool {
        matches!(self.role, Role::Admin | Role::Auditor)
    }
}

// ─────────────────────────────────────────────────────────
// Campaigns & milestones
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    PendingApproval,
    Active,
    Paused,
    Completed,
    Cancelled,
    UnderReview,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::PendingApproval => "pending_approval",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::UnderReview => "under_review",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub id: i64,
    pub owner_id: String,
    pub title: String,
    pub target_amount: f64,
    pub raised_amount: f64,
    pub released_amount: f64,
    pub donor_count: i64,
    pub status: CampaignStatus,
    pub is_verified: bool,
    pub created_at: i64,
    pub updated_at: i64,
    #[sqlx(skip)]
    pub milestones: Vec<Milestone>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Pending,
    Submitted,
    Verified,
    Rejected,
    FundsReleased,
}

impl MilestoneStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::Verified => "verified",
            Self::Rejected => "rejected",
            Self::FundsReleased => "funds_released",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Milestone {
    pub id: i64,
    pub campaign_id: i64,
    /// 1-based position within the campaign.
    #[serde(rename = "order")]
    pub position: i64,
    pub title: String,
    pub description: Option<String>,
    pub target_amount: f64,
    pub deadline: Option<i64>,
    pub status: MilestoneStatus,
    /// References to externally stored evidence (e.g. IPFS CIDs).
    pub proof_documents: Json<Vec<String>>,
    pub submitted_at: Option<i64>,
    pub submitted_by: Option<String>,
    pub verified_at: Option<i64>,
    pub verified_by: Option<String>,
    pub rejection_reason: Option<String>,
    /// Hash of the on-chain release transaction.
    pub transaction_hash: Option<String>,
    pub released_amount: Option<f64>,
    pub released_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMilestone {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub target_amount: f64,
    #[serde(default)]
    pub deadline: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCampaign {
    pub title: String,
    pub target_amount: f64,
    #[serde(default)]
    pub milestones: Vec<NewMilestone>,
    /// Skip `draft` and go straight to `pending_approval`.
    #[serde(default)]
    pub submit_for_approval: bool,
}

/// On-chain release of a verified milestone's funds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MilestoneRelease {
    pub transaction_hash: String,
    pub network: Network,
}

/// A campaign together with its derived funding progress (percent).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignView {
    #[serde(flatten)]
    pub campaign: Campaign,
    pub progress: f64,
}

// ─────────────────────────────────────────────────────────
// Donations
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum DonationStatus {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Donation {
    pub id: i64,
    pub donor_id: String,
    pub campaign_id: i64,
    /// Amount claimed by the donor, in display units.
    pub amount: f64,
    pub currency: String,
    pub network: Network,
    pub transaction_hash: String,
    pub status: DonationStatus,
    /// Donor address reported by the `DonationMade` event.
    pub donor_address: Option<String>,
    /// Amount reported by the chain, in display units.
    pub onchain_amount: Option<f64>,
    pub block_number: Option<i64>,
    pub block_timestamp: Option<i64>,
    pub gas_used: Option<String>,
    pub gas_fee: Option<String>,
    pub failure_code: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: i64,
    pub confirmed_at: Option<i64>,
    pub updated_at: i64,
}

/// A donor's assertion that a chain transaction funded a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonationClaim {
    pub campaign_id: i64,
    pub amount: f64,
    pub transaction_hash: String,
    pub network: Network,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "MATIC".to_string()
}

/// Trusted outcome of a successful reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub transaction_hash: String,
    pub donor_address: String,
    /// On-chain amount in display units.
    pub amount: f64,
    pub block_number: i64,
    pub block_timestamp: Option<i64>,
    pub gas_used: u128,
    pub gas_fee: Option<u128>,
}

// ─────────────────────────────────────────────────────────
// Audits
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum AuditType {
    Financial,
    Milestone,
    Compliance,
    Security,
    Impact,
}

impl AuditType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Financial => "financial",
            Self::Milestone => "milestone",
            Self::Compliance => "compliance",
            Self::Security => "security",
            Self::Impact => "impact",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum AuditStatus {
    Scheduled,
    InProgress,
    Completed,
    Failed,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub id: i64,
    pub audit_id: i64,
    pub severity: Severity,
    pub category: String,
    pub description: String,
    pub recommendation: Option<String>,
    pub resolved: bool,
    pub resolved_at: Option<i64>,
    pub resolved_by: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFinding {
    pub severity: Severity,
    pub category: String,
    pub description: String,
    #[serde(default)]
    pub recommendation: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Audit {
    pub id: i64,
    pub campaign_id: i64,
    pub auditor_id: String,
    pub audit_type: AuditType,
    pub status: AuditStatus,
    pub scheduled_date: i64,
    pub started_at: Option<i64>,
    pub completed_date: Option<i64>,
    pub overall_score: Option<i64>,
    pub report: Option<String>,
    /// Advisory follow-up date for the external scheduler.
    pub next_audit_date: Option<i64>,
    pub failure_reason: Option<String>,
    pub created_by: String,
    pub created_at: i64,
    #[sqlx(skip)]
    pub findings: Vec<Finding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAudit {
    pub campaign_id: i64,
    pub audit_type: AuditType,
    #[serde(default)]
    pub scheduled_date: Option<i64>,
    /// Required when an admin schedules the audit.
    #[serde(default)]
    pub auditor_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditCompletion {
    #[serde(default)]
    pub findings: Vec<NewFinding>,
    pub overall_score: i64,
    pub report: String,
}

/// An audit together with its derived risk level.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditView {
    #[serde(flatten)]
    pub audit: Audit,
    pub risk_level: RiskLevel,
}
