//! Application-wide error types.
//!
//! Every kind maps to a stable machine-readable code (see [`AppError::code`])
//! plus a human message. Chain, reconciliation and state errors are all
//! recoverable by the caller; only the infrastructure variants are fatal.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Failures surfaced by the chain gateway or by receipt inspection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("transaction {0} not found on chain")]
    NotFound(String),

    #[error("transaction {0} has not been mined yet")]
    NotConfirmed(String),

    #[error("RPC unavailable: {0}")]
    RpcUnavailable(String),

    #[error("could not decode chain data: {0}")]
    DecodeFailure(String),

    #[error("transaction targets {actual}, expected {expected}")]
    WrongContract { expected: String, actual: String },

    #[error("transaction {0} reverted")]
    TransactionFailed(String),
}

/// Failures produced while matching a donation claim against the chain.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReconciliationError {
    #[error("transaction {0} is already attached to another donation")]
    DuplicateTransaction(String),

    #[error("no matching custody event for campaign {0} in transaction")]
    NoMatchingEvent(i64),

    #[error("claimed amount {claimed} does not match on-chain amount {onchain}")]
    AmountMismatch { claimed: f64, onchain: f64 },
}

/// Guard failures from the milestone, audit and campaign state machines.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("a {0} audit is already scheduled or in progress for this campaign")]
    AuditInFlight(String),
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Reconciliation(#[from] ReconciliationError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Integrity violation: {0}")]
    Integrity(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl ChainError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "CHAIN_TX_NOT_FOUND",
            Self::NotConfirmed(_) => "CHAIN_TX_NOT_CONFIRMED",
            Self::RpcUnavailable(_) => "CHAIN_RPC_UNAVAILABLE",
            Self::DecodeFailure(_) => "CHAIN_DECODE_FAILURE",
            Self::WrongContract { .. } => "CHAIN_WRONG_CONTRACT",
            Self::TransactionFailed(_) => "CHAIN_TX_FAILED",
        }
    }

    /// Transient failures leave a donation `pending` so it can be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RpcUnavailable(_) | Self::NotConfirmed(_))
    }
}

impl ReconciliationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicateTransaction(_) => "DUPLICATE_TRANSACTION",
            Self::NoMatchingEvent(_) => "NO_MATCHING_EVENT",
            Self::AmountMismatch { .. } => "AMOUNT_MISMATCH",
        }
    }
}

impl StateError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidState(_) => "INVALID_STATE",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::AuditInFlight(_) => "AUDIT_IN_FLIGHT",
        }
    }
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Chain(e) => e.code(),
            Self::Reconciliation(e) => e.code(),
            Self::State(e) => e.code(),
            Self::Database(_) => "DATABASE_ERROR",
            Self::Migrate(_) => "MIGRATION_ERROR",
            Self::Http(_) => "HTTP_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Integrity(_) => "INTEGRITY_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Chain(ChainError::RpcUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Chain(ChainError::NotConfirmed(_)) => StatusCode::ACCEPTED,
            Self::Chain(ChainError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Chain(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Reconciliation(ReconciliationError::DuplicateTransaction(_)) => {
                StatusCode::CONFLICT
            }
            Self::Reconciliation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::State(StateError::Unauthorized(_)) => StatusCode::FORBIDDEN,
            Self::State(StateError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::State(StateError::InvalidInput(_)) => StatusCode::BAD_REQUEST,
            Self::State(_) => StatusCode::CONFLICT,
            Self::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Shorthand used by the state machines.
pub(crate) fn invalid_state(msg: impl Into<String>) -> AppError {
    StateError::InvalidState(msg.into()).into()
}

pub(crate) fn unauthorized(msg: impl Into<String>) -> AppError {
    StateError::Unauthorized(msg.into()).into()
}

pub(crate) fn not_found(what: impl Into<String>) -> AppError {
    StateError::NotFound(what.into()).into()
}

pub(crate) fn invalid_input(msg: impl Into<String>) -> AppError {
    StateError::InvalidInput(msg.into()).into()
}

/// True when a database error is a UNIQUE constraint violation.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(code = self.code(), "{self}");
        }
        let body = ErrorResponse {
            code: self.code(),
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
