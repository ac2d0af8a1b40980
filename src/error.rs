use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tracing::error;

use crate::store::StoreError;

/// Errors surfaced by the chain clients. Kinds, not transport types:
/// the relayers only care whether a failure is worth retrying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    NodeUnavailable(String),
    Timeout,
    RateLimited,
    InsufficientFunds,
    ExpiryRejected,
    AccountNotReady,
    /// Non-transient RPC rejection (bad params, unknown note, ...).
    Rpc(String),
    Malformed(String),
}

impl ChainError {
    /// Transient errors are retried on the next tick without advancing
    /// any cursor past the offending event.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChainError::NodeUnavailable(_) | ChainError::Timeout | ChainError::RateLimited
        )
    }
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainError::NodeUnavailable(msg) => write!(f, "node unavailable: {msg}"),
            ChainError::Timeout => write!(f, "rpc deadline exceeded"),
            ChainError::RateLimited => write!(f, "rate limited by node"),
            ChainError::InsufficientFunds => write!(f, "insufficient funds"),
            ChainError::ExpiryRejected => write!(f, "transaction expired before mining"),
            ChainError::AccountNotReady => write!(f, "account not loaded on the rollup"),
            ChainError::Rpc(msg) => write!(f, "rpc error: {msg}"),
            ChainError::Malformed(msg) => write!(f, "malformed response: {msg}"),
        }
    }
}

impl std::error::Error for ChainError {}

/// Facade-level error. Policy and crypto errors map to 4xx, transient
/// upstream failures to 5xx, everything else to 500.
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    MalformedAccountId,
    MalformedSecret,
    AccountNotReady,
    NotFound(String),
    Upstream(String),
    Internal(String),
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::MalformedAccountId => StatusCode::BAD_REQUEST,
            AppError::MalformedSecret => StatusCode::BAD_REQUEST,
            AppError::AccountNotReady => StatusCode::CONFLICT,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Upstream(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::MalformedAccountId => "MALFORMED_ACCOUNT_ID",
            AppError::MalformedSecret => "MALFORMED_SECRET",
            AppError::AccountNotReady => "ACCOUNT_NOT_READY",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Upstream(_) => "UPSTREAM_UNAVAILABLE",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Sanitized message shown to clients. Internal details are logged
    /// server-side only.
    fn public_message(&self) -> String {
        match self {
            AppError::BadRequest(msg) => msg.clone(),
            AppError::MalformedAccountId => "account id is not valid bech32 or hex".into(),
            AppError::MalformedSecret => "secret must be 32 bytes of hex".into(),
            AppError::AccountNotReady => "account is not known to the rollup yet".into(),
            AppError::NotFound(what) => format!("{what} not found"),
            AppError::Upstream(_) => "upstream chain unavailable, try again".into(),
            AppError::Internal(_) => "internal error".into(),
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::BadRequest(msg) => write!(f, "bad request: {msg}"),
            AppError::MalformedAccountId => write!(f, "malformed account id"),
            AppError::MalformedSecret => write!(f, "malformed secret"),
            AppError::AccountNotReady => write!(f, "account not ready"),
            AppError::NotFound(what) => write!(f, "{what} not found"),
            AppError::Upstream(msg) => write!(f, "upstream error: {msg}"),
            AppError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => AppError::NotFound(what),
            StoreError::Backend(msg) => AppError::Internal(msg),
        }
    }
}

impl From<ChainError> for AppError {
    fn from(e: ChainError) -> Self {
        match e {
            ChainError::AccountNotReady => AppError::AccountNotReady,
            ChainError::InsufficientFunds => {
                AppError::BadRequest("insufficient funds in the pool".into())
            }
            e if e.is_transient() => AppError::Upstream(e.to_string()),
            e => AppError::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if matches!(self, AppError::Upstream(_) | AppError::Internal(_)) {
            error!(error = %self, "request failed");
        }

        let status = self.status_code();
        let body = json!({
            "success": false,
            "error": self.public_message(),
            "code": self.error_code(),
        });
        (status, axum::Json(body)).into_response()
    }
}
