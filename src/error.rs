// error.rs
use axum::response::{IntoResponse, Response};
use axum::Json;
use http::StatusCode;
use serde_json::json;
use thiserror::Error;

/// Failures raised by a `PollStore` or `JobQueue` implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The voter's votes changed between read and write.
    #[error("concurrent modification")]
    Conflict,

    /// The (poll, user, option) uniqueness constraint rejected an insert.
    #[error("duplicate vote")]
    Duplicate,

    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// The poll was gone when the write ran.
    #[error("poll missing")]
    PollMissing,

    /// The poll closed between read and write.
    #[error("poll closed")]
    PollClosed,

    /// The poll's deadline passed between read and write.
    #[error("poll expired")]
    PollExpired,
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Duplicate,
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::Decode(_)
            | sqlx::Error::TypeNotFound { .. } => StoreError::Corrupt(err.to_string()),
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

/// Caller-visible failures of the poll operations.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("poll not found")]
    NotFound,

    #[error("only the poll creator may do that")]
    Forbidden,

    #[error("poll is closed")]
    PollClosed,

    #[error("poll has expired")]
    PollExpired,

    #[error("option does not belong to this poll")]
    InvalidOption,

    #[error("vote already recorded")]
    AlreadyVoted,

    #[error("poll is already closed")]
    AlreadyClosed,

    #[error("invalid poll: {0}")]
    Invalid(String),

    #[error("storage is unavailable, try again")]
    StoreUnavailable,

    #[error("temporary failure, try again")]
    TransientIo,
}

impl PollError {
    /// Whether a background job should retry after this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PollError::StoreUnavailable | PollError::TransientIo)
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            PollError::NotFound => StatusCode::NOT_FOUND,
            PollError::Forbidden => StatusCode::FORBIDDEN,
            PollError::PollClosed | PollError::AlreadyClosed | PollError::AlreadyVoted => {
                StatusCode::CONFLICT
            }
            PollError::PollExpired => StatusCode::GONE,
            PollError::InvalidOption | PollError::Invalid(_) => StatusCode::BAD_REQUEST,
            PollError::StoreUnavailable | PollError::TransientIo => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }

    fn code(&self) -> &'static str {
        match self {
            PollError::NotFound => "not_found",
            PollError::Forbidden => "forbidden",
            PollError::PollClosed => "poll_closed",
            PollError::PollExpired => "poll_expired",
            PollError::InvalidOption => "invalid_option",
            PollError::AlreadyVoted => "already_voted",
            PollError::AlreadyClosed => "already_closed",
            PollError::Invalid(_) => "invalid",
            PollError::StoreUnavailable => "store_unavailable",
            PollError::TransientIo => "transient_io",
        }
    }
}

impl From<StoreError> for PollError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate => PollError::AlreadyVoted,
            StoreError::Unavailable(reason) => {
                tracing::warn!(%reason, "store call failed");
                PollError::StoreUnavailable
            }
            StoreError::Conflict => PollError::TransientIo,
            StoreError::PollMissing => PollError::NotFound,
            StoreError::PollClosed => PollError::PollClosed,
            StoreError::PollExpired => PollError::PollExpired,
            StoreError::Corrupt(reason) => {
                tracing::error!(%reason, "store returned an unreadable row");
                PollError::TransientIo
            }
        }
    }
}

impl IntoResponse for PollError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.to_string(),
            "code": self.code(),
        });
        (self.status_code(), Json(body)).into_response()
    }
}
