//! Shardkeeper error abstractions.

use axum::http::StatusCode;

pub use shardkeeper_core::AppError;

// Error messages.
pub const ERR_ITER_FAILURE: &str = "error returned during key/value iteration from database";
pub const ERR_DB_FLUSH: &str = "error flushing database state";

/// An extension trait for the shardkeeper core `AppError`.
pub trait AppErrorExt {
    /// Get the HTTP status code and message for this error.
    fn into_status(self) -> (StatusCode, String);

    /// Translate the given error as an app error and map into an HTTP status & message.
    fn http(err: anyhow::Error) -> (StatusCode, String);
}

impl AppErrorExt for AppError {
    fn into_status(self) -> (StatusCode, String) {
        let status = match &self {
            AppError::InvalidInput(_) | AppError::MissingResources(_) => StatusCode::BAD_REQUEST,
            AppError::ConcurrentModification { .. } | AppError::ItemExists(_) => StatusCode::CONFLICT,
            AppError::ItemNotFound(_) => StatusCode::NOT_FOUND,
            AppError::ReadinessTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            AppError::StoreUnavailable(_) | AppError::ResyncRequired(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Ise(err) => {
                tracing::error!(error = ?err, "internal server error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, self.to_string())
    }

    fn http(err: anyhow::Error) -> (StatusCode, String) {
        err.downcast::<Self>()
            .map(Self::into_status)
            .unwrap_or_else(|err| Self::Ise(err).into_status())
    }
}

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;
