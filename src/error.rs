use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::time::Duration;
use thiserror::Error;

/// Failure of a single store round-trip. Every variant is transient from the
/// pipeline's point of view and feeds circuit-breaker accounting.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unreachable(String),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store connection error: {0}")]
    Connection(String),
    #[error("store error: {0}")]
    Generic(String),
}

impl StoreError {
    pub fn reason(&self) -> &'static str {
        match self {
            StoreError::Unreachable(_) => "DB_UNREACHABLE",
            StoreError::Timeout(_) => "DB_TIMEOUT",
            StoreError::Connection(_) => "DB_CONNECTION_ERROR",
            StoreError::Generic(_) => "DB_GENERIC_ERROR",
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => StoreError::Unreachable(err.to_string()),
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Connection(err.to_string()),
            other => StoreError::Generic(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unreachable: {0}")]
    Unreachable(String),
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("failed to encode fallback message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to decode fallback message: {0}")]
    Decode(String),
}

/// Outcome of a call routed through the circuit breaker.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit open; call short-circuited")]
    Open,
    #[error(transparent)]
    Inner(E),
}

/// Why a fallback message could not be applied and must be redelivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryFailure {
    DbUnreachable,
    DbTimeout,
    DbConnectionError,
    DbGenericError,
    CircuitOpen,
    InFlight,
    Unknown,
}

impl RecoveryFailure {
    pub fn reason(&self) -> &'static str {
        match self {
            RecoveryFailure::DbUnreachable => "DB_UNREACHABLE",
            RecoveryFailure::DbTimeout => "DB_TIMEOUT",
            RecoveryFailure::DbConnectionError => "DB_CONNECTION_ERROR",
            RecoveryFailure::DbGenericError => "DB_GENERIC_ERROR",
            RecoveryFailure::CircuitOpen => "CIRCUIT_OPEN",
            RecoveryFailure::InFlight => "IN_FLIGHT",
            RecoveryFailure::Unknown => "UNKNOWN",
        }
    }
}

impl From<&StoreError> for RecoveryFailure {
    fn from(err: &StoreError) -> Self {
        match err {
            StoreError::Unreachable(_) => RecoveryFailure::DbUnreachable,
            StoreError::Timeout(_) => RecoveryFailure::DbTimeout,
            StoreError::Connection(_) => RecoveryFailure::DbConnectionError,
            StoreError::Generic(_) => RecoveryFailure::DbGenericError,
        }
    }
}

impl From<BreakerError<StoreError>> for RecoveryFailure {
    fn from(err: BreakerError<StoreError>) -> Self {
        match err {
            BreakerError::Open => RecoveryFailure::CircuitOpen,
            BreakerError::Inner(inner) => RecoveryFailure::from(&inner),
        }
    }
}

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("forecaster request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("forecaster timed out after {0:?}")]
    Timeout(Duration),
    #[error("not enough history: have {have}, need {need}")]
    InsufficientHistory { have: usize, need: usize },
    #[error("forecaster returned an unusable response: {0}")]
    BadResponse(String),
}

/// Errors reported synchronously to callers of the control surface.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("upload contained no readings")]
    EmptyUpload,
    #[error("pending queue is empty; ingest a dataset first")]
    EmptyQueue,
    #[error("failed to parse upload: {0}")]
    Parse(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<ControlError> for AppError {
    fn from(err: ControlError) -> Self {
        let status = match &err {
            ControlError::EmptyUpload | ControlError::Parse(_) => StatusCode::BAD_REQUEST,
            ControlError::EmptyQueue => StatusCode::CONFLICT,
            ControlError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, status = %status, "control request failed");
        } else {
            tracing::warn!(error = %err, status = %status, "control request rejected");
        }
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_errors_map_to_recovery_taxonomy() {
        let open: BreakerError<StoreError> = BreakerError::Open;
        assert_eq!(RecoveryFailure::from(open), RecoveryFailure::CircuitOpen);

        let timeout = BreakerError::Inner(StoreError::Timeout(Duration::from_secs(3)));
        assert_eq!(RecoveryFailure::from(timeout).reason(), "DB_TIMEOUT");
    }

    #[test]
    fn pool_timeout_is_unreachable() {
        let err = StoreError::from(sqlx::Error::PoolTimedOut);
        assert_eq!(err.reason(), "DB_UNREACHABLE");
        let err = StoreError::from(sqlx::Error::PoolClosed);
        assert_eq!(err.reason(), "DB_CONNECTION_ERROR");
    }

    #[test]
    fn control_errors_pick_http_status() {
        assert_eq!(
            AppError::from(ControlError::EmptyQueue).status,
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::from(ControlError::Store(StoreError::Generic("x".into()))).status,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
