//! Service error taxonomy
//!
//! Every error carries a kind with a stable numeric code. Handler layers render
//! it through `IntoResponse` as `{"code", "message"}` with the kind's status.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::data::DataError;
use crate::data::broker::BrokerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    Internal,
    Rpc,
    /// Handled by the retry consumer, never surfaced to users
    Retriable,
}

impl ErrorKind {
    pub fn code(&self) -> u32 {
        match self {
            Self::InvalidArgument => 600_001,
            Self::NotFound => 600_002,
            Self::Internal => 600_003,
            Self::Rpc => 600_004,
            Self::Retriable => 600_005,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidArgument => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Internal | Self::Rpc | Self::Retriable => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct ServiceError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ServiceError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn rpc(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Rpc, message)
    }

    pub fn retriable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Retriable, message)
    }

    pub fn missing_config(field: &str) -> Self {
        Self::invalid_argument(format!("missing required config field: {field}"))
    }

    pub fn code(&self) -> u32 {
        self.kind.code()
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

impl From<DataError> for ServiceError {
    fn from(e: DataError) -> Self {
        match e {
            DataError::InvalidInput(msg) => Self::invalid_argument(msg),
            other => {
                tracing::error!(error = %other, "Storage error");
                Self::rpc(other.to_string())
            }
        }
    }
}

impl From<BrokerError> for ServiceError {
    fn from(e: BrokerError) -> Self {
        Self::rpc(e.to_string())
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(e: serde_json::Error) -> Self {
        Self::internal(format!("serialization failed: {e}"))
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (
            self.kind.status(),
            Json(serde_json::json!({
                "code": self.kind.code(),
                "message": self.message,
            })),
        )
            .into_response()
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ServiceError::invalid_argument("x").kind.status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ServiceError::not_found("x").kind.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ServiceError::rpc("x").kind.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_data_error_conversion() {
        let err: ServiceError = DataError::InvalidInput("bad token".to_string()).into();
        assert!(err.is(ErrorKind::InvalidArgument));
        let err: ServiceError = DataError::QueryBuild("boom".to_string()).into();
        assert!(err.is(ErrorKind::Rpc));
    }

    #[test]
    fn test_broker_error_is_rpc() {
        let err: ServiceError = BrokerError::QueueFull("spans".to_string()).into();
        assert!(err.is(ErrorKind::Rpc));
    }

    #[test]
    fn test_response_status() {
        let response = ServiceError::not_found("span missing").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_codes_are_distinct() {
        let kinds = [
            ErrorKind::InvalidArgument,
            ErrorKind::NotFound,
            ErrorKind::Internal,
            ErrorKind::Rpc,
            ErrorKind::Retriable,
        ];
        let mut codes: Vec<u32> = kinds.iter().map(|k| k.code()).collect();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
    }
}
