//! HTTP error mapping
//!
//! Every error body is `{code, error, message}`: `code` is the stable label,
//! `error` the HTTP reason phrase.

use async_relay::RelayError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub error: String,
    pub message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Relay(e) => match e {
                RelayError::UnknownOperation(_) => StatusCode::NOT_FOUND,
                RelayError::OperationFailed { .. } => StatusCode::BAD_GATEWAY,
                RelayError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
                RelayError::PublishFailed { .. }
                | RelayError::Infrastructure { .. }
                | RelayError::HealthCheckFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
                RelayError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Relay(e) => e.code(),
            ApiError::NotFound(_) => "not_found",
            ApiError::BadRequest(_) => "bad_request",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();

        if status.is_server_error() {
            tracing::warn!(code = self.code(), error = %self, "Request failed");
        } else {
            tracing::debug!(code = self.code(), error = %self, "Request rejected");
        }

        // Worker failures pass the worker's text through untouched
        let message = match &self {
            ApiError::Relay(RelayError::OperationFailed { message, .. }) => message.clone(),
            other => other.to_string(),
        };

        let body = ErrorBody {
            code: self.code(),
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message,
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_relay::ClientError;
    use std::time::Duration;

    #[test]
    fn test_relay_errors_map_to_distinct_statuses() {
        let cases = [
            (RelayError::UnknownOperation("x".into()), StatusCode::NOT_FOUND),
            (
                RelayError::OperationFailed {
                    correlation_id: "r".into(),
                    message: "boom".into(),
                },
                StatusCode::BAD_GATEWAY,
            ),
            (
                RelayError::Timeout {
                    correlation_id: "r".into(),
                    waited: Duration::from_secs(1),
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                RelayError::PublishFailed {
                    operation: "x".into(),
                    source: ClientError::connection("refused"),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                RelayError::infrastructure("read result", ClientError::connection("refused")),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status(), expected);
        }
    }

    #[tokio::test]
    async fn test_operation_failed_body_carries_worker_text() {
        let response = ApiError::from(RelayError::OperationFailed {
            correlation_id: "r".into(),
            message: "person not found".into(),
        })
        .into_response();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], "operation_failed");
        assert_eq!(body["error"], "Bad Gateway");
        assert_eq!(body["message"], "person not found");
    }
}
