//! JSON error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::error::ErrorKind;

/// An error rendered as `{"error": <message>, "kind": <kind>}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    /// A 400 for a request the handler rejects before touching the indexer.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: ErrorKind::Invalid.as_str(),
            message: message.into(),
        }
    }

    /// A 504 for a request that ran past the configured timeout.
    pub(crate) fn timeout() -> Self {
        Self {
            status: StatusCode::GATEWAY_TIMEOUT,
            kind: "timeout",
            message: "request timed out".to_string(),
        }
    }

    /// HTTP status this error renders with.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<crate::Error> for ApiError {
    fn from(error: crate::Error) -> Self {
        let kind = error.kind();
        let status = match kind {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Invalid => StatusCode::BAD_REQUEST,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if kind == ErrorKind::Internal {
            tracing::error!(error = %error, "Request failed");
        } else {
            tracing::debug!(error = %error, kind = kind.as_str(), "Request rejected");
        }
        Self {
            status,
            kind: kind.as_str(),
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
            "kind": self.kind,
        });
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{StorageError, WatcherError};

    #[test]
    fn test_status_mapping() {
        let cases = [
            (crate::Error::from(StorageError::not_found("root", "/x")), StatusCode::NOT_FOUND),
            (StorageError::conflict("root", "/x").into(), StatusCode::CONFLICT),
            (WatcherError::RootNotFound("/x".into()).into(), StatusCode::NOT_FOUND),
            (crate::Error::invalid("empty query"), StatusCode::BAD_REQUEST),
            (crate::Error::internal("boom"), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status(), status);
        }
    }

    #[tokio::test]
    async fn test_body_shape() {
        let response = ApiError::from(crate::Error::from(StorageError::conflict("root", "/docs"))).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["kind"], "conflict");
        assert!(body["error"].as_str().unwrap().contains("/docs"));
    }
}
