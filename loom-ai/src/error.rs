//! Error types for loom-ai
//!
//! Every failure reaching the HTTP surface is an [`ApiError`], rendered as
//! `{"error": {"code", "message", ...details}}`.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::governance::GovernanceRejection;
use crate::jobs::{JobError, OrchestratorError};
use crate::provider::ProviderError;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Missing user identity (401)
    #[error("Authentication required")]
    Unauthenticated,

    /// Conflict (409), e.g. inline generation already running for the node
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Rate limit or quota breach (429)
    #[error(transparent)]
    Governance(#[from] GovernanceRejection),

    /// Model provider failure (502/503)
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    /// loom-common error
    #[error("Common error: {0}")]
    Common(loom_common::Error),
}

impl From<loom_common::Error> for ApiError {
    fn from(err: loom_common::Error) -> Self {
        ApiError::from_common(err)
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Provider(e) => ApiError::Provider(e),
            JobError::Context(e) => ApiError::from_common(e),
            JobError::Persistence(e) => ApiError::Internal(format!("Failed to persist generated image: {}", e)),
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::InvalidInput(msg) => ApiError::BadRequest(msg),
            OrchestratorError::NotFound(msg) => ApiError::NotFound(msg),
            OrchestratorError::InProgress(node_id) => {
                ApiError::Conflict(format!("image generation already in progress for node {}", node_id))
            }
            OrchestratorError::Job(e) => ApiError::from(e),
            OrchestratorError::Data(e) => ApiError::Common(e),
        }
    }
}

impl ApiError {
    /// Map common errors onto their HTTP meaning
    pub fn from_common(err: loom_common::Error) -> Self {
        match err {
            loom_common::Error::NotFound(msg) => ApiError::NotFound(msg),
            loom_common::Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            other => ApiError::Common(other),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.parts().0
    }

    fn parts(&self) -> (StatusCode, &'static str, Map<String, Value>) {
        let mut details = Map::new();
        let (status, code) = match self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Unauthenticated => (StatusCode::UNAUTHORIZED, "UNAUTHENTICATED"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::Governance(GovernanceRejection::RateLimited {
                limit,
                retry_after_secs,
                reset_at,
            }) => {
                details.insert("limit".into(), json!(limit));
                details.insert("retry_after_secs".into(), json!(retry_after_secs));
                details.insert("reset_at".into(), json!(reset_at.to_rfc3339()));
                (StatusCode::TOO_MANY_REQUESTS, "RATE_LIMITED")
            }
            ApiError::Governance(GovernanceRejection::QuotaExceeded(exceeded)) => {
                details.insert("period".into(), json!(exceeded.period.as_str()));
                details.insert("limit".into(), json!(exceeded.limit));
                details.insert("used".into(), json!(exceeded.used));
                details.insert("reset_at".into(), json!(exceeded.reset_at.to_rfc3339()));
                (StatusCode::TOO_MANY_REQUESTS, "QUOTA_EXCEEDED")
            }
            ApiError::Provider(e) => match e {
                ProviderError::MissingCredentials(_) => (StatusCode::SERVICE_UNAVAILABLE, "PROVIDER_NOT_CONFIGURED"),
                ProviderError::Unparseable(_) => (StatusCode::BAD_GATEWAY, "UNPARSEABLE_AI_RESPONSE"),
                ProviderError::InvalidMimeType(_) => (StatusCode::BAD_GATEWAY, "INVALID_IMAGE_FORMAT"),
                ProviderError::Network(_) | ProviderError::Upstream { .. } | ProviderError::EmptyResponse => {
                    (StatusCode::BAD_GATEWAY, "GENERATION_FAILED")
                }
            },
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            ApiError::Common(_) => (StatusCode::INTERNAL_SERVER_ERROR, "COMMON_ERROR"),
        };
        (status, code, details)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, details) = self.parts();
        if status.is_server_error() {
            tracing::error!(code = error_code, error = %self, "Request failed");
        }

        let mut error = Map::new();
        error.insert("code".into(), json!(error_code));
        error.insert("message".into(), json!(self.to_string()));
        error.extend(details);

        let mut response = (status, Json(json!({ "error": Value::Object(error) }))).into_response();

        if let ApiError::Governance(GovernanceRejection::RateLimited { retry_after_secs, .. }) = &self {
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::{QuotaExceeded, QuotaPeriod};
    use chrono::Utc;

    #[test]
    fn test_status_mapping() {
        let cases: Vec<(ApiError, StatusCode, &str)> = vec![
            (ApiError::BadRequest("x".into()), StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            (ApiError::Unauthenticated, StatusCode::UNAUTHORIZED, "UNAUTHENTICATED"),
            (
                ApiError::Provider(ProviderError::MissingCredentials("k".into())),
                StatusCode::SERVICE_UNAVAILABLE,
                "PROVIDER_NOT_CONFIGURED",
            ),
            (
                ApiError::Provider(ProviderError::Unparseable("x".into())),
                StatusCode::BAD_GATEWAY,
                "UNPARSEABLE_AI_RESPONSE",
            ),
            (
                ApiError::Provider(ProviderError::InvalidMimeType("image/gif".into())),
                StatusCode::BAD_GATEWAY,
                "INVALID_IMAGE_FORMAT",
            ),
            (
                ApiError::Provider(ProviderError::Upstream { status: 500, message: "x".into() }),
                StatusCode::BAD_GATEWAY,
                "GENERATION_FAILED",
            ),
            (
                ApiError::from(OrchestratorError::InProgress(uuid::Uuid::new_v4())),
                StatusCode::CONFLICT,
                "CONFLICT",
            ),
        ];
        for (err, status, code) in cases {
            let (actual_status, actual_code, _) = err.parts();
            assert_eq!(actual_status, status);
            assert_eq!(actual_code, code);
        }
    }

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let response = ApiError::Governance(GovernanceRejection::RateLimited {
            limit: 5,
            retry_after_secs: 42,
            reset_at: Utc::now(),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "42");
    }

    #[test]
    fn test_quota_details() {
        let (status, code, details) = ApiError::Governance(GovernanceRejection::QuotaExceeded(QuotaExceeded {
            period: QuotaPeriod::Monthly,
            limit: 1500,
            used: 1500,
            reset_at: Utc::now(),
        }))
        .parts();
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(code, "QUOTA_EXCEEDED");
        assert_eq!(details["period"], json!("monthly"));
        assert_eq!(details["used"], json!(1500));
    }
}
