//! Governance middleware
//!
//! Classifies each request, resolves its key (client IP or user id), admits
//! or rejects it, and reports remaining allowance in response headers.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{request::Parts, HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::{Admission, EndpointClass, Governance};
use crate::error::ApiError;

/// Header carrying the authenticated user id from the upstream auth layer
pub const USER_ID_HEADER: &str = "x-user-id";

/// User identity of a governed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser(pub String);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for AuthenticatedUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(user) = parts.extensions.get::<AuthenticatedUser>() {
            return Ok(user.clone());
        }
        user_from_headers(&parts.headers)
            .map(AuthenticatedUser)
            .ok_or(ApiError::Unauthenticated)
    }
}

fn user_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn client_ip(request: &Request) -> String {
    let forwarded = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn governance_middleware(
    State(governance): State<Arc<Governance>>,
    mut request: Request,
    next: Next,
) -> Response {
    let class = EndpointClass::classify(request.uri().path());
    if class == EndpointClass::Open {
        return next.run(request).await;
    }

    let key = if class == EndpointClass::Auth {
        client_ip(&request)
    } else {
        match user_from_headers(request.headers()) {
            Some(user) => {
                request.extensions_mut().insert(AuthenticatedUser(user.clone()));
                user
            }
            None => return ApiError::Unauthenticated.into_response(),
        }
    };

    let admission = match governance.admit(class, &key).await {
        Ok(admission) => admission,
        Err(rejection) => return ApiError::from(rejection).into_response(),
    };

    let mut response = next.run(request).await;
    apply_headers(response.headers_mut(), &admission);
    response
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: String) {
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

fn apply_headers(headers: &mut HeaderMap, admission: &Admission) {
    if let Some(rate) = &admission.rate {
        set_header(headers, "x-ratelimit-limit", rate.limit.to_string());
        set_header(headers, "x-ratelimit-remaining", rate.remaining.to_string());
    }
    if let Some(quota) = &admission.quota {
        set_header(headers, "x-quota-daily-remaining", quota.daily_remaining().to_string());
        set_header(headers, "x-quota-monthly-remaining", quota.monthly_remaining().to_string());
        set_header(headers, "x-quota-daily-reset", quota.daily_reset_at.to_rfc3339());
        set_header(headers, "x-quota-monthly-reset", quota.monthly_reset_at.to_rfc3339());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::{QuotaStatus, RateDecision};
    use chrono::Utc;
    use std::time::Duration;

    #[test]
    fn test_headers_written_for_admission() {
        let mut headers = HeaderMap::new();
        apply_headers(
            &mut headers,
            &Admission {
                rate: Some(RateDecision {
                    limit: 30,
                    remaining: 29,
                    reset_after: Duration::from_secs(60),
                }),
                quota: Some(QuotaStatus {
                    daily_limit: 100,
                    daily_used: 4,
                    daily_reset_at: Utc::now(),
                    monthly_limit: 1500,
                    monthly_used: 40,
                    monthly_reset_at: Utc::now(),
                }),
            },
        );
        assert_eq!(headers["x-ratelimit-limit"], "30");
        assert_eq!(headers["x-ratelimit-remaining"], "29");
        assert_eq!(headers["x-quota-daily-remaining"], "96");
        assert_eq!(headers["x-quota-monthly-remaining"], "1460");
        assert!(headers.contains_key("x-quota-daily-reset"));
    }

    #[test]
    fn test_blank_user_header_is_absent() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("  "));
        assert_eq!(user_from_headers(&headers), None);
        headers.insert(USER_ID_HEADER, HeaderValue::from_static("user-7"));
        assert_eq!(user_from_headers(&headers).as_deref(), Some("user-7"));
    }
}
