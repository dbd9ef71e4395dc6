use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use oproxy_protocol::error::{ErrorBody, ErrorKind};

/// Typed error carried through the pipeline and rendered as the
/// `{"error":{"message","type"}}` body.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: ErrorKind,
    pub message: String,
    /// Seconds for the `Retry-After` header on 429s.
    pub retry_after: Option<u64>,
    /// Which window denied, surfaced as `X-RateLimit-Limit`.
    pub limit_scope: Option<&'static str>,
}

impl ApiError {
    pub fn new(status: StatusCode, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
            retry_after: None,
            limit_scope: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorKind::InvalidRequestError, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, ErrorKind::AuthError, message)
    }

    pub fn access_denied(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, ErrorKind::AccessDenied, message)
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, ErrorKind::PermissionError, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, ErrorKind::NotFound, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: u64, scope: &'static str) -> Self {
        let mut err = Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::RateLimitError,
            message,
        );
        err.retry_after = Some(retry_after);
        err.limit_scope = Some(scope);
        err
    }

    pub fn no_backends() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::NoBackends,
            "no backends available for this request",
        )
    }

    pub fn upstream(status: StatusCode, message: impl Into<String>) -> Self {
        Self::new(status, ErrorKind::UpstreamError, message)
    }

    pub fn gateway_timeout(message: impl Into<String>) -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT, ErrorKind::UpstreamError, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, ErrorKind::ServerError, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody::new(self.kind, self.message);
        let mut response = (self.status, Json(body)).into_response();
        if let Some(secs) = self.retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("retry-after", value);
            }
        }
        if let Some(scope) = self.limit_scope {
            response
                .headers_mut()
                .insert("x-ratelimit-limit", HeaderValue::from_static(scope));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_carries_headers() {
        let err = ApiError::rate_limited("too many requests", 7, "ip");
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["retry-after"], "7");
        assert_eq!(response.headers()["x-ratelimit-limit"], "ip");
    }

    #[test]
    fn kinds_map_to_expected_statuses() {
        assert_eq!(ApiError::invalid_request("x").status, StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::auth("x").status, StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::access_denied("x").status, StatusCode::FORBIDDEN);
        assert_eq!(ApiError::permission("x").status, StatusCode::FORBIDDEN);
        assert_eq!(ApiError::not_found("x").status, StatusCode::NOT_FOUND);
        assert_eq!(ApiError::no_backends().status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ApiError::gateway_timeout("x").status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ApiError::server("x").status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
