use serde::{Deserialize, Serialize};

/// Client-visible error classes carried in the `type` field of the
/// OpenAI-shaped error body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthError,
    AccessDenied,
    PermissionError,
    RateLimitError,
    InvalidRequestError,
    NotFound,
    ServerError,
    UpstreamError,
    StreamError,
    NoBackends,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AuthError => "auth_error",
            ErrorKind::AccessDenied => "access_denied",
            ErrorKind::PermissionError => "permission_error",
            ErrorKind::RateLimitError => "rate_limit_error",
            ErrorKind::InvalidRequestError => "invalid_request_error",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ServerError => "server_error",
            ErrorKind::UpstreamError => "upstream_error",
            ErrorKind::StreamError => "stream_error",
            ErrorKind::NoBackends => "no_backends",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: ErrorKind,
}

/// The wire shape every error response uses: `{"error":{"message","type"}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

impl ErrorBody {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                message: message.into(),
                kind,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_serializes_to_openai_shape() {
        let body = ErrorBody::new(ErrorKind::RateLimitError, "slow down");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"]["message"], "slow down");
        assert_eq!(json["error"]["type"], "rate_limit_error");
    }
}
