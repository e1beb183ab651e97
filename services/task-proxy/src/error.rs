//! Request-path error types
//!
//! Every failure the proxy produces itself (as opposed to relaying an
//! upstream response) maps to a distinct status and `error.type`, so callers
//! can tell "no key available" from "upstream unreachable" from "upstream
//! answered with something unreadable".

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Failures raised while dispatching a task request.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("no upstream key available")]
    PoolExhausted,

    #[error("upstream request failed: {0}")]
    UpstreamTransport(String),

    #[error("upstream timed out after {0}s")]
    UpstreamTimeout(u64),

    #[error("upstream response is not valid JSON: {0}")]
    UpstreamResponseParse(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("task still running after waiting {waited_secs}s ({attempts} status queries)")]
    PollTimeout { waited_secs: u64, attempts: u32 },

    #[error("status polling cancelled: service shutting down")]
    PollCancelled,

    /// Proxy-side fault unrelated to upstream, e.g. the key store failing
    /// while a request is in flight.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::PoolExhausted | ProxyError::PollCancelled => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::UpstreamTransport(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout(_) | ProxyError::PollTimeout { .. } => {
                StatusCode::GATEWAY_TIMEOUT
            }
            ProxyError::UpstreamResponseParse(_) | ProxyError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Value of `error.type` in the JSON envelope.
    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::PoolExhausted => "pool_exhausted",
            ProxyError::UpstreamTransport(_) | ProxyError::UpstreamTimeout(_) => {
                "upstream_transport_error"
            }
            ProxyError::UpstreamResponseParse(_) => "upstream_parse_error",
            ProxyError::InvalidRequest(_) => "invalid_request",
            ProxyError::PollTimeout { .. } => "poll_timeout",
            ProxyError::PollCancelled => "poll_cancelled",
            ProxyError::Internal(_) => "internal_error",
        }
    }

    /// Label for `proxy_upstream_errors_total`, or None for caller-side errors.
    pub fn upstream_error_label(&self) -> Option<&'static str> {
        match self {
            ProxyError::UpstreamTransport(_) => Some("transport"),
            ProxyError::UpstreamTimeout(_) => Some("timeout"),
            ProxyError::UpstreamResponseParse(_) => Some("parse"),
            _ => None,
        }
    }

    /// Render as the proxy's JSON error envelope.
    pub fn into_response_with_id(self, request_id: &str) -> Response {
        error_response(self.status(), self.error_type(), &self.to_string(), request_id)
    }
}

impl From<key_pool::Error> for ProxyError {
    fn from(err: key_pool::Error) -> Self {
        match err {
            key_pool::Error::PoolExhausted => ProxyError::PoolExhausted,
            other => ProxyError::Internal(other.to_string()),
        }
    }
}

/// JSON error body: {"error":{"type":"...","message":"...","request_id":"req_..."}}
pub fn error_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
    request_id: &str,
) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_failures_have_distinct_statuses() {
        let exhausted = ProxyError::PoolExhausted;
        let transport = ProxyError::UpstreamTransport("connection refused".into());
        let parse = ProxyError::UpstreamResponseParse("expected value".into());

        assert_eq!(exhausted.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(transport.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(parse.status(), StatusCode::INTERNAL_SERVER_ERROR);

        assert_eq!(exhausted.error_type(), "pool_exhausted");
        assert_eq!(transport.error_type(), "upstream_transport_error");
        assert_eq!(parse.error_type(), "upstream_parse_error");
    }

    #[test]
    fn timeout_is_gateway_timeout_with_transport_type() {
        let err = ProxyError::UpstreamTimeout(60);
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(err.error_type(), "upstream_transport_error");
        assert!(err.to_string().contains("60s"));
    }

    #[test]
    fn pool_exhausted_converts_from_pool_error() {
        let err: ProxyError = key_pool::Error::PoolExhausted.into();
        assert!(matches!(err, ProxyError::PoolExhausted));
    }

    #[test]
    fn store_failure_is_internal_not_upstream() {
        let err: ProxyError = key_pool::Error::StoreUnavailable("disk I/O error".into()).into();
        assert!(matches!(err, ProxyError::Internal(_)));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.error_type(), "internal_error");
        assert_eq!(err.upstream_error_label(), None);
    }

    #[tokio::test]
    async fn envelope_carries_type_message_and_request_id() {
        let resp = ProxyError::PoolExhausted.into_response_with_id("req_abc123");
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], "pool_exhausted");
        assert_eq!(json["error"]["request_id"], "req_abc123");
        assert!(json["error"]["message"].is_string());
    }
}
