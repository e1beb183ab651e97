//! Task dispatch to the upstream job API
//!
//! Each call draws a key from the pool, forwards the request with that key
//! as the raw `Authorization` value, and hands the upstream answer back
//! unchanged (status, `Content-Type`, body bytes), including upstream 4xx
//! and 5xx responses. Nothing here retries: a failed upstream call is
//! reported to the caller once.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use common::Secret;
use key_pool::Pool;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::UsageWeights;
use crate::error::ProxyError;
use crate::metrics;
use crate::poll::{self, PollSettings, Sleeper};

/// Task types this proxy knows how to submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    TextToModel,
    ImageToModel,
}

impl TaskKind {
    /// Value written into the payload's `type` field.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::TextToModel => "text_to_model",
            TaskKind::ImageToModel => "image_to_model",
        }
    }
}

/// Shared state for dispatch, cloned into every handler.
#[derive(Clone)]
pub struct DispatchState {
    pub client: reqwest::Client,
    /// Base URL without trailing slash, e.g. `https://api.tripo3d.ai/v2/openapi`
    pub upstream_url: String,
    pub timeout: Duration,
    pub pool: Arc<Pool>,
    pub weights: UsageWeights,
    pub poll: PollSettings,
    pub sleeper: Arc<dyn Sleeper>,
    /// Cancelled on shutdown; ends in-flight status polling.
    pub shutdown: CancellationToken,
}

/// A fully buffered upstream response, relayed to the caller as-is.
#[derive(Debug, Clone)]
pub struct UpstreamReply {
    pub status: StatusCode,
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
}

impl IntoResponse for UpstreamReply {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        if let Some(content_type) = self.content_type {
            response.headers_mut().insert(CONTENT_TYPE, content_type);
        }
        response
    }
}

/// Payload for an image task referencing an uploaded file token.
pub fn image_payload(file_token: &str, file_type: Option<&str>) -> Value {
    serde_json::json!({
        "type": TaskKind::ImageToModel.as_str(),
        "file": {
            "type": file_type.unwrap_or("png"),
            "file_token": file_token,
        }
    })
}

/// Submit a new task upstream.
///
/// Overwrites the payload's top-level `type` with `kind`. Usage is charged
/// to the key only when upstream answers `200 OK`; any other status or a
/// transport failure charges nothing.
pub async fn submit_task(
    state: &DispatchState,
    kind: TaskKind,
    payload: Value,
) -> Result<UpstreamReply, ProxyError> {
    let Value::Object(mut payload) = payload else {
        return Err(ProxyError::InvalidRequest(
            "task payload must be a JSON object".into(),
        ));
    };
    payload.insert("type".into(), Value::String(kind.as_str().into()));
    let body = serde_json::to_vec(&payload)
        .map_err(|e| ProxyError::InvalidRequest(format!("unserializable payload: {e}")))?;

    let key = state.pool.allocate()?;
    let url = format!("{}/task", state.upstream_url);
    let reply = send_upstream(state, Method::POST, &url, &key, Some(body)).await?;

    if reply.status == StatusCode::OK {
        let weight = state.weights.for_kind(kind);
        // Accounting is advisory: a failed increment never fails the request.
        match state.pool.record_usage(key.expose(), weight).await {
            Ok(()) => metrics::record_usage(kind.as_str(), weight),
            Err(e) => warn!(key = %key.fingerprint(), error = %e, "usage not recorded"),
        }
        info!(key = %key.fingerprint(), kind = kind.as_str(), weight, "task submitted");
    } else {
        debug!(
            key = %key.fingerprint(),
            status = reply.status.as_u16(),
            "upstream rejected task, no usage charged"
        );
    }

    Ok(reply)
}

/// Query a task's status.
///
/// With `synchronous` unset this is one upstream call. With it set, the
/// query repeats until the task is no longer running (see `poll`).
pub async fn query_task(
    state: &DispatchState,
    task_id: &str,
    synchronous: bool,
) -> Result<UpstreamReply, ProxyError> {
    validate_task_id(task_id)?;
    if synchronous {
        poll::poll_until_settled(state, task_id).await
    } else {
        fetch_status(state, task_id).await
    }
}

/// One status query with a freshly allocated key.
pub(crate) async fn fetch_status(
    state: &DispatchState,
    task_id: &str,
) -> Result<UpstreamReply, ProxyError> {
    let key = state.pool.allocate()?;
    let url = format!("{}/task/{task_id}", state.upstream_url);
    send_upstream(state, Method::GET, &url, &key, None).await
}

fn validate_task_id(task_id: &str) -> Result<(), ProxyError> {
    if task_id.is_empty() {
        return Err(ProxyError::InvalidRequest("taskId is required".into()));
    }
    if !task_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ProxyError::InvalidRequest(
            "taskId may only contain letters, digits, '-' and '_'".into(),
        ));
    }
    Ok(())
}

async fn send_upstream(
    state: &DispatchState,
    method: Method,
    url: &str,
    key: &Secret<String>,
    body: Option<Vec<u8>>,
) -> Result<UpstreamReply, ProxyError> {
    let mut auth = HeaderValue::from_str(key.expose()).map_err(|_| {
        ProxyError::UpstreamTransport("stored key is not a valid header value".into())
    })?;
    auth.set_sensitive(true);

    let mut request = state
        .client
        .request(method, url)
        .header(AUTHORIZATION, auth)
        .timeout(state.timeout);
    if let Some(body) = body {
        request = request.header(CONTENT_TYPE, "application/json").body(body);
    }

    let response = request
        .send()
        .await
        .map_err(|e| classify_transport(state, e))?;
    let status = response.status();
    let content_type = response.headers().get(CONTENT_TYPE).cloned();
    let body = response
        .bytes()
        .await
        .map_err(|e| classify_transport(state, e))?;

    debug!(status = status.as_u16(), bytes = body.len(), "upstream responded");
    Ok(UpstreamReply {
        status,
        content_type,
        body,
    })
}

fn classify_transport(state: &DispatchState, err: reqwest::Error) -> ProxyError {
    if err.is_timeout() {
        ProxyError::UpstreamTimeout(state.timeout.as_secs())
    } else {
        ProxyError::UpstreamTransport(err.to_string())
    }
}
