//! Task Key Proxy
//!
//! Single-binary service that fronts an asynchronous 3D-generation task API
//! with a rotating pool of API keys:
//! 1. Loads keys from the SQLite key database into an in-memory pool
//! 2. Forwards task submissions and status queries, one key per upstream call
//! 3. Charges a fixed usage weight to the key on every accepted submission
//! 4. Optionally long-polls a task's status until it finishes
//!
//! A second listener serves the admin API for managing keys.

mod admin;
mod config;
mod dispatch;
mod error;
mod metrics;
mod poll;

#[cfg(test)]
mod test_support;

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use key_pool::{Pool, spawn_refresh_task};
use key_store::SqliteKeyStore;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::AdminState;
use crate::config::Config;
use crate::dispatch::{DispatchState, TaskKind, UpstreamReply};
use crate::error::ProxyError;
use crate::metrics::ServiceCounters;
use crate::poll::{PollSettings, TokioSleep};

/// How long in-flight requests may take to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    dispatch: DispatchState,
    counters: ServiceCounters,
    prometheus: PrometheusHandle,
}

/// Build the task router.
///
/// A concurrency limit layer caps simultaneous requests at `max_connections`;
/// long-polling queries count against it for their whole duration.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/task/text_to_model", post(text_to_model_handler))
        .route("/task/image_to_model", post(image_to_model_handler))
        .route("/task/query", get(query_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting task-key-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.proxy.listen_addr,
        admin_listen_addr = %config.proxy.admin_listen_addr,
        upstream_url = %config.proxy.upstream_url,
        database = %config.store.database_path.display(),
        "configuration loaded"
    );

    let store = SqliteKeyStore::open(&config.store.database_path).with_context(|| {
        format!(
            "failed to open key database {}",
            config.store.database_path.display()
        )
    })?;
    let pool = Arc::new(
        Pool::load(Arc::new(store))
            .await
            .context("failed to load key pool")?,
    );
    if pool.is_empty() {
        warn!("key pool is empty; task requests will fail until keys are added");
    }

    let shutdown = CancellationToken::new();

    let refresh_task = (config.pool.refresh_interval_secs > 0).then(|| {
        spawn_refresh_task(
            pool.clone(),
            Duration::from_secs(config.pool.refresh_interval_secs),
            shutdown.clone(),
        )
    });

    let client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;

    let counters = ServiceCounters::new();
    let app_state = AppState {
        dispatch: DispatchState {
            client,
            upstream_url: config.proxy.upstream_url.clone(),
            timeout: Duration::from_secs(config.proxy.timeout_secs),
            pool: pool.clone(),
            weights: config.weights.clone(),
            poll: PollSettings {
                interval: config.poll.interval(),
                max_wait: config.poll.max_wait(),
            },
            sleeper: Arc::new(TokioSleep),
            shutdown: shutdown.clone(),
        },
        counters: counters.clone(),
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.proxy.max_connections);
    let admin_app = admin::build_admin_router(AdminState::new(pool.clone()));

    let listener = TcpListener::bind(config.proxy.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.proxy.listen_addr))?;
    let admin_listener = TcpListener::bind(config.proxy.admin_listen_addr)
        .await
        .with_context(|| {
            format!(
                "failed to bind admin listener to {}",
                config.proxy.admin_listen_addr
            )
        })?;

    let server = spawn_server(listener, app, shutdown.clone());
    let admin_server = spawn_server(admin_listener, admin_app, shutdown.clone());
    info!(
        addr = %config.proxy.listen_addr,
        admin_addr = %config.proxy.admin_listen_addr,
        keys = pool.len(),
        "accepting requests"
    );

    // Graceful shutdown:
    // 1. shutdown_signal() fires on SIGTERM/SIGINT
    // 2. cancelling the token ends polling loops and stops both listeners
    // 3. DRAIN_TIMEOUT bounds how long in-flight requests may take, measured
    //    from signal receipt
    shutdown_signal().await;
    shutdown.cancel();

    match tokio::time::timeout(DRAIN_TIMEOUT, async { tokio::join!(server, admin_server) }).await
    {
        Ok((server, admin)) => {
            log_server_exit("task", server);
            log_server_exit("admin", admin);
        }
        Err(_) => {
            warn!(
                remaining = counters.in_flight.load(Ordering::Relaxed),
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    if let Some(handle) = refresh_task
        && let Err(e) = handle.await
    {
        error!(error = %e, "refresh task panicked");
    }

    info!("shutdown complete");
    Ok(())
}

fn spawn_server(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> JoinHandle<std::io::Result<()>> {
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
    })
}

fn log_server_exit(name: &str, result: Result<std::io::Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => info!(server = name, "all in-flight requests drained"),
        Ok(Err(e)) => error!(server = name, error = %e, "server error during shutdown"),
        Err(e) => error!(server = name, error = %e, "server task panicked"),
    }
}

/// Run one task request: assign a request id, time it, and render either the
/// relayed upstream reply or the proxy's JSON error envelope.
async fn handle_task<F>(state: &AppState, route: &'static str, work: F) -> Response
where
    F: Future<Output = Result<UpstreamReply, ProxyError>>,
{
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    let _in_flight = state.counters.begin();
    let started = Instant::now();

    let result = work
        .instrument(info_span!("task_request", request_id = %request_id, route))
        .await;

    let response = match result {
        Ok(reply) => reply.into_response(),
        Err(e) => {
            state.counters.record_error();
            if let Some(label) = e.upstream_error_label() {
                metrics::record_upstream_error(label);
            }
            warn!(request_id = %request_id, route, error = %e, "task request failed");
            e.into_response_with_id(&request_id)
        }
    };

    metrics::record_request(
        route,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Malformed query strings (e.g. a repeated `taskId`) get the JSON error
/// envelope like every other invalid request.
fn query_rejection(rejection: QueryRejection) -> ProxyError {
    ProxyError::InvalidRequest(rejection.body_text())
}

/// Parse a task payload. Only JSON objects are accepted.
fn parse_payload(body: &[u8]) -> Result<Value, ProxyError> {
    if body.is_empty() {
        return Err(ProxyError::InvalidRequest(
            "request body must be a JSON object".into(),
        ));
    }
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| ProxyError::InvalidRequest(format!("malformed JSON body: {e}")))?;
    if !value.is_object() {
        return Err(ProxyError::InvalidRequest(
            "request body must be a JSON object".into(),
        ));
    }
    Ok(value)
}

/// POST /task/text_to_model
async fn text_to_model_handler(State(state): State<AppState>, body: Bytes) -> Response {
    handle_task(&state, "text_to_model", async {
        let payload = parse_payload(&body)?;
        dispatch::submit_task(&state.dispatch, TaskKind::TextToModel, payload).await
    })
    .await
}

#[derive(Debug, Deserialize)]
struct ImageParams {
    file_token: Option<String>,
    file_type: Option<String>,
}

/// POST /task/image_to_model[?file_token=..&file_type=..]
///
/// A JSON body is forwarded as-is (with `type` overwritten). Without a body,
/// the payload is built from the uploaded file's token.
async fn image_to_model_handler(
    State(state): State<AppState>,
    params: Result<Query<ImageParams>, QueryRejection>,
    body: Bytes,
) -> Response {
    handle_task(&state, "image_to_model", async {
        let Query(params) = params.map_err(query_rejection)?;
        let payload = match (body.is_empty(), params.file_token.as_deref()) {
            (true, Some(token)) if !token.is_empty() => {
                dispatch::image_payload(token, params.file_type.as_deref())
            }
            (true, _) => {
                return Err(ProxyError::InvalidRequest(
                    "expected a JSON body or a file_token query parameter".into(),
                ));
            }
            (false, _) => parse_payload(&body)?,
        };
        dispatch::submit_task(&state.dispatch, TaskKind::ImageToModel, payload).await
    })
    .await
}

#[derive(Debug, Deserialize)]
struct QueryParams {
    #[serde(rename = "taskId")]
    task_id: Option<String>,
    sync: Option<String>,
}

/// GET /task/query?taskId=..[&sync=1]
async fn query_handler(
    State(state): State<AppState>,
    params: Result<Query<QueryParams>, QueryRejection>,
) -> Response {
    handle_task(&state, "query", async {
        let Query(params) = params.map_err(query_rejection)?;
        let synchronous = matches!(params.sync.as_deref(), Some("1" | "true"));
        let task_id = params.task_id.as_deref().unwrap_or_default();
        dispatch::query_task(&state.dispatch, task_id, synchronous).await
    })
    .await
}

/// Health endpoint: 200 while the pool has keys, 503 when it is empty.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let pool = state.dispatch.pool.health();
    let status_code = if state.dispatch.pool.is_empty() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let body = serde_json::json!({
        "status": if status_code == StatusCode::OK { "healthy" } else { "degraded" },
        "pool": pool,
        "uptime_seconds": state.counters.started_at.elapsed().as_secs(),
        "requests_served": state.counters.requests_total.load(Ordering::Relaxed),
        "errors_total": state.counters.errors_total.load(Ordering::Relaxed),
    });

    (
        status_code,
        [(CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
