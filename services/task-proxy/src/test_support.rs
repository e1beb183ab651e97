//! Shared fixtures for dispatch, polling and router tests
//!
//! `start_upstream` runs a scripted stand-in for the task API on an
//! ephemeral port: the Nth request gets the Nth reply, and once the script
//! runs out the last reply repeats. Every request is recorded so tests can
//! assert on method, path, `Authorization` and body.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, HeaderName};
use axum::http::{Request, StatusCode};
use axum::response::IntoResponse;
use key_pool::Pool;
use key_store::MemoryKeyStore;
use tokio_util::sync::CancellationToken;

use crate::config::UsageWeights;
use crate::dispatch::DispatchState;
use crate::poll::{PollSettings, Sleeper};

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub authorization: Option<String>,
    pub content_type: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct Reply {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: String,
    pub delay: Duration,
}

impl Reply {
    pub fn json(status: StatusCode, body: impl Into<String>) -> Self {
        Self::raw(status, "application/json", body)
    }

    pub fn raw(status: StatusCode, content_type: &'static str, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type,
            body: body.into(),
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

struct Script {
    replies: Vec<Reply>,
    recorded: Mutex<Vec<Recorded>>,
}

pub struct ScriptedUpstream {
    pub url: String,
    script: Arc<Script>,
}

impl ScriptedUpstream {
    pub fn recorded(&self) -> Vec<Recorded> {
        self.script.recorded.lock().unwrap().clone()
    }

    pub fn hits(&self) -> usize {
        self.script.recorded.lock().unwrap().len()
    }
}

/// Start a scripted upstream. With an empty script every request gets 500.
pub async fn start_upstream(replies: Vec<Reply>) -> ScriptedUpstream {
    let script = Arc::new(Script {
        replies,
        recorded: Mutex::new(Vec::new()),
    });

    let handler_script = script.clone();
    let app = Router::new().fallback(move |request: Request<Body>| {
        let script = handler_script.clone();
        async move {
            let (parts, body) = request.into_parts();
            let body = axum::body::to_bytes(body, 1024 * 1024).await.unwrap();
            let header = |name: HeaderName| {
                parts
                    .headers
                    .get(name)
                    .map(|v| v.to_str().unwrap().to_owned())
            };

            let index = {
                let mut recorded = script.recorded.lock().unwrap();
                recorded.push(Recorded {
                    method: parts.method.to_string(),
                    path: parts.uri.path().to_owned(),
                    authorization: header(AUTHORIZATION),
                    content_type: header(CONTENT_TYPE),
                    body: String::from_utf8_lossy(&body).into_owned(),
                });
                recorded.len() - 1
            };

            let Some(reply) = script.replies.get(index).or(script.replies.last()).cloned() else {
                return (StatusCode::INTERNAL_SERVER_ERROR, "script is empty").into_response();
            };
            if !reply.delay.is_zero() {
                tokio::time::sleep(reply.delay).await;
            }
            (reply.status, [(CONTENT_TYPE, reply.content_type)], reply.body).into_response()
        }
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    ScriptedUpstream {
        url: format!("http://{addr}"),
        script,
    }
}

/// Sleeper that returns immediately and records each requested duration.
#[derive(Default)]
pub struct InstantSleep {
    slept: Mutex<Vec<Duration>>,
}

impl InstantSleep {
    pub fn slept(&self) -> Vec<Duration> {
        self.slept.lock().unwrap().clone()
    }
}

impl Sleeper for InstantSleep {
    fn sleep(
        &self,
        duration: Duration,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        self.slept.lock().unwrap().push(duration);
        Box::pin(std::future::ready(()))
    }
}

pub struct Harness {
    pub state: DispatchState,
    pub store: Arc<MemoryKeyStore>,
    pub sleeper: Arc<InstantSleep>,
    pub upstream: ScriptedUpstream,
}

/// Dispatch state over an in-memory pool of `keys` and a scripted upstream.
///
/// Defaults: 5s upstream timeout, 2s poll interval, 600s max wait, default
/// usage weights (text 20, image 30).
pub async fn harness(keys: &[&str], replies: Vec<Reply>) -> Harness {
    let upstream = start_upstream(replies).await;
    let store = Arc::new(MemoryKeyStore::with_values(keys.iter().copied()));
    let pool = Pool::load(store.clone()).await.unwrap();
    let sleeper = Arc::new(InstantSleep::default());

    let state = DispatchState {
        client: reqwest::Client::new(),
        upstream_url: upstream.url.clone(),
        timeout: Duration::from_secs(5),
        pool: Arc::new(pool),
        weights: UsageWeights::default(),
        poll: PollSettings {
            interval: Duration::from_secs(2),
            max_wait: Some(Duration::from_secs(600)),
        },
        sleeper: sleeper.clone(),
        shutdown: CancellationToken::new(),
    };

    Harness {
        state,
        store,
        sleeper,
        upstream,
    }
}
