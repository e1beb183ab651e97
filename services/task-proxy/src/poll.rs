//! Synchronous status polling
//!
//! A synchronous query keeps asking upstream for the task's status until
//! the task leaves the `running` state. Each iteration is an independent
//! upstream call with its own freshly allocated key, so a long wait spreads
//! across the pool instead of hammering one key. The loop is an explicit
//! `loop`, never recursion, so arbitrarily long tasks use constant stack.
//!
//! Termination:
//! - upstream no longer reports `data.status == "running"`: relay that reply,
//!   whatever its status code
//! - upstream answers with a body that is not JSON: `UpstreamResponseParse`
//! - the next sleep would push cumulative waiting past `max_wait`: `PollTimeout`
//! - the shutdown token fires: `PollCancelled`
//! - any dispatch failure (empty pool, transport, unreadable body): that error
//!
//! A client that disconnects drops the handler future, which drops this
//! loop at its next await point.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::dispatch::{DispatchState, UpstreamReply, fetch_status};
use crate::error::ProxyError;
use crate::metrics;

/// Upstream status string for an unfinished task.
const RUNNING: &str = "running";

/// Abstraction over the delay between status queries.
///
/// Production uses [`TokioSleep`]; tests substitute a sleeper that returns
/// immediately and records what it was asked to wait.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Sleeps on the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleep;

impl Sleeper for TokioSleep {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    /// Cap on cumulative sleep per synchronous query; None waits indefinitely
    pub max_wait: Option<Duration>,
}

/// Whether an upstream status body reports the task as still running.
///
/// A body that is not JSON at all is a parse error. Valid JSON without a
/// `data.status` string is treated as settled and relayed as-is.
pub fn is_running(body: &[u8]) -> Result<bool, ProxyError> {
    let parsed: Value = serde_json::from_slice(body)
        .map_err(|e| ProxyError::UpstreamResponseParse(e.to_string()))?;
    Ok(parsed
        .get("data")
        .and_then(|data| data.get("status"))
        .and_then(Value::as_str)
        == Some(RUNNING))
}

/// Query `task_id` until it settles, then return the settling reply verbatim.
pub async fn poll_until_settled(
    state: &DispatchState,
    task_id: &str,
) -> Result<UpstreamReply, ProxyError> {
    let mut attempts: u32 = 0;
    let mut waited = Duration::ZERO;

    loop {
        if state.shutdown.is_cancelled() {
            return Err(ProxyError::PollCancelled);
        }

        attempts += 1;
        let reply = tokio::select! {
            biased;
            _ = state.shutdown.cancelled() => return Err(ProxyError::PollCancelled),
            reply = fetch_status(state, task_id) => reply?,
        };
        metrics::record_poll_iteration();

        if !is_running(&reply.body)? {
            debug!(task_id, attempts, status = reply.status.as_u16(), "task settled");
            return Ok(reply);
        }

        let interval = state.poll.interval;
        if let Some(max_wait) = state.poll.max_wait
            && waited + interval > max_wait
        {
            warn!(task_id, attempts, waited_secs = waited.as_secs(), "task still running at max wait");
            return Err(ProxyError::PollTimeout {
                waited_secs: waited.as_secs(),
                attempts,
            });
        }

        tokio::select! {
            biased;
            _ = state.shutdown.cancelled() => return Err(ProxyError::PollCancelled),
            _ = state.sleeper.sleep(interval) => {}
        }
        waited += interval;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Reply, harness};
    use axum::http::StatusCode;
    use bytes::Bytes;

    fn running() -> Reply {
        Reply::json(
            StatusCode::OK,
            r#"{"code":0,"data":{"task_id":"t-1","status":"running","progress":40}}"#,
        )
    }

    const SUCCESS: &str =
        r#"{"code":0,"data":{"task_id":"t-1","status":"success","output":{"model":"m.glb"}}}"#;

    #[test]
    fn running_detection() {
        assert!(is_running(br#"{"data":{"status":"running"}}"#).unwrap());
        assert!(!is_running(br#"{"data":{"status":"success"}}"#).unwrap());
        assert!(!is_running(br#"{"data":{"status":"queued"}}"#).unwrap());
        assert!(!is_running(br#"{"data":{}}"#).unwrap());
        assert!(!is_running(br#"{"code":1001}"#).unwrap());
        assert!(!is_running(br#"[1,2,3]"#).unwrap());
        assert!(!is_running(br#"{"data":{"status":42}}"#).unwrap());
    }

    #[test]
    fn non_json_is_parse_error() {
        let err = is_running(b"<html>bad gateway</html>").unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamResponseParse(_)));
    }

    #[tokio::test]
    async fn polls_until_settled_and_relays_last_reply() {
        let h = harness(
            &["key-a"],
            vec![running(), running(), Reply::json(StatusCode::OK, SUCCESS)],
        )
        .await;

        let reply = poll_until_settled(&h.state, "t-1").await.unwrap();

        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body, Bytes::from(SUCCESS));
        assert_eq!(h.upstream.hits(), 3);
        assert_eq!(
            h.sleeper.slept(),
            vec![Duration::from_secs(2), Duration::from_secs(2)]
        );
    }

    #[tokio::test]
    async fn each_iteration_allocates_a_fresh_key() {
        let h = harness(
            &["key-a", "key-b", "key-c"],
            vec![running(), running(), running(), Reply::json(StatusCode::OK, SUCCESS)],
        )
        .await;

        poll_until_settled(&h.state, "t-1").await.unwrap();

        let auths: Vec<String> = h
            .upstream
            .recorded()
            .into_iter()
            .filter_map(|r| r.authorization)
            .collect();
        assert_eq!(auths, vec!["key-a", "key-b", "key-c", "key-a"]);
    }

    #[tokio::test]
    async fn settled_on_first_query_never_sleeps() {
        let h = harness(&["key-a"], vec![Reply::json(StatusCode::OK, SUCCESS)]).await;

        poll_until_settled(&h.state, "t-1").await.unwrap();
        assert_eq!(h.upstream.hits(), 1);
        assert!(h.sleeper.slept().is_empty());
    }

    #[tokio::test]
    async fn unparseable_status_body_is_parse_error() {
        let h = harness(
            &["key-a"],
            vec![Reply::raw(StatusCode::OK, "text/plain", "not json")],
        )
        .await;

        let err = poll_until_settled(&h.state, "t-1").await.unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamResponseParse(_)));
    }

    #[tokio::test]
    async fn html_error_page_during_polling_is_parse_error() {
        let h = harness(
            &["key-a"],
            vec![
                running(),
                Reply::raw(StatusCode::BAD_GATEWAY, "text/html", "<html>502</html>"),
            ],
        )
        .await;

        let err = poll_until_settled(&h.state, "t-1").await.unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamResponseParse(_)), "got: {err:?}");
        assert_eq!(h.upstream.hits(), 2);
    }

    #[tokio::test]
    async fn json_error_body_is_relayed_verbatim() {
        let body = r#"{"code":2001,"message":"task not found"}"#;
        let h = harness(&["key-a"], vec![Reply::json(StatusCode::NOT_FOUND, body)]).await;

        let reply = poll_until_settled(&h.state, "t-1").await.unwrap();
        assert_eq!(reply.status, StatusCode::NOT_FOUND);
        assert_eq!(reply.body, Bytes::from(body));
        assert_eq!(h.upstream.hits(), 1);
    }

    #[tokio::test]
    async fn cancellation_during_status_query_ends_loop() {
        let h = harness(
            &["key-a"],
            vec![running().delayed(Duration::from_secs(30))],
        )
        .await;

        let shutdown = h.state.shutdown.clone();
        let state = h.state.clone();
        let polling = tokio::spawn(async move { poll_until_settled(&state, "t-1").await });

        // Wait until the status query reaches upstream and is being held there.
        while h.upstream.hits() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();

        let err = tokio::time::timeout(Duration::from_secs(2), polling)
            .await
            .expect("in-flight query must be abandoned on cancellation")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ProxyError::PollCancelled), "got: {err:?}");
        assert!(h.sleeper.slept().is_empty());
    }

    #[tokio::test]
    async fn max_wait_bounds_cumulative_sleep() {
        let mut h = harness(&["key-a"], vec![running()]).await;
        h.state.poll = PollSettings {
            interval: Duration::from_secs(2),
            max_wait: Some(Duration::from_secs(4)),
        };

        let err = poll_until_settled(&h.state, "t-1").await.unwrap_err();

        match err {
            ProxyError::PollTimeout {
                waited_secs,
                attempts,
            } => {
                assert_eq!(waited_secs, 4);
                assert_eq!(attempts, 3);
            }
            other => panic!("expected PollTimeout, got {other:?}"),
        }
        assert_eq!(h.upstream.hits(), 3);
        assert_eq!(h.sleeper.slept().len(), 2);
    }

    #[tokio::test]
    async fn unbounded_wait_keeps_polling() {
        let mut replies = vec![running(); 25];
        replies.push(Reply::json(StatusCode::OK, SUCCESS));
        let mut h = harness(&["key-a"], replies).await;
        h.state.poll.max_wait = None;

        let reply = poll_until_settled(&h.state, "t-1").await.unwrap();
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(h.upstream.hits(), 26);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_first_query() {
        let h = harness(&["key-a"], vec![running()]).await;
        h.state.shutdown.cancel();

        let err = poll_until_settled(&h.state, "t-1").await.unwrap_err();
        assert!(matches!(err, ProxyError::PollCancelled));
        assert_eq!(h.upstream.hits(), 0);
    }

    #[tokio::test]
    async fn cancellation_during_sleep_ends_loop() {
        let mut h = harness(&["key-a"], vec![running()]).await;
        h.state.sleeper = std::sync::Arc::new(TokioSleep);
        h.state.poll.interval = Duration::from_secs(3600);

        let shutdown = h.state.shutdown.clone();
        let state = h.state.clone();
        let polling = tokio::spawn(async move { poll_until_settled(&state, "t-1").await });

        // Let the first query complete and the loop enter its sleep.
        while h.upstream.hits() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();

        let err = polling.await.unwrap().unwrap_err();
        assert!(matches!(err, ProxyError::PollCancelled));
        assert_eq!(h.upstream.hits(), 1);
    }

    #[tokio::test]
    async fn pool_emptied_mid_poll_surfaces_exhaustion() {
        let h = harness(&["key-a"], vec![running()]).await;
        h.state.pool.remove("key-a").await.unwrap();

        let err = poll_until_settled(&h.state, "t-1").await.unwrap_err();
        assert!(matches!(err, ProxyError::PoolExhausted));
    }
}
