//! Integration tests for the active check session.
//!
//! A fake server on loopback answers the newline-delimited JSON requests
//! and records everything the agent sends.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hostmon_core::{AgentMetrics, MetricRegistry, MetricValue, NOT_SUPPORTED};
use hostmon_protocol::{ActiveCheck, ServerResponse};
use hostmond::{ActiveError, ActiveSession, ActiveSessionConfig, SessionStats};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

/// Upper bound on waiting for the agent to send something
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Test Helpers
// ============================================================================

/// How the fake server answers one request; `None` closes without reply.
type Responder = fn(&Value) -> Option<Value>;

/// Accepts connections forever, forwarding each request to the test.
async fn spawn_fake_server(respond: Responder) -> (u16, mpsc::UnboundedReceiver<Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let (reader, mut writer) = stream.into_split();
            let mut line = String::new();
            if BufReader::new(reader).read_line(&mut line).await.is_err() {
                continue;
            }
            let Ok(request) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            let reply = respond(&request);
            let _ = tx.send(request);
            if let Some(reply) = reply {
                let _ = writer.write_all(format!("{reply}\n").as_bytes()).await;
            }
        }
    });

    (port, rx)
}

fn check(key: &str, delay: u64) -> ActiveCheck {
    ActiveCheck {
        key: key.to_string(),
        delay,
    }
}

fn reply(response: ServerResponse) -> Option<Value> {
    Some(serde_json::to_value(response).unwrap())
}

fn checks_then_ack(request: &Value) -> Option<Value> {
    match request["request"].as_str() {
        Some("active checks") => reply(ServerResponse::checks(vec![
            check("agent.ping", 1),
            check("bogus.key", 60),
        ])),
        Some("agent data") => reply(ServerResponse::ack("processed")),
        _ => None,
    }
}

fn session_config(port: u16, refresh: Duration) -> ActiveSessionConfig {
    ActiveSessionConfig {
        server: "127.0.0.1".to_string(),
        port,
        hostname: "itest".to_string(),
        refresh_interval: refresh,
        io_timeout: Duration::from_secs(1),
    }
}

/// Registry whose `hang` key never finishes evaluating.
struct HangingRegistry;

#[async_trait]
impl MetricRegistry for HangingRegistry {
    async fn evaluate(&self, key: &str) -> MetricValue {
        match key {
            "hang" => std::future::pending().await,
            _ => MetricValue::Value("1".to_string()),
        }
    }
}

type SessionHandle = JoinHandle<Result<SessionStats, ActiveError>>;

fn spawn_session(config: ActiveSessionConfig) -> (CancellationToken, SessionHandle) {
    spawn_session_with(config, Arc::new(AgentMetrics::new("itest", BTreeMap::new())))
}

fn spawn_session_with(
    config: ActiveSessionConfig,
    registry: Arc<dyn MetricRegistry>,
) -> (CancellationToken, SessionHandle) {
    let cancel_token = CancellationToken::new();
    let session = ActiveSession::new(config, registry, cancel_token.clone());
    (cancel_token, tokio::spawn(session.run()))
}

/// Drains everything received so far, returning the request types.
fn drain(rx: &mut mpsc::UnboundedReceiver<Value>) -> Vec<String> {
    let mut kinds = Vec::new();
    while let Ok(request) = rx.try_recv() {
        kinds.push(request["request"].as_str().unwrap_or_default().to_string());
    }
    kinds
}

async fn next_request(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("agent sent nothing")
        .expect("fake server stopped")
}

async fn stop(cancel_token: CancellationToken, handle: SessionHandle) -> SessionStats {
    cancel_token.cancel();
    timeout(RECV_TIMEOUT, handle)
        .await
        .expect("session did not stop")
        .expect("session panicked")
        .expect("session failed")
}

fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

// ============================================================================
// Refresh and Push
// ============================================================================

#[tokio::test]
async fn test_fetched_keys_are_pushed() {
    let (port, mut rx) = spawn_fake_server(checks_then_ack).await;
    let (cancel_token, handle) = spawn_session(session_config(port, Duration::from_secs(60)));

    let request = next_request(&mut rx).await;
    assert_eq!(request["request"], "active checks");
    assert_eq!(request["host"], "itest");

    let push = next_request(&mut rx).await;
    assert_eq!(push["request"], "agent data");
    let values = push["data"].as_array().unwrap();
    assert_eq!(values.len(), 2);

    let ping = values.iter().find(|v| v["key"] == "agent.ping").unwrap();
    assert_eq!(ping["value"], "1");
    assert_eq!(ping["host"], "itest");
    assert!(ping["clock"].as_i64().unwrap() > 0);

    let bogus = values.iter().find(|v| v["key"] == "bogus.key").unwrap();
    assert_eq!(bogus["value"], NOT_SUPPORTED);

    let stats = stop(cancel_token, handle).await;
    assert_eq!(stats.refreshes, 1);
    assert!(stats.pushes >= 1);
    assert_eq!(stats.failed_pushes, 0);
}

#[tokio::test]
async fn test_only_due_keys_are_pushed_again() {
    let (port, mut rx) = spawn_fake_server(checks_then_ack).await;
    let (cancel_token, handle) = spawn_session(session_config(port, Duration::from_secs(60)));

    next_request(&mut rx).await;
    let first = next_request(&mut rx).await;
    assert_eq!(first["data"].as_array().unwrap().len(), 2);

    // agent.ping is due every second, bogus.key only every minute
    let second = next_request(&mut rx).await;
    assert_eq!(second["request"], "agent data");
    let values = second["data"].as_array().unwrap();
    assert_eq!(values.len(), 1);
    assert_eq!(values[0]["key"], "agent.ping");

    stop(cancel_token, handle).await;
}

// ============================================================================
// Failure Handling
// ============================================================================

#[tokio::test]
async fn test_unreachable_server_keeps_session_running() {
    let (cancel_token, handle) =
        spawn_session(session_config(closed_port(), Duration::from_secs(60)));

    sleep(Duration::from_millis(300)).await;
    assert!(!handle.is_finished());

    let stats = stop(cancel_token, handle).await;
    assert_eq!(stats.refreshes, 0);
    assert_eq!(stats.failed_refreshes, 1);
}

#[tokio::test]
async fn test_failed_refresh_retried_at_fixed_cadence() {
    let (cancel_token, handle) =
        spawn_session(session_config(closed_port(), Duration::from_secs(1)));

    sleep(Duration::from_millis(2500)).await;

    let stats = stop(cancel_token, handle).await;
    assert!(
        (2..=4).contains(&stats.failed_refreshes),
        "unexpected retry count: {}",
        stats.failed_refreshes
    );
}

#[tokio::test]
async fn test_rejected_refresh_sends_no_values() {
    let (port, mut rx) =
        spawn_fake_server(|_| reply(ServerResponse::failed("host not found"))).await;
    let (cancel_token, handle) = spawn_session(session_config(port, Duration::from_secs(60)));

    let request = next_request(&mut rx).await;
    assert_eq!(request["request"], "active checks");

    sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err());
    assert!(!handle.is_finished());

    let stats = stop(cancel_token, handle).await;
    assert_eq!(stats.failed_refreshes, 1);
    assert_eq!(stats.pushes, 0);
}

#[tokio::test]
async fn test_failed_push_drops_batch() {
    fn checks_only(request: &Value) -> Option<Value> {
        match request["request"].as_str() {
            Some("active checks") => reply(ServerResponse::checks(vec![
                check("agent.ping", 1),
                check("agent.version", 60),
            ])),
            _ => None,
        }
    }

    let (port, mut rx) = spawn_fake_server(checks_only).await;
    let (cancel_token, handle) = spawn_session(session_config(port, Duration::from_secs(60)));

    next_request(&mut rx).await;
    let first = next_request(&mut rx).await;
    assert_eq!(first["data"].as_array().unwrap().len(), 2);

    // The unacknowledged batch is not resent
    let second = next_request(&mut rx).await;
    assert_eq!(second["data"].as_array().unwrap().len(), 1);

    let stats = stop(cancel_token, handle).await;
    assert!(stats.failed_pushes >= 2);
    assert_eq!(stats.pushes, 0);
}

#[tokio::test]
async fn test_zero_delay_clamped() {
    fn zero_delay(request: &Value) -> Option<Value> {
        match request["request"].as_str() {
            Some("active checks") => reply(ServerResponse::checks(vec![check("agent.ping", 0)])),
            _ => reply(ServerResponse::ack("processed")),
        }
    }

    let (port, mut rx) = spawn_fake_server(zero_delay).await;
    let (cancel_token, handle) = spawn_session(session_config(port, Duration::from_secs(60)));

    sleep(Duration::from_millis(1500)).await;
    let stats = stop(cancel_token, handle).await;

    // One refresh plus at most two pushes in 1.5s
    let mut received = 0;
    while rx.try_recv().is_ok() {
        received += 1;
    }
    assert!(received <= 3, "agent sent {received} requests");
    assert!(stats.pushes <= 2);
}

#[tokio::test]
async fn test_huge_delay_does_not_stop_session() {
    fn huge_delay(request: &Value) -> Option<Value> {
        match request["request"].as_str() {
            Some("active checks") => {
                reply(ServerResponse::checks(vec![check("agent.ping", u64::MAX)]))
            }
            _ => reply(ServerResponse::ack("processed")),
        }
    }

    let (port, mut rx) = spawn_fake_server(huge_delay).await;
    let (cancel_token, handle) = spawn_session(session_config(port, Duration::from_secs(60)));

    next_request(&mut rx).await;
    let push = next_request(&mut rx).await;
    assert_eq!(push["data"].as_array().unwrap().len(), 1);

    // Not due again for a long time, and still alive
    sleep(Duration::from_millis(300)).await;
    assert!(drain(&mut rx).is_empty());
    assert!(!handle.is_finished());

    let stats = stop(cancel_token, handle).await;
    assert_eq!(stats.refreshes, 1);
    assert_eq!(stats.pushes, 1);
}

#[tokio::test]
async fn test_hung_check_does_not_block_others() {
    fn hang_and_ping(request: &Value) -> Option<Value> {
        match request["request"].as_str() {
            Some("active checks") => reply(ServerResponse::checks(vec![
                check("hang", 60),
                check("agent.ping", 60),
            ])),
            _ => reply(ServerResponse::ack("processed")),
        }
    }

    let (port, mut rx) = spawn_fake_server(hang_and_ping).await;
    let (cancel_token, handle) = spawn_session_with(
        session_config(port, Duration::from_secs(60)),
        Arc::new(HangingRegistry),
    );

    next_request(&mut rx).await;
    let push = next_request(&mut rx).await;
    assert_eq!(push["request"], "agent data");

    let values = push["data"].as_array().unwrap();
    assert_eq!(values.len(), 2);
    let hang = values.iter().find(|v| v["key"] == "hang").unwrap();
    assert_eq!(hang["value"], NOT_SUPPORTED);
    let ping = values.iter().find(|v| v["key"] == "agent.ping").unwrap();
    assert_eq!(ping["value"], "1");

    let stats = stop(cancel_token, handle).await;
    assert_eq!(stats.values_sent, 2);
}

// ============================================================================
// Refresh Cadence
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_one_refresh_per_interval() {
    fn slow_checks(request: &Value) -> Option<Value> {
        match request["request"].as_str() {
            Some("active checks") => reply(ServerResponse::checks(vec![check("agent.ping", 3)])),
            _ => reply(ServerResponse::ack("processed")),
        }
    }

    let (port, mut rx) = spawn_fake_server(slow_checks).await;
    let (cancel_token, handle) = spawn_session(session_config(port, Duration::from_secs(10)));

    // Refreshes at 0s, 10s, 20s and 30s; pushes in between
    sleep(Duration::from_secs(35)).await;
    let stats = stop(cancel_token, handle).await;

    let kinds = drain(&mut rx);
    let refreshes = kinds.iter().filter(|k| *k == "active checks").count();
    assert_eq!(refreshes, 4);
    assert_eq!(stats.refreshes, 4);
    assert_eq!(stats.failed_refreshes, 0);
    assert!(kinds.iter().filter(|k| *k == "agent data").count() > refreshes);
}
