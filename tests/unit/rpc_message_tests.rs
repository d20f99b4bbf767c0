//! Unit tests for the JSON-RPC connection over in-memory streams.
//!
//! One end is the connection under test, the other a hand-driven "agent"
//! reading and writing ndJSON lines.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use acp_runner::acp::rpc::{ClientServices, RpcConnection, ServiceFuture};
use acp_runner::transport::{DefaultTransport, LineDisposition, TransportHooks};
use acp_runner::{AppError, Result};

/// Services that forward everything into channels and answer requests
/// with a fixed `{"pong": true}`.
struct RecordingServices {
    notifications: mpsc::Sender<(String, Value)>,
    requests: mpsc::Sender<(String, Value)>,
}

impl ClientServices for RecordingServices {
    fn handle_request(&self, method: String, params: Value) -> ServiceFuture<'_, Result<Value>> {
        let requests = self.requests.clone();
        Box::pin(async move {
            let known = method == "ping";
            let _ = requests.send((method.clone(), params)).await;
            if known {
                Ok(json!({ "pong": true }))
            } else {
                Err(AppError::Rpc(format!("unsupported method: {method}")))
            }
        })
    }

    fn handle_notification(&self, method: String, params: Value) -> ServiceFuture<'_, ()> {
        let notifications = self.notifications.clone();
        Box::pin(async move {
            let _ = notifications.send((method, params)).await;
        })
    }
}

struct Harness {
    conn: Arc<RpcConnection>,
    agent_lines: tokio::io::Lines<BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>>,
    agent_writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
    notifications: mpsc::Receiver<(String, Value)>,
    requests: mpsc::Receiver<(String, Value)>,
}

fn connect(hooks: Arc<dyn TransportHooks>) -> Harness {
    let (local, remote) = tokio::io::duplex(1 << 16);
    let (local_read, local_write) = tokio::io::split(local);
    let (remote_read, remote_write) = tokio::io::split(remote);

    let (notif_tx, notifications) = mpsc::channel(16);
    let (req_tx, requests) = mpsc::channel(16);
    let services = Arc::new(RecordingServices {
        notifications: notif_tx,
        requests: req_tx,
    });

    let conn = RpcConnection::spawn(
        local_read,
        local_write,
        hooks,
        services,
        CancellationToken::new(),
    );

    Harness {
        conn,
        agent_lines: BufReader::new(remote_read).lines(),
        agent_writer: remote_write,
        notifications,
        requests,
    }
}

async fn agent_send(writer: &mut tokio::io::WriteHalf<tokio::io::DuplexStream>, value: &Value) {
    let mut line = value.to_string();
    line.push('\n');
    writer
        .write_all(line.as_bytes())
        .await
        .expect("agent write must succeed");
}

/// Outbound requests carry the JSON-RPC 2.0 shape and resolve with the
/// agent's result.
#[tokio::test]
async fn request_round_trips_with_the_result() {
    let mut harness = connect(Arc::new(DefaultTransport));

    let conn = Arc::clone(&harness.conn);
    let caller = tokio::spawn(async move { conn.request("initialize", json!({ "a": 1 })).await });

    let line = harness
        .agent_lines
        .next_line()
        .await
        .expect("agent read")
        .expect("request line");
    let sent: Value = serde_json::from_str(&line).expect("request must be JSON");
    assert_eq!(sent["jsonrpc"], "2.0");
    assert_eq!(sent["method"], "initialize");
    assert_eq!(sent["params"]["a"], 1);
    assert!(sent["id"].is_i64(), "requests must carry a numeric id");

    agent_send(
        &mut harness.agent_writer,
        &json!({ "jsonrpc": "2.0", "id": sent["id"], "result": { "ok": true } }),
    )
    .await;

    let result = caller.await.expect("join").expect("request must resolve");
    assert_eq!(result, json!({ "ok": true }));
}

/// An error object in the reply surfaces as a structured protocol error.
#[tokio::test]
async fn error_reply_maps_to_protocol_error() {
    let mut harness = connect(Arc::new(DefaultTransport));

    let conn = Arc::clone(&harness.conn);
    let caller = tokio::spawn(async move { conn.request("prompt", json!({})).await });

    let line = harness
        .agent_lines
        .next_line()
        .await
        .expect("agent read")
        .expect("request line");
    let sent: Value = serde_json::from_str(&line).expect("json");

    agent_send(
        &mut harness.agent_writer,
        &json!({
            "jsonrpc": "2.0",
            "id": sent["id"],
            "error": { "code": -32000, "message": "model overloaded" },
        }),
    )
    .await;

    let err = caller.await.expect("join").expect_err("request must fail");
    assert_eq!(
        err,
        AppError::Protocol {
            code: Some(-32000),
            message: "model overloaded".to_owned(),
        }
    );
}

/// Notifications reach the services in arrival order.
#[tokio::test]
async fn notifications_dispatch_in_order() {
    let mut harness = connect(Arc::new(DefaultTransport));

    for index in 0..3 {
        agent_send(
            &mut harness.agent_writer,
            &json!({
                "jsonrpc": "2.0",
                "method": "session/update",
                "params": { "index": index },
            }),
        )
        .await;
    }

    for index in 0..3 {
        let (method, params) = harness
            .notifications
            .recv()
            .await
            .expect("notification must arrive");
        assert_eq!(method, "session/update");
        assert_eq!(params["index"], index, "order must be preserved");
    }
}

/// Agent-initiated requests are served and the reply echoes the id.
#[tokio::test]
async fn agent_requests_are_served() {
    let mut harness = connect(Arc::new(DefaultTransport));

    agent_send(
        &mut harness.agent_writer,
        &json!({
            "jsonrpc": "2.0",
            "id": "req-7",
            "method": "ping",
            "params": { "x": 1 },
        }),
    )
    .await;

    let (method, params) = harness.requests.recv().await.expect("request must arrive");
    assert_eq!(method, "ping");
    assert_eq!(params["x"], 1);

    let line = harness
        .agent_lines
        .next_line()
        .await
        .expect("agent read")
        .expect("reply line");
    let reply: Value = serde_json::from_str(&line).expect("json");
    assert_eq!(reply["id"], "req-7", "the reply must echo the request id");
    assert_eq!(reply["result"]["pong"], true);
}

/// Unknown agent requests produce a method-not-found error reply.
#[tokio::test]
async fn unknown_agent_request_gets_an_error_reply() {
    let mut harness = connect(Arc::new(DefaultTransport));

    agent_send(
        &mut harness.agent_writer,
        &json!({ "jsonrpc": "2.0", "id": 9, "method": "fs/read_text_file", "params": {} }),
    )
    .await;

    // The recording services still observe the attempt.
    let _ = harness.requests.recv().await.expect("request observed");

    let line = harness
        .agent_lines
        .next_line()
        .await
        .expect("agent read")
        .expect("reply line");
    let reply: Value = serde_json::from_str(&line).expect("json");
    assert_eq!(reply["id"], 9);
    assert_eq!(reply["error"]["code"], -32601);
}

/// Filtered and non-JSON lines are dropped and counted; surviving lines
/// still dispatch.
#[tokio::test]
async fn filtered_and_noise_lines_are_counted() {
    struct NoiseFilter;
    impl TransportHooks for NoiseFilter {
        fn filter_stdout_line(&self, line: &str) -> LineDisposition {
            if line.contains("NOISE") {
                LineDisposition::Drop
            } else {
                LineDisposition::Pass
            }
        }
    }

    let mut harness = connect(Arc::new(NoiseFilter));

    harness
        .agent_writer
        .write_all(b"NOISE: starting up\nthis is not json\n")
        .await
        .expect("write noise");
    agent_send(
        &mut harness.agent_writer,
        &json!({ "jsonrpc": "2.0", "method": "session/update", "params": {} }),
    )
    .await;

    // The valid notification arriving proves the noise was processed first.
    let (method, _) = harness
        .notifications
        .recv()
        .await
        .expect("notification must survive the noise");
    assert_eq!(method, "session/update");

    assert_eq!(
        harness.conn.dropped_line_count(),
        2,
        "one filtered line and one non-JSON line must be counted"
    );
}

/// A replace disposition substitutes the line before parsing.
#[tokio::test]
async fn replaced_lines_are_parsed_as_replacement() {
    struct Rewriter;
    impl TransportHooks for Rewriter {
        fn filter_stdout_line(&self, line: &str) -> LineDisposition {
            line.strip_prefix("DEBUG ")
                .map_or(LineDisposition::Pass, |rest| {
                    LineDisposition::Replace(rest.to_owned())
                })
        }
    }

    let mut harness = connect(Arc::new(Rewriter));

    harness
        .agent_writer
        .write_all(
            b"DEBUG {\"jsonrpc\":\"2.0\",\"method\":\"session/update\",\"params\":{\"y\":2}}\n",
        )
        .await
        .expect("write prefixed line");

    let (method, params) = harness
        .notifications
        .recv()
        .await
        .expect("replaced line must dispatch");
    assert_eq!(method, "session/update");
    assert_eq!(params["y"], 2);
    assert_eq!(harness.conn.dropped_line_count(), 0);
}
