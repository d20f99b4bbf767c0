//! Bidirectional JSON-RPC connection over the agent's framed stdio.
//!
//! One reader task consumes the agent's stdout through [`NdjsonCodec`],
//! one writer task owns the agent's stdin; nothing else touches either
//! stream. Inbound messages are classified three ways:
//!
//! - **Responses** (`id`, no `method`) resolve the pending-request map and
//!   wake the caller blocked in [`RpcConnection::request`].
//! - **Agent-initiated requests** (`id` + `method`) are served on a spawned
//!   task through [`ClientServices::handle_request`]; the reply is written
//!   back through the writer channel. Serving on a task keeps the reader
//!   loop responsive while a permission decision is pending.
//! - **Notifications** (`method`, no `id`) are awaited inline so they reach
//!   the handler in arrival order.
//!
//! Every stdout line first passes the transport's
//! [`filter_stdout_line`](crate::transport::TransportHooks::filter_stdout_line)
//! hook; dropped lines and post-filter JSON parse failures are counted and
//! the total is logged when the connection closes.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::acp::codec::NdjsonCodec;
use crate::transport::{LineDisposition, TransportHooks};
use crate::{AppError, Result};

/// Boxed future returned by the collaborator traits.
pub type ServiceFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Client-side services exposed to the agent over the connection.
///
/// The backend implements this to serve `requestPermission` and consume
/// `session/update` notifications.
pub trait ClientServices: Send + Sync {
    /// Serve an agent-initiated request. The returned value (or error)
    /// becomes the JSON-RPC reply.
    fn handle_request(&self, method: String, params: Value) -> ServiceFuture<'_, Result<Value>>;

    /// Consume an agent notification. Called in arrival order.
    fn handle_notification(&self, method: String, params: Value) -> ServiceFuture<'_, ()>;
}

/// Reply slot for an in-flight outbound request.
type PendingReply = oneshot::Sender<Result<Value>>;

/// Bidirectional JSON-RPC connection to one agent process.
pub struct RpcConnection {
    outbound: mpsc::Sender<Value>,
    pending: Arc<Mutex<HashMap<i64, PendingReply>>>,
    next_id: AtomicI64,
    dropped_lines: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl RpcConnection {
    /// Spawn the reader and writer tasks over the given streams and return
    /// the connection handle.
    ///
    /// `cancel` stops both tasks; the connection also stops on stream EOF,
    /// failing every pending request with [`AppError::Rpc`].
    pub fn spawn<R, W>(
        reader: R,
        writer: W,
        hooks: Arc<dyn TransportHooks>,
        services: Arc<dyn ClientServices>,
        cancel: CancellationToken,
    ) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel::<Value>(64);
        let pending: Arc<Mutex<HashMap<i64, PendingReply>>> = Arc::new(Mutex::new(HashMap::new()));
        let dropped_lines = Arc::new(AtomicU64::new(0));

        let conn = Arc::new(Self {
            outbound: outbound_tx.clone(),
            pending: Arc::clone(&pending),
            next_id: AtomicI64::new(1),
            dropped_lines: Arc::clone(&dropped_lines),
            cancel: cancel.clone(),
        });

        tokio::spawn(run_writer(writer, outbound_rx, cancel.clone()));
        tokio::spawn(run_reader(
            reader,
            hooks,
            services,
            outbound_tx,
            pending,
            dropped_lines,
            cancel,
        ));

        conn
    }

    /// Issue a request and await the agent's reply.
    ///
    /// # Errors
    ///
    /// - [`AppError::Rpc`] when the connection is closed before a reply
    ///   arrives.
    /// - [`AppError::Protocol`] when the agent replies with an error object.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let msg = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        if self.outbound.send(msg).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(AppError::Rpc(format!(
                "connection closed before '{method}' could be sent"
            )));
        }

        match rx.await {
            Ok(reply) => reply,
            Err(_) => Err(AppError::Rpc(format!(
                "connection closed while awaiting reply to '{method}'"
            ))),
        }
    }

    /// Send a notification (no reply expected).
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Rpc`] when the connection is closed.
    pub async fn notify(&self, method: &str, params: Value) -> Result<()> {
        let msg = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.outbound
            .send(msg)
            .await
            .map_err(|_| AppError::Rpc(format!("connection closed, '{method}' not sent")))
    }

    /// Lines discarded so far by the stdout filter or by JSON parsing.
    #[must_use]
    pub fn dropped_line_count(&self) -> u64 {
        self.dropped_lines.load(Ordering::Relaxed)
    }

    /// Stop both tasks and fail every pending request.
    pub async fn close(&self) {
        self.cancel.cancel();
        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(AppError::Rpc("connection closed".into())));
        }
    }
}

// ── Writer task ───────────────────────────────────────────────────────────────

/// Serialize outbound values as ndJSON lines onto the agent's stdin.
async fn run_writer<W>(mut writer: W, mut rx: mpsc::Receiver<Value>, cancel: CancellationToken)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("rpc writer: cancellation received, stopping");
                break;
            }

            msg = rx.recv() => {
                let Some(value) = msg else {
                    debug!("rpc writer: outbound channel closed, stopping");
                    break;
                };
                let mut bytes = match serde_json::to_vec(&value) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!(%err, "rpc writer: failed to serialize outbound message");
                        continue;
                    }
                };
                bytes.push(b'\n');
                if let Err(err) = writer.write_all(&bytes).await {
                    warn!(%err, "rpc writer: write to agent stdin failed, stopping");
                    break;
                }
            }
        }
    }
}

// ── Reader task ───────────────────────────────────────────────────────────────

/// Consume framed stdout lines, filter, parse, and route them.
async fn run_reader<R>(
    reader: R,
    hooks: Arc<dyn TransportHooks>,
    services: Arc<dyn ClientServices>,
    outbound: mpsc::Sender<Value>,
    pending: Arc<Mutex<HashMap<i64, PendingReply>>>,
    dropped_lines: Arc<AtomicU64>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut framed = FramedRead::new(reader, NdjsonCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("rpc reader: cancellation received, stopping");
                break;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!("rpc reader: EOF on agent stdout");
                        break;
                    }
                    Some(Err(AppError::Acp(msg))) => {
                        // Framing-level problem (oversized line). Skip it.
                        dropped_lines.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %msg, "rpc reader: framing error, line skipped");
                    }
                    Some(Err(err)) => {
                        warn!(%err, "rpc reader: stream error, stopping");
                        break;
                    }
                    Some(Ok(line)) => {
                        let line = match hooks.filter_stdout_line(&line) {
                            LineDisposition::Pass => line,
                            LineDisposition::Replace(replacement) => replacement,
                            LineDisposition::Drop => {
                                dropped_lines.fetch_add(1, Ordering::Relaxed);
                                continue;
                            }
                        };
                        if line.trim().is_empty() {
                            continue;
                        }
                        let value = match serde_json::from_str::<Value>(&line) {
                            Ok(value) => value,
                            Err(err) => {
                                // Non-JSON stdout noise that survived the filter.
                                dropped_lines.fetch_add(1, Ordering::Relaxed);
                                debug!(%err, raw = %truncate(&line, 200),
                                    "rpc reader: non-JSON line dropped");
                                continue;
                            }
                        };
                        route_inbound(&services, &outbound, &pending, value).await;
                    }
                }
            }
        }
    }

    // Fail whatever is still in flight so callers do not hang.
    let mut pending = pending.lock().await;
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(AppError::Rpc("connection closed".into())));
    }
}

/// Classify one parsed inbound message and dispatch it.
async fn route_inbound(
    services: &Arc<dyn ClientServices>,
    outbound: &mpsc::Sender<Value>,
    pending: &Arc<Mutex<HashMap<i64, PendingReply>>>,
    value: Value,
) {
    let method = value.get("method").and_then(Value::as_str);
    let id = value.get("id").filter(|id| !id.is_null()).cloned();

    match (method, id) {
        // Agent-initiated request: serve it without blocking the reader.
        (Some(method), Some(id)) => {
            let method = method.to_owned();
            let params = value.get("params").cloned().unwrap_or(Value::Null);
            let services = Arc::clone(services);
            let outbound = outbound.clone();
            tokio::spawn(async move {
                let reply = match services.handle_request(method.clone(), params).await {
                    Ok(result) => json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": result,
                    }),
                    Err(err) => {
                        warn!(method = method.as_str(), %err, "rpc: agent request failed");
                        json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "error": { "code": error_code(&err), "message": err.to_string() },
                        })
                    }
                };
                let _ = outbound.send(reply).await;
            });
        }

        // Notification: deliver inline to preserve arrival order.
        (Some(method), None) => {
            let params = value.get("params").cloned().unwrap_or(Value::Null);
            services.handle_notification(method.to_owned(), params).await;
        }

        // Response: resolve the pending request.
        (None, Some(id)) => {
            let Some(id) = id.as_i64() else {
                warn!(?id, "rpc: response with non-numeric id ignored");
                return;
            };
            let Some(tx) = pending.lock().await.remove(&id) else {
                warn!(id, "rpc: response for unknown request ignored");
                return;
            };
            let reply = if let Some(error) = value.get("error") {
                Err(AppError::Protocol {
                    code: error.get("code").and_then(Value::as_i64),
                    message: error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("unspecified agent error")
                        .to_owned(),
                })
            } else {
                Ok(value.get("result").cloned().unwrap_or(Value::Null))
            };
            let _ = tx.send(reply);
        }

        (None, None) => {
            debug!("rpc: unroutable message without method or id, dropped");
        }
    }
}

/// JSON-RPC error code for a failed agent request.
fn error_code(err: &AppError) -> i64 {
    match err {
        AppError::Protocol {
            code: Some(code), ..
        } => *code,
        AppError::Rpc(msg) if msg.starts_with("unsupported method") => -32601,
        _ => -32603,
    }
}

/// Clip a log excerpt to at most `max` characters.
fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_owned()
    } else {
        let clipped: String = text.chars().take(max).collect();
        format!("{clipped}…")
    }
}
