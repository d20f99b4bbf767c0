//! ACP backend — process supervision and the agent-message stream.
//!
//! [`AcpBackend`] owns the agent child process, the JSON-RPC connection,
//! and all per-session mutable state (active tool calls, timers, the
//! id→tool-name map). Its only output is the flat [`AgentMessage`] stream;
//! its input surface is the narrow operation set the runner drives:
//! `start_session`, `send_prompt`, `cancel`, the three setters,
//! `respond_to_permission`, and `dispose`.
//!
//! Inbound traffic dispatches through [`handlers`] (session updates) and
//! [`permission`] (the synchronous `requestPermission` service).

pub mod handlers;
pub mod permission;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::acp::handshake::{self, HandshakeOutcome};
use crate::acp::rpc::{ClientServices, RpcConnection, ServiceFuture};
use crate::acp::spawner::{self, AgentCommand, ExitInfo};
use crate::message::{AgentMessage, SessionStatus};
use crate::transport::TransportHooks;
use crate::{AppError, Result};

pub use permission::{PermissionDecision, PermissionHandler};

/// Cap on waiting for the agent to acknowledge a `cancel`.
const CANCEL_REPLY_CAP: Duration = Duration::from_secs(2);

/// Cap on waiting for the child to die during dispose (covers the 1 s
/// SIGTERM grace plus margin).
const DISPOSE_EXIT_CAP: Duration = Duration::from_secs(3);

/// Probe deciding whether a prompt asks the agent to retitle the session.
pub type ChangeTitleProbe = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Backend for one ACP agent process.
pub struct AcpBackend {
    inner: Arc<BackendInner>,
}

pub(crate) struct BackendInner {
    command: AgentCommand,
    cwd: PathBuf,
    pub(crate) hooks: Arc<dyn TransportHooks>,
    pub(crate) permission_handler: Option<Arc<dyn PermissionHandler>>,
    change_title_probe: Option<ChangeTitleProbe>,
    events: Mutex<Option<mpsc::Sender<AgentMessage>>>,
    pub(crate) state: Mutex<BackendState>,
    /// Stops the connection, stderr logger, and timer tasks.
    cancel: CancellationToken,
    /// Triggers the exit monitor's graceful-kill sequence.
    kill: CancellationToken,
}

#[derive(Default)]
pub(crate) struct BackendState {
    pub(crate) conn: Option<Arc<RpcConnection>>,
    pub(crate) session_id: Option<String>,
    exit_rx: Option<watch::Receiver<Option<ExitInfo>>>,
    /// Keeps the exit channel open for stream-attached sessions that have
    /// no child process (and therefore no monitor holding the sender).
    exit_keepalive: Option<watch::Sender<Option<ExitInfo>>>,
    pub(crate) active_calls: HashMap<String, ActiveCall>,
    pub(crate) tool_names: HashMap<String, String>,
    pub(crate) idle_timer: Option<JoinHandle<()>>,
    pub(crate) tool_calls_since_prompt: u32,
    pub(crate) recent_prompt_had_change_title: bool,
    last_status: Option<SessionStatus>,
    /// Last advertised `configOptions` payload, kept for synthesizing a
    /// `config_options_update` when the agent does not echo one.
    pub(crate) config_options: Option<Value>,
    disposed: bool,
}

/// Bookkeeping for one in-flight tool call.
pub(crate) struct ActiveCall {
    pub(crate) tool_name: String,
    pub(crate) started: Instant,
    pub(crate) investigation: bool,
    timeout_task: JoinHandle<()>,
}

impl AcpBackend {
    /// Create a backend for the given agent command.
    ///
    /// `events` receives every agent-message; dropping the receiver makes
    /// subsequent emissions no-ops. The permission handler is optional
    /// (absent means permissions auto-approve once, per the wire
    /// contract); the change-title probe feeds the tool-name heuristics.
    #[must_use]
    pub fn new(
        command: AgentCommand,
        cwd: PathBuf,
        hooks: Arc<dyn TransportHooks>,
        permission_handler: Option<Arc<dyn PermissionHandler>>,
        change_title_probe: Option<ChangeTitleProbe>,
        events: mpsc::Sender<AgentMessage>,
    ) -> Self {
        Self {
            inner: Arc::new(BackendInner {
                command,
                cwd,
                hooks,
                permission_handler,
                change_title_probe,
                events: Mutex::new(Some(events)),
                state: Mutex::new(BackendState::default()),
                cancel: CancellationToken::new(),
                kill: CancellationToken::new(),
            }),
        }
    }

    /// Spawn the agent process and establish the ACP session.
    ///
    /// Emits `starting`, then — on success — the initial capability events
    /// from the `newSession` reply, then `idle`. The optional initial
    /// prompt is dispatched on a background task so the caller gets the
    /// session id as soon as the handshake completes.
    ///
    /// # Errors
    ///
    /// [`AppError::Spawn`] for environment failures (never retried),
    /// [`AppError::Handshake`] when every handshake attempt failed. Either
    /// way an `error` status with the detail is emitted first.
    pub async fn start_session(&self, initial_prompt: Option<String>) -> Result<String> {
        self.inner.emit_status(SessionStatus::Starting, None).await;

        let spawned = match spawner::spawn_agent(&self.inner.command) {
            Ok(spawned) => spawned,
            Err(err) => {
                self.inner
                    .emit_status(SessionStatus::Error, Some(err.to_string()))
                    .await;
                return Err(err);
            }
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        let _monitor =
            spawner::monitor_exit(spawned.child, spawned.pid, self.inner.kill.clone(), exit_tx);
        let _stderr = spawner::spawn_stderr_logger(
            spawned.stderr,
            Arc::clone(&self.inner.hooks),
            self.event_sender().await,
            self.inner.cancel.clone(),
        );
        self.watch_unexpected_exit(exit_rx.clone());

        let conn = RpcConnection::spawn(
            spawned.stdout,
            spawned.stdin,
            Arc::clone(&self.inner.hooks),
            Arc::new(BackendServices {
                inner: Arc::clone(&self.inner),
            }),
            self.inner.cancel.child_token(),
        );

        {
            let mut state = self.inner.state.lock().await;
            state.conn = Some(Arc::clone(&conn));
            state.exit_rx = Some(exit_rx.clone());
        }

        self.establish(&conn, exit_rx, initial_prompt).await
    }

    /// Establish the ACP session over caller-supplied byte streams.
    ///
    /// Same pipeline as [`Self::start_session`] minus the child-process
    /// supervision; for in-process agents and tests.
    ///
    /// # Errors
    ///
    /// As [`Self::start_session`], except spawn failures cannot occur.
    pub async fn start_session_with_streams<R, W>(
        &self,
        reader: R,
        writer: W,
        initial_prompt: Option<String>,
    ) -> Result<String>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.inner.emit_status(SessionStatus::Starting, None).await;

        let (exit_tx, exit_rx) = watch::channel(None);

        let conn = RpcConnection::spawn(
            reader,
            writer,
            Arc::clone(&self.inner.hooks),
            Arc::new(BackendServices {
                inner: Arc::clone(&self.inner),
            }),
            self.inner.cancel.child_token(),
        );

        {
            let mut state = self.inner.state.lock().await;
            state.conn = Some(Arc::clone(&conn));
            state.exit_rx = Some(exit_rx.clone());
            state.exit_keepalive = Some(exit_tx);
        }

        self.establish(&conn, exit_rx, initial_prompt).await
    }

    /// Handshake, initial capability events, `idle`, optional first prompt.
    async fn establish(
        &self,
        conn: &Arc<RpcConnection>,
        exit_rx: watch::Receiver<Option<ExitInfo>>,
        initial_prompt: Option<String>,
    ) -> Result<String> {
        let outcome =
            match handshake::establish(conn, self.inner.hooks.as_ref(), &self.inner.cwd, exit_rx)
                .await
            {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.inner
                        .emit_status(SessionStatus::Error, Some(err.to_string()))
                        .await;
                    return Err(err);
                }
            };

        let session_id = outcome.session_id.clone();
        {
            let mut state = self.inner.state.lock().await;
            state.session_id = Some(session_id.clone());
            state.config_options = outcome.config_options.clone();
        }

        self.announce_capabilities(&outcome).await;
        self.inner.emit_status(SessionStatus::Idle, None).await;

        if let Some(prompt) = initial_prompt {
            let backend = self.clone_handle();
            let session = session_id.clone();
            tokio::spawn(async move {
                if let Err(err) = backend.send_prompt(&session, &prompt).await {
                    warn!(%err, "initial prompt failed");
                }
            });
        }

        Ok(session_id)
    }

    /// Forward the capability surfaces advertised by `newSession` as
    /// events, so the projection sees them the same way as live updates.
    async fn announce_capabilities(&self, outcome: &HandshakeOutcome) {
        if let Some(config_options) = &outcome.config_options {
            self.inner
                .emit_event("config_options_update", config_options.clone())
                .await;
        }
        if let Some(modes) = &outcome.modes {
            self.inner.emit_event("modes_update", modes.clone()).await;
        }
        if let Some(models) = &outcome.models {
            self.inner.emit_event("models_update", models.clone()).await;
        }
    }

    /// Send a user prompt and await the agent's end-of-turn reply.
    ///
    /// Resets the per-prompt heuristics state, emits `running`, and issues
    /// the `prompt` call. Streamed output arrives as notifications while
    /// this future is pending.
    ///
    /// # Errors
    ///
    /// Emits an `error` status with a structured detail and re-throws when
    /// the call fails. The session stays usable; later prompts may succeed.
    pub async fn send_prompt(&self, session_id: &str, text: &str) -> Result<()> {
        let requests_title_change = self
            .inner
            .change_title_probe
            .as_ref()
            .map(|probe| probe(text))
            .unwrap_or_else(|| self.inner.hooks.prompt_requests_title_change(text));

        let conn = {
            let mut state = self.inner.state.lock().await;
            state.tool_calls_since_prompt = 0;
            state.recent_prompt_had_change_title = requests_title_change;
            state
                .conn
                .clone()
                .ok_or_else(|| AppError::Rpc("no active session".into()))?
        };

        self.inner.emit_status(SessionStatus::Running, None).await;

        let params = json!({
            "sessionId": session_id,
            "prompt": [{ "type": "text", "text": text }],
        });

        match conn.request("prompt", params).await {
            Ok(reply) => {
                if let Some(stop) = reply.get("stopReason").and_then(Value::as_str) {
                    debug!(session_id, stop_reason = stop, "prompt completed");
                }
                Ok(())
            }
            Err(err) => {
                self.inner
                    .emit_status(SessionStatus::Error, Some(structured_detail(&err)))
                    .await;
                Err(err)
            }
        }
    }

    /// Cancel the agent's current work. Does not kill the child.
    ///
    /// The reply is awaited for at most [`CANCEL_REPLY_CAP`]; agents that
    /// treat `cancel` as fire-and-forget cannot wedge the caller. Emits
    /// `stopped` either way.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Rpc`] when no session is active.
    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        let conn = {
            let state = self.inner.state.lock().await;
            state
                .conn
                .clone()
                .ok_or_else(|| AppError::Rpc("no active session".into()))?
        };

        let request = conn.request("cancel", json!({ "sessionId": session_id }));
        match tokio::time::timeout(CANCEL_REPLY_CAP, request).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(session_id, %err, "cancel was not acknowledged"),
            Err(_) => debug!(session_id, "no cancel acknowledgement within the cap"),
        }

        self.inner.emit_status(SessionStatus::Stopped, None).await;
        Ok(())
    }

    /// Switch the session's operating mode. Best-effort.
    ///
    /// On success a `current_mode_update` event is synthesized so the
    /// projection sees the change even if the agent does not echo one.
    pub async fn set_session_mode(&self, mode_id: &str) -> bool {
        let Some((conn, session_id)) = self.inner.active_connection().await else {
            return false;
        };
        let params = json!({ "sessionId": session_id, "modeId": mode_id });
        match conn.request("setSessionMode", params).await {
            Ok(_) => {
                self.inner
                    .emit_event("current_mode_update", json!({ "currentModeId": mode_id }))
                    .await;
                true
            }
            Err(err) => {
                warn!(mode_id, %err, "setSessionMode failed");
                false
            }
        }
    }

    /// Switch the session's model. Best-effort; the capability is unstable
    /// and may be absent entirely, which reports as `false`.
    pub async fn set_session_model(&self, model_id: &str) -> bool {
        let Some((conn, session_id)) = self.inner.active_connection().await else {
            return false;
        };
        let params = json!({ "sessionId": session_id, "modelId": model_id });
        match conn.request("setSessionModel", params).await {
            Ok(_) => true,
            Err(err) => {
                warn!(model_id, %err, "setSessionModel failed");
                false
            }
        }
    }

    /// Set an advertised config option. Best-effort.
    ///
    /// When the agent echoes updated `configOptions` in the reply they are
    /// forwarded as an event; otherwise the stored payload is patched and
    /// re-emitted so downstream projections observe the new value.
    pub async fn set_session_config_option(&self, config_id: &str, value: &str) -> bool {
        let Some((conn, session_id)) = self.inner.active_connection().await else {
            return false;
        };
        let params = json!({
            "sessionId": session_id,
            "configId": config_id,
            "value": value,
        });
        match conn.request("setSessionConfigOption", params).await {
            Ok(reply) => {
                let echoed = reply.get("configOptions").cloned();
                let payload = {
                    let mut state = self.inner.state.lock().await;
                    if let Some(echoed) = echoed {
                        state.config_options = Some(echoed.clone());
                        Some(echoed)
                    } else {
                        patch_config_option(state.config_options.as_mut(), config_id, value);
                        state.config_options.clone()
                    }
                };
                if let Some(payload) = payload {
                    self.inner
                        .emit_event("config_options_update", payload)
                        .await;
                }
                true
            }
            Err(err) => {
                warn!(config_id, %err, "setSessionConfigOption failed");
                false
            }
        }
    }

    /// Record an out-of-band permission decision.
    ///
    /// Emits a `PermissionResponse` event only; ACP permissions are
    /// answered synchronously inside the `requestPermission` service, so
    /// nothing is transmitted to the agent here.
    pub async fn respond_to_permission(&self, id: &str, approved: bool) {
        self.inner
            .emit(AgentMessage::PermissionResponse {
                id: id.to_owned(),
                approved,
            })
            .await;
    }

    /// Tear the session down. Idempotent.
    ///
    /// Best-effort `cancel` (capped), SIGTERM, 1 s grace, SIGKILL, then
    /// timers drained, maps cleared, and the event sender dropped.
    pub async fn dispose(&self) {
        let (conn, session_id, exit_rx, exit_keepalive) = {
            let mut state = self.inner.state.lock().await;
            if state.disposed {
                return;
            }
            state.disposed = true;
            (
                state.conn.clone(),
                state.session_id.clone(),
                state.exit_rx.clone(),
                state.exit_keepalive.take(),
            )
        };

        if let (Some(conn), Some(session_id)) = (&conn, &session_id) {
            let request = conn.request("cancel", json!({ "sessionId": session_id }));
            if tokio::time::timeout(CANCEL_REPLY_CAP, request).await.is_err() {
                debug!("dispose: cancel not acknowledged within the cap");
            }
        }

        // Ask the exit monitor to run the SIGTERM → SIGKILL sequence. A
        // stream-attached session has no monitor; dropping its keepalive
        // sender lets the wait below fall through immediately.
        self.inner.kill.cancel();
        drop(exit_keepalive);
        if let Some(mut exit_rx) = exit_rx {
            let wait = async {
                loop {
                    if exit_rx.borrow_and_update().is_some() {
                        break;
                    }
                    if exit_rx.changed().await.is_err() {
                        break;
                    }
                }
            };
            if tokio::time::timeout(DISPOSE_EXIT_CAP, wait).await.is_err() {
                warn!("dispose: agent did not die within the exit cap");
            }
        }

        if let Some(conn) = conn {
            let dropped = conn.dropped_line_count();
            if dropped > 0 {
                info!(dropped_lines = dropped, "stdout lines dropped this session");
            }
            conn.close().await;
        }
        self.inner.cancel.cancel();

        let mut state = self.inner.state.lock().await;
        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
        }
        for (_, call) in state.active_calls.drain() {
            call.timeout_task.abort();
        }
        state.tool_names.clear();
        state.conn = None;
        drop(state);

        *self.inner.events.lock().await = None;
        info!("backend disposed");
    }

    /// Watch channel publishing the child's exit, once a session was
    /// started with a real process. `None` for stream-attached sessions
    /// before start.
    pub async fn exit_watch(&self) -> Option<watch::Receiver<Option<ExitInfo>>> {
        self.inner.state.lock().await.exit_rx.clone()
    }

    /// Cheap handle sharing the same backend.
    #[must_use]
    pub fn clone_handle(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }

    async fn event_sender(&self) -> mpsc::Sender<AgentMessage> {
        // The stderr logger needs a plain sender; a disposed backend hands
        // out a dead channel so late lines go nowhere.
        if let Some(tx) = self.inner.events.lock().await.clone() {
            tx
        } else {
            mpsc::channel(1).0
        }
    }

    /// Emit terminal statuses when the child dies outside dispose.
    fn watch_unexpected_exit(&self, mut exit_rx: watch::Receiver<Option<ExitInfo>>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let info = loop {
                if let Some(info) = exit_rx.borrow_and_update().clone() {
                    break info;
                }
                if exit_rx.changed().await.is_err() {
                    return;
                }
            };
            if inner.state.lock().await.disposed {
                return;
            }
            let status = if info.code == Some(0) {
                SessionStatus::Stopped
            } else {
                SessionStatus::Error
            };
            inner.emit_status(status, Some(info.reason)).await;
        });
    }
}

// ── Inner plumbing shared with the handlers ──────────────────────────────────

impl BackendInner {
    /// Send one agent-message; a no-op after dispose.
    pub(crate) async fn emit(&self, msg: AgentMessage) {
        let tx = self.events.lock().await.clone();
        if let Some(tx) = tx {
            let _ = tx.send(msg).await;
        }
    }

    /// Emit a named event message.
    pub(crate) async fn emit_event(&self, name: &str, payload: Value) {
        self.emit(AgentMessage::Event {
            name: name.to_owned(),
            payload,
        })
        .await;
    }

    /// Emit a status transition. Consecutive duplicates without detail are
    /// suppressed so `running`/`idle` stay transition markers.
    pub(crate) async fn emit_status(&self, status: SessionStatus, detail: Option<String>) {
        {
            let mut state = self.state.lock().await;
            if state.last_status == Some(status) && detail.is_none() {
                return;
            }
            state.last_status = Some(status);
        }
        self.emit(AgentMessage::Status { status, detail }).await;
    }

    /// Connection plus session id, when a session is established.
    pub(crate) async fn active_connection(&self) -> Option<(Arc<RpcConnection>, String)> {
        let state = self.state.lock().await;
        match (&state.conn, &state.session_id) {
            (Some(conn), Some(session_id)) => Some((Arc::clone(conn), session_id.clone())),
            _ => None,
        }
    }

    /// (Re)arm the idle timer: after the transport's idle timeout with no
    /// active tool calls, `idle` is emitted.
    pub(crate) async fn arm_idle_timer(self: &Arc<Self>) {
        let delay = self.hooks.idle_timeout();
        let inner = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let quiet = {
                let state = inner.state.lock().await;
                state.active_calls.is_empty() && !state.disposed
            };
            if quiet {
                inner.emit_status(SessionStatus::Idle, None).await;
            }
        });
        let mut state = self.state.lock().await;
        if let Some(old) = state.idle_timer.replace(task) {
            old.abort();
        }
    }

    /// After a tool call leaves the active set: when the set is empty,
    /// clear the idle timer and emit `idle` immediately.
    pub(crate) async fn settle_if_drained(&self) {
        let drained = {
            let mut state = self.state.lock().await;
            if state.active_calls.is_empty() {
                if let Some(timer) = state.idle_timer.take() {
                    timer.abort();
                }
                true
            } else {
                false
            }
        };
        if drained {
            self.emit_status(SessionStatus::Idle, None).await;
        }
    }

    /// Start tracking a tool call: record the start time, arm the per-call
    /// timeout, and emit `running` plus the `ToolCall` message.
    pub(crate) async fn start_tool_call(
        self: &Arc<Self>,
        call_id: String,
        tool_name: String,
        kind: &str,
        args: Value,
    ) {
        let timeout = self.hooks.tool_call_timeout(&call_id, kind);
        let investigation = self.hooks.is_investigation_tool(&call_id, kind);

        let timeout_task = {
            let inner = Arc::clone(self);
            let call_id = call_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                inner.expire_tool_call(&call_id).await;
            })
        };

        {
            let mut state = self.state.lock().await;
            state.tool_names.insert(call_id.clone(), tool_name.clone());
            state.active_calls.insert(
                call_id.clone(),
                ActiveCall {
                    tool_name: tool_name.clone(),
                    started: Instant::now(),
                    investigation,
                    timeout_task,
                },
            );
        }

        if investigation {
            debug!(call_id, tool = tool_name.as_str(), ?timeout, "investigation tool started");
        }

        self.emit_status(SessionStatus::Running, None).await;
        self.emit(AgentMessage::ToolCall {
            call_id,
            tool_name,
            args,
        })
        .await;
    }

    /// Complete a tool call: stop its timer, emit the result, and settle
    /// the idle state when the active set drains.
    pub(crate) async fn complete_tool_call(&self, call_id: &str, result: Value) {
        let Some(call) = self.remove_active_call(call_id).await else {
            debug!(call_id, "completion for untracked tool call");
            return;
        };
        log_call_duration(call_id, &call, "tool call completed");
        self.emit(AgentMessage::ToolResult {
            call_id: call_id.to_owned(),
            tool_name: call.tool_name,
            result,
        })
        .await;
        self.settle_if_drained().await;
    }

    /// Fail a tool call with the extracted error detail.
    pub(crate) async fn fail_tool_call(&self, call_id: &str, detail: String, status: &str) {
        let Some(call) = self.remove_active_call(call_id).await else {
            debug!(call_id, status, "failure for untracked tool call");
            return;
        };
        log_call_duration(call_id, &call, "tool call failed");
        warn!(
            call_id,
            tool = call.tool_name.as_str(),
            status,
            detail = detail.as_str(),
            "tool call did not complete"
        );
        self.emit(AgentMessage::ToolResult {
            call_id: call_id.to_owned(),
            tool_name: call.tool_name,
            result: json!({ "error": detail, "status": status }),
        })
        .await;
        self.settle_if_drained().await;
    }

    /// Timeout expiry: drop the call from the active set and settle.
    async fn expire_tool_call(self: &Arc<Self>, call_id: &str) {
        let removed = {
            let mut state = self.state.lock().await;
            state.active_calls.remove(call_id)
        };
        let Some(call) = removed else {
            return;
        };
        log_call_duration(call_id, &call, "tool call timed out");
        self.settle_if_drained().await;
    }

    async fn remove_active_call(&self, call_id: &str) -> Option<ActiveCall> {
        let mut state = self.state.lock().await;
        let call = state.active_calls.remove(call_id)?;
        call.timeout_task.abort();
        Some(call)
    }

    /// Whether a call is currently tracked.
    pub(crate) async fn is_call_active(&self, call_id: &str) -> bool {
        self.state.lock().await.active_calls.contains_key(call_id)
    }
}

/// Log a finished call's duration in seconds (and minutes for
/// investigation tools).
fn log_call_duration(call_id: &str, call: &ActiveCall, what: &str) {
    let secs = call.started.elapsed().as_secs_f64();
    if call.investigation {
        info!(
            call_id,
            tool = call.tool_name.as_str(),
            duration_secs = format!("{secs:.2}").as_str(),
            duration_mins = format!("{:.2}", secs / 60.0).as_str(),
            "{what}"
        );
    } else {
        info!(
            call_id,
            tool = call.tool_name.as_str(),
            duration_secs = format!("{secs:.2}").as_str(),
            "{what}"
        );
    }
}

/// Structured detail string for a failed prompt.
fn structured_detail(err: &AppError) -> String {
    match err {
        AppError::Protocol { code, message } => {
            json!({ "code": code, "message": message }).to_string()
        }
        other => other.to_string(),
    }
}

/// Patch `currentValue` of the option matching `config_id` in a stored
/// `configOptions` payload.
fn patch_config_option(payload: Option<&mut Value>, config_id: &str, value: &str) {
    let Some(Value::Array(options)) = payload else {
        return;
    };
    for option in options {
        let Some(object) = option.as_object_mut() else {
            continue;
        };
        if object.get("id").and_then(Value::as_str) == Some(config_id) {
            object.insert("currentValue".to_owned(), Value::String(value.to_owned()));
        }
    }
}

// ── RPC services ─────────────────────────────────────────────────────────────

/// Client-side service surface handed to the connection.
struct BackendServices {
    inner: Arc<BackendInner>,
}

impl ClientServices for BackendServices {
    fn handle_request(&self, method: String, params: Value) -> ServiceFuture<'_, Result<Value>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            match method.as_str() {
                "requestPermission" => permission::serve(&inner, params).await,
                other => Err(AppError::Rpc(format!("unsupported method: {other}"))),
            }
        })
    }

    fn handle_notification(&self, method: String, params: Value) -> ServiceFuture<'_, ()> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            match method.as_str() {
                "session/update" => handlers::dispatch_session_update(&inner, params).await,
                other => {
                    debug!(method = other, "unknown notification dropped");
                }
            }
        })
    }
}
