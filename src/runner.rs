//! Runner — wires the backend, the turn mapper, and the relay together.
//!
//! The runner owns the only loop that touches the mapper and the
//! accumulated capability snapshot, so every projection and envelope is
//! produced in agent-message order. Startup follows a fixed sequence: the
//! relay and control channels come from the caller, the tool bridge (when
//! present) is started and its URL handed to the child through the
//! environment, then the backend spawns the agent and the event loop runs
//! until a kill command, a relay/backend shutdown, or the child's death.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::acp::rpc::ServiceFuture;
use crate::acp::spawner::{AgentCommand, ExitInfo};
use crate::backend::{AcpBackend, PermissionHandler};
use crate::message::{AgentMessage, SessionStatus};
use crate::metadata::{
    self, extract_config_options_from_payload, extract_mode_state, extract_model_state,
    SessionMetadata, SessionSnapshot,
};
use crate::session::{SessionEnvelope, TurnMapper, TurnStatus};
use crate::transport::TransportHooks;
use crate::Result;

/// Environment variable carrying the tool-bridge URL to the child.
pub const BRIDGE_URL_ENV: &str = "ACP_RUNNER_BRIDGE_URL";

/// Control commands registered with the relay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Cancel the agent's current work; the session stays alive.
    Abort,
    /// Tear everything down and exit.
    Kill,
}

/// One user message arriving from the control surface.
#[derive(Debug, Clone, Default)]
pub struct InboundUserMessage {
    /// Prompt text.
    pub text: String,
    /// Requested operating mode, validated against advertised options.
    pub permission_mode: Option<String>,
    /// Requested model, validated against advertised options.
    pub model: Option<String>,
}

/// Functional metadata update applied by the relay.
pub type MetadataUpdate = Box<dyn FnOnce(SessionMetadata) -> SessionMetadata + Send>;

/// The established relay session (external collaborator).
pub trait RelaySession: Send + Sync {
    /// Forward one envelope, in emission order.
    fn send_envelope(&self, envelope: SessionEnvelope) -> ServiceFuture<'_, Result<()>>;

    /// Apply a functional metadata update.
    fn update_metadata(&self, update: MetadataUpdate) -> ServiceFuture<'_, ()>;

    /// Close the session.
    fn close(&self) -> ServiceFuture<'_, ()>;
}

/// Local bridge server for agent-side tools (external collaborator).
pub trait ToolBridge: Send + Sync {
    /// Start the server and return its URL.
    fn start(&self) -> ServiceFuture<'_, Result<String>>;
}

/// Everything the runner needs to start a session.
pub struct RunnerConfig {
    /// Resolved agent invocation.
    pub command: AgentCommand,
    /// Working directory handed to `newSession`.
    pub cwd: PathBuf,
    /// Per-agent transport policy.
    pub hooks: Arc<dyn TransportHooks>,
    /// Optional permission decision collaborator.
    pub permission_handler: Option<Arc<dyn PermissionHandler>>,
    /// Optional prompt dispatched right after the handshake.
    pub initial_prompt: Option<String>,
}

/// Collaborator endpoints the caller established beforehand.
pub struct RunnerEndpoints {
    /// Relay session receiving envelopes and metadata.
    pub relay: Arc<dyn RelaySession>,
    /// Optional tool bridge; its URL reaches the child via
    /// [`BRIDGE_URL_ENV`].
    pub bridge: Option<Arc<dyn ToolBridge>>,
    /// Inbound user messages.
    pub inbound: mpsc::Receiver<InboundUserMessage>,
    /// Abort/kill commands from the relay's RPC handlers.
    pub control: mpsc::Receiver<ControlCommand>,
}

/// Run one agent session to completion.
///
/// Returns the process exit code: 0 for a clean shutdown, 1 for a startup
/// failure, the child's exit code when the agent process died underneath
/// the session.
///
/// # Errors
///
/// Only infrastructure failures surface as errors; agent-level failures
/// are folded into the exit code.
pub async fn run(config: RunnerConfig, endpoints: RunnerEndpoints) -> Result<i32> {
    let RunnerEndpoints {
        relay,
        bridge,
        mut inbound,
        mut control,
    } = endpoints;

    let mut command = config.command;
    if let Some(bridge) = bridge {
        match bridge.start().await {
            Ok(url) => {
                debug!(url = url.as_str(), "tool bridge started");
                command.env.push((BRIDGE_URL_ENV.to_owned(), url));
            }
            Err(err) => {
                warn!(%err, "tool bridge failed to start, continuing without it");
            }
        }
    }

    let (events_tx, mut events) = mpsc::channel::<AgentMessage>(256);
    let backend = AcpBackend::new(
        command,
        config.cwd,
        config.hooks,
        config.permission_handler,
        None,
        events_tx,
    );

    let session_id = match backend.start_session(config.initial_prompt).await {
        Ok(session_id) => session_id,
        Err(err) => {
            warn!(%err, "session startup failed");
            relay.close().await;
            backend.dispose().await;
            return Ok(1);
        }
    };
    info!(session_id = session_id.as_str(), "session started");

    let exit_rx = backend.exit_watch().await;

    let mut mapper = TurnMapper::new();
    let mut snapshot = SessionSnapshot::default();
    let mut exit_code = 0;
    let mut inbound_open = true;
    let mut control_open = true;

    loop {
        tokio::select! {
            msg = events.recv() => {
                let Some(msg) = msg else {
                    debug!("agent-message stream ended");
                    break;
                };
                let outcome = handle_agent_message(
                    &relay,
                    &mut mapper,
                    &mut snapshot,
                    exit_rx.as_ref(),
                    &msg,
                )
                .await;
                if let Some(code) = outcome {
                    exit_code = code;
                    break;
                }
            }

            msg = inbound.recv(), if inbound_open => {
                let Some(msg) = msg else {
                    inbound_open = false;
                    continue;
                };
                dispatch_user_message(&relay, &backend, &mut mapper, &snapshot, &session_id, msg)
                    .await;
            }

            cmd = control.recv(), if control_open => {
                let Some(cmd) = cmd else {
                    control_open = false;
                    continue;
                };
                match cmd {
                    ControlCommand::Abort => {
                        if let Err(err) = backend.cancel(&session_id).await {
                            warn!(%err, "abort failed");
                        }
                    }
                    ControlCommand::Kill => {
                        info!("kill requested");
                        break;
                    }
                }
            }
        }
    }

    backend.dispose().await;
    relay.close().await;
    Ok(exit_code)
}

/// Fold one agent-message: project envelopes, fold capability events,
/// drive turn ends from statuses.
///
/// Returns `Some(exit_code)` when the message is terminal for the run.
async fn handle_agent_message(
    relay: &Arc<dyn RelaySession>,
    mapper: &mut TurnMapper,
    snapshot: &mut SessionSnapshot,
    exit_rx: Option<&watch::Receiver<Option<ExitInfo>>>,
    msg: &AgentMessage,
) -> Option<i32> {
    debug!(message = ?msg, "agent message");

    // Capability events re-project the whole accumulated snapshot.
    if let AgentMessage::Event { name, payload } = msg {
        if snapshot.apply_event(name, payload) {
            let snap = snapshot.clone();
            relay
                .update_metadata(Box::new(move |prev| metadata::merge(&prev, &snap)))
                .await;
        }
    }

    for envelope in mapper.map_message(msg) {
        forward(relay, envelope).await;
    }

    if let AgentMessage::Status { status, detail } = msg {
        let turn_status = match status {
            SessionStatus::Idle => Some(TurnStatus::Completed),
            SessionStatus::Stopped => Some(TurnStatus::Cancelled),
            SessionStatus::Error => Some(TurnStatus::Failed),
            SessionStatus::Starting | SessionStatus::Running => None,
        };
        if let Some(turn_status) = turn_status {
            for envelope in mapper.end_turn(turn_status) {
                forward(relay, envelope).await;
            }
        }

        // A stopped/error status backed by a real child exit ends the run
        // with the child's code; a plain cancel leaves the session alive.
        if matches!(status, SessionStatus::Stopped | SessionStatus::Error) {
            if let Some(info) = exit_rx.and_then(|rx| rx.borrow().clone()) {
                info!(
                    reason = info.reason.as_str(),
                    detail = detail.as_deref().unwrap_or(""),
                    "agent process is gone, ending run"
                );
                return Some(info.code.unwrap_or(1));
            }
        }
    }

    None
}

/// Dispatch one inbound user message: apply selections, send the prompt,
/// open the turn.
async fn dispatch_user_message(
    relay: &Arc<dyn RelaySession>,
    backend: &AcpBackend,
    mapper: &mut TurnMapper,
    snapshot: &SessionSnapshot,
    session_id: &str,
    msg: InboundUserMessage,
) {
    if let Some(mode) = &msg.permission_mode {
        apply_mode_selection(backend, snapshot, mode).await;
    }
    if let Some(model) = &msg.model {
        apply_model_selection(backend, snapshot, model).await;
    }

    let prompt_backend = backend.clone_handle();
    let prompt_session = session_id.to_owned();
    let text = msg.text;
    tokio::spawn(async move {
        // The prompt call resolves at end of turn; failures already
        // surfaced as an error status.
        if let Err(err) = prompt_backend.send_prompt(&prompt_session, &text).await {
            debug!(%err, "prompt ended with an error");
        }
    });

    for envelope in mapper.start_turn() {
        forward(relay, envelope).await;
    }
}

/// Route a mode selection: advertised config option first, legacy mode
/// second, ignore on mismatch.
async fn apply_mode_selection(backend: &AcpBackend, snapshot: &SessionSnapshot, mode: &str) {
    if let Some(selector_id) = config_selector_for(snapshot, "mode", mode) {
        if backend.set_session_config_option(&selector_id, mode).await {
            return;
        }
    }
    let known_legacy = snapshot
        .modes
        .as_ref()
        .and_then(extract_mode_state)
        .is_some_and(|state| state.available_modes.iter().any(|entry| entry.id == mode));
    if known_legacy {
        backend.set_session_mode(mode).await;
    } else {
        debug!(mode, "mode selection does not match any advertised option, ignored");
    }
}

/// Route a model selection: advertised config option first, legacy model
/// second, ignore on mismatch.
async fn apply_model_selection(backend: &AcpBackend, snapshot: &SessionSnapshot, model: &str) {
    if let Some(selector_id) = config_selector_for(snapshot, "model", model) {
        if backend.set_session_config_option(&selector_id, model).await {
            return;
        }
    }
    let known_legacy = snapshot
        .models
        .as_ref()
        .and_then(extract_model_state)
        .is_some_and(|state| {
            state
                .available_models
                .iter()
                .any(|entry| entry.model_id == model)
        });
    if known_legacy {
        backend.set_session_model(model).await;
    } else {
        debug!(model, "model selection does not match any advertised option, ignored");
    }
}

/// Id of the advertised selector of `category` offering `code`, if any.
fn config_selector_for(snapshot: &SessionSnapshot, category: &str, code: &str) -> Option<String> {
    let options = snapshot
        .config_options
        .as_ref()
        .and_then(extract_config_options_from_payload)?;
    options
        .iter()
        .filter(|option| {
            option.option_type == "select" && option.category.as_deref() == Some(category)
        })
        .find(|option| {
            metadata::flatten_choices(option)
                .iter()
                .any(|entry| entry.code == code)
        })
        .and_then(|option| option.id.clone())
}

async fn forward(relay: &Arc<dyn RelaySession>, envelope: SessionEnvelope) {
    if let Err(err) = relay.send_envelope(envelope).await {
        warn!(%err, "relay rejected an envelope");
    }
}
