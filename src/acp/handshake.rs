//! ACP session establishment.
//!
//! After the agent process is spawned and the JSON-RPC connection is up,
//! the backend performs the `initialize` / `newSession` exchange before
//! any prompt is sent. Each attempt is bounded by the transport's init
//! timeout; failed attempts are retried up to [`MAX_ATTEMPTS`] times with
//! exponential backoff (1 s, 2 s, 4 s, clamped at [`BACKOFF_CAP`]).
//!
//! Two conditions end the retry loop early:
//!
//! - a non-retryable spawn/environment error
//!   ([`AppError::is_retryable`] is false), and
//! - the agent process exiting, signalled out-of-band through the exit
//!   watch channel so the loop does not sit out its timeout against a
//!   corpse.

use std::path::Path;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::acp::rpc::RpcConnection;
use crate::acp::spawner::ExitInfo;
use crate::transport::TransportHooks;
use crate::{AppError, Result};

/// Maximum `initialize`/`newSession` attempts.
pub const MAX_ATTEMPTS: u32 = 3;

/// Upper bound on the exponential backoff between attempts.
pub const BACKOFF_CAP: Duration = Duration::from_secs(5);

/// ACP protocol version spoken by this client.
const PROTOCOL_VERSION: u32 = 1;

/// Result of a successful handshake.
#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    /// Opaque session id assigned by the agent.
    pub session_id: String,
    /// `configOptions` surface from the `newSession` reply, if advertised.
    pub config_options: Option<Value>,
    /// Legacy `modes` surface, if advertised.
    pub modes: Option<Value>,
    /// Legacy `models` surface, if advertised.
    pub models: Option<Value>,
}

/// Run `initialize` + `newSession` with retry.
///
/// # Errors
///
/// - [`AppError::Spawn`] when the agent exits mid-handshake or the
///   environment is broken (never retried).
/// - [`AppError::Handshake`] when every attempt timed out or failed.
pub async fn establish(
    conn: &RpcConnection,
    hooks: &dyn TransportHooks,
    cwd: &Path,
    mut exited: watch::Receiver<Option<ExitInfo>>,
) -> Result<HandshakeOutcome> {
    let mut last_err = AppError::Handshake("no handshake attempt was made".into());

    for attempt in 1..=MAX_ATTEMPTS {
        if let Some(info) = exited.borrow().clone() {
            return Err(AppError::Spawn(format!(
                "agent exited during handshake: {}",
                info.reason
            )));
        }

        let outcome = tokio::select! {
            biased;

            info = child_exit(&mut exited) => {
                return Err(AppError::Spawn(format!(
                    "agent exited during handshake: {}",
                    info.reason
                )));
            }

            result = tokio::time::timeout(hooks.init_timeout(), attempt_once(conn, cwd)) => {
                match result {
                    Ok(result) => result,
                    Err(_elapsed) => Err(AppError::Handshake(format!(
                        "attempt {attempt} timed out after {:?}",
                        hooks.init_timeout()
                    ))),
                }
            }
        };

        match outcome {
            Ok(outcome) => {
                info!(
                    session_id = %outcome.session_id,
                    attempt,
                    "ACP session established"
                );
                return Ok(outcome);
            }
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => {
                warn!(attempt, %err, "handshake attempt failed");
                last_err = err;
            }
        }

        if attempt < MAX_ATTEMPTS {
            let delay = backoff_delay(attempt);
            debug!(attempt, ?delay, "backing off before next handshake attempt");
            tokio::select! {
                info = child_exit(&mut exited) => {
                    return Err(AppError::Spawn(format!(
                        "agent exited during handshake: {}",
                        info.reason
                    )));
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    Err(last_err)
}

/// Backoff before the attempt following `attempt`: 1 s, 2 s, 4 s, capped.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = Duration::from_secs(1u64 << (attempt - 1).min(6));
    exp.min(BACKOFF_CAP)
}

/// One `initialize` + `newSession` exchange.
async fn attempt_once(conn: &RpcConnection, cwd: &Path) -> Result<HandshakeOutcome> {
    let init = conn
        .request(
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "clientInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "clientCapabilities": {
                    "fs": { "readTextFile": false, "writeTextFile": false },
                },
            }),
        )
        .await?;

    if let Some(agent) = init.get("agentInfo").or_else(|| init.get("serverInfo")) {
        debug!(agent = %agent, "agent identified itself");
    }

    let reply = conn
        .request(
            "newSession",
            json!({
                "cwd": cwd.to_string_lossy(),
                "mcpServers": [],
            }),
        )
        .await?;

    let session_id = reply
        .get("sessionId")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Handshake("newSession reply is missing 'sessionId'".into()))?
        .to_owned();

    Ok(HandshakeOutcome {
        session_id,
        config_options: reply.get("configOptions").cloned(),
        modes: reply.get("modes").cloned(),
        models: reply.get("models").cloned(),
    })
}

/// Resolve once the child-exit watch carries a value.
async fn child_exit(exited: &mut watch::Receiver<Option<ExitInfo>>) -> ExitInfo {
    loop {
        if let Some(info) = exited.borrow_and_update().clone() {
            return info;
        }
        if exited.changed().await.is_err() {
            // Sender dropped without publishing: treat as an exit of
            // unknown cause so the handshake stops waiting.
            return ExitInfo {
                code: None,
                reason: "exit monitor stopped".into(),
            };
        }
    }
}
