//! Server side of the agent's `requestPermission` call.
//!
//! ACP permissions are synchronous: the agent blocks until the JSON-RPC
//! reply selects one of its offered options, so the decision collaborator
//! is awaited inside the service (the connection serves requests on their
//! own task, keeping the stream loop live meanwhile).
//!
//! The tool-call id doubles as the permission id, which makes an
//! operator's out-of-band reply correlatable without an auxiliary map.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::acp::rpc::ServiceFuture;
use crate::backend::BackendInner;
use crate::message::AgentMessage;
use crate::transport::ToolNameContext;
use crate::Result;

/// Operator verdict on a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    /// Allow this one call.
    Approved,
    /// Allow this call and all further calls of the tool this session.
    ApprovedForSession,
    /// Reject the call.
    Denied,
    /// Reject and ask the agent to stop what it is doing.
    Abort,
}

impl PermissionDecision {
    /// Wire spelling used in the synthetic decision result.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::ApprovedForSession => "approved_for_session",
            Self::Denied => "denied",
            Self::Abort => "abort",
        }
    }

    fn status(self) -> &'static str {
        match self {
            Self::Approved | Self::ApprovedForSession => "approved",
            Self::Denied | Self::Abort => "denied",
        }
    }
}

/// Decision collaborator invoked for every permission request.
///
/// The future must be resolvable from outside the backend's own tasks
/// (typically a UI round-trip); the service awaits it without blocking the
/// stream loop.
pub trait PermissionHandler: Send + Sync {
    /// Decide whether `tool_name` may run with `input`.
    fn decide(
        &self,
        tool_call_id: String,
        tool_name: String,
        input: Value,
    ) -> ServiceFuture<'_, Result<PermissionDecision>>;
}

/// One normalized permission option offered by the agent.
#[derive(Debug, Clone)]
struct PermissionOption {
    option_id: String,
    name: String,
    kind: String,
}

/// Serve one `requestPermission` call; the returned value is the JSON-RPC
/// reply.
pub(crate) async fn serve(inner: &Arc<BackendInner>, params: Value) -> Result<Value> {
    let tool_call = params.get("toolCall");

    // The tool-call id is both toolCallId and permissionId.
    let call_id = tool_call
        .and_then(|call| call.get("id").or_else(|| call.get("toolCallId")))
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let tool_name = identify_tool(inner, &params, tool_call, &call_id).await;
    let options = normalize_options(&params);

    inner
        .emit(AgentMessage::PermissionRequest {
            id: call_id.clone(),
            reason: tool_name.clone(),
            payload: params.clone(),
        })
        .await;

    let Some(handler) = inner.permission_handler.clone() else {
        // Unattended mode: proceed once.
        let option_id = select_option(&options, PermissionDecision::Approved);
        debug!(
            call_id = call_id.as_str(),
            option_id = option_id.as_str(),
            "no permission handler configured, auto-selecting"
        );
        return Ok(selected(option_id));
    };

    let input = tool_call
        .and_then(|call| call.get("rawInput"))
        .cloned()
        .unwrap_or(Value::Null);

    let decision = match handler.decide(call_id.clone(), tool_name.clone(), input).await {
        Ok(decision) => decision,
        Err(err) => {
            warn!(call_id = call_id.as_str(), %err, "permission handler failed, cancelling");
            PermissionDecision::Abort
        }
    };

    let option_id = select_option(&options, decision);

    // Synthetic result so UIs can close their countdown for this call.
    inner
        .emit(AgentMessage::ToolResult {
            call_id: call_id.clone(),
            tool_name,
            result: json!({
                "status": decision.status(),
                "decision": decision.as_str(),
            }),
        })
        .await;

    debug!(
        call_id = call_id.as_str(),
        decision = decision.as_str(),
        option_id = option_id.as_str(),
        "permission resolved"
    );
    Ok(selected(option_id))
}

fn selected(option_id: String) -> Value {
    json!({ "outcome": { "outcome": "selected", "optionId": option_id } })
}

/// Identify the tool behind a permission request.
///
/// Prefers `toolCall.kind`, then `toolCall.toolName`, then a top-level
/// `kind`; generic leftovers go through the transport's name heuristics.
async fn identify_tool(
    inner: &Arc<BackendInner>,
    params: &Value,
    tool_call: Option<&Value>,
    call_id: &str,
) -> String {
    let reported = tool_call
        .and_then(|call| call.get("kind").or_else(|| call.get("toolName")))
        .or_else(|| params.get("kind"))
        .and_then(Value::as_str)
        .unwrap_or("other");

    if let Some(name) = inner.hooks.extract_tool_name_from_id(call_id) {
        return name;
    }

    let input = tool_call
        .and_then(|call| call.get("rawInput"))
        .cloned()
        .unwrap_or(Value::Null);
    let ctx = {
        let state = inner.state.lock().await;
        ToolNameContext {
            tool_calls_since_prompt: state.tool_calls_since_prompt,
            recent_prompt_had_change_title: state.recent_prompt_had_change_title,
        }
    };
    inner.hooks.determine_tool_name(reported, call_id, &input, ctx)
}

/// Normalize the request's option list.
fn normalize_options(params: &Value) -> Vec<PermissionOption> {
    let Some(options) = params.get("options").and_then(Value::as_array) else {
        return Vec::new();
    };
    options
        .iter()
        .filter_map(|option| {
            let option_id = option
                .get("optionId")
                .or_else(|| option.get("id"))
                .and_then(Value::as_str)?
                .to_owned();
            Some(PermissionOption {
                name: option
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or(&option_id)
                    .to_owned(),
                kind: option
                    .get("kind")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
                option_id,
            })
        })
        .collect()
}

/// Map a decision onto one of the request's option ids.
///
/// `approved` prefers `proceed_once`, `approved_for_session` prefers
/// `proceed_always`, denials prefer `cancel`; option kinds and names are
/// the fallbacks, then the first offered option, then the canonical id
/// itself when the agent offered none.
fn select_option(options: &[PermissionOption], decision: PermissionDecision) -> String {
    let (canonical, kind_needle, name_needle) = match decision {
        PermissionDecision::Approved => ("proceed_once", "allow_once", "once"),
        PermissionDecision::ApprovedForSession => ("proceed_always", "allow_always", "always"),
        PermissionDecision::Denied | PermissionDecision::Abort => ("cancel", "reject", "cancel"),
    };

    if let Some(option) = options.iter().find(|option| option.option_id == canonical) {
        return option.option_id.clone();
    }
    if let Some(option) = options
        .iter()
        .find(|option| option.kind.starts_with(kind_needle))
    {
        return option.option_id.clone();
    }
    if let Some(option) = options
        .iter()
        .find(|option| option.name.to_lowercase().contains(name_needle))
    {
        return option.option_id.clone();
    }
    options
        .first()
        .map(|option| option.option_id.clone())
        .unwrap_or_else(|| canonical.to_owned())
}
