//! `session/update` notification dispatch.
//!
//! Each notification kind has its own reducer over the backend state
//! (active tool calls, timers, the id→name map). Reducers report an
//! [`UpdateOutcome`] so the dispatcher can log unhandled kinds and the
//! per-prompt tool-call counter in one place. Unknown kinds are logged and
//! dropped, never fatal.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;

use crate::backend::BackendInner;
use crate::message::AgentMessage;
use crate::transport::ToolNameContext;

/// Result of one reducer.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateOutcome {
    /// Whether the kind was recognized and acted on.
    pub handled: bool,
    /// New per-prompt tool-call count, when the reducer advanced it.
    pub tool_calls_since_prompt: Option<u32>,
}

impl UpdateOutcome {
    fn handled() -> Self {
        Self {
            handled: true,
            tool_calls_since_prompt: None,
        }
    }
}

/// Assistant chunks opening with a bold header line are thinking output
/// streamed through the regular message channel.
fn thinking_header() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\*\*[^*]+\*\*\n").expect("thinking header pattern"))
}

/// Dispatch one `session/update` notification.
pub(crate) async fn dispatch_session_update(inner: &Arc<BackendInner>, params: Value) {
    // The update body nests under `update`; tolerate flat payloads from
    // older agents.
    let update = params.get("update").unwrap_or(&params);
    let Some(kind) = update.get("sessionUpdate").and_then(Value::as_str) else {
        debug!("session/update without a sessionUpdate kind, dropped");
        return;
    };

    let outcome = match kind {
        "agent_message_chunk" => on_message_chunk(inner, update).await,
        "agent_thought_chunk" => on_thought_chunk(inner, update).await,
        "tool_call" => on_tool_call(inner, update).await,
        "tool_call_update" => on_tool_call_update(inner, update).await,
        "available_commands_update" => {
            inner
                .emit_event("available_commands", update.clone())
                .await;
            UpdateOutcome::handled()
        }
        "config_option_update" | "config_options_update" => {
            inner
                .emit_event("config_options_update", update.clone())
                .await;
            UpdateOutcome::handled()
        }
        "current_mode_update" => {
            inner.emit_event("current_mode_update", update.clone()).await;
            UpdateOutcome::handled()
        }
        "modes_update" => {
            inner.emit_event("modes_update", update.clone()).await;
            UpdateOutcome::handled()
        }
        "models_update" => {
            inner.emit_event("models_update", update.clone()).await;
            UpdateOutcome::handled()
        }
        "messageChunk" => on_legacy_message_chunk(inner, update).await,
        "plan" => {
            inner.emit_event("plan", update.clone()).await;
            UpdateOutcome::handled()
        }
        "thinking" => {
            inner.emit_event("thinking", update.clone()).await;
            UpdateOutcome::handled()
        }
        "usage_update" => {
            let total = update
                .get("totalTokens")
                .or_else(|| update.get("total"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            inner.emit(AgentMessage::TokenCount { total }).await;
            UpdateOutcome::handled()
        }
        "fs_edit" => {
            inner
                .emit(AgentMessage::FsEdit {
                    payload: update.clone(),
                })
                .await;
            UpdateOutcome::handled()
        }
        "terminal_output" => {
            inner
                .emit(AgentMessage::TerminalOutput {
                    payload: update.clone(),
                })
                .await;
            UpdateOutcome::handled()
        }
        other => {
            debug!(kind = other, "unknown session update kind, dropped");
            UpdateOutcome::default()
        }
    };

    if let Some(count) = outcome.tool_calls_since_prompt {
        debug!(kind, tool_calls_since_prompt = count, "session update handled");
    }
}

// ── Text and thinking chunks ─────────────────────────────────────────────────

/// `agent_message_chunk` — streamed assistant text, unless the chunk opens
/// with a bold header, which marks thinking streamed through the message
/// channel.
async fn on_message_chunk(inner: &Arc<BackendInner>, update: &Value) -> UpdateOutcome {
    let Some(text) = chunk_text(update) else {
        return UpdateOutcome::handled();
    };

    if thinking_header().is_match(&text) {
        inner
            .emit_event("thinking", json!({ "text": text, "streaming": true }))
            .await;
        return UpdateOutcome::handled();
    }

    inner
        .emit(AgentMessage::ModelOutput { text_delta: text })
        .await;
    inner.arm_idle_timer().await;
    UpdateOutcome::handled()
}

/// `agent_thought_chunk` — always streamed thinking.
async fn on_thought_chunk(inner: &Arc<BackendInner>, update: &Value) -> UpdateOutcome {
    let Some(text) = chunk_text(update) else {
        return UpdateOutcome::handled();
    };
    inner
        .emit_event("thinking", json!({ "text": text, "streaming": true }))
        .await;
    UpdateOutcome::handled()
}

/// Legacy `messageChunk` with a bare `textDelta` field.
async fn on_legacy_message_chunk(inner: &Arc<BackendInner>, update: &Value) -> UpdateOutcome {
    let Some(delta) = update.get("textDelta").and_then(Value::as_str) else {
        return UpdateOutcome::handled();
    };
    inner
        .emit(AgentMessage::ModelOutput {
            text_delta: delta.to_owned(),
        })
        .await;
    inner.arm_idle_timer().await;
    UpdateOutcome::handled()
}

/// Text of a content chunk: `content` may be `{type: "text", text}` or a
/// bare string.
fn chunk_text(update: &Value) -> Option<String> {
    match update.get("content")? {
        Value::String(text) => Some(text.clone()),
        Value::Object(map) => map
            .get("text")
            .and_then(Value::as_str)
            .map(str::to_owned),
        _ => None,
    }
}

// ── Tool-call lifecycle ──────────────────────────────────────────────────────

/// `tool_call` — start tracking unless the call is already active.
async fn on_tool_call(inner: &Arc<BackendInner>, update: &Value) -> UpdateOutcome {
    let Some(call_id) = call_id(update) else {
        debug!("tool_call without an id, dropped");
        return UpdateOutcome::default();
    };

    if inner.is_call_active(&call_id).await {
        return UpdateOutcome::handled();
    }

    let count = {
        let mut state = inner.state.lock().await;
        state.tool_calls_since_prompt += 1;
        state.tool_calls_since_prompt
    };

    start_call(inner, update, call_id).await;
    UpdateOutcome {
        handled: true,
        tool_calls_since_prompt: Some(count),
    }
}

/// `tool_call_update` — start on `in_progress`/`pending`, finish on the
/// terminal statuses.
async fn on_tool_call_update(inner: &Arc<BackendInner>, update: &Value) -> UpdateOutcome {
    let Some(call_id) = call_id(update) else {
        debug!("tool_call_update without an id, dropped");
        return UpdateOutcome::default();
    };
    let status = update
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("in_progress");

    match status {
        "in_progress" | "pending" => {
            if !inner.is_call_active(&call_id).await {
                start_call(inner, update, call_id).await;
            }
        }
        "completed" => {
            let result = update.get("content").cloned().unwrap_or(Value::Null);
            inner.complete_tool_call(&call_id, result).await;
        }
        "failed" | "cancelled" => {
            let detail = extract_failure_detail(update, status);
            inner.fail_tool_call(&call_id, detail, status).await;
        }
        other => {
            debug!(call_id = call_id.as_str(), status = other, "unknown tool call status");
        }
    }
    UpdateOutcome::handled()
}

/// Resolve the tool name and begin tracking the call.
async fn start_call(inner: &Arc<BackendInner>, update: &Value, call_id: String) {
    let kind = update
        .get("kind")
        .and_then(Value::as_str)
        .unwrap_or("other");
    let args = parse_tool_args(update);
    let input = update.get("rawInput").cloned().unwrap_or_else(|| args.clone());

    let ctx = {
        let state = inner.state.lock().await;
        ToolNameContext {
            tool_calls_since_prompt: state.tool_calls_since_prompt,
            recent_prompt_had_change_title: state.recent_prompt_had_change_title,
        }
    };

    let tool_name = inner
        .hooks
        .extract_tool_name_from_id(&call_id)
        .unwrap_or_else(|| inner.hooks.determine_tool_name(kind, &call_id, &input, ctx));

    inner.start_tool_call(call_id, tool_name, kind, args).await;
}

/// Call id: `toolCallId` with an `id` fallback.
fn call_id(update: &Value) -> Option<String> {
    update
        .get("toolCallId")
        .or_else(|| update.get("id"))
        .and_then(Value::as_str)
        .map(str::to_owned)
}

/// Invocation arguments: `items` wrapping when `content` is an array, the
/// object as-is otherwise, with `locations` folded in when present.
fn parse_tool_args(update: &Value) -> Value {
    let mut args = match update.get("content") {
        Some(Value::Array(items)) => json!({ "items": items }),
        Some(Value::Object(map)) => Value::Object(map.clone()),
        _ => json!({}),
    };
    if let Some(locations) = update.get("locations") {
        if let Some(map) = args.as_object_mut() {
            map.insert("locations".to_owned(), locations.clone());
        }
    }
    args
}

/// Failure detail for `failed`/`cancelled` updates.
///
/// Preference order: `content.error.message`, `content.error` (string),
/// `content.message`, `reason`, the status itself, and finally the whole
/// update truncated to 500 characters.
pub(crate) fn extract_failure_detail(update: &Value, status: &str) -> String {
    if let Some(content) = update.get("content") {
        if let Some(message) = content
            .get("error")
            .and_then(|error| error.get("message"))
            .and_then(Value::as_str)
        {
            return message.to_owned();
        }
        if let Some(error) = content.get("error").and_then(Value::as_str) {
            return error.to_owned();
        }
        if let Some(message) = content.get("message").and_then(Value::as_str) {
            return message.to_owned();
        }
    }
    if let Some(reason) = update.get("reason").and_then(Value::as_str) {
        return reason.to_owned();
    }
    if !status.is_empty() {
        return status.to_owned();
    }
    let raw = update.to_string();
    if raw.chars().count() > 500 {
        raw.chars().take(500).collect()
    } else {
        raw
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
