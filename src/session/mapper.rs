//! Turn mapper — projects the agent-message stream into session envelopes.
//!
//! The mapper is a pure state machine with no I/O: the caller owns turn
//! lifecycle through [`TurnMapper::start_turn`] / [`TurnMapper::end_turn`]
//! and feeds every agent-message through [`TurnMapper::map_message`],
//! forwarding whatever envelopes come back.
//!
//! Text and thinking chunks are coalesced: consecutive chunks of one kind
//! buffer up and flush as a single `text` envelope when the opposite kind
//! arrives, when a tool call interleaves, or when the turn ends. Flushing
//! also happens when no turn is active, so output arriving after a turn
//! closed is still observable (with no turn id) rather than silently
//! dropped.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Instant;

use serde_json::Value;
use uuid::Uuid;

use crate::message::AgentMessage;
use crate::session::envelope::{EnvelopeEvent, SessionEnvelope, TurnStatus};

/// Milliseconds elapsed since the first envelope clock read in this
/// process. Monotonic, comparable across mapper instances.
fn elapsed_ms() -> u64 {
    static PROCESS_EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = PROCESS_EPOCH.get_or_init(Instant::now);
    u64::try_from(epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Stateful projection of agent-messages into session envelopes.
#[derive(Debug, Default)]
pub struct TurnMapper {
    current_turn_id: Option<String>,
    pending_text: String,
    pending_thinking: String,
    call_ids: HashMap<String, String>,
    time_counter: u64,
}

impl TurnMapper {
    /// Create a mapper with no active turn.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The active turn id, if a turn is open.
    #[must_use]
    pub fn current_turn(&self) -> Option<&str> {
        self.current_turn_id.as_deref()
    }

    /// Open a turn. Emits one `turn-start`; a no-op while a turn is active.
    pub fn start_turn(&mut self) -> Vec<SessionEnvelope> {
        if self.current_turn_id.is_some() {
            return Vec::new();
        }
        self.current_turn_id = Some(Uuid::new_v4().to_string());
        vec![self.envelope(EnvelopeEvent::TurnStart)]
    }

    /// Close the active turn with `status`.
    ///
    /// Pending text and thinking are flushed first (in that order); the
    /// `turn-end` follows, bound to the turn being closed. With no active
    /// turn this still flushes any late output but emits no `turn-end`.
    pub fn end_turn(&mut self, status: TurnStatus) -> Vec<SessionEnvelope> {
        let mut out = self.flush_pending();
        if self.current_turn_id.is_some() {
            out.push(self.envelope(EnvelopeEvent::TurnEnd { status }));
            self.current_turn_id = None;
        }
        out
    }

    /// Project one agent-message into zero or more envelopes.
    ///
    /// Status, permission, token-count, fs-edit, and terminal-output
    /// messages are not the mapper's business and produce nothing.
    pub fn map_message(&mut self, msg: &AgentMessage) -> Vec<SessionEnvelope> {
        match msg {
            AgentMessage::ModelOutput { text_delta } => self.on_model_output(text_delta),
            AgentMessage::Event { name, payload } if name == "thinking" => {
                self.on_thinking(payload)
            }
            AgentMessage::ToolCall {
                call_id,
                tool_name,
                args,
            } => self.on_tool_call(call_id, tool_name, args),
            AgentMessage::ToolResult { call_id, .. } => self.on_tool_result(call_id),
            _ => Vec::new(),
        }
    }

    // ── Reducers ─────────────────────────────────────────────────────────────

    fn on_model_output(&mut self, delta: &str) -> Vec<SessionEnvelope> {
        if delta.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::new();
        if !self.pending_thinking.is_empty() {
            out.push(self.flush_thinking());
        }
        self.pending_text.push_str(delta);
        out
    }

    fn on_thinking(&mut self, payload: &Value) -> Vec<SessionEnvelope> {
        let text = payload.get("text").and_then(Value::as_str).unwrap_or("");
        if text.is_empty() {
            return Vec::new();
        }
        let streaming = payload
            .get("streaming")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if streaming {
            let mut out = Vec::new();
            if !self.pending_text.is_empty() {
                out.push(self.flush_text());
            }
            self.pending_thinking.push_str(text);
            out
        } else {
            let mut out = self.flush_pending();
            let text = text.to_owned();
            out.push(self.envelope(EnvelopeEvent::Text {
                text,
                thinking: Some(true),
            }));
            out
        }
    }

    fn on_tool_call(&mut self, call_id: &str, tool_name: &str, args: &Value) -> Vec<SessionEnvelope> {
        let mut out = self.flush_pending();
        let our_call = Uuid::new_v4().to_string();
        self.call_ids.insert(call_id.to_owned(), our_call.clone());
        out.push(self.envelope(EnvelopeEvent::ToolCallStart {
            call: our_call,
            name: tool_name.to_owned(),
            title: tool_name.to_owned(),
            description: tool_name.to_owned(),
            args: args.clone(),
        }));
        out
    }

    fn on_tool_result(&mut self, call_id: &str) -> Vec<SessionEnvelope> {
        // Results may interleave with streaming text; no flush here. An
        // unknown call id still gets a fresh envelope id so the result is
        // observable.
        let call = self
            .call_ids
            .get(call_id)
            .cloned()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        vec![self.envelope(EnvelopeEvent::ToolCallEnd { call })]
    }

    // ── Buffers & clock ──────────────────────────────────────────────────────

    /// Flush pending text, then pending thinking. At most one buffer is
    /// ever non-empty, because each kind flushes the other on arrival.
    fn flush_pending(&mut self) -> Vec<SessionEnvelope> {
        let mut out = Vec::new();
        if !self.pending_text.is_empty() {
            out.push(self.flush_text());
        }
        if !self.pending_thinking.is_empty() {
            out.push(self.flush_thinking());
        }
        out
    }

    fn flush_text(&mut self) -> SessionEnvelope {
        let text = std::mem::take(&mut self.pending_text);
        self.envelope(EnvelopeEvent::Text {
            text,
            thinking: None,
        })
    }

    fn flush_thinking(&mut self) -> SessionEnvelope {
        let text = std::mem::take(&mut self.pending_thinking);
        self.envelope(EnvelopeEvent::Text {
            text,
            thinking: Some(true),
        })
    }

    fn envelope(&mut self, ev: EnvelopeEvent) -> SessionEnvelope {
        SessionEnvelope {
            id: Uuid::new_v4().to_string(),
            time: self.next_time(),
            turn: self.current_turn_id.clone(),
            ev,
        }
    }

    /// Advance the envelope clock: strictly increasing, clamped above the
    /// process-elapsed wall clock so times stay meaningful across bursts.
    fn next_time(&mut self) -> u64 {
        let time = (self.time_counter + 1).max(elapsed_ms());
        self.time_counter = time;
        time
    }
}
