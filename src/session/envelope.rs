//! Session envelopes — the external, time-ordered stream consumed by the
//! relay.
//!
//! Envelopes are small, self-describing, and serialized with kebab-case
//! tags. Ordering is carried by `time`, which strictly increases across
//! every envelope one mapper emits; grouping is carried by `turn`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Terminal disposition of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    /// The agent finished and went idle.
    Completed,
    /// The turn ended with an error.
    Failed,
    /// The turn was cancelled by the operator.
    Cancelled,
}

/// Envelope payload variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EnvelopeEvent {
    /// A turn opened.
    TurnStart,
    /// A turn closed with the given status.
    TurnEnd {
        /// How the turn ended.
        status: TurnStatus,
    },
    /// Coalesced assistant text; `thinking` marks reasoning output.
    Text {
        /// The text block.
        text: String,
        /// Present and `true` for thinking output.
        #[serde(skip_serializing_if = "Option::is_none")]
        thinking: Option<bool>,
    },
    /// A tool call became visible.
    ToolCallStart {
        /// Stable envelope-side call id.
        call: String,
        /// Tool name.
        name: String,
        /// Display title (equal to the tool name in this core).
        title: String,
        /// Display description (equal to the tool name in this core).
        description: String,
        /// Invocation arguments.
        args: Value,
    },
    /// The matching tool call finished.
    ToolCallEnd {
        /// Call id from the paired `ToolCallStart`.
        call: String,
    },
}

/// One unit of the relay stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEnvelope {
    /// Fresh opaque id, unique within the process.
    pub id: String,
    /// Strictly increasing emission time (milliseconds scale).
    pub time: u64,
    /// Turn this envelope belongs to; absent for late flushes after a
    /// turn already closed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn: Option<String>,
    /// Payload.
    pub ev: EnvelopeEvent,
}
