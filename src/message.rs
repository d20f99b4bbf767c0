//! The flat agent-message stream emitted by the backend.
//!
//! Every observable effect of the agent process — streamed text, tool-call
//! lifecycle, capability updates, permission traffic, status transitions —
//! is normalized into one [`AgentMessage`] variant before it reaches the
//! turn mapper or the runner. Nothing else crosses the backend boundary.

use serde_json::Value;

/// Coarse backend status, reported alongside an optional detail string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Child spawned, handshake in progress.
    Starting,
    /// A prompt or tool call is in flight.
    Running,
    /// All text streams settled and no tool call is active.
    Idle,
    /// A failure was surfaced; the detail carries the cause.
    Error,
    /// The session was cancelled or the agent process ended.
    Stopped,
}

impl SessionStatus {
    /// Stable lowercase name used in logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }
}

/// Messages emitted by the backend into the shared agent-message channel.
#[derive(Debug, Clone)]
pub enum AgentMessage {
    /// Status transition, with an optional human-readable detail.
    Status {
        /// New backend status.
        status: SessionStatus,
        /// Cause or context (error text, exit reason).
        detail: Option<String>,
    },
    /// Streamed assistant text.
    ModelOutput {
        /// Incremental text chunk.
        text_delta: String,
    },
    /// A tool call started on the agent side.
    ToolCall {
        /// Agent-assigned tool-call identifier.
        call_id: String,
        /// Resolved tool name.
        tool_name: String,
        /// Parsed invocation arguments.
        args: Value,
    },
    /// A tool call reached a terminal state (or a permission decision
    /// was synthesized for it).
    ToolResult {
        /// Identifier of the originating tool call.
        call_id: String,
        /// Resolved tool name.
        tool_name: String,
        /// Result payload; `{error, status}` for failures.
        result: Value,
    },
    /// Named side-channel event.
    ///
    /// Carrier for `thinking`, `plan`, `available_commands`,
    /// `config_options_update`, `modes_update`, `current_mode_update`,
    /// and `models_update`.
    Event {
        /// Event name.
        name: String,
        /// Event payload, shape depends on `name`.
        payload: Value,
    },
    /// The agent asked for permission to run a tool.
    PermissionRequest {
        /// Permission id; equals the tool-call id it guards.
        id: String,
        /// Short reason shown to the operator (the tool name).
        reason: String,
        /// Raw request parameters for richer UIs.
        payload: Value,
    },
    /// An operator answered a permission request out-of-band.
    PermissionResponse {
        /// Permission id being answered.
        id: String,
        /// Whether the operator approved.
        approved: bool,
    },
    /// Token usage snapshot. Ignored by the turn mapper.
    TokenCount {
        /// Total tokens consumed so far.
        total: u64,
    },
    /// File-system edit notification. Ignored by the turn mapper.
    FsEdit {
        /// Raw notification payload.
        payload: Value,
    },
    /// Terminal output notification. Ignored by the turn mapper.
    TerminalOutput {
        /// Raw notification payload.
        payload: Value,
    },
}

impl AgentMessage {
    /// Shorthand for a status message without detail.
    #[must_use]
    pub fn status(status: SessionStatus) -> Self {
        Self::Status {
            status,
            detail: None,
        }
    }

    /// Shorthand for a status message with detail.
    #[must_use]
    pub fn status_with_detail(status: SessionStatus, detail: impl Into<String>) -> Self {
        Self::Status {
            status,
            detail: Some(detail.into()),
        }
    }
}
