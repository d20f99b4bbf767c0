//! Per-agent transport policy hooks.
//!
//! Different ACP agents misbehave in different ways: some print banners to
//! stdout before their first JSON line, some report every tool as `other`,
//! some run investigation tools for many minutes. [`TransportHooks`] keeps
//! that vendor tuning out of the backend core — every hook has a documented
//! default and the backend only ever talks to the trait.

use std::time::Duration;

use serde_json::Value;

use crate::message::AgentMessage;

/// Default timeout for the `initialize`/`newSession` handshake.
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default quiet interval after the last text chunk before `idle` is emitted.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(500);

/// Default maximum lifetime of a single tool call.
pub const DEFAULT_TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// What to do with one line of child stdout before JSON parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineDisposition {
    /// Forward the line unchanged.
    Pass,
    /// Substitute the line with the given replacement.
    Replace(String),
    /// Discard the line. Dropped lines are counted and logged at dispose.
    Drop,
}

/// Context handed to [`TransportHooks::determine_tool_name`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ToolNameContext {
    /// Tool calls observed since the last prompt was sent.
    pub tool_calls_since_prompt: u32,
    /// Whether the last prompt looked like a title-change request.
    pub recent_prompt_had_change_title: bool,
}

/// Per-agent transport tuning consumed by the backend.
///
/// All hooks are optional in the sense that the default method bodies
/// implement the documented baseline behavior; agent-specific transports
/// override only what they need.
pub trait TransportHooks: Send + Sync {
    /// Timeout for one `initialize`/`newSession` handshake attempt.
    fn init_timeout(&self) -> Duration {
        DEFAULT_INIT_TIMEOUT
    }

    /// Quiet interval after the last text chunk before `idle` is emitted.
    fn idle_timeout(&self) -> Duration {
        DEFAULT_IDLE_TIMEOUT
    }

    /// Maximum lifetime of the given tool call.
    fn tool_call_timeout(&self, _call_id: &str, _kind: &str) -> Duration {
        DEFAULT_TOOL_CALL_TIMEOUT
    }

    /// Whether the tool is a long-running investigation tool.
    ///
    /// Investigation tools get their (typically extended) timeout from
    /// [`Self::tool_call_timeout`] and their elapsed time is additionally
    /// logged in minutes.
    fn is_investigation_tool(&self, _call_id: &str, _kind: &str) -> bool {
        false
    }

    /// Recover a tool name from the call id when the reported `kind` is
    /// unreliable. `None` leaves the `kind` in charge.
    fn extract_tool_name_from_id(&self, _call_id: &str) -> Option<String> {
        None
    }

    /// Resolve generic kinds (`other`, `Unknown`) into a concrete tool name.
    ///
    /// The default is the identity on `kind`.
    fn determine_tool_name(
        &self,
        kind: &str,
        _call_id: &str,
        _input: &Value,
        _ctx: ToolNameContext,
    ) -> String {
        kind.to_owned()
    }

    /// Filter one line of child stdout before JSON parsing.
    fn filter_stdout_line(&self, _line: &str) -> LineDisposition {
        LineDisposition::Pass
    }

    /// Inspect a chunk of child stderr; may synthesize an agent-message.
    ///
    /// The chunk is logged regardless of the return value.
    fn handle_stderr(&self, _text: &str) -> Option<AgentMessage> {
        None
    }

    /// Whether the given prompt asks the agent to change a session title.
    ///
    /// Feeds `recent_prompt_had_change_title` in [`ToolNameContext`] so
    /// name heuristics can distinguish title-change tool calls.
    fn prompt_requests_title_change(&self, _prompt: &str) -> bool {
        false
    }
}

/// Baseline transport: every hook at its documented default.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTransport;

impl TransportHooks for DefaultTransport {}

/// Transport with timeout values supplied by the configuration file.
///
/// Keeps the hook trait as the only channel between configuration and the
/// backend; everything not overridden falls through to the defaults.
#[derive(Debug, Clone, Copy)]
pub struct ConfiguredTransport {
    init: Duration,
    idle: Duration,
    tool_call: Duration,
}

impl ConfiguredTransport {
    /// Build a transport from explicit timeout values.
    #[must_use]
    pub fn new(init: Duration, idle: Duration, tool_call: Duration) -> Self {
        Self {
            init,
            idle,
            tool_call,
        }
    }
}

impl Default for ConfiguredTransport {
    fn default() -> Self {
        Self {
            init: DEFAULT_INIT_TIMEOUT,
            idle: DEFAULT_IDLE_TIMEOUT,
            tool_call: DEFAULT_TOOL_CALL_TIMEOUT,
        }
    }
}

impl TransportHooks for ConfiguredTransport {
    fn init_timeout(&self) -> Duration {
        self.init
    }

    fn idle_timeout(&self) -> Duration {
        self.idle
    }

    fn tool_call_timeout(&self, _call_id: &str, _kind: &str) -> Duration {
        self.tool_call
    }
}
