//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing, CLI usage, or validation failure.
    Config(String),
    /// Child process could not be spawned or its environment is unusable
    /// (`ENOENT`, `EACCES`, `EPIPE`). Never retried.
    Spawn(String),
    /// The `initialize`/`newSession` exchange failed or timed out. Retryable.
    Handshake(String),
    /// JSON-RPC connection failure (stream closed, write failed).
    Rpc(String),
    /// Error object reported by the agent in a JSON-RPC response.
    Protocol {
        /// JSON-RPC error code, when the agent supplied one.
        code: Option<i64>,
        /// Human-readable error message.
        message: String,
    },
    /// ACP wire anomaly (oversized line, malformed frame).
    Acp(String),
    /// Relay session failure when forwarding envelopes or metadata.
    Relay(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Handshake(msg) => write!(f, "handshake: {msg}"),
            Self::Rpc(msg) => write!(f, "rpc: {msg}"),
            Self::Protocol { code, message } => match code {
                Some(code) => write!(f, "protocol error {code}: {message}"),
                None => write!(f, "protocol error: {message}"),
            },
            Self::Acp(msg) => write!(f, "acp: {msg}"),
            Self::Relay(msg) => write!(f, "relay: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl AppError {
    /// Classify a spawn-time I/O error.
    ///
    /// `ENOENT`, `EACCES`, and `EPIPE` identify a broken environment rather
    /// than a transient failure; the handshake retry loop must not wait out
    /// its timeout for these.
    pub fn from_spawn_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => Self::Spawn(format!("command not found (ENOENT): {err}")),
            ErrorKind::PermissionDenied => {
                Self::Spawn(format!("permission denied (EACCES): {err}"))
            }
            ErrorKind::BrokenPipe => Self::Spawn(format!("broken pipe (EPIPE): {err}")),
            _ => Self::Spawn(err.to_string()),
        }
    }

    /// Whether a failed handshake attempt may be retried.
    ///
    /// Spawn/environment errors are terminal; everything else (timeouts,
    /// transient RPC failures) gets another attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Spawn(_))
    }
}
