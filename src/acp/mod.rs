//! Agent Client Protocol (ACP) wire layer.
//!
//! Everything between the agent's stdio and the backend's typed world:
//!
//! - [`codec`]: ndJSON framing with a 1 MiB per-line limit and EOF flush.
//! - [`rpc`]: bidirectional JSON-RPC connection — outbound requests with
//!   reply correlation, inbound notification/request dispatch, the single
//!   writer task that owns the agent's stdin.
//! - [`spawner`]: process spawning, stderr logging, and the exit monitor
//!   that owns the child and performs graceful termination.
//! - [`handshake`]: the `initialize` / `newSession` exchange with retry
//!   and out-of-band abort on child exit.

pub mod codec;
pub mod handshake;
pub mod rpc;
pub mod spawner;
