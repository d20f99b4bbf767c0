#![forbid(unsafe_code)]

//! Runner and protocol adapter for Agent Client Protocol (ACP) coding
//! agents.
//!
//! Spawns an ACP-speaking child process, speaks ndJSON JSON-RPC to it,
//! and projects the agent's session updates into a time-ordered session
//! envelope stream for a remote control surface.

pub mod acp;
pub mod backend;
pub mod config;
pub mod errors;
pub mod message;
pub mod metadata;
pub mod runner;
pub mod session;
pub mod transport;

pub use errors::{AppError, Result};
