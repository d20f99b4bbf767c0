//! Session-envelope stream production.
//!
//! - [`envelope`]: the external envelope types, serde-tagged for the relay.
//! - [`mapper`]: the turn mapper projecting agent-messages into envelopes.

pub mod envelope;
pub mod mapper;

pub use envelope::{EnvelopeEvent, SessionEnvelope, TurnStatus};
pub use mapper::TurnMapper;
