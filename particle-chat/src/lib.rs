//! Conversation controller for particle
//!
//! Owns the multi-session [`ConversationState`] and drives the send
//! lifecycle against a [`ChatTransport`](particle_transport::ChatTransport).

pub mod controller;
pub mod events;
pub mod state;

pub use controller::{ConversationController, PendingSend, SendOutcome, SendRejected};
pub use events::ConversationEvent;
pub use state::{ConversationState, SessionIndex};
