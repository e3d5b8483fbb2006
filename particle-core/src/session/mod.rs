//! Chat sessions and messages
//!
//! Sessions live only in memory for the lifetime of the client; the
//! server-assigned identifier is what links a session to its history on
//! the remote side.

pub mod store;

pub use store::{ChatMessage, ChatSession, Sender, SourceDocument};
