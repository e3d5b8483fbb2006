//! Transport client for particle
//!
//! This crate talks to the remote question-answering endpoint. Every failure
//! shape the endpoint or the network can produce is normalized into one
//! [`TransportError`] so callers never branch on payload shape.

pub mod base;
pub mod http;

pub use base::{ChatReply, ChatRequest, ChatTransport, TransportError, TransportResult};
pub use http::HttpTransport;
