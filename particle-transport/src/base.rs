//! Base trait and wire types for the chat transport

use async_trait::async_trait;
use particle_core::session::SourceDocument;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Message used when the service signals failure without saying why
pub const GENERIC_FAILURE: &str = "Failed to send message";

/// Error type for transport operations
///
/// The `Display` output is what gets shown to the user.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("network error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("timeout of {timeout_ms}ms exceeded")]
    Timeout { timeout_ms: u128 },

    #[error("Request failed with status code {0}")]
    Status(u16),

    #[error("{0}")]
    Api(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Request body sent to the chat route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    pub session_id: Option<String>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>, session_id: Option<String>) -> Self {
        Self {
            message: message.into(),
            session_id,
        }
    }
}

/// Successful reply from the chat route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatReply {
    pub answer: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub source_doc: Vec<SourceDocument>,
}

impl ChatReply {
    pub fn new(answer: impl Into<String>, session_id: Option<String>) -> Self {
        Self {
            answer: answer.into(),
            session_id,
            source_doc: Vec::new(),
        }
    }
}

/// A client able to deliver one user message and return the service's reply
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send `request` and wait for the reply or a normalized failure
    async fn send(&self, request: ChatRequest) -> TransportResult<ChatReply>;
}
