//! Session data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Bot,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Bot => "bot",
        }
    }
}

/// A document the service cited for an answer
///
/// Only `relevant_doc` is guaranteed; every other field the service sends
/// is kept in `extra` untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub relevant_doc: String,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// A chat message
///
/// Fields are private: once a message is in a session log it can only be read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    id: String,
    text: String,
    sender: Sender,
    created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    sources: Vec<SourceDocument>,
}

impl ChatMessage {
    /// Create a message authored by the user
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Sender::User, text.into(), Vec::new())
    }

    /// Create a reply from the service with the documents it cited
    pub fn bot(text: impl Into<String>, sources: Vec<SourceDocument>) -> Self {
        Self::new(Sender::Bot, text.into(), sources)
    }

    fn new(sender: Sender, text: String, sources: Vec<SourceDocument>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text,
            sender,
            created_at: Utc::now(),
            sources,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn sender(&self) -> Sender {
        self.sender
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn sources(&self) -> &[SourceDocument] {
        &self.sources
    }
}

/// One conversation thread
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    session_id: Option<String>,
    messages: Vec<ChatMessage>,
    created_at: DateTime<Utc>,
}

impl ChatSession {
    /// Create an empty session with no server identifier
    pub fn new() -> Self {
        Self {
            session_id: None,
            messages: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Server-assigned identifier, `None` until the first successful exchange
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Messages in display order
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Append a message to the end of the log
    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Assign the server identifier if none is set yet.
    ///
    /// Returns true when the identifier was assigned by this call. Empty
    /// identifiers are ignored.
    pub fn backfill_session_id(&mut self, session_id: &str) -> bool {
        if self.session_id.is_some() || session_id.is_empty() {
            return false;
        }
        self.session_id = Some(session_id.to_string());
        true
    }
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new()
    }
}
