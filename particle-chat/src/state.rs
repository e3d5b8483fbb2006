//! Multi-session conversation state
//!
//! Holds the ordered session list, the active-session pointer, the in-flight
//! flag and the last surfaced error. Sessions are never removed or
//! reordered, so a [`SessionIndex`] stays valid for the life of the state.
//!
//! Everything that changes the state is crate-private; outside this crate
//! the state is reachable only as `&ConversationState` through the
//! controller.

use particle_core::session::{ChatMessage, ChatSession};
use tracing::warn;

/// Stable position of a session in the conversation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionIndex(usize);

impl SessionIndex {
    pub fn get(self) -> usize {
        self.0
    }
}

impl From<SessionIndex> for usize {
    fn from(index: SessionIndex) -> Self {
        index.0
    }
}

impl std::fmt::Display for SessionIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sessions, the active pointer, and send status
///
/// Starts with one empty session and never drops below one.
#[derive(Debug, Clone)]
pub struct ConversationState {
    sessions: Vec<ChatSession>,
    active: usize,
    pending: bool,
    last_error: Option<String>,
}

impl ConversationState {
    pub(crate) fn new() -> Self {
        Self {
            sessions: vec![ChatSession::new()],
            active: 0,
            pending: false,
            last_error: None,
        }
    }

    /// All sessions in display order
    pub fn sessions(&self) -> &[ChatSession] {
        &self.sessions
    }

    pub fn session(&self, index: SessionIndex) -> &ChatSession {
        &self.sessions[index.0]
    }

    /// Number of sessions, always at least one
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn active_index(&self) -> SessionIndex {
        SessionIndex(self.active)
    }

    pub fn active_session(&self) -> &ChatSession {
        &self.sessions[self.active]
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Index for a raw position if it names an existing session
    pub fn index(&self, position: usize) -> Option<SessionIndex> {
        (position < self.sessions.len()).then_some(SessionIndex(position))
    }

    /// Display label for a session, `Chat 1` for the first
    pub fn title(&self, index: SessionIndex) -> String {
        format!("Chat {}", index.0 + 1)
    }

    /// Append an empty session, make it active and clear the error
    pub(crate) fn create_session(&mut self) -> SessionIndex {
        self.sessions.push(ChatSession::new());
        self.active = self.sessions.len() - 1;
        self.last_error = None;
        SessionIndex(self.active)
    }

    /// Make the session at `position` active and clear the error.
    ///
    /// Callers only pass positions they enumerated from [`Self::sessions`];
    /// anything else is a programming error. Debug builds assert; release
    /// builds log and leave the state untouched.
    pub(crate) fn select_session(&mut self, position: usize) -> Option<SessionIndex> {
        debug_assert!(
            position < self.sessions.len(),
            "session position {} out of range (len {})",
            position,
            self.sessions.len()
        );
        let Some(index) = self.index(position) else {
            warn!(
                position,
                len = self.sessions.len(),
                "Ignoring selection of unknown session"
            );
            return None;
        };
        self.active = index.0;
        self.last_error = None;
        Some(index)
    }

    /// Append a message to the log of `index`
    pub(crate) fn append_message(&mut self, index: SessionIndex, message: ChatMessage) {
        self.sessions[index.0].push(message);
    }

    /// One-time assignment of the server identifier; see [`ChatSession::session_id`]
    pub(crate) fn backfill_session_id(&mut self, index: SessionIndex, session_id: &str) -> bool {
        self.sessions[index.0].backfill_session_id(session_id)
    }

    pub(crate) fn set_pending(&mut self, pending: bool) {
        self.pending = pending;
    }

    pub(crate) fn set_error(&mut self, error: Option<String>) {
        self.last_error = error;
    }
}
