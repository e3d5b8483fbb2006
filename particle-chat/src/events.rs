//! Change notifications emitted by the controller

use particle_core::session::Sender;

use crate::state::SessionIndex;

/// Something in the conversation state changed
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    /// A new empty session was appended and made active
    SessionCreated { index: SessionIndex },
    /// The active session changed
    SessionSelected { index: SessionIndex },
    /// A message was appended to a session log
    MessageAppended {
        index: SessionIndex,
        message_id: String,
        sender: Sender,
    },
    /// The server identifier was assigned to a session
    SessionIdAssigned {
        index: SessionIndex,
        session_id: String,
    },
    PendingChanged { pending: bool },
    ErrorChanged { error: Option<String> },
}

impl ConversationEvent {
    /// Session the event concerns, if it is about a single session
    pub fn session(&self) -> Option<SessionIndex> {
        match self {
            Self::SessionCreated { index }
            | Self::SessionSelected { index }
            | Self::MessageAppended { index, .. }
            | Self::SessionIdAssigned { index, .. } => Some(*index),
            Self::PendingChanged { .. } | Self::ErrorChanged { .. } => None,
        }
    }
}
