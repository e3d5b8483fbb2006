//! Send lifecycle over the multi-session conversation state
//!
//! A send runs in three phases so the caller never holds the controller
//! borrowed across the network wait:
//!
//! 1. [`ConversationController::begin_send`] appends the user message to the
//!    active session, raises the pending flag and captures the target session.
//! 2. [`PendingSend::dispatch`] performs the request without touching state.
//! 3. [`ConversationController::complete_send`] applies the reply (or the
//!    failure) to the captured session and lowers the pending flag.
//!
//! [`ConversationController::send_message`] runs all three in sequence.
//!
//! Each send carries an id; an outcome is applied only by the controller
//! whose in-flight send it belongs to.

use particle_core::session::{ChatMessage, ChatSession, Sender};
use particle_core::utils::truncate;
use particle_transport::{ChatReply, ChatRequest, ChatTransport, TransportResult};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::events::ConversationEvent;
use crate::state::{ConversationState, SessionIndex};

/// Buffered events per subscriber before the slowest one starts lagging
const EVENT_CAPACITY: usize = 256;

/// Characters of message text included in log lines
const LOG_PREVIEW_LEN: usize = 60;

/// Send ids are unique across every controller in the process
static NEXT_SEND_ID: AtomicU64 = AtomicU64::new(1);

/// Why a send was not started
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendRejected {
    #[error("message is empty")]
    Empty,

    #[error("a message is already being sent")]
    InFlight,
}

/// A started send waiting to be dispatched
#[derive(Debug)]
pub struct PendingSend {
    id: u64,
    target: SessionIndex,
    request: ChatRequest,
}

impl PendingSend {
    /// Session the reply will be applied to
    pub fn target(&self) -> SessionIndex {
        self.target
    }

    pub fn request(&self) -> &ChatRequest {
        &self.request
    }

    /// Run the request. Never fails: transport errors are carried in the outcome.
    pub async fn dispatch(self, transport: &dyn ChatTransport) -> SendOutcome {
        let PendingSend {
            id,
            target,
            request,
        } = self;
        let result = transport.send(request).await;
        SendOutcome { id, target, result }
    }
}

/// Result of a dispatched send, ready for [`ConversationController::complete_send`]
#[derive(Debug)]
pub struct SendOutcome {
    id: u64,
    target: SessionIndex,
    result: TransportResult<ChatReply>,
}

impl SendOutcome {
    pub fn target(&self) -> SessionIndex {
        self.target
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Owner of the conversation state and the only way to mutate it
pub struct ConversationController {
    state: ConversationState,
    transport: Arc<dyn ChatTransport>,
    events: broadcast::Sender<ConversationEvent>,
    in_flight: Option<u64>,
}

impl ConversationController {
    /// Create a controller with one empty active session
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: ConversationState::new(),
            transport,
            events,
            in_flight: None,
        }
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    pub fn active_session(&self) -> &ChatSession {
        self.state.active_session()
    }

    pub fn active_index(&self) -> SessionIndex {
        self.state.active_index()
    }

    pub fn is_pending(&self) -> bool {
        self.state.is_pending()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.state.last_error()
    }

    /// Shared handle to the transport, for dispatching outside the controller
    pub fn transport(&self) -> Arc<dyn ChatTransport> {
        Arc::clone(&self.transport)
    }

    /// Receive a [`ConversationEvent`] for every later state change
    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.events.subscribe()
    }

    /// Append a new empty session and make it active
    pub fn create_session(&mut self) -> SessionIndex {
        let had_error = self.state.last_error().is_some();
        let index = self.state.create_session();
        info!(session = index.get(), total = self.state.len(), "Created chat session");

        self.emit(ConversationEvent::SessionCreated { index });
        if had_error {
            self.emit(ConversationEvent::ErrorChanged { error: None });
        }
        index
    }

    /// Make the session at `position` active.
    ///
    /// Positions come from enumerating [`ConversationState::sessions`]; an
    /// unknown position leaves the state unchanged and returns `None`.
    pub fn select_session(&mut self, position: usize) -> Option<SessionIndex> {
        let had_error = self.state.last_error().is_some();
        let index = self.state.select_session(position)?;
        debug!(session = index.get(), "Selected chat session");

        self.emit(ConversationEvent::SessionSelected { index });
        if had_error {
            self.emit(ConversationEvent::ErrorChanged { error: None });
        }
        Some(index)
    }

    /// Continue a server conversation whose identifier is already known.
    ///
    /// Reuses the active session when it is still blank, otherwise creates one.
    pub fn resume_session(&mut self, session_id: &str) -> SessionIndex {
        let active = self.state.active_session();
        let index = if active.is_empty() && active.session_id().is_none() {
            self.state.active_index()
        } else {
            self.create_session()
        };

        if self.state.backfill_session_id(index, session_id) {
            info!(session = index.get(), session_id, "Resumed server session");
            self.emit(ConversationEvent::SessionIdAssigned {
                index,
                session_id: session_id.to_string(),
            });
        }
        index
    }

    /// Optimistically record `text` in the active session and prepare its request.
    ///
    /// Whitespace-only text and sends while another is in flight are rejected
    /// without touching state.
    pub fn begin_send(&mut self, text: &str) -> Result<PendingSend, SendRejected> {
        let text = text.trim();
        if text.is_empty() {
            debug!("Ignoring empty message");
            return Err(SendRejected::Empty);
        }
        if self.state.is_pending() {
            warn!(
                preview = %truncate(text, LOG_PREVIEW_LEN),
                "Rejecting message while another is in flight"
            );
            return Err(SendRejected::InFlight);
        }

        let target = self.state.active_index();
        self.append(target, ChatMessage::user(text));
        self.set_pending(true);
        self.clear_error();

        let id = NEXT_SEND_ID.fetch_add(1, Ordering::Relaxed);
        self.in_flight = Some(id);

        let session_id = self.state.session(target).session_id().map(str::to_string);
        debug!(
            send = id,
            session = target.get(),
            session_id = ?session_id,
            preview = %truncate(text, LOG_PREVIEW_LEN),
            "Dispatching message"
        );

        Ok(PendingSend {
            id,
            target,
            request: ChatRequest::new(text, session_id),
        })
    }

    /// Apply a dispatched send to the session captured by [`Self::begin_send`].
    ///
    /// An outcome that does not belong to this controller's in-flight send
    /// is logged and dropped without touching state.
    pub fn complete_send(&mut self, outcome: SendOutcome) {
        let SendOutcome { id, target, result } = outcome;

        if self.in_flight != Some(id) {
            warn!(
                send = id,
                in_flight = ?self.in_flight,
                "Ignoring outcome of a send that is not in flight"
            );
            return;
        }
        self.in_flight = None;
        let Some(target) = self.state.index(target.get()) else {
            warn!(send = id, session = target.get(), "Dropping outcome for unknown session");
            self.set_pending(false);
            return;
        };

        match result {
            Ok(reply) => {
                let ChatReply {
                    answer,
                    session_id,
                    source_doc,
                } = reply;
                self.append(target, ChatMessage::bot(answer, source_doc));

                if let Some(session_id) = session_id {
                    if self.state.backfill_session_id(target, &session_id) {
                        info!(session = target.get(), %session_id, "Assigned server session id");
                        self.emit(ConversationEvent::SessionIdAssigned {
                            index: target,
                            session_id,
                        });
                    } else if self.state.session(target).session_id() != Some(session_id.as_str())
                    {
                        debug!(
                            session = target.get(),
                            ignored = %session_id,
                            "Keeping previously assigned session id"
                        );
                    }
                }
            }
            Err(err) => {
                let message = err.to_string();
                warn!(session = target.get(), "Send failed: {}", message);
                self.state.set_error(Some(message.clone()));
                self.emit(ConversationEvent::ErrorChanged {
                    error: Some(message),
                });
            }
        }

        self.set_pending(false);
    }

    /// Send `text` from the active session and wait for the outcome.
    ///
    /// Returns the session the exchange was recorded in. Transport failures
    /// are not returned; they land in [`Self::last_error`].
    pub async fn send_message(&mut self, text: &str) -> Result<SessionIndex, SendRejected> {
        let pending = self.begin_send(text)?;
        let target = pending.target();
        let transport = self.transport();
        let outcome = pending.dispatch(transport.as_ref()).await;
        self.complete_send(outcome);
        Ok(target)
    }

    fn append(&mut self, index: SessionIndex, message: ChatMessage) {
        let message_id = message.id().to_string();
        let sender: Sender = message.sender();
        self.state.append_message(index, message);
        self.emit(ConversationEvent::MessageAppended {
            index,
            message_id,
            sender,
        });
    }

    fn set_pending(&mut self, pending: bool) {
        if self.state.is_pending() != pending {
            self.state.set_pending(pending);
            self.emit(ConversationEvent::PendingChanged { pending });
        }
    }

    fn clear_error(&mut self) {
        if self.state.last_error().is_some() {
            self.state.set_error(None);
            self.emit(ConversationEvent::ErrorChanged { error: None });
        }
    }

    fn emit(&self, event: ConversationEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use particle_core::session::SourceDocument;
    use particle_transport::TransportError;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};

    /// Replays canned results in order and records every request
    struct ScriptedTransport {
        replies: Mutex<VecDeque<TransportResult<ChatReply>>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<TransportResult<ChatReply>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<ChatRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn send(&self, request: ChatRequest) -> TransportResult<ChatReply> {
            self.requests.lock().unwrap().push(request);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Api("no scripted reply".to_string())))
        }
    }

    fn reply(answer: &str, session_id: &str) -> TransportResult<ChatReply> {
        Ok(ChatReply::new(answer, Some(session_id.to_string())))
    }

    fn failure(message: &str) -> TransportResult<ChatReply> {
        Err(TransportError::Api(message.to_string()))
    }

    fn drain(rx: &mut broadcast::Receiver<ConversationEvent>) -> Vec<ConversationEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_first_exchange_assigns_session_id() {
        let transport = ScriptedTransport::new(vec![reply("Unplug for 10 seconds.", "abc123")]);
        let mut controller = ConversationController::new(transport.clone());

        let target = assert_ok!(
            controller
                .send_message("How do I reset my dishwasher?")
                .await
        );

        let session = controller.state().session(target);
        assert_eq!(session.messages().len(), 2);
        assert_eq!(session.messages()[0].sender(), Sender::User);
        assert_eq!(session.messages()[0].text(), "How do I reset my dishwasher?");
        assert_eq!(session.messages()[1].sender(), Sender::Bot);
        assert_eq!(session.messages()[1].text(), "Unplug for 10 seconds.");
        assert_eq!(session.session_id(), Some("abc123"));
        assert!(!controller.is_pending());
        assert!(controller.last_error().is_none());

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].session_id, None);
    }

    #[tokio::test]
    async fn test_failed_send_keeps_optimistic_message() {
        let transport = ScriptedTransport::new(vec![failure("timeout")]);
        let mut controller = ConversationController::new(transport);

        assert_ok!(controller.send_message("Is part PS11752778 in stock?").await);

        let session = controller.active_session();
        assert_eq!(session.messages().len(), 1);
        assert_eq!(session.messages()[0].sender(), Sender::User);
        assert_eq!(session.session_id(), None);
        assert!(!controller.is_pending());
        assert_eq!(controller.last_error(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_session_id_is_assigned_once() {
        let transport = ScriptedTransport::new(vec![
            reply("first", "S1"),
            failure("Request failed with status code 502"),
            reply("third", "S2"),
        ]);
        let mut controller = ConversationController::new(transport.clone());

        controller.send_message("one").await.unwrap();
        assert_eq!(controller.active_session().session_id(), Some("S1"));

        controller.send_message("two").await.unwrap();
        assert_eq!(controller.active_session().session_id(), Some("S1"));

        controller.send_message("three").await.unwrap();
        assert_eq!(controller.active_session().session_id(), Some("S1"));
        assert_eq!(controller.active_session().messages().len(), 5);

        let sent: Vec<_> = transport
            .requests()
            .into_iter()
            .map(|r| r.session_id)
            .collect();
        assert_eq!(
            sent,
            vec![None, Some("S1".to_string()), Some("S1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_empty_session_id_in_reply_is_not_assigned() {
        let transport = ScriptedTransport::new(vec![reply("hi", ""), reply("again", "S9")]);
        let mut controller = ConversationController::new(transport);

        controller.send_message("hello").await.unwrap();
        assert_eq!(controller.active_session().session_id(), None);

        controller.send_message("hello?").await.unwrap();
        assert_eq!(controller.active_session().session_id(), Some("S9"));
    }

    #[tokio::test]
    async fn test_whitespace_only_send_is_noop() {
        let transport = ScriptedTransport::new(vec![reply("unused", "S1")]);
        let mut controller = ConversationController::new(transport.clone());
        let mut rx = controller.subscribe();

        let err = assert_err!(controller.send_message("   \n\t ").await);
        assert_eq!(err, SendRejected::Empty);
        assert!(controller.active_session().is_empty());
        assert!(!controller.is_pending());
        assert!(transport.requests().is_empty());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_text_is_trimmed_before_storing_and_sending() {
        let transport = ScriptedTransport::new(vec![reply("ok", "S1")]);
        let mut controller = ConversationController::new(transport.clone());

        controller.send_message("  water filter  \n").await.unwrap();

        assert_eq!(controller.active_session().messages()[0].text(), "water filter");
        assert_eq!(transport.requests()[0].message, "water filter");
    }

    #[test]
    fn test_second_send_while_pending_is_rejected() {
        let mut controller = ConversationController::new(ScriptedTransport::new(vec![]));

        let pending = controller.begin_send("first").unwrap();
        assert!(controller.is_pending());
        assert_eq!(controller.active_session().messages().len(), 1);

        assert_eq!(
            controller.begin_send("second").unwrap_err(),
            SendRejected::InFlight
        );
        assert_eq!(controller.active_session().messages().len(), 1);
        assert_eq!(pending.request().message, "first");
    }

    #[test]
    fn test_user_message_appended_before_dispatch() {
        let mut controller = ConversationController::new(ScriptedTransport::new(vec![]));
        let active = controller.active_index();

        let pending = controller.begin_send("where is my order").unwrap();

        assert_eq!(pending.target(), active);
        let messages = controller.active_session().messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text(), "where is my order");
        assert!(controller.is_pending());
    }

    #[tokio::test]
    async fn test_reply_lands_in_session_active_at_send_time() {
        let transport = ScriptedTransport::new(vec![reply("Here you go.", "first-session")]);
        let mut controller = ConversationController::new(transport.clone());

        let pending = controller.begin_send("question for chat 1").unwrap();
        let origin = pending.target();

        let other = controller.create_session();
        assert_eq!(controller.active_index(), other);

        let outcome = pending.dispatch(transport.as_ref()).await;
        assert!(outcome.is_success());
        controller.complete_send(outcome);

        let origin_session = controller.state().session(origin);
        assert_eq!(origin_session.messages().len(), 2);
        assert_eq!(origin_session.session_id(), Some("first-session"));

        assert_eq!(controller.active_index(), other);
        assert!(controller.active_session().is_empty());
        assert_eq!(controller.active_session().session_id(), None);
    }

    #[tokio::test]
    async fn test_outcome_delivered_from_spawned_task() {
        let transport = ScriptedTransport::new(vec![reply("Spawned answer.", "S7")]);
        let mut controller = ConversationController::new(transport);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let pending = controller.begin_send("hello from chat 1").unwrap();
        let origin = pending.target();
        let handle = controller.transport();
        tokio::spawn(async move {
            let outcome = pending.dispatch(handle.as_ref()).await;
            let _ = tx.send(outcome);
        });

        controller.create_session();
        controller.select_session(0);
        controller.create_session();

        let outcome = rx.recv().await.unwrap();
        controller.complete_send(outcome);

        assert_eq!(controller.state().len(), 3);
        assert_eq!(controller.active_index().get(), 2);
        assert_eq!(controller.state().session(origin).messages().len(), 2);
        assert_eq!(controller.state().session(origin).session_id(), Some("S7"));
        assert!(!controller.is_pending());
    }

    #[tokio::test]
    async fn test_bot_message_keeps_sources() {
        let doc: SourceDocument = serde_json::from_value(serde_json::json!({
            "relevant_doc": "Ice maker troubleshooting",
            "part_number": "PS11752778"
        }))
        .unwrap();
        let mut answer = ChatReply::new("Check the water inlet valve.", Some("S1".to_string()));
        answer.source_doc = vec![doc.clone()];

        let mut controller = ConversationController::new(ScriptedTransport::new(vec![Ok(answer)]));
        controller.send_message("ice maker not working").await.unwrap();

        let bot = &controller.active_session().messages()[1];
        assert_eq!(bot.sources(), &[doc]);
    }

    #[test]
    fn test_create_session_grows_and_activates() {
        let mut controller = ConversationController::new(ScriptedTransport::new(vec![]));

        for expected_len in 2..=6 {
            let index = controller.create_session();
            assert_eq!(controller.state().len(), expected_len);
            assert_eq!(controller.active_index(), index);
            assert_eq!(index.get(), expected_len - 1);
            assert!(controller.active_session().is_empty());
        }
    }

    #[tokio::test]
    async fn test_switching_sessions_clears_error() {
        let transport = ScriptedTransport::new(vec![failure("boom"), failure("boom again")]);
        let mut controller = ConversationController::new(transport);

        controller.send_message("hi").await.unwrap();
        assert_eq!(controller.last_error(), Some("boom"));
        controller.create_session();
        assert!(controller.last_error().is_none());

        controller.send_message("hi").await.unwrap();
        assert_eq!(controller.last_error(), Some("boom again"));
        controller.select_session(0);
        assert!(controller.last_error().is_none());
        assert_eq!(controller.active_index().get(), 0);
    }

    #[tokio::test]
    async fn test_new_send_clears_previous_error() {
        let transport = ScriptedTransport::new(vec![failure("boom"), reply("fine", "S1")]);
        let mut controller = ConversationController::new(transport);

        controller.send_message("first").await.unwrap();
        assert!(controller.last_error().is_some());

        controller.begin_send("second").map(|_| ()).unwrap();
        assert!(controller.last_error().is_none());
    }

    #[tokio::test]
    async fn test_events_follow_send_lifecycle() {
        let transport = ScriptedTransport::new(vec![reply("Unplug for 10 seconds.", "abc123")]);
        let mut controller = ConversationController::new(transport);
        let mut rx = controller.subscribe();

        let target = controller.send_message("reset?").await.unwrap();
        let events = drain(&mut rx);

        assert_eq!(events.len(), 5);
        assert!(matches!(
            events[0],
            ConversationEvent::MessageAppended { sender: Sender::User, .. }
        ));
        assert_eq!(events[1], ConversationEvent::PendingChanged { pending: true });
        assert!(matches!(
            events[2],
            ConversationEvent::MessageAppended { sender: Sender::Bot, .. }
        ));
        assert_eq!(
            events[3],
            ConversationEvent::SessionIdAssigned {
                index: target,
                session_id: "abc123".to_string()
            }
        );
        assert_eq!(events[4], ConversationEvent::PendingChanged { pending: false });
    }

    #[tokio::test]
    async fn test_failure_event_carries_message() {
        let transport = ScriptedTransport::new(vec![failure("timeout of 30000ms exceeded")]);
        let mut controller = ConversationController::new(transport);
        let mut rx = controller.subscribe();

        controller.send_message("hello").await.unwrap();
        let events = drain(&mut rx);

        assert!(events.contains(&ConversationEvent::ErrorChanged {
            error: Some("timeout of 30000ms exceeded".to_string())
        }));
        assert_eq!(
            events.last(),
            Some(&ConversationEvent::PendingChanged { pending: false })
        );
    }

    #[test]
    fn test_resume_session_reuses_blank_session() {
        let mut controller = ConversationController::new(ScriptedTransport::new(vec![]));

        let index = controller.resume_session("existing-42");
        assert_eq!(index.get(), 0);
        assert_eq!(controller.state().len(), 1);
        assert_eq!(controller.active_session().session_id(), Some("existing-42"));

        let second = controller.resume_session("existing-43");
        assert_eq!(second.get(), 1);
        assert_eq!(controller.active_session().session_id(), Some("existing-43"));
    }

    #[tokio::test]
    async fn test_outcome_of_another_controllers_send_is_ignored() {
        let transport = ScriptedTransport::new(vec![
            reply("for the other controller", "other"),
            reply("for this controller", "mine"),
        ]);
        let mut other = ConversationController::new(transport.clone());
        other.create_session();
        other.create_session();
        let mut controller = ConversationController::new(transport.clone());

        let foreign = other.begin_send("sent from chat 3").unwrap();
        let own = controller.begin_send("sent from chat 1").unwrap();
        let foreign_outcome = foreign.dispatch(transport.as_ref()).await;
        assert_eq!(foreign_outcome.target().get(), 2);

        controller.complete_send(foreign_outcome);

        assert!(controller.is_pending());
        assert_eq!(controller.state().len(), 1);
        assert_eq!(controller.active_session().messages().len(), 1);
        assert_eq!(
            controller.begin_send("overlapping").unwrap_err(),
            SendRejected::InFlight
        );

        let own_outcome = own.dispatch(transport.as_ref()).await;
        controller.complete_send(own_outcome);
        assert!(!controller.is_pending());
        assert_eq!(controller.active_session().messages().len(), 2);
        assert_eq!(controller.active_session().session_id(), Some("mine"));
    }

    #[tokio::test]
    async fn test_outcome_without_send_in_flight_is_ignored() {
        let transport = ScriptedTransport::new(vec![reply("late answer", "S1")]);
        let mut sender = ConversationController::new(transport.clone());
        let mut idle = ConversationController::new(transport.clone());
        let mut rx = idle.subscribe();

        let pending = sender.begin_send("hello").unwrap();
        let outcome = pending.dispatch(transport.as_ref()).await;
        idle.complete_send(outcome);

        assert!(!idle.is_pending());
        assert!(idle.active_session().is_empty());
        assert_eq!(idle.active_session().session_id(), None);
        assert!(drain(&mut rx).is_empty());
    }
}
