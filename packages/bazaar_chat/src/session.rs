//! Conversation join/leave/send, and the per-screen [`ConversationSession`].

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::time::Instant;
use tracing::{debug, info};

use crate::api::ChatApi;
use crate::connection::{ConnectionManager, Inner};
use crate::error::{ChatError, Result};
use crate::locked;
use crate::mux::Subscription;
use crate::protocol::{
    ClientEvent, ConversationRef, Message, MessageType, SendMessage, TypingStatus,
};
use crate::rooms::JoinStep;
use crate::typing::TypingSignaler;

impl ConnectionManager {
    /// Join `conversation_id` on the current link.
    ///
    /// Already joined resolves without sending. Concurrent callers share the
    /// one request in flight.
    pub async fn join(&self, conversation_id: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(ChatError::NotConnected);
        }
        let step = locked(&self.inner.rooms).begin_join(conversation_id);
        let outcome = match step {
            JoinStep::Ready => return Ok(()),
            JoinStep::Wait(rx) => rx,
            JoinStep::Send(attempt, rx) => {
                Inner::spawn_join(&self.inner, conversation_id.to_string(), attempt);
                rx
            }
        };
        outcome.await.unwrap_or(Err(ChatError::NotConnected))
    }

    /// Leave `conversation_id`. Local state always drops to not-joined; the
    /// server is told best-effort.
    pub fn leave(&self, conversation_id: &str) {
        locked(&self.inner.rooms).leave(conversation_id);
        let event = ClientEvent::LeaveConversation(ConversationRef::new(conversation_id));
        if let Err(e) = self.inner.emit(event) {
            debug!(conversation = %conversation_id, error = %e, "leave not sent");
        }
    }

    pub fn is_joined(&self, conversation_id: &str) -> bool {
        locked(&self.inner.rooms).is_joined(conversation_id)
    }

    /// Send a message, joining first if needed. Resolves with the
    /// server-confirmed message.
    pub async fn send(
        &self,
        conversation_id: &str,
        content: &str,
        kind: MessageType,
        media_url: Option<String>,
    ) -> Result<Message> {
        self.join(conversation_id).await?;
        let ack = self
            .inner
            .request(ClientEvent::SendMessage(SendMessage {
                conversation_id: conversation_id.to_string(),
                content: content.to_string(),
                kind,
                media_url,
            }))
            .await?;
        match ack.into_result() {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(ChatError::Protocol(
                "send acknowledged without a message".to_string(),
            )),
            Err(reason) => Err(ChatError::SendRejected(reason)),
        }
    }
}

/// Messages of one conversation, unique by id, ordered by `created_at`.
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    messages: Vec<Message>,
    ids: HashSet<String>,
}

impl MessageLog {
    /// Insert unless a message with the same id is already present.
    pub fn insert(&mut self, message: Message) -> bool {
        if !self.ids.insert(message.id.clone()) {
            return false;
        }
        let at = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.messages.insert(at, message);
        true
    }

    /// Insert every message not already present; returns how many were new.
    pub fn merge(&mut self, messages: impl IntoIterator<Item = Message>) -> usize {
        messages.into_iter().filter(|m| self.insert(m.clone())).count()
    }

    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// An open conversation screen.
///
/// Holds the conversation's membership, its live message list, and the
/// peer's typing state. Dropping it unsubscribes, ends any typing burst, and
/// leaves the room when no other session for it remains open.
pub struct ConversationSession {
    connection: ConnectionManager,
    conversation_id: String,
    log: Arc<Mutex<MessageLog>>,
    /// Deadline of the peer's typing indicator; `None` when not typing.
    peer_typing: Arc<Mutex<Option<Instant>>>,
    typing: TypingSignaler,
    _messages: Subscription,
    _presence: Subscription,
}

impl ConversationSession {
    /// Subscribe to the conversation's events and join it.
    pub async fn open(
        connection: &ConnectionManager,
        conversation_id: impl Into<String>,
    ) -> Result<Self> {
        let conversation_id = conversation_id.into();
        let log = Arc::new(Mutex::new(MessageLog::default()));
        let peer_typing = Arc::new(Mutex::new(None));
        let me = connection.user_id();

        let messages = {
            let log = log.clone();
            let peer_typing = peer_typing.clone();
            let id = conversation_id.clone();
            connection.events().on::<Message, _>(move |message| {
                if message.conversation_id != id {
                    return;
                }
                if me.as_deref() != Some(message.sender_id.as_str()) {
                    *locked(&peer_typing) = None;
                }
                if !locked(&log).insert(message.clone()) {
                    debug!(message = %message.id, "duplicate message discarded");
                }
            })
        };
        let presence = {
            let peer_typing = peer_typing.clone();
            let id = conversation_id.clone();
            let expiry = connection.config().peer_typing_timeout;
            connection.events().on::<TypingStatus, _>(move |status| {
                if status.conversation_id == id {
                    *locked(&peer_typing) = status.is_typing.then(|| Instant::now() + expiry);
                }
            })
        };

        locked(&connection.inner.rooms).retain(&conversation_id);
        let session = Self {
            typing: TypingSignaler::new(
                connection.clone(),
                conversation_id.clone(),
                connection.config().typing_timeout,
            ),
            connection: connection.clone(),
            conversation_id,
            log,
            peer_typing,
            _messages: messages,
            _presence: presence,
        };
        session.connection.join(&session.conversation_id).await?;
        info!(conversation = %session.conversation_id, "conversation opened");
        Ok(session)
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn is_joined(&self) -> bool {
        self.connection.is_joined(&self.conversation_id)
    }

    /// Send a text message.
    pub async fn send(&self, content: &str) -> Result<Message> {
        self.send_with(content, MessageType::Text, None).await
    }

    pub async fn send_with(
        &self,
        content: &str,
        kind: MessageType,
        media_url: Option<String>,
    ) -> Result<Message> {
        self.typing.halt();
        let message = self
            .connection
            .send(&self.conversation_id, content, kind, media_url)
            .await?;
        locked(&self.log).insert(message.clone());
        Ok(message)
    }

    /// Snapshot of the visible message list.
    pub fn messages(&self) -> Vec<Message> {
        locked(&self.log).as_slice().to_vec()
    }

    pub fn set_typing(&self, is_typing: bool) {
        self.typing.set_typing(is_typing);
    }

    /// Whether the peer is typing. Expires on its own if the peer's stop
    /// signal never arrives.
    pub fn peer_typing(&self) -> bool {
        locked(&self.peer_typing).is_some_and(|deadline| Instant::now() < deadline)
    }

    /// Merge up to `limit` messages of REST history. Returns how many were new.
    pub async fn load_history(&self, api: &dyn ChatApi, limit: usize) -> Result<usize> {
        let history = api.get_messages(&self.conversation_id, limit).await?;
        let added = locked(&self.log).merge(history);
        debug!(conversation = %self.conversation_id, added, "history merged");
        Ok(added)
    }

    pub fn close(self) {}
}

impl Drop for ConversationSession {
    fn drop(&mut self) {
        self.typing.halt();
        let last = locked(&self.connection.inner.rooms).release(&self.conversation_id);
        if last {
            self.connection.leave(&self.conversation_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::{Duration as ChronoDuration, Utc};
    use futures::FutureExt;
    use futures::future::BoxFuture;
    use proptest::prelude::*;

    use crate::connection::ConnectionState;
    use crate::error::GENERIC_REJECTION;
    use crate::protocol::{ConversationSummary, EventKind, ServerEvent};
    use crate::test_support::{FakeServer, manager_for, message};

    async fn connected() -> (FakeServer, ConnectionManager) {
        let server = FakeServer::new();
        let manager = manager_for(&server, "alice");
        manager.connect().await.unwrap();
        (server, manager)
    }

    #[tokio::test]
    async fn join_twice_sends_one_request() {
        let (server, manager) = connected().await;
        manager.join("c1").await.unwrap();
        manager.join("c1").await.unwrap();
        assert!(manager.is_joined("c1"));
        assert_eq!(server.count("join-conversation"), 1);
    }

    #[tokio::test]
    async fn concurrent_joins_share_one_request() {
        let (server, manager) = connected().await;
        let (a, b) = tokio::join!(manager.join("c1"), manager.join("c1"));
        a.unwrap();
        b.unwrap();
        assert_eq!(server.count("join-conversation"), 1);
    }

    #[tokio::test]
    async fn join_without_connection_fails() {
        let server = FakeServer::new();
        let manager = manager_for(&server, "alice");
        assert_eq!(manager.join("c1").await, Err(ChatError::NotConnected));
        assert_eq!(
            manager.send("c1", "hi", MessageType::Text, None).await,
            Err(ChatError::NotConnected)
        );
    }

    #[tokio::test]
    async fn join_rejection_surfaces_server_reason() {
        let (server, manager) = connected().await;
        server.reject_joins("c2", "not a participant");
        assert_eq!(
            manager.join("c2").await,
            Err(ChatError::JoinRejected("not a participant".into()))
        );
        assert!(!manager.is_joined("c2"));
    }

    #[tokio::test(start_paused = true)]
    async fn join_times_out() {
        let (server, manager) = connected().await;
        server.set_drop_requests(true);
        assert_eq!(manager.join("c1").await, Err(ChatError::Timeout));
        assert!(!manager.is_joined("c1"));
    }

    #[tokio::test]
    async fn leave_resets_join_state() {
        let (server, manager) = connected().await;
        manager.join("c1").await.unwrap();
        manager.leave("c1");
        assert!(!manager.is_joined("c1"));
        manager.join("c1").await.unwrap();
        server.settle().await;
        assert_eq!(server.count("join-conversation"), 2);
        assert_eq!(server.count("leave-conversation"), 1);
    }

    #[tokio::test]
    async fn send_auto_joins_and_returns_confirmed_message() {
        let (server, manager) = connected().await;
        let sent = manager
            .send("c1", "hello", MessageType::Text, None)
            .await
            .unwrap();
        assert_eq!(sent.id, "m1");
        assert_eq!(sent.conversation_id, "c1");
        assert_eq!(sent.content, "hello");
        assert_eq!(sent.sender_id, "alice");
        assert!(manager.is_joined("c1"));
        assert_eq!(server.count("join-conversation"), 1);
    }

    #[tokio::test]
    async fn send_rejection_surfaces_reason() {
        let (_server, manager) = connected().await;
        assert_eq!(
            manager.send("c1", "   ", MessageType::Text, None).await,
            Err(ChatError::SendRejected("message content is empty".into()))
        );
    }

    #[tokio::test]
    async fn silent_rejection_falls_back_to_generic_reason() {
        let (server, manager) = connected().await;
        server.reject_joins_silently("c3");
        assert_eq!(
            manager.send("c3", "hi", MessageType::Text, None).await,
            Err(ChatError::JoinRejected(GENERIC_REJECTION.into()))
        );
    }

    #[tokio::test]
    async fn abandoned_send_ack_is_ignored() {
        let (server, manager) = connected().await;
        manager.join("c1").await.unwrap();
        // Dropping the future after the frame is out leaves a late ack behind.
        let send = manager.send("c1", "bye", MessageType::Text, None);
        let _ = send.now_or_never();
        server.settle().await;
        assert!(manager.is_connected());
        manager
            .send("c1", "still here", MessageType::Text, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn echoed_send_appears_once() {
        let (server, manager) = connected().await;
        let session = ConversationSession::open(&manager, "c1").await.unwrap();

        let sent = session.send("hello").await.unwrap();
        assert_eq!(sent.id, "m1");
        server.push(ServerEvent::NewMessage(sent.clone()));
        server.settle().await;

        let visible = session.messages();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, "m1");
        assert_eq!(visible[0].content, "hello");
    }

    #[tokio::test]
    async fn session_filters_by_conversation() {
        let (server, manager) = connected().await;
        let session = ConversationSession::open(&manager, "c1").await.unwrap();

        server.push(ServerEvent::NewMessage(message("x1", "c1", "mine")));
        server.push(ServerEvent::NewMessage(message("x2", "c2", "other")));
        server.push(ServerEvent::PeerTyping(TypingStatus {
            conversation_id: "c2".into(),
            is_typing: true,
        }));
        server.settle().await;

        let ids: Vec<String> = session.messages().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["x1".to_string()]);
        assert!(!session.peer_typing());
    }

    #[tokio::test]
    async fn peer_typing_clears_on_peer_message() {
        let (server, manager) = connected().await;
        let session = ConversationSession::open(&manager, "c1").await.unwrap();

        server.push(ServerEvent::PeerTyping(TypingStatus {
            conversation_id: "c1".into(),
            is_typing: true,
        }));
        server.settle().await;
        assert!(session.peer_typing());

        server.push(ServerEvent::NewMessage(message("x1", "c1", "done")));
        server.settle().await;
        assert!(!session.peer_typing());
    }

    #[tokio::test(start_paused = true)]
    async fn peer_typing_expires_without_refresh() {
        let (server, manager) = connected().await;
        let session = ConversationSession::open(&manager, "c1").await.unwrap();
        let expiry = manager.config().peer_typing_timeout;

        server.push(ServerEvent::PeerTyping(TypingStatus {
            conversation_id: "c1".into(),
            is_typing: true,
        }));
        server.settle().await;
        tokio::time::advance(expiry - Duration::from_millis(100)).await;
        assert!(session.peer_typing());

        // A refresh pushes the deadline out again.
        server.push(ServerEvent::PeerTyping(TypingStatus {
            conversation_id: "c1".into(),
            is_typing: true,
        }));
        server.settle().await;
        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(session.peer_typing());

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!session.peer_typing());
    }

    #[tokio::test]
    async fn dropping_session_unsubscribes_and_leaves() {
        let (server, manager) = connected().await;
        let session = ConversationSession::open(&manager, "c1").await.unwrap();
        assert_eq!(manager.events().len(EventKind::NewMessage), 1);
        assert_eq!(manager.events().len(EventKind::PeerTyping), 1);

        session.close();
        server.settle().await;
        assert!(manager.events().is_empty());
        assert!(!manager.is_joined("c1"));
        assert_eq!(server.count("leave-conversation"), 1);
    }

    #[tokio::test]
    async fn repeated_navigation_does_not_accumulate_handlers() {
        let (server, manager) = connected().await;
        for _ in 0..10 {
            let session = ConversationSession::open(&manager, "c1").await.unwrap();
            drop(session);
        }
        server.settle().await;
        assert_eq!(manager.events().len(EventKind::NewMessage), 0);
        assert_eq!(server.count("leave-conversation"), 10);
    }

    #[tokio::test]
    async fn shared_membership_leaves_with_last_session() {
        let (server, manager) = connected().await;
        let first = ConversationSession::open(&manager, "c1").await.unwrap();
        let second = ConversationSession::open(&manager, "c1").await.unwrap();
        assert_eq!(server.count("join-conversation"), 1);

        drop(first);
        server.settle().await;
        assert!(second.is_joined());
        assert_eq!(server.count("leave-conversation"), 0);

        drop(second);
        server.settle().await;
        assert_eq!(server.count("leave-conversation"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn session_rejoins_after_reconnect_and_send_succeeds() {
        let (server, manager) = connected().await;
        let session = ConversationSession::open(&manager, "c1").await.unwrap();
        assert!(session.is_joined());
        let mut state = manager.watch_state();

        server.drop_links();
        state
            .wait_for(|s| matches!(s, ConnectionState::Reconnecting { .. }))
            .await
            .unwrap();
        assert!(!session.is_joined());
        state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();

        // Issued at once: waits for the replayed join rather than racing it.
        let sent = session.send("after reconnect").await.unwrap();
        assert_eq!(sent.content, "after reconnect");
        assert!(session.is_joined());
        assert_eq!(server.count("join-conversation"), 2);
    }

    #[tokio::test]
    async fn disconnect_drops_membership() {
        let (_server, manager) = connected().await;
        let session = ConversationSession::open(&manager, "c1").await.unwrap();
        manager.disconnect();
        assert!(!session.is_joined());
        assert_eq!(session.send("hi").await, Err(ChatError::NotConnected));
    }

    #[tokio::test]
    async fn connect_after_disconnect_does_not_replay_rooms() {
        let (server, manager) = connected().await;
        let session = ConversationSession::open(&manager, "c1").await.unwrap();
        manager.disconnect();
        manager.connect().await.unwrap();
        server.settle().await;

        assert_eq!(server.count("join-conversation"), 1);
        assert!(!manager.is_joined("c1"));

        drop(session);
        server.settle().await;
        assert_eq!(server.count("leave-conversation"), 0);
    }

    struct HistoryApi(Vec<Message>);

    impl ChatApi for HistoryApi {
        fn list_conversations(&self) -> BoxFuture<'_, Result<Vec<ConversationSummary>>> {
            async { Ok(Vec::new()) }.boxed()
        }

        fn get_messages<'a>(
            &'a self,
            _conversation_id: &'a str,
            limit: usize,
        ) -> BoxFuture<'a, Result<Vec<Message>>> {
            let page = self.0.iter().take(limit).cloned().collect();
            async move { Ok(page) }.boxed()
        }

        fn create_conversation<'a>(
            &'a self,
            _provider_id: &'a str,
            _service_id: &'a str,
        ) -> BoxFuture<'a, Result<String>> {
            async { Ok("c1".to_string()) }.boxed()
        }

        fn mark_read<'a>(&'a self, _conversation_id: &'a str) -> BoxFuture<'a, Result<()>> {
            async { Ok(()) }.boxed()
        }
    }

    #[tokio::test]
    async fn history_merges_without_duplicates_in_time_order() {
        let (server, manager) = connected().await;
        let session = ConversationSession::open(&manager, "c1").await.unwrap();

        let now = Utc::now();
        let mut live = message("h3", "c1", "live");
        live.created_at = now;
        server.push(ServerEvent::NewMessage(live.clone()));
        server.settle().await;

        let mut h1 = message("h1", "c1", "first");
        h1.created_at = now - ChronoDuration::minutes(2);
        let mut h2 = message("h2", "c1", "second");
        h2.created_at = now - ChronoDuration::minutes(1);
        let api = HistoryApi(vec![h1, h2, live]);

        assert_eq!(session.load_history(&api, 50).await.unwrap(), 2);
        let ids: Vec<String> = session.messages().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["h1", "h2", "h3"]);
    }

    proptest! {
        #[test]
        fn log_keeps_each_id_once(ids in proptest::collection::vec(0u8..16, 0..64)) {
            let mut log = MessageLog::default();
            for id in &ids {
                log.insert(message(&format!("m{id}"), "c1", "x"));
            }
            let unique: HashSet<u8> = ids.iter().copied().collect();
            prop_assert_eq!(log.len(), unique.len());
            let mut seen = HashSet::new();
            for m in log.as_slice() {
                prop_assert!(seen.insert(m.id.clone()));
            }
        }
    }
}
