//! Self-expiring typing presence for one conversation.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::connection::ConnectionManager;
use crate::locked;
use crate::protocol::{ClientEvent, TypingStatus};

#[derive(Default)]
struct TypingState {
    active: bool,
    /// Bumped on every call; a timer only fires for the generation that armed it.
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

/// Debounces `typing-status` for one conversation.
///
/// A start signal goes out once per typing burst; the burst ends with exactly
/// one stop, either explicit or after `timeout` without a refresh.
pub struct TypingSignaler {
    connection: ConnectionManager,
    conversation_id: String,
    timeout: Duration,
    state: Arc<Mutex<TypingState>>,
}

impl TypingSignaler {
    pub fn new(
        connection: ConnectionManager,
        conversation_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            connection,
            conversation_id: conversation_id.into(),
            timeout,
            state: Arc::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        locked(&self.state).active
    }

    pub fn set_typing(&self, is_typing: bool) {
        let mut state = locked(&self.state);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.generation += 1;

        if !is_typing {
            state.active = false;
            drop(state);
            signal(&self.connection, &self.conversation_id, false);
            return;
        }

        if !state.active {
            state.active = true;
            signal(&self.connection, &self.conversation_id, true);
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("no runtime; typing will not expire on its own");
            return;
        };
        let generation = state.generation;
        let shared = self.state.clone();
        let connection = self.connection.clone();
        let conversation_id = self.conversation_id.clone();
        let timeout = self.timeout;
        state.timer = Some(runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            {
                let mut state = locked(&shared);
                if state.generation != generation || !state.active {
                    return;
                }
                state.active = false;
                state.timer = None;
            }
            debug!(conversation = %conversation_id, "typing expired");
            signal(&connection, &conversation_id, false);
        }));
    }

    /// Stop any burst in progress. Sends a stop only if one is owed.
    pub fn halt(&self) {
        let was_active = {
            let mut state = locked(&self.state);
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.generation += 1;
            std::mem::replace(&mut state.active, false)
        };
        if was_active {
            signal(&self.connection, &self.conversation_id, false);
        }
    }
}

impl Drop for TypingSignaler {
    fn drop(&mut self) {
        self.halt();
    }
}

fn signal(connection: &ConnectionManager, conversation_id: &str, is_typing: bool) {
    let event = ClientEvent::TypingStatus(TypingStatus {
        conversation_id: conversation_id.to_string(),
        is_typing,
    });
    // Presence is best-effort; a dropped signal expires on the peer anyway.
    if let Err(e) = connection.inner.emit(event) {
        debug!(conversation = %conversation_id, is_typing, error = %e, "typing signal not sent");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeServer, manager_for};

    async fn connected() -> (FakeServer, ConnectionManager) {
        let server = FakeServer::new();
        let manager = manager_for(&server, "alice");
        manager.connect().await.unwrap();
        (server, manager)
    }

    async fn pause_for(server: &FakeServer, millis: u64) {
        tokio::time::sleep(Duration::from_millis(millis)).await;
        server.settle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn idle_typing_sends_exactly_one_stop() {
        let (server, manager) = connected().await;
        let typing = TypingSignaler::new(manager, "c1", Duration::from_secs(3));

        typing.set_typing(true);
        pause_for(&server, 3_500).await;
        assert_eq!(server.typing_signals(), vec![true, false]);
        assert!(!typing.is_active());

        pause_for(&server, 10_000).await;
        assert_eq!(server.typing_signals(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_typing_sends_one_start_and_no_stop() {
        let (server, manager) = connected().await;
        let typing = TypingSignaler::new(manager, "c1", Duration::from_secs(3));

        for _ in 0..5 {
            typing.set_typing(true);
            pause_for(&server, 1_000).await;
        }
        assert_eq!(server.typing_signals(), vec![true]);

        pause_for(&server, 3_500).await;
        assert_eq!(server.typing_signals(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_stop_cancels_timer() {
        let (server, manager) = connected().await;
        let typing = TypingSignaler::new(manager, "c1", Duration::from_secs(3));

        typing.set_typing(true);
        pause_for(&server, 500).await;
        typing.set_typing(false);
        pause_for(&server, 5_000).await;
        assert_eq!(server.typing_signals(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_while_typing_sends_stop() {
        let (server, manager) = connected().await;
        let typing = TypingSignaler::new(manager, "c1", Duration::from_secs(3));
        typing.set_typing(true);
        drop(typing);
        pause_for(&server, 5_000).await;
        assert_eq!(server.typing_signals(), vec![true, false]);
    }

    #[tokio::test]
    async fn typing_without_connection_is_silent() {
        let server = FakeServer::new();
        let manager = manager_for(&server, "alice");
        let typing = TypingSignaler::new(manager, "c1", Duration::from_secs(3));
        typing.set_typing(true);
        typing.set_typing(false);
        assert!(server.typing_signals().is_empty());
    }
}
