//! ConnectionManager: the single authenticated link to the chat server.
//!
//! Owns connect/handshake, request/ack correlation, inbound dispatch into the
//! [`EventMux`], and reconnection with backoff. After any successful
//! handshake, rooms that still have open sessions are joined again so
//! membership survives transport loss without the UI noticing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::TokenStore;
use crate::error::{ChatError, Result};
use crate::locked;
use crate::mux::EventMux;
use crate::protocol::{Ack, ClientEvent, ClientFrame, ConversationRef, ServerFrame};
use crate::rooms::RoomTable;
use crate::transport::{Connector, Link};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

/// Client tunables. Defaults match the mobile client's behaviour.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bound on open + hello + welcome.
    pub handshake_timeout: Duration,
    /// Bound on each join/send acknowledgment.
    pub request_timeout: Duration,
    pub reconnect_attempts: u32,
    /// Delay before the first reconnect attempt; doubles per attempt.
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    /// Typing presence expires after this long without a refresh.
    pub typing_timeout: Duration,
    /// A peer's typing indicator is dropped after this long without a
    /// refresh, in case its stop signal never arrives.
    pub peer_typing_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            typing_timeout: Duration::from_secs(3),
            peer_typing_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    /// Delay before reconnect `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.reconnect_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_reconnect_delay)
    }
}

struct LiveLink {
    outbound: mpsc::Sender<String>,
    cancel: CancellationToken,
    epoch: u64,
}

pub(crate) struct Inner {
    connector: Arc<dyn Connector>,
    tokens: Arc<dyn TokenStore>,
    pub(crate) config: ClientConfig,
    state: watch::Sender<ConnectionState>,
    link: Mutex<Option<LiveLink>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Ack>>>,
    next_ack: AtomicU64,
    next_epoch: AtomicU64,
    /// Credential of the last successful connect, re-sent on reconnect.
    credential: Mutex<Option<String>>,
    user_id: Mutex<Option<String>>,
    pub(crate) rooms: Mutex<RoomTable>,
    pub(crate) events: EventMux,
    /// Cancelled by `disconnect`; stops reader and reconnect tasks.
    lifecycle: Mutex<CancellationToken>,
    connect_lock: tokio::sync::Mutex<()>,
}

/// Handle to the chat connection. Clones share one connection.
#[derive(Clone)]
pub struct ConnectionManager {
    pub(crate) inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        tokens: Arc<dyn TokenStore>,
        config: ClientConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                connector,
                tokens,
                config,
                state,
                link: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                next_ack: AtomicU64::new(1),
                next_epoch: AtomicU64::new(1),
                credential: Mutex::new(None),
                user_id: Mutex::new(None),
                rooms: Mutex::new(RoomTable::default()),
                events: EventMux::new(),
                lifecycle: Mutex::new(CancellationToken::new()),
                connect_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Connect and authenticate with the token store's credential.
    ///
    /// Already connected → no-op. A reconnect loop in progress is superseded.
    pub async fn connect(&self) -> Result<()> {
        let _guard = self.inner.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        let token = self
            .inner
            .tokens
            .token()
            .ok_or_else(|| ChatError::Auth("no credential available".to_string()))?;

        let lifecycle = CancellationToken::new();
        let previous = std::mem::replace(&mut *locked(&self.inner.lifecycle), lifecycle.clone());
        previous.cancel();

        self.inner.set_state(ConnectionState::Connecting);
        match Inner::establish(&self.inner, &token, &lifecycle).await {
            Ok(user_id) => {
                *locked(&self.inner.credential) = Some(token);
                info!(user = %user_id, "connected to chat server");
                Ok(())
            }
            Err(e) => {
                if !lifecycle.is_cancelled() {
                    self.inner.set_state(ConnectionState::Disconnected);
                }
                warn!(error = %e, "connect failed");
                Err(e)
            }
        }
    }

    /// Tear down the link, clear subscriptions, fail pending requests.
    /// Idempotent.
    pub fn disconnect(&self) {
        locked(&self.inner.lifecycle).cancel();
        let link = locked(&self.inner.link).take();
        let was_live = link.is_some();
        if let Some(link) = link {
            link.cancel.cancel();
        }
        locked(&self.inner.pending).clear();
        locked(&self.inner.rooms).reset();
        self.inner.events.clear();
        *locked(&self.inner.credential) = None;
        *locked(&self.inner.user_id) = None;

        if was_live || self.state() != ConnectionState::Disconnected {
            self.inner.set_state(ConnectionState::Disconnected);
            info!("disconnected from chat server");
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// User id the server assigned at the last handshake.
    pub fn user_id(&self) -> Option<String> {
        locked(&self.inner.user_id).clone()
    }

    /// Inbound event multiplexer.
    pub fn events(&self) -> &EventMux {
        &self.inner.events
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "connection state");
        }
    }

    /// Open a link, handshake, install it, and replay joins. Returns the
    /// server-assigned user id.
    async fn establish(
        inner: &Arc<Inner>,
        token: &str,
        lifecycle: &CancellationToken,
    ) -> Result<String> {
        let hello = serde_json::to_string(&ClientFrame {
            ack: None,
            event: ClientEvent::Hello {
                token: token.to_string(),
            },
        })?;

        let (link, user_id) = timeout(
            inner.config.handshake_timeout,
            handshake(inner.connector.clone(), hello),
        )
        .await
        .map_err(|_| ChatError::Timeout)??;

        let epoch = inner.next_epoch.fetch_add(1, Ordering::Relaxed);
        let cancel = lifecycle.child_token();
        {
            let mut slot = locked(&inner.link);
            if lifecycle.is_cancelled() {
                return Err(ChatError::NotConnected);
            }
            *slot = Some(LiveLink {
                outbound: link.outbound,
                cancel: cancel.clone(),
                epoch,
            });
        }
        *locked(&inner.user_id) = Some(user_id.clone());

        // Rooms enter `Joining` before the state flips, so a send issued as
        // soon as `Connected` is observed waits for the replayed join.
        let rejoin = locked(&inner.rooms).prepare_rejoin();
        inner.set_state(ConnectionState::Connected);

        tokio::spawn(read_loop(Arc::downgrade(inner), link.inbound, cancel, epoch));

        if !rejoin.is_empty() {
            info!(rooms = rejoin.len(), "replaying conversation joins");
        }
        for (conversation_id, attempt) in rejoin {
            Inner::spawn_join(inner, conversation_id, attempt);
        }
        Ok(user_id)
    }

    /// Send the join request for `attempt` on its own task so its outcome is
    /// recorded even if every caller stops waiting.
    pub(crate) fn spawn_join(inner: &Arc<Inner>, conversation_id: String, attempt: u64) {
        let inner = inner.clone();
        tokio::spawn(async move {
            let result = inner
                .request(ClientEvent::JoinConversation(ConversationRef::new(
                    conversation_id.clone(),
                )))
                .await
                .and_then(|ack| {
                    ack.into_result()
                        .map(|_| ())
                        .map_err(ChatError::JoinRejected)
                });
            match &result {
                Ok(()) => debug!(conversation = %conversation_id, "joined"),
                Err(e) => warn!(conversation = %conversation_id, error = %e, "join failed"),
            }
            locked(&inner.rooms).finish_join(&conversation_id, attempt, &result);
        });
    }

    fn outbound(&self) -> Result<mpsc::Sender<String>> {
        locked(&self.link)
            .as_ref()
            .map(|l| l.outbound.clone())
            .ok_or(ChatError::NotConnected)
    }

    /// Send `event` with an ack id and wait for the correlated reply.
    pub(crate) async fn request(&self, event: ClientEvent) -> Result<Ack> {
        let outbound = self.outbound()?;
        let id = self.next_ack.fetch_add(1, Ordering::Relaxed);
        let name = event.name();
        let frame = serde_json::to_string(&ClientFrame {
            ack: Some(id),
            event,
        })?;

        let (tx, rx) = oneshot::channel();
        locked(&self.pending).insert(id, tx);
        // Removes the entry however this future ends, including being dropped.
        let _pending = PendingGuard {
            pending: &self.pending,
            id,
        };

        if outbound.send(frame).await.is_err() {
            return Err(ChatError::NotConnected);
        }

        match timeout(self.config.request_timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            // Sender dropped: the link went away mid-request.
            Ok(Err(_)) => Err(ChatError::NotConnected),
            Err(_) => {
                warn!(event = name, ack = id, "request timed out");
                Err(ChatError::Timeout)
            }
        }
    }

    /// Send `event` without waiting for anything.
    pub(crate) fn emit(&self, event: ClientEvent) -> Result<()> {
        let outbound = self.outbound()?;
        let frame = serde_json::to_string(&ClientFrame { ack: None, event })?;
        outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                ChatError::Transport("outbound queue full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => ChatError::NotConnected,
        })
    }

    fn handle_frame(&self, text: &str) {
        let frame = match serde_json::from_str::<ServerFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "malformed server frame");
                return;
            }
        };
        match frame {
            ServerFrame::Event { event } => self.events.emit(&event),
            ServerFrame::Ack(ack) => match locked(&self.pending).remove(&ack.ack) {
                Some(waiter) => {
                    let _ = waiter.send(ack);
                }
                None => debug!(ack = ack.ack, "late acknowledgment ignored"),
            },
            ServerFrame::Welcome { .. } => debug!("duplicate welcome ignored"),
            ServerFrame::Rejected { reason } => {
                warn!(reason = %reason, "server rejected established session")
            }
        }
    }

    /// Reader saw the transport end. Only acts if `epoch` is still the live
    /// link; otherwise a newer link already replaced it.
    fn on_link_lost(inner: &Arc<Inner>, epoch: u64) {
        {
            let mut slot = locked(&inner.link);
            match slot.as_ref() {
                Some(link) if link.epoch == epoch => *slot = None,
                _ => return,
            }
        }
        locked(&inner.pending).clear();
        locked(&inner.rooms).connection_lost();

        let lifecycle = locked(&inner.lifecycle).clone();
        if lifecycle.is_cancelled() {
            return;
        }
        warn!("connection lost, will attempt reconnection");
        inner.set_state(ConnectionState::Reconnecting { attempt: 0 });
        tokio::spawn(reconnect_loop(Arc::downgrade(inner), lifecycle));
    }
}

struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<u64, oneshot::Sender<Ack>>>,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        locked(self.pending).remove(&self.id);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        locked(&self.lifecycle).cancel();
    }
}

/// Open a link, present the credential, and wait for the verdict.
async fn handshake(connector: Arc<dyn Connector>, hello: String) -> Result<(Link, String)> {
    let mut link = connector.open().await?;
    link.outbound
        .send(hello)
        .await
        .map_err(|_| ChatError::Transport("link closed during handshake".to_string()))?;
    loop {
        let text = link.inbound.recv().await.ok_or_else(|| {
            ChatError::Transport("connection closed during handshake".to_string())
        })?;
        match serde_json::from_str::<ServerFrame>(&text)? {
            ServerFrame::Welcome { user_id } => return Ok((link, user_id)),
            ServerFrame::Rejected { reason } => return Err(ChatError::Auth(reason)),
            other => debug!(frame = ?other, "ignoring frame before welcome"),
        }
    }
}

async fn read_loop(
    inner: Weak<Inner>,
    mut inbound: mpsc::Receiver<String>,
    cancel: CancellationToken,
    epoch: u64,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = inbound.recv() => frame,
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match frame {
            Some(text) => inner.handle_frame(&text),
            None => {
                Inner::on_link_lost(&inner, epoch);
                return;
            }
        }
    }
}

async fn reconnect_loop(inner: Weak<Inner>, lifecycle: CancellationToken) {
    let Some((config, token)) = inner.upgrade().map(|i| {
        let token = locked(&i.credential).clone();
        (i.config.clone(), token)
    }) else {
        return;
    };
    let Some(token) = token else {
        return;
    };

    for attempt in 1..=config.reconnect_attempts {
        tokio::select! {
            _ = lifecycle.cancelled() => return,
            _ = tokio::time::sleep(config.backoff(attempt)) => {}
        }
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.set_state(ConnectionState::Reconnecting { attempt });
        info!(attempt, "reconnection attempt");

        match Inner::establish(&inner, &token, &lifecycle).await {
            Ok(_) => {
                info!(attempt, "reconnected");
                return;
            }
            Err(e) if !e.is_transient() => {
                warn!(attempt, code = e.error_code(), error = %e, "reconnection abandoned");
                break;
            }
            Err(e) => warn!(attempt, error = %e, "reconnect failed"),
        }
    }

    if let Some(inner) = inner.upgrade() {
        if !lifecycle.is_cancelled() {
            warn!("giving up on reconnection");
            inner.set_state(ConnectionState::Disconnected);
        }
    }
}
