//! In-process fake chat server for client tests.
//!
//! Speaks the real wire format over [`Link`] channel pairs: answers the
//! handshake, acknowledges joins and sends, echoes confirmed messages back as
//! `new-message`, and records every client event it receives. Knobs let a
//! test refuse connections, stay silent, swallow requests, or cut every live
//! link to simulate transport loss.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::StaticTokenStore;
use crate::connection::{ClientConfig, ConnectionManager};
use crate::error::{ChatError, Result};
use crate::locked;
use crate::protocol::{Ack, ClientEvent, ClientFrame, Message, ServerEvent, ServerFrame};
use crate::transport::{Connector, LINK_CAPACITY, Link};

#[derive(Default)]
struct Shared {
    refuse: AtomicBool,
    silent: AtomicBool,
    revoked: AtomicBool,
    drop_requests: AtomicBool,
    echo: AtomicBool,
    connections: AtomicUsize,
    next_message: AtomicU64,
    links: Mutex<Vec<(mpsc::Sender<String>, CancellationToken)>>,
    received: Mutex<Vec<ClientEvent>>,
    silent_rejects: Mutex<HashSet<String>>,
    rejections: Mutex<HashMap<String, String>>,
}

#[derive(Clone)]
pub(crate) struct FakeServer {
    shared: Arc<Shared>,
}

pub(crate) fn manager_for(server: &FakeServer, token: &str) -> ConnectionManager {
    ConnectionManager::new(
        server.connector(),
        Arc::new(StaticTokenStore::new(token)),
        ClientConfig::default(),
    )
}

pub(crate) fn message(id: &str, conversation_id: &str, content: &str) -> Message {
    Message {
        id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        sender_id: "peer".to_string(),
        content: content.to_string(),
        kind: Default::default(),
        media_url: None,
        created_at: chrono::Utc::now(),
    }
}

impl FakeServer {
    pub fn new() -> Self {
        let shared = Shared::default();
        shared.echo.store(true, Ordering::SeqCst);
        Self {
            shared: Arc::new(shared),
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    pub fn set_refuse(&self, on: bool) {
        self.shared.refuse.store(on, Ordering::SeqCst);
    }

    /// Accept links but never answer the handshake.
    pub fn set_silent(&self, on: bool) {
        self.shared.silent.store(on, Ordering::SeqCst);
    }

    /// Reject every handshake as if the credential had been revoked.
    pub fn set_revoked(&self, on: bool) {
        self.shared.revoked.store(on, Ordering::SeqCst);
    }

    /// Record join/send requests without acknowledging them.
    pub fn set_drop_requests(&self, on: bool) {
        self.shared.drop_requests.store(on, Ordering::SeqCst);
    }

    pub fn set_echo(&self, on: bool) {
        self.shared.echo.store(on, Ordering::SeqCst);
    }

    pub fn reject_joins(&self, conversation_id: &str, reason: &str) {
        locked(&self.shared.rejections).insert(conversation_id.to_string(), reason.to_string());
    }

    /// Reject joins without an error string.
    pub fn reject_joins_silently(&self, conversation_id: &str) {
        locked(&self.shared.silent_rejects).insert(conversation_id.to_string());
    }

    /// Links that completed `open` so far.
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Push an event to every live link.
    pub fn push(&self, event: ServerEvent) {
        let Ok(text) = serde_json::to_string(&ServerFrame::from(event)) else {
            return;
        };
        for (tx, _) in locked(&self.shared.links).iter() {
            let _ = tx.try_send(text.clone());
        }
    }

    /// Cut every live link as if the network went away.
    pub fn drop_links(&self) {
        for (_, cancel) in locked(&self.shared.links).drain(..) {
            cancel.cancel();
        }
    }

    pub fn received(&self) -> Vec<ClientEvent> {
        locked(&self.shared.received).clone()
    }

    pub fn count(&self, name: &str) -> usize {
        locked(&self.shared.received)
            .iter()
            .filter(|e| e.name() == name)
            .count()
    }

    /// Typing flags sent, in order.
    pub fn typing_signals(&self) -> Vec<bool> {
        locked(&self.shared.received)
            .iter()
            .filter_map(|e| match e {
                ClientEvent::TypingStatus(t) => Some(t.is_typing),
                _ => None,
            })
            .collect()
    }

    /// Let spawned client and server tasks run until quiet.
    pub async fn settle(&self) {
        for _ in 0..64 {
            tokio::task::yield_now().await;
        }
    }
}

impl Connector for FakeServer {
    fn open(&self) -> BoxFuture<'static, Result<Link>> {
        let shared = self.shared.clone();
        async move {
            if shared.refuse.load(Ordering::SeqCst) {
                return Err(ChatError::Transport("connection refused".to_string()));
            }
            let (client_tx, client_rx) = mpsc::channel(LINK_CAPACITY);
            let (server_tx, server_rx) = mpsc::channel(LINK_CAPACITY);
            let cancel = CancellationToken::new();
            locked(&shared.links).push((server_tx.clone(), cancel.clone()));
            shared.connections.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve(shared, client_rx, server_tx, cancel));
            Ok(Link {
                outbound: client_tx,
                inbound: server_rx,
            })
        }
        .boxed()
    }
}

async fn serve(
    shared: Arc<Shared>,
    mut from_client: mpsc::Receiver<String>,
    to_client: mpsc::Sender<String>,
    cancel: CancellationToken,
) {
    let mut user_id = String::new();
    loop {
        let text = tokio::select! {
            _ = cancel.cancelled() => break,
            text = from_client.recv() => match text {
                Some(text) => text,
                None => break,
            },
        };
        let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else {
            continue;
        };
        locked(&shared.received).push(frame.event.clone());

        let mut replies = Vec::new();
        match frame.event {
            ClientEvent::Hello { token } => {
                if shared.silent.load(Ordering::SeqCst) {
                    continue;
                }
                if token.starts_with("bad") || shared.revoked.load(Ordering::SeqCst) {
                    replies.push(ServerFrame::Rejected {
                        reason: "invalid token".to_string(),
                    });
                } else {
                    user_id = token;
                    replies.push(ServerFrame::Welcome {
                        user_id: user_id.clone(),
                    });
                }
            }
            ClientEvent::JoinConversation(room) => {
                let Some(ack) = frame.ack else { continue };
                if shared.drop_requests.load(Ordering::SeqCst) {
                    continue;
                }
                let id = room.conversation_id;
                let reply = if locked(&shared.silent_rejects).contains(&id) {
                    Ack {
                        ack,
                        success: false,
                        message: None,
                        error: None,
                    }
                } else if let Some(reason) = locked(&shared.rejections).get(&id) {
                    Ack::rejected(ack, reason.clone())
                } else {
                    Ack::ok(ack, None)
                };
                replies.push(ServerFrame::Ack(reply));
            }
            ClientEvent::SendMessage(send) => {
                let Some(ack) = frame.ack else { continue };
                if shared.drop_requests.load(Ordering::SeqCst) {
                    continue;
                }
                if send.content.trim().is_empty() && send.media_url.is_none() {
                    replies.push(ServerFrame::Ack(Ack::rejected(ack, "message content is empty")));
                } else {
                    let n = shared.next_message.fetch_add(1, Ordering::SeqCst) + 1;
                    let confirmed = Message {
                        id: format!("m{n}"),
                        conversation_id: send.conversation_id,
                        sender_id: user_id.clone(),
                        content: send.content,
                        kind: send.kind,
                        media_url: send.media_url,
                        created_at: chrono::Utc::now(),
                    };
                    replies.push(ServerFrame::Ack(Ack::ok(ack, Some(confirmed.clone()))));
                    if shared.echo.load(Ordering::SeqCst) {
                        replies.push(ServerEvent::NewMessage(confirmed).into());
                    }
                }
            }
            ClientEvent::LeaveConversation(_) | ClientEvent::TypingStatus(_) => {}
        }

        for reply in replies {
            let Ok(text) = serde_json::to_string(&reply) else {
                continue;
            };
            if to_client.send(text).await.is_err() {
                return;
            }
        }
    }
}
