//! Real-time chat core for the Bazaar services marketplace.
//!
//! - `connection`: the single authenticated link to the chat server, with
//!   reconnect-and-rejoin
//! - `mux`: typed publish/subscribe over inbound server events
//! - `session`: conversation join/leave/send and the per-screen session
//! - `typing`: self-expiring typing presence
//! - `reconciler`: conversation list summaries kept current by activity pushes
//! - `protocol`: wire frames shared with the server
//! - `api` / `transport`: collaborator seams (token store, REST, websocket)

pub mod api;
pub mod connection;
pub mod error;
pub mod mux;
pub mod protocol;
pub mod reconciler;
pub mod session;
pub mod transport;
pub mod typing;

mod rooms;

#[cfg(test)]
mod test_support;

pub use api::{ChatApi, HttpChatApi, StaticTokenStore, TokenStore};
pub use connection::{ClientConfig, ConnectionManager, ConnectionState};
pub use error::{ChatError, Result};
pub use mux::{EventMux, EventPayload, Subscription};
pub use protocol::{
    ActivityNotification, ConversationSummary, EventKind, Message, MessageType, ServerEvent,
    TypingStatus,
};
pub use reconciler::ConversationList;
pub use session::{ConversationSession, MessageLog};
pub use transport::{Connector, Link, WsConnector};
pub use typing::TypingSignaler;

use std::sync::{Mutex, MutexGuard};

/// Lock a std mutex, recovering the guard if a previous holder panicked.
///
/// Event handlers run user code and may panic; the state they guard stays
/// usable because every critical section leaves it consistent.
pub(crate) fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
