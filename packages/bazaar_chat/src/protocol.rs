//! Wire protocol types
//!
//! JSON text frames exchanged over the chat websocket. Event names and payload
//! field casing are shared with the mobile client, so payloads are camelCase
//! and event names are kebab-case.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GENERIC_REJECTION;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
}

/// A chat message. `id` is assigned by the server and globally unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Short text shown in a conversation list row.
    pub fn preview(&self) -> String {
        match self.kind {
            MessageType::Text => self.content.clone(),
            MessageType::Image if self.content.trim().is_empty() => "[image]".to_string(),
            MessageType::File if self.content.trim().is_empty() => "[file]".to_string(),
            MessageType::Image | MessageType::File => self.content.clone(),
        }
    }
}

/// One row of the conversation list, as served by the REST API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub other_party: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(default)]
    pub last_message_text: Option<String>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: u32,
}

/// Pushed to participants for activity in conversations they have not joined
/// on that connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityNotification {
    pub conversation_id: String,
    pub message: Message,
    pub unread_delta: u32,
}

/// Typing presence, in both directions (`typing-status` out, `peer-typing` in).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingStatus {
    pub conversation_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRef {
    pub conversation_id: String,
}

impl ConversationRef {
    pub fn new(conversation_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub conversation_id: String,
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
}

/// Events sent FROM the client TO the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// First frame on every link: presents the credential.
    Hello { token: String },
    JoinConversation(ConversationRef),
    LeaveConversation(ConversationRef),
    SendMessage(SendMessage),
    TypingStatus(TypingStatus),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "hello",
            Self::JoinConversation(_) => "join-conversation",
            Self::LeaveConversation(_) => "leave-conversation",
            Self::SendMessage(_) => "send-message",
            Self::TypingStatus(_) => "typing-status",
        }
    }
}

/// Client frame: an event, plus an ack id when the client waits for a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
    pub event: ClientEvent,
}

/// Named event classes the server pushes. Subscriptions are keyed by these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewMessage,
    ActivityNotification,
    PeerTyping,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewMessage => "new-message",
            Self::ActivityNotification => "activity-notification",
            Self::PeerTyping => "peer-typing",
        }
    }
}

/// Events sent FROM the server TO the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    NewMessage(Message),
    ActivityNotification(ActivityNotification),
    PeerTyping(TypingStatus),
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::NewMessage(_) => EventKind::NewMessage,
            Self::ActivityNotification(_) => EventKind::ActivityNotification,
            Self::PeerTyping(_) => EventKind::PeerTyping,
        }
    }

    /// Conversation the event belongs to.
    pub fn conversation_id(&self) -> &str {
        match self {
            Self::NewMessage(m) => &m.conversation_id,
            Self::ActivityNotification(n) => &n.conversation_id,
            Self::PeerTyping(t) => &t.conversation_id,
        }
    }
}

/// Reply to a client frame that carried an ack id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub ack: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Ack {
    pub fn ok(ack: u64, message: Option<Message>) -> Self {
        Self {
            ack,
            success: true,
            message,
            error: None,
        }
    }

    pub fn rejected(ack: u64, error: impl Into<String>) -> Self {
        Self {
            ack,
            success: false,
            message: None,
            error: Some(error.into()),
        }
    }

    /// Split into the confirmed message or the server's reason, falling back
    /// to a generic reason when the server gave none.
    pub fn into_result(self) -> Result<Option<Message>, String> {
        if self.success {
            Ok(self.message)
        } else {
            Err(self
                .error
                .filter(|e| !e.trim().is_empty())
                .unwrap_or_else(|| GENERIC_REJECTION.to_string()))
        }
    }
}

/// Frames sent FROM the server TO the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Handshake accepted.
    Welcome {
        #[serde(rename = "userId")]
        user_id: String,
    },
    /// Handshake refused; the server closes the link after sending this.
    Rejected { reason: String },
    Ack(Ack),
    Event { event: ServerEvent },
}

impl From<ServerEvent> for ServerFrame {
    fn from(event: ServerEvent) -> Self {
        Self::Event { event }
    }
}

// REST bodies

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationRequest {
    pub provider_id: String,
    pub service_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationResponse {
    pub conversation_id: String,
}
