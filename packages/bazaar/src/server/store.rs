//! In-memory conversation store.
//!
//! Conversations are between one customer and one provider, about one
//! service. Each participant has an unread counter that grows when the other
//! side sends and resets when they mark the conversation read.

use std::collections::HashMap;

use bazaar_chat::{ConversationSummary, Message, MessageType};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Reasons the store declines a request. The display text is what clients
/// see as the rejection reason.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("conversation not found")]
    NotFound,

    #[error("not a participant")]
    NotParticipant,

    #[error("conversation archived")]
    Archived,

    #[error("message content is empty")]
    EmptyContent,

    #[error("message exceeds {0} characters")]
    TooLong(usize),

    #[error("cannot start a conversation with yourself")]
    SelfConversation,

    #[error("{0} is required")]
    Missing(&'static str),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

struct Conversation {
    id: String,
    customer_id: String,
    provider_id: String,
    service_id: String,
    archived: bool,
    created_at: DateTime<Utc>,
    messages: Vec<Message>,
    unread: HashMap<String, u32>,
}

impl Conversation {
    fn is_participant(&self, user_id: &str) -> bool {
        self.customer_id == user_id || self.provider_id == user_id
    }

    fn other_party(&self, user_id: &str) -> &str {
        if self.customer_id == user_id {
            &self.provider_id
        } else {
            &self.customer_id
        }
    }

    fn last_activity(&self) -> DateTime<Utc> {
        self.messages
            .last()
            .map(|m| m.created_at)
            .unwrap_or(self.created_at)
    }

    fn summary_for(&self, user_id: &str) -> ConversationSummary {
        let last = self.messages.last();
        ConversationSummary {
            id: self.id.clone(),
            other_party: self.other_party(user_id).to_string(),
            service_id: Some(self.service_id.clone()),
            last_message_text: last.map(Message::preview),
            last_message_at: last.map(|m| m.created_at),
            unread_count: self.unread.get(user_id).copied().unwrap_or(0),
        }
    }
}

/// A message accepted by [`ChatStore::append`].
#[derive(Debug, Clone)]
pub struct Appended {
    pub message: Message,
    /// The participant who did not send it.
    pub recipient: String,
}

pub struct ChatStore {
    conversations: RwLock<HashMap<String, Conversation>>,
    max_message_len: usize,
}

impl ChatStore {
    pub fn new(max_message_len: usize) -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            max_message_len,
        }
    }

    /// Open (or reuse) the conversation between `customer_id` and
    /// `provider_id` about `service_id`.
    pub async fn create_conversation(
        &self,
        customer_id: &str,
        provider_id: &str,
        service_id: &str,
    ) -> StoreResult<String> {
        if provider_id.trim().is_empty() {
            return Err(StoreError::Missing("providerId"));
        }
        if service_id.trim().is_empty() {
            return Err(StoreError::Missing("serviceId"));
        }
        if customer_id == provider_id {
            return Err(StoreError::SelfConversation);
        }

        let mut conversations = self.conversations.write().await;
        if let Some(existing) = conversations.values().find(|c| {
            c.customer_id == customer_id
                && c.provider_id == provider_id
                && c.service_id == service_id
                && !c.archived
        }) {
            return Ok(existing.id.clone());
        }

        let id = Uuid::new_v4().to_string();
        conversations.insert(
            id.clone(),
            Conversation {
                id: id.clone(),
                customer_id: customer_id.to_string(),
                provider_id: provider_id.to_string(),
                service_id: service_id.to_string(),
                archived: false,
                created_at: Utc::now(),
                messages: Vec::new(),
                unread: HashMap::new(),
            },
        );
        Ok(id)
    }

    /// Joining requires membership; archived conversations stay readable.
    pub async fn check_participant(&self, conversation_id: &str, user_id: &str) -> StoreResult<()> {
        let conversations = self.conversations.read().await;
        let conversation = conversations
            .get(conversation_id)
            .ok_or(StoreError::NotFound)?;
        if !conversation.is_participant(user_id) {
            return Err(StoreError::NotParticipant);
        }
        Ok(())
    }

    /// Validate and store a message from `sender_id`, counting it unread for
    /// the other participant.
    pub async fn append(
        &self,
        conversation_id: &str,
        sender_id: &str,
        content: &str,
        kind: MessageType,
        media_url: Option<String>,
    ) -> StoreResult<Appended> {
        let media_url = media_url.filter(|u| !u.trim().is_empty());
        if content.trim().is_empty() && media_url.is_none() {
            return Err(StoreError::EmptyContent);
        }
        if content.chars().count() > self.max_message_len {
            return Err(StoreError::TooLong(self.max_message_len));
        }

        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or(StoreError::NotFound)?;
        if !conversation.is_participant(sender_id) {
            return Err(StoreError::NotParticipant);
        }
        if conversation.archived {
            return Err(StoreError::Archived);
        }

        let message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            kind,
            media_url,
            created_at: Utc::now(),
        };
        let recipient = conversation.other_party(sender_id).to_string();
        *conversation.unread.entry(recipient.clone()).or_insert(0) += 1;
        conversation.messages.push(message.clone());

        Ok(Appended { message, recipient })
    }

    /// The user's conversations, most recent activity first.
    pub async fn list_for(&self, user_id: &str) -> Vec<ConversationSummary> {
        let conversations = self.conversations.read().await;
        let mut mine: Vec<&Conversation> = conversations
            .values()
            .filter(|c| c.is_participant(user_id) && !c.archived)
            .collect();
        mine.sort_by_key(|c| std::cmp::Reverse(c.last_activity()));
        mine.into_iter().map(|c| c.summary_for(user_id)).collect()
    }

    /// The latest `limit` messages, oldest first.
    pub async fn messages(
        &self,
        conversation_id: &str,
        user_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<Message>> {
        let conversations = self.conversations.read().await;
        let conversation = conversations
            .get(conversation_id)
            .ok_or(StoreError::NotFound)?;
        if !conversation.is_participant(user_id) {
            return Err(StoreError::NotParticipant);
        }
        let skip = conversation.messages.len().saturating_sub(limit);
        Ok(conversation.messages[skip..].to_vec())
    }

    pub async fn mark_read(&self, conversation_id: &str, user_id: &str) -> StoreResult<()> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or(StoreError::NotFound)?;
        if !conversation.is_participant(user_id) {
            return Err(StoreError::NotParticipant);
        }
        conversation.unread.insert(user_id.to_string(), 0);
        Ok(())
    }

    /// Archive: no further sends, hidden from lists.
    pub async fn archive(&self, conversation_id: &str, user_id: &str) -> StoreResult<()> {
        let mut conversations = self.conversations.write().await;
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or(StoreError::NotFound)?;
        if !conversation.is_participant(user_id) {
            return Err(StoreError::NotParticipant);
        }
        conversation.archived = true;
        Ok(())
    }

    pub async fn conversation_count(&self) -> usize {
        self.conversations.read().await.len()
    }
}
