//! Conversation list kept current by `activity-notification` pushes.
//!
//! Rows always originate from the REST API; pushes only update rows that are
//! already present. Each update swaps preview, timestamp, and unread count
//! under one write lock so readers never see half of it.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};

use crate::api::ChatApi;
use crate::error::Result;
use crate::mux::{EventMux, Subscription};
use crate::protocol::{ActivityNotification, ConversationSummary};

#[derive(Debug, Clone, Default)]
pub struct ConversationList {
    rows: Arc<RwLock<Vec<ConversationSummary>>>,
}

impl ConversationList {
    pub fn new(rows: Vec<ConversationSummary>) -> Self {
        Self {
            rows: Arc::new(RwLock::new(rows)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<ConversationSummary>> {
        self.rows.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<ConversationSummary>> {
        self.rows.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn replace(&self, rows: Vec<ConversationSummary>) {
        *self.write() = rows;
    }

    pub fn snapshot(&self) -> Vec<ConversationSummary> {
        self.read().clone()
    }

    pub fn get(&self, conversation_id: &str) -> Option<ConversationSummary> {
        self.read().iter().find(|s| s.id == conversation_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Fold one notification into its row. Unknown conversations are dropped.
    pub fn apply(&self, notification: &ActivityNotification) -> bool {
        let mut rows = self.write();
        let Some(row) = rows
            .iter_mut()
            .find(|s| s.id == notification.conversation_id)
        else {
            debug!(
                conversation = %notification.conversation_id,
                "activity for unknown conversation dropped"
            );
            return false;
        };
        row.last_message_text = Some(notification.message.preview());
        row.last_message_at = Some(notification.message.created_at);
        row.unread_count = row.unread_count.saturating_add(notification.unread_delta);
        true
    }

    /// Keep this list current from `mux`'s activity notifications.
    pub fn attach(&self, mux: &EventMux) -> Subscription {
        let list = self.clone();
        mux.on::<ActivityNotification, _>(move |notification| {
            list.apply(notification);
        })
    }

    /// Reset unread locally after the user opened the conversation.
    pub fn mark_read(&self, conversation_id: &str) -> bool {
        match self.write().iter_mut().find(|s| s.id == conversation_id) {
            Some(row) => {
                row.unread_count = 0;
                true
            }
            None => false,
        }
    }

    /// Most recent activity first; rows without messages last.
    pub fn sorted_by_recent(&self) -> Vec<ConversationSummary> {
        let mut rows = self.snapshot();
        rows.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        rows
    }

    /// Re-fetch every row from the server, which is authoritative.
    pub async fn refresh(&self, api: &dyn ChatApi) -> Result<usize> {
        let rows = api.list_conversations().await?;
        let count = rows.len();
        self.replace(rows);
        info!(conversations = count, "conversation list refreshed");
        Ok(count)
    }
}
