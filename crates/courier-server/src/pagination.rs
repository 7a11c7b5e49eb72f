//! Backward paging through a conversation's history.
//!
//! Pages are keyed by the monotonic message id, never by `createdAt`, so
//! chained pages partition the history with no gaps or duplicates.

use std::sync::Arc;

use courier_shared::types::{ConversationId, Message, MessageId};

use crate::error::{lookup_failed, ServerError};
use crate::storage::MessageStore;

/// One page, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub messages: Vec<Message>,
    pub limit: u32,
}

impl Page {
    /// A full page suggests older messages exist.
    pub fn has_more(&self) -> bool {
        self.messages.len() == self.limit as usize
    }

    /// Cursor for the next (older) page.
    pub fn next_cursor(&self) -> Option<MessageId> {
        self.messages.last().map(|m| m.id)
    }

    /// Oldest first, as rendered.
    pub fn chronological(mut self) -> Vec<Message> {
        self.messages.reverse();
        self.messages
    }
}

#[derive(Clone)]
pub struct PaginationCursor {
    messages: Arc<dyn MessageStore>,
    default_limit: u32,
    max_limit: u32,
}

impl PaginationCursor {
    pub fn new(messages: Arc<dyn MessageStore>, default_limit: u32, max_limit: u32) -> Self {
        let max_limit = max_limit.max(1);
        Self {
            messages,
            default_limit: default_limit.clamp(1, max_limit),
            max_limit,
        }
    }

    pub fn effective_limit(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_limit)
            .clamp(1, self.max_limit)
    }

    /// The `limit` messages immediately before `before`, or the most recent
    /// ones without a cursor.
    pub async fn page(
        &self,
        conversation: ConversationId,
        limit: Option<u32>,
        before: Option<MessageId>,
    ) -> Result<Page, ServerError> {
        let limit = self.effective_limit(limit);
        let mut messages = self
            .messages
            .load_messages_before(conversation, before, limit)
            .await
            .map_err(lookup_failed)?;

        // Don't trust the collaborator's ordering or bounds.
        messages.retain(|m| m.conversation_id == conversation);
        if let Some(cursor) = before {
            messages.retain(|m| m.id < cursor);
        }
        messages.sort_by(|a, b| b.id.cmp(&a.id));
        messages.dedup_by_key(|m| m.id);
        messages.truncate(limit as usize);

        Ok(Page { messages, limit })
    }
}
