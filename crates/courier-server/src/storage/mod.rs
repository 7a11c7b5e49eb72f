//! Collaborator interfaces consumed by the core.
//!
//! Persistence, membership and sessions belong to the storage and auth
//! layers. The core only talks to them through these traits; membership
//! checks and message writes are the only places the core awaits on I/O.

mod memory;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use courier_shared::keys::KeyDirectory;
use courier_shared::types::{
    ConversationId, DeliveryState, Message, MessageId, NewMessage, PublicKey, UserId,
};

pub use memory::{MemoryStore, Seed};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid record: {0}")]
    Invalid(String),
}

#[async_trait]
pub trait ConversationDirectory: Send + Sync {
    async fn is_participant(
        &self,
        user: UserId,
        conversation: ConversationId,
    ) -> Result<bool, StorageError>;

    /// Everyone sharing at least one conversation with `user`.
    async fn contacts_of(&self, user: UserId) -> Result<HashSet<UserId>, StorageError>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Assigns the id and timestamp. Ids increase strictly per conversation.
    async fn persist_message(&self, message: NewMessage) -> Result<Message, StorageError>;

    /// Up to `limit` messages with id strictly below `before` (or the newest
    /// ones when `before` is `None`), newest first.
    async fn load_messages_before(
        &self,
        conversation: ConversationId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<Message>, StorageError>;

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>, StorageError>;

    /// Move a message forward to `state`. Returns the new state, or `None`
    /// when the message was already at or past it.
    async fn advance_delivery_state(
        &self,
        id: MessageId,
        state: DeliveryState,
    ) -> Result<Option<DeliveryState>, StorageError>;
}

#[async_trait]
pub trait KeyPublisher: Send + Sync {
    async fn set_public_key(&self, user: UserId, key: PublicKey) -> Result<(), StorageError>;
}

#[async_trait]
pub trait SessionLookup: Send + Sync {
    /// Resolve a session token issued by the auth layer.
    async fn current_user_id(&self, token: &str) -> Result<Option<UserId>, StorageError>;
}

/// Handles to every collaborator, usually all backed by one store.
#[derive(Clone)]
pub struct Collaborators {
    pub conversations: Arc<dyn ConversationDirectory>,
    pub messages: Arc<dyn MessageStore>,
    pub keys: Arc<dyn KeyDirectory>,
    pub key_publisher: Arc<dyn KeyPublisher>,
    pub sessions: Arc<dyn SessionLookup>,
}

impl Collaborators {
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: ConversationDirectory
            + MessageStore
            + KeyDirectory
            + KeyPublisher
            + SessionLookup
            + 'static,
    {
        Self {
            conversations: store.clone(),
            messages: store.clone(),
            keys: store.clone(),
            key_publisher: store.clone(),
            sessions: store,
        }
    }
}
