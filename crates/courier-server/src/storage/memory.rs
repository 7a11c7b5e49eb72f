//! In-memory backend implementing every collaborator trait.
//!
//! Used by the binary when no external store is wired in, and by tests.
//! Optionally seeded from a JSON fixture (`SEED_PATH`).

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

use courier_shared::error::LookupError;
use courier_shared::keys::KeyDirectory;
use courier_shared::types::{
    Conversation, ConversationId, DeliveryState, Identity, Message, MessageId, NewMessage,
    PublicKey, UserId,
};

use super::{ConversationDirectory, KeyPublisher, MessageStore, SessionLookup, StorageError};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedUser {
    pub id: UserId,
    pub display_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedConversation {
    pub participant_ids: Vec<UserId>,
    #[serde(default)]
    pub is_group: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedSession {
    pub token: String,
    pub user_id: UserId,
}

/// Fixture format for `SEED_PATH`.
#[derive(Debug, Default, Deserialize)]
pub struct Seed {
    #[serde(default)]
    pub users: Vec<SeedUser>,
    #[serde(default)]
    pub conversations: Vec<SeedConversation>,
    #[serde(default)]
    pub sessions: Vec<SeedSession>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<UserId, Identity>,
    conversations: HashMap<ConversationId, Conversation>,
    messages: HashMap<ConversationId, BTreeMap<MessageId, Message>>,
    message_index: HashMap<MessageId, ConversationId>,
    sessions: HashMap<String, UserId>,
    next_conversation_id: u64,
    next_message_id: u64,
    last_created_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn from_seed(seed: Seed) -> Result<Self, StorageError> {
        let store = Self::new();
        for user in seed.users {
            store.add_user(user.id, &user.display_name).await;
        }
        for conversation in seed.conversations {
            store
                .create_conversation(&conversation.participant_ids, conversation.is_group)
                .await?;
        }
        {
            let mut inner = store.inner.write().await;
            for session in seed.sessions {
                inner.sessions.insert(session.token, session.user_id);
            }
        }
        Ok(store)
    }

    pub async fn from_seed_file(path: &Path) -> Result<Self, StorageError> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            StorageError::Unavailable(format!("Failed to read seed '{}': {}", path.display(), e))
        })?;
        let seed: Seed = serde_json::from_str(&raw)
            .map_err(|e| StorageError::Invalid(format!("Bad seed file: {e}")))?;

        info!(
            path = %path.display(),
            users = seed.users.len(),
            conversations = seed.conversations.len(),
            "Loading seed data"
        );
        Self::from_seed(seed).await
    }

    pub async fn add_user(&self, id: UserId, display_name: &str) {
        let mut inner = self.inner.write().await;
        inner.users.entry(id).or_insert_with(|| Identity {
            id,
            public_key: None,
            display_name: display_name.to_string(),
        });
    }

    /// Participants must be known users, at least two and unique.
    pub async fn create_conversation(
        &self,
        participants: &[UserId],
        is_group: bool,
    ) -> Result<Conversation, StorageError> {
        let participant_ids: BTreeSet<UserId> = participants.iter().copied().collect();
        if participant_ids.len() < 2 || participant_ids.len() != participants.len() {
            return Err(StorageError::Invalid(
                "a conversation needs at least two distinct participants".into(),
            ));
        }

        let mut inner = self.inner.write().await;
        if let Some(unknown) = participant_ids.iter().find(|id| !inner.users.contains_key(id)) {
            return Err(StorageError::Invalid(format!("unknown user {unknown}")));
        }

        inner.next_conversation_id += 1;
        let conversation = Conversation {
            id: ConversationId(inner.next_conversation_id),
            is_group,
            participant_ids,
        };
        inner
            .conversations
            .insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    /// Issue a session token the way the auth layer would after login.
    pub async fn issue_session(&self, user: UserId) -> String {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let token = hex::encode(bytes);
        self.inner.write().await.sessions.insert(token.clone(), user);
        token
    }

    pub async fn display_name(&self, user: UserId) -> Option<String> {
        self.inner
            .read()
            .await
            .users
            .get(&user)
            .map(|identity| identity.display_name.clone())
    }

    /// Make subsequent writes fail (fault injection).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent lookups fail (fault injection).
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn check_reads(&self) -> Result<(), StorageError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("read path offline".into()));
        }
        Ok(())
    }

    fn check_writes(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("write path offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ConversationDirectory for MemoryStore {
    async fn is_participant(
        &self,
        user: UserId,
        conversation: ConversationId,
    ) -> Result<bool, StorageError> {
        self.check_reads()?;
        Ok(self
            .inner
            .read()
            .await
            .conversations
            .get(&conversation)
            .map(|c| c.includes(user))
            .unwrap_or(false))
    }

    async fn contacts_of(&self, user: UserId) -> Result<HashSet<UserId>, StorageError> {
        self.check_reads()?;
        let inner = self.inner.read().await;
        Ok(inner
            .conversations
            .values()
            .filter(|c| c.includes(user))
            .flat_map(|c| c.participant_ids.iter().copied())
            .filter(|id| *id != user)
            .collect())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn persist_message(&self, message: NewMessage) -> Result<Message, StorageError> {
        self.check_writes()?;
        let mut inner = self.inner.write().await;
        if !inner.conversations.contains_key(&message.conversation_id) {
            return Err(StorageError::Invalid(format!(
                "unknown conversation {}",
                message.conversation_id
            )));
        }

        inner.next_message_id += 1;
        let id = MessageId(inner.next_message_id);

        // Keep createdAt non-decreasing along the id order.
        let now = Utc::now();
        let created_at = match inner.last_created_at {
            Some(last) if last > now => last,
            _ => now,
        };
        inner.last_created_at = Some(created_at);

        let stored = Message {
            id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            ciphertext: message.ciphertext,
            nonce: message.nonce,
            created_at,
            delivery_state: DeliveryState::Sent,
        };

        inner.message_index.insert(id, stored.conversation_id);
        inner
            .messages
            .entry(stored.conversation_id)
            .or_default()
            .insert(id, stored.clone());

        debug!(message = %id, conversation = %stored.conversation_id, "Message persisted");
        Ok(stored)
    }

    async fn load_messages_before(
        &self,
        conversation: ConversationId,
        before: Option<MessageId>,
        limit: u32,
    ) -> Result<Vec<Message>, StorageError> {
        self.check_reads()?;
        let inner = self.inner.read().await;
        let Some(messages) = inner.messages.get(&conversation) else {
            return Ok(Vec::new());
        };

        let upper = before.unwrap_or(MessageId(u64::MAX));
        Ok(messages
            .range(..upper)
            .rev()
            .take(limit as usize)
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>, StorageError> {
        self.check_reads()?;
        let inner = self.inner.read().await;
        Ok(inner
            .message_index
            .get(&id)
            .and_then(|conversation| inner.messages.get(conversation))
            .and_then(|messages| messages.get(&id))
            .cloned())
    }

    async fn advance_delivery_state(
        &self,
        id: MessageId,
        state: DeliveryState,
    ) -> Result<Option<DeliveryState>, StorageError> {
        self.check_writes()?;
        let mut inner = self.inner.write().await;
        let Some(conversation) = inner.message_index.get(&id).copied() else {
            return Err(StorageError::Invalid(format!("unknown message {id}")));
        };
        let message = inner
            .messages
            .get_mut(&conversation)
            .and_then(|messages| messages.get_mut(&id))
            .ok_or_else(|| StorageError::Invalid(format!("unknown message {id}")))?;

        let advanced = message.delivery_state.advance(state);
        if let Some(next) = advanced {
            message.delivery_state = next;
        }
        Ok(advanced)
    }
}

#[async_trait]
impl KeyDirectory for MemoryStore {
    async fn get_public_key(&self, user: UserId) -> Result<Option<PublicKey>, LookupError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(LookupError("identity store offline".into()));
        }
        Ok(self
            .inner
            .read()
            .await
            .users
            .get(&user)
            .and_then(|identity| identity.public_key))
    }
}

#[async_trait]
impl KeyPublisher for MemoryStore {
    async fn set_public_key(&self, user: UserId, key: PublicKey) -> Result<(), StorageError> {
        self.check_writes()?;
        let mut inner = self.inner.write().await;
        let identity = inner
            .users
            .get_mut(&user)
            .ok_or_else(|| StorageError::Invalid(format!("unknown user {user}")))?;
        identity.public_key = Some(key);
        info!(user = %user, fingerprint = %key.fingerprint(), "Public key published");
        Ok(())
    }
}

#[async_trait]
impl SessionLookup for MemoryStore {
    async fn current_user_id(&self, token: &str) -> Result<Option<UserId>, StorageError> {
        self.check_reads()?;
        Ok(self.inner.read().await.sessions.get(token).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_shared::types::Nonce;

    async fn store_with_pair() -> (MemoryStore, Conversation) {
        let store = MemoryStore::new();
        store.add_user(UserId(1), "Alice").await;
        store.add_user(UserId(2), "Bob").await;
        store.add_user(UserId(3), "Carol").await;
        let conversation = store
            .create_conversation(&[UserId(1), UserId(2)], false)
            .await
            .unwrap();
        (store, conversation)
    }

    fn new_message(conversation: ConversationId, sender: UserId) -> NewMessage {
        NewMessage {
            conversation_id: conversation,
            sender_id: sender,
            ciphertext: vec![0u8; 20],
            nonce: Nonce([0u8; 24]),
        }
    }

    #[tokio::test]
    async fn test_membership() {
        let (store, conversation) = store_with_pair().await;
        assert!(store.is_participant(UserId(1), conversation.id).await.unwrap());
        assert!(!store.is_participant(UserId(3), conversation.id).await.unwrap());
        assert!(!store
            .is_participant(UserId(1), ConversationId(999))
            .await
            .unwrap());
        assert_eq!(
            store.contacts_of(UserId(1)).await.unwrap(),
            HashSet::from([UserId(2)])
        );
    }

    #[tokio::test]
    async fn test_conversation_requires_distinct_known_participants() {
        let (store, _) = store_with_pair().await;
        assert!(store
            .create_conversation(&[UserId(1), UserId(1)], false)
            .await
            .is_err());
        assert!(store.create_conversation(&[UserId(1)], false).await.is_err());
        assert!(store
            .create_conversation(&[UserId(1), UserId(42)], false)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_ids_increase_and_timestamps_follow() {
        let (store, conversation) = store_with_pair().await;
        let a = store
            .persist_message(new_message(conversation.id, UserId(1)))
            .await
            .unwrap();
        let b = store
            .persist_message(new_message(conversation.id, UserId(2)))
            .await
            .unwrap();
        assert!(b.id > a.id);
        assert!(b.created_at >= a.created_at);
        assert_eq!(a.delivery_state, DeliveryState::Sent);
    }

    #[tokio::test]
    async fn test_load_before_is_exclusive_and_newest_first() {
        let (store, conversation) = store_with_pair().await;
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(
                store
                    .persist_message(new_message(conversation.id, UserId(1)))
                    .await
                    .unwrap()
                    .id,
            );
        }

        let page = store
            .load_messages_before(conversation.id, Some(ids[3]), 2)
            .await
            .unwrap();
        let got: Vec<MessageId> = page.iter().map(|m| m.id).collect();
        assert_eq!(got, vec![ids[2], ids[1]]);
    }

    #[tokio::test]
    async fn test_delivery_state_never_regresses() {
        let (store, conversation) = store_with_pair().await;
        let message = store
            .persist_message(new_message(conversation.id, UserId(1)))
            .await
            .unwrap();

        assert_eq!(
            store
                .advance_delivery_state(message.id, DeliveryState::Read)
                .await
                .unwrap(),
            Some(DeliveryState::Read)
        );
        assert_eq!(
            store
                .advance_delivery_state(message.id, DeliveryState::Delivered)
                .await
                .unwrap(),
            None
        );
        let stored = store.get_message(message.id).await.unwrap().unwrap();
        assert_eq!(stored.delivery_state, DeliveryState::Read);
    }

    #[tokio::test]
    async fn test_sessions_and_keys() {
        let (store, _) = store_with_pair().await;
        let token = store.issue_session(UserId(2)).await;
        assert_eq!(store.current_user_id(&token).await.unwrap(), Some(UserId(2)));
        assert_eq!(store.current_user_id("nope").await.unwrap(), None);

        assert_eq!(store.get_public_key(UserId(2)).await.unwrap(), None);
        store
            .set_public_key(UserId(2), PublicKey([5u8; 32]))
            .await
            .unwrap();
        assert_eq!(
            store.get_public_key(UserId(2)).await.unwrap(),
            Some(PublicKey([5u8; 32]))
        );
    }

    #[tokio::test]
    async fn test_seed_parsing() {
        let seed: Seed = serde_json::from_str(
            r#"{
                "users": [{"id": 1, "displayName": "Alice"}, {"id": 2, "displayName": "Bob"}],
                "conversations": [{"participantIds": [1, 2]}],
                "sessions": [{"token": "dev-alice", "userId": 1}]
            }"#,
        )
        .unwrap();
        let store = MemoryStore::from_seed(seed).await.unwrap();
        assert_eq!(
            store.current_user_id("dev-alice").await.unwrap(),
            Some(UserId(1))
        );
        assert!(store
            .is_participant(UserId(2), ConversationId(1))
            .await
            .unwrap());
        assert_eq!(store.display_name(UserId(2)).await.as_deref(), Some("Bob"));
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let (store, conversation) = store_with_pair().await;
        store.set_fail_writes(true);
        assert!(store
            .persist_message(new_message(conversation.id, UserId(1)))
            .await
            .is_err());
        store.set_fail_reads(true);
        assert!(store.get_public_key(UserId(1)).await.is_err());
    }
}
