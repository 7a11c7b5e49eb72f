//! Conversation fan-out groups.
//!
//! A room is the set of connections subscribed to one conversation. Each
//! room has a sequencer so that, for a given conversation, the order in
//! which sends pass the membership check is the order every subscriber
//! observes them. Different conversations never contend.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use courier_shared::protocol::ServerEvent;
use courier_shared::types::{
    ConnectionId, ConversationId, DeliveryState, Message, MessageId, NewMessage, UserId,
};

use crate::error::{lookup_failed, storage_failed, ServerError};
use crate::presence::PresenceTracker;
use crate::registry::ConnectionRegistry;
use crate::storage::{ConversationDirectory, MessageStore};

#[derive(Default)]
struct Room {
    subscribers: RwLock<HashMap<ConnectionId, UserId>>,
    sequencer: Mutex<()>,
}

impl Room {
    async fn connections(&self) -> Vec<ConnectionId> {
        self.subscribers.read().await.keys().copied().collect()
    }
}

#[derive(Clone)]
pub struct ConversationRoomRouter {
    rooms: Arc<RwLock<HashMap<ConversationId, Arc<Room>>>>,
    memberships: Arc<RwLock<HashMap<ConnectionId, HashSet<ConversationId>>>>,
    conversations: Arc<dyn ConversationDirectory>,
    messages: Arc<dyn MessageStore>,
    registry: ConnectionRegistry,
    presence: PresenceTracker,
}

impl ConversationRoomRouter {
    pub fn new(
        conversations: Arc<dyn ConversationDirectory>,
        messages: Arc<dyn MessageStore>,
        registry: ConnectionRegistry,
        presence: PresenceTracker,
    ) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            memberships: Arc::new(RwLock::new(HashMap::new())),
            conversations,
            messages,
            registry,
            presence,
        }
    }

    /// Fails with `AccessDenied` unless `user` participates in `conversation`.
    pub async fn check_participant(
        &self,
        user: UserId,
        conversation: ConversationId,
    ) -> Result<(), ServerError> {
        let allowed = self
            .conversations
            .is_participant(user, conversation)
            .await
            .map_err(lookup_failed)?;
        if !allowed {
            warn!(user = %user, conversation = %conversation, "Access denied");
            return Err(ServerError::AccessDenied { user, conversation });
        }
        Ok(())
    }

    pub async fn join(
        &self,
        connection: ConnectionId,
        user: UserId,
        conversation: ConversationId,
    ) -> Result<(), ServerError> {
        self.check_participant(user, conversation).await?;

        let room = self.room(conversation).await;
        room.subscribers.write().await.insert(connection, user);
        drop(room);

        self.memberships
            .write()
            .await
            .entry(connection)
            .or_default()
            .insert(conversation);

        debug!(conn = %connection.short(), user = %user, conversation = %conversation, "Joined room");
        Ok(())
    }

    pub async fn leave(&self, connection: ConnectionId, conversation: ConversationId) {
        {
            let mut memberships = self.memberships.write().await;
            if let Some(set) = memberships.get_mut(&connection) {
                set.remove(&conversation);
                if set.is_empty() {
                    memberships.remove(&connection);
                }
            }
        }
        self.unsubscribe(connection, conversation).await;
    }

    /// Remove a closing connection from every room it joined.
    pub async fn drop_connection(&self, connection: ConnectionId) {
        let joined = self
            .memberships
            .write()
            .await
            .remove(&connection)
            .unwrap_or_default();
        for conversation in joined {
            self.unsubscribe(connection, conversation).await;
        }
    }

    pub async fn is_subscribed(&self, connection: ConnectionId, conversation: ConversationId) -> bool {
        self.memberships
            .read()
            .await
            .get(&connection)
            .map(|set| set.contains(&conversation))
            .unwrap_or(false)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Persist and fan out a message. The sender gets its echo even when
    /// its connection has not joined the room.
    pub async fn relay_message(
        &self,
        connection: ConnectionId,
        message: NewMessage,
    ) -> Result<Message, ServerError> {
        let conversation = message.conversation_id;
        let room = self.room(conversation).await;

        let result = async {
            let _turn = room.sequencer.lock().await;

            // Re-checked on every send; membership may change after join.
            self.check_participant(message.sender_id, conversation).await?;

            let stored = self
                .messages
                .persist_message(message)
                .await
                .map_err(storage_failed)?;

            let subscribers = room.connections().await;
            for conn in &subscribers {
                self.registry
                    .send(*conn, ServerEvent::NewMessage(stored.clone()))
                    .await;
            }
            if !subscribers.contains(&connection) {
                self.registry
                    .send(connection, ServerEvent::NewMessage(stored.clone()))
                    .await;
            }

            debug!(
                message = %stored.id,
                conversation = %conversation,
                recipients = subscribers.len(),
                "Message relayed"
            );
            Ok(stored)
        }
        .await;

        drop(room);
        self.prune(conversation).await;
        result
    }

    /// Point-to-point delivery by user, ignoring rooms.
    pub async fn relay_to_user(&self, user: UserId, event: ServerEvent) -> Result<(), ServerError> {
        let connection = self
            .presence
            .connection_of(user)
            .await
            .ok_or(ServerError::PeerUnreachable(user))?;
        if !self.registry.send(connection, event).await {
            return Err(ServerError::PeerUnreachable(user));
        }
        Ok(())
    }

    /// Typing indicators go to everyone else in the room. Only subscribed
    /// connections may send them, so no storage round-trip is needed.
    pub async fn relay_typing(
        &self,
        connection: ConnectionId,
        user: UserId,
        conversation: ConversationId,
        is_typing: bool,
    ) -> Result<(), ServerError> {
        if !self.is_subscribed(connection, conversation).await {
            return Err(ServerError::AccessDenied { user, conversation });
        }
        let Some(room) = self.rooms.read().await.get(&conversation).cloned() else {
            return Ok(());
        };

        let event = ServerEvent::UserTyping {
            conversation_id: conversation,
            user_id: user,
            is_typing,
        };
        for conn in room.connections().await {
            if conn != connection {
                self.registry.send(conn, event.clone()).await;
            }
        }
        Ok(())
    }

    /// Advance a message's delivery state on behalf of a recipient and tell
    /// the room (and the sender, wherever they are connected).
    pub async fn relay_receipt(
        &self,
        user: UserId,
        message_id: MessageId,
        state: DeliveryState,
    ) -> Result<(), ServerError> {
        let message = self
            .messages
            .get_message(message_id)
            .await
            .map_err(lookup_failed)?
            .ok_or_else(|| ServerError::NotFound(format!("message {message_id}")))?;

        self.check_participant(user, message.conversation_id).await?;
        if message.sender_id == user {
            return Err(ServerError::IllegalTransition(
                "only a recipient can acknowledge a message".into(),
            ));
        }

        let advanced = self
            .messages
            .advance_delivery_state(message_id, state)
            .await
            .map_err(storage_failed)?;
        let Some(next) = advanced else {
            return Ok(());
        };

        let conversation_id = message.conversation_id;
        let event = match next {
            DeliveryState::Read => ServerEvent::MessageRead {
                conversation_id,
                message_id,
            },
            _ => ServerEvent::MessageDelivered {
                conversation_id,
                message_id,
            },
        };

        let mut targets: HashSet<ConnectionId> = match self.rooms.read().await.get(&conversation_id) {
            Some(room) => room.connections().await.into_iter().collect(),
            None => HashSet::new(),
        };
        if let Some(sender_conn) = self.presence.connection_of(message.sender_id).await {
            targets.insert(sender_conn);
        }
        for conn in targets {
            self.registry.send(conn, event.clone()).await;
        }

        debug!(message = %message_id, state = ?next, "Delivery state advanced");
        Ok(())
    }

    async fn room(&self, conversation: ConversationId) -> Arc<Room> {
        if let Some(room) = self.rooms.read().await.get(&conversation) {
            return room.clone();
        }
        self.rooms
            .write()
            .await
            .entry(conversation)
            .or_default()
            .clone()
    }

    async fn unsubscribe(&self, connection: ConnectionId, conversation: ConversationId) {
        let room = self.rooms.read().await.get(&conversation).cloned();
        if let Some(room) = room {
            // Wait out any fan-out in progress so it cannot reach a
            // connection that has already left.
            let _turn = room.sequencer.lock().await;
            room.subscribers.write().await.remove(&connection);
        }
        self.prune(conversation).await;
    }

    /// Drop an empty room nobody else is holding.
    async fn prune(&self, conversation: ConversationId) {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(&conversation) else {
            return;
        };
        if Arc::strong_count(room) == 1 && room.subscribers.read().await.is_empty() {
            rooms.remove(&conversation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionPolicy;
    use crate::storage::MemoryStore;
    use courier_shared::types::Nonce;
    use tokio::sync::mpsc;

    struct Fixture {
        store: Arc<MemoryStore>,
        registry: ConnectionRegistry,
        presence: PresenceTracker,
        router: ConversationRoomRouter,
        conversation: ConversationId,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        store.add_user(UserId(1), "Alice").await;
        store.add_user(UserId(2), "Bob").await;
        store.add_user(UserId(3), "Mallory").await;
        let conversation = store
            .create_conversation(&[UserId(1), UserId(2)], false)
            .await
            .unwrap()
            .id;

        let registry = ConnectionRegistry::new(64);
        let presence = PresenceTracker::new(registry.clone());
        let router = ConversationRoomRouter::new(
            store.clone(),
            store.clone(),
            registry.clone(),
            presence.clone(),
        );
        Fixture {
            store,
            registry,
            presence,
            router,
            conversation,
        }
    }

    async fn online(
        f: &Fixture,
        user: UserId,
    ) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
        let (conn, rx) = f.registry.open(Some(user)).await;
        f.presence
            .authenticate(conn, user, HashSet::new(), SessionPolicy::Evict)
            .await
            .unwrap();
        (conn, rx)
    }

    fn draft(conversation: ConversationId, sender: UserId, tag: u8) -> NewMessage {
        NewMessage {
            conversation_id: conversation,
            sender_id: sender,
            ciphertext: vec![tag; 24],
            nonce: Nonce([tag; 24]),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn message_ids(events: &[ServerEvent]) -> Vec<MessageId> {
        events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::NewMessage(m) => Some(m.id),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_join_requires_participation() {
        let f = fixture().await;
        let (conn, _rx) = online(&f, UserId(3)).await;

        let err = f.router.join(conn, UserId(3), f.conversation).await.unwrap_err();
        assert_eq!(
            err,
            ServerError::AccessDenied {
                user: UserId(3),
                conversation: f.conversation
            }
        );
        assert!(!f.router.is_subscribed(conn, f.conversation).await);
    }

    #[tokio::test]
    async fn test_join_lookup_failure_is_distinct() {
        let f = fixture().await;
        let (conn, _rx) = online(&f, UserId(1)).await;
        f.store.set_fail_reads(true);

        let err = f.router.join(conn, UserId(1), f.conversation).await.unwrap_err();
        assert!(matches!(err, ServerError::LookupFailed(_)));
    }

    #[tokio::test]
    async fn test_fan_out_includes_sender_echo() {
        let f = fixture().await;
        let (a, mut a_rx) = online(&f, UserId(1)).await;
        let (b, mut b_rx) = online(&f, UserId(2)).await;
        f.router.join(a, UserId(1), f.conversation).await.unwrap();
        f.router.join(b, UserId(2), f.conversation).await.unwrap();

        let stored = f
            .router
            .relay_message(a, draft(f.conversation, UserId(1), 1))
            .await
            .unwrap();

        assert_eq!(message_ids(&drain(&mut a_rx)), vec![stored.id]);
        assert_eq!(message_ids(&drain(&mut b_rx)), vec![stored.id]);
    }

    #[tokio::test]
    async fn test_leave_waits_for_fan_out_in_progress() {
        let f = fixture().await;
        let (a, mut a_rx) = online(&f, UserId(1)).await;
        let (b, mut b_rx) = online(&f, UserId(2)).await;
        f.router.join(a, UserId(1), f.conversation).await.unwrap();
        f.router.join(b, UserId(2), f.conversation).await.unwrap();

        let room = f.router.rooms.read().await.get(&f.conversation).cloned().unwrap();
        let turn = room.sequencer.lock().await;

        let router = f.router.clone();
        let conversation = f.conversation;
        let leave = tokio::spawn(async move { router.leave(b, conversation).await });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!leave.is_finished());
        assert!(room.connections().await.contains(&b));

        drop(turn);
        leave.await.unwrap();
        assert_eq!(room.connections().await, vec![a]);
        drop(room);

        let stored = f
            .router
            .relay_message(a, draft(f.conversation, UserId(1), 1))
            .await
            .unwrap();
        assert_eq!(message_ids(&drain(&mut a_rx)), vec![stored.id]);
        assert!(drain(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn test_unjoined_sender_still_gets_echo() {
        let f = fixture().await;
        let (a, mut a_rx) = online(&f, UserId(1)).await;

        let stored = f
            .router
            .relay_message(a, draft(f.conversation, UserId(1), 1))
            .await
            .unwrap();
        assert_eq!(message_ids(&drain(&mut a_rx)), vec![stored.id]);
        assert_eq!(f.router.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_non_participant_send_is_not_persisted() {
        let f = fixture().await;
        let (m, mut m_rx) = online(&f, UserId(3)).await;

        let err = f
            .router
            .relay_message(m, draft(f.conversation, UserId(3), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::AccessDenied { .. }));
        assert!(drain(&mut m_rx).is_empty());
        assert!(f
            .store
            .load_messages_before(f.conversation, None, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure_means_no_echo() {
        let f = fixture().await;
        let (a, mut a_rx) = online(&f, UserId(1)).await;
        let (b, mut b_rx) = online(&f, UserId(2)).await;
        f.router.join(a, UserId(1), f.conversation).await.unwrap();
        f.router.join(b, UserId(2), f.conversation).await.unwrap();
        f.store.set_fail_writes(true);

        let err = f
            .router
            .relay_message(a, draft(f.conversation, UserId(1), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::StorageFailure(_)));
        assert!(drain(&mut a_rx).is_empty());
        assert!(drain(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_sends_observed_in_same_order() {
        let f = fixture().await;
        let (a, mut a_rx) = online(&f, UserId(1)).await;
        let (b, mut b_rx) = online(&f, UserId(2)).await;
        f.router.join(a, UserId(1), f.conversation).await.unwrap();
        f.router.join(b, UserId(2), f.conversation).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..20u8 {
            let router = f.router.clone();
            let conversation = f.conversation;
            let (conn, sender) = if i % 2 == 0 { (a, UserId(1)) } else { (b, UserId(2)) };
            handles.push(tokio::spawn(async move {
                router
                    .relay_message(conn, draft(conversation, sender, i))
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let seen_by_a = message_ids(&drain(&mut a_rx));
        let seen_by_b = message_ids(&drain(&mut b_rx));
        assert_eq!(seen_by_a.len(), 20);
        assert_eq!(seen_by_a, seen_by_b);
        let mut sorted = seen_by_a.clone();
        sorted.sort();
        assert_eq!(seen_by_a, sorted);
    }

    #[tokio::test]
    async fn test_leave_stops_delivery() {
        let f = fixture().await;
        let (a, mut a_rx) = online(&f, UserId(1)).await;
        let (b, mut b_rx) = online(&f, UserId(2)).await;
        f.router.join(a, UserId(1), f.conversation).await.unwrap();
        f.router.join(b, UserId(2), f.conversation).await.unwrap();

        f.router.leave(b, f.conversation).await;
        f.router
            .relay_message(a, draft(f.conversation, UserId(1), 1))
            .await
            .unwrap();

        assert_eq!(message_ids(&drain(&mut a_rx)).len(), 1);
        assert!(drain(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn test_drop_connection_frees_rooms() {
        let f = fixture().await;
        let (a, _a_rx) = online(&f, UserId(1)).await;
        f.router.join(a, UserId(1), f.conversation).await.unwrap();
        assert_eq!(f.router.room_count().await, 1);

        f.router.drop_connection(a).await;
        assert_eq!(f.router.room_count().await, 0);
        assert!(!f.router.is_subscribed(a, f.conversation).await);
    }

    #[tokio::test]
    async fn test_relay_to_offline_user_is_unreachable() {
        let f = fixture().await;
        let err = f
            .router
            .relay_to_user(UserId(2), ServerEvent::UserOnline { user_id: UserId(1) })
            .await
            .unwrap_err();
        assert_eq!(err, ServerError::PeerUnreachable(UserId(2)));
    }

    #[tokio::test]
    async fn test_typing_excludes_sender_and_requires_join() {
        let f = fixture().await;
        let (a, mut a_rx) = online(&f, UserId(1)).await;
        let (b, mut b_rx) = online(&f, UserId(2)).await;

        assert!(f
            .router
            .relay_typing(a, UserId(1), f.conversation, true)
            .await
            .is_err());

        f.router.join(a, UserId(1), f.conversation).await.unwrap();
        f.router.join(b, UserId(2), f.conversation).await.unwrap();
        f.router
            .relay_typing(a, UserId(1), f.conversation, true)
            .await
            .unwrap();

        assert!(drain(&mut a_rx).is_empty());
        assert_eq!(
            drain(&mut b_rx),
            vec![ServerEvent::UserTyping {
                conversation_id: f.conversation,
                user_id: UserId(1),
                is_typing: true
            }]
        );
    }

    #[tokio::test]
    async fn test_receipts_are_recipient_driven_and_forward_only() {
        let f = fixture().await;
        let (a, mut a_rx) = online(&f, UserId(1)).await;
        let (_b, _b_rx) = online(&f, UserId(2)).await;
        let stored = f
            .router
            .relay_message(a, draft(f.conversation, UserId(1), 1))
            .await
            .unwrap();
        drain(&mut a_rx);

        // Sender cannot mark its own message.
        assert!(matches!(
            f.router
                .relay_receipt(UserId(1), stored.id, DeliveryState::Delivered)
                .await,
            Err(ServerError::IllegalTransition(_))
        ));

        f.router
            .relay_receipt(UserId(2), stored.id, DeliveryState::Read)
            .await
            .unwrap();
        assert_eq!(
            drain(&mut a_rx),
            vec![ServerEvent::MessageRead {
                conversation_id: f.conversation,
                message_id: stored.id
            }]
        );

        // Going back to delivered is a silent no-op.
        f.router
            .relay_receipt(UserId(2), stored.id, DeliveryState::Delivered)
            .await
            .unwrap();
        assert!(drain(&mut a_rx).is_empty());
    }

    #[tokio::test]
    async fn test_receipt_for_unknown_message() {
        let f = fixture().await;
        let err = f
            .router
            .relay_receipt(UserId(2), MessageId(404), DeliveryState::Read)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::NotFound(_)));
    }
}
