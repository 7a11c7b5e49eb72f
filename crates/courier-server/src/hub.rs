//! Event dispatch.
//!
//! Every socket's inbound events land here in order. The hub checks that
//! the connection is authenticated, routes the event to presence, rooms,
//! history or calls, and reports failures back to that connection only.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use courier_shared::constants::{MAX_CIPHERTEXT_SIZE, TAG_SIZE};
use courier_shared::keys::KeyResolutionCache;
use courier_shared::protocol::{ClientEvent, ServerEvent};
use courier_shared::types::{
    ConnectionId, ConversationId, DeliveryState, MessageId, NewMessage, Nonce, PublicKey, UserId,
};

use crate::calls::{CallEvent, CallSignalingStateMachine};
use crate::config::ServerConfig;
use crate::error::{lookup_failed, storage_failed, ServerError};
use crate::pagination::PaginationCursor;
use crate::presence::PresenceTracker;
use crate::registry::ConnectionRegistry;
use crate::rooms::ConversationRoomRouter;
use crate::storage::Collaborators;

#[derive(Clone)]
pub struct Hub {
    config: Arc<ServerConfig>,
    registry: ConnectionRegistry,
    presence: PresenceTracker,
    rooms: ConversationRoomRouter,
    calls: CallSignalingStateMachine,
    history: PaginationCursor,
    keys: KeyResolutionCache,
    collaborators: Collaborators,
}

impl Hub {
    pub fn new(config: Arc<ServerConfig>, collaborators: Collaborators) -> Self {
        let registry = ConnectionRegistry::new(config.outbound_queue_capacity);
        let presence = PresenceTracker::new(registry.clone());
        let rooms = ConversationRoomRouter::new(
            collaborators.conversations.clone(),
            collaborators.messages.clone(),
            registry.clone(),
            presence.clone(),
        );
        let calls =
            CallSignalingStateMachine::new(rooms.clone(), config.ring_timeout, config.end_grace);
        let history = PaginationCursor::new(
            collaborators.messages.clone(),
            config.history_default_page,
            config.history_max_page,
        );
        let keys = KeyResolutionCache::new(collaborators.keys.clone());

        Self {
            config,
            registry,
            presence,
            rooms,
            calls,
            history,
            keys,
            collaborators,
        }
    }

    /// Register a socket. `verified_user` is the identity proven by the
    /// session token, if any.
    pub async fn open_connection(
        &self,
        verified_user: Option<UserId>,
    ) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
        self.registry.open(verified_user).await
    }

    /// Tear down everything tied to a socket.
    pub async fn close_connection(&self, connection: ConnectionId) {
        self.registry.close(connection).await;
        self.rooms.drop_connection(connection).await;
        if let Some(user) = self.presence.disconnect(connection).await {
            self.calls.peer_disconnected(user).await;
            info!(conn = %connection.short(), user = %user, "Connection closed");
        } else {
            debug!(conn = %connection.short(), "Connection closed");
        }
    }

    /// Handle one inbound event; any failure is sent back as an `error` event.
    pub async fn handle_event(&self, connection: ConnectionId, event: ClientEvent) {
        let name = event.name();
        if let Err(err) = self.dispatch(connection, event).await {
            match &err {
                ServerError::AccessDenied { .. } => {
                    warn!(conn = %connection.short(), event = name, error = %err, "Event rejected")
                }
                ServerError::StorageFailure(_) | ServerError::LookupFailed(_) => {
                    warn!(conn = %connection.short(), event = name, error = %err, "Collaborator failure")
                }
                _ => debug!(conn = %connection.short(), event = name, error = %err, "Event rejected"),
            }
            self.send_error(connection, &err).await;
        }
    }

    pub async fn send_error(&self, connection: ConnectionId, err: &ServerError) {
        self.registry.send(connection, err.to_event()).await;
    }

    pub async fn online_count(&self) -> usize {
        self.presence.online_count().await
    }

    pub async fn connection_count(&self) -> usize {
        self.registry.len().await
    }

    pub async fn active_calls(&self) -> usize {
        self.calls.active_count().await
    }

    async fn dispatch(&self, connection: ConnectionId, event: ClientEvent) -> Result<(), ServerError> {
        if let ClientEvent::Authenticate { user_id } = event {
            return self.authenticate(connection, user_id).await;
        }

        let user = self
            .registry
            .user_of(connection)
            .await
            .ok_or_else(|| ServerError::Unauthenticated("authenticate first".into()))?;

        match event {
            ClientEvent::Authenticate { .. } => Ok(()),
            ClientEvent::PublishKey { public_key } => {
                self.publish_key(connection, user, public_key).await
            }
            ClientEvent::GetPublicKey { user_id } => {
                let public_key = self.keys.resolve(user_id).await?.key();
                self.reply(
                    connection,
                    ServerEvent::PublicKeyResolved {
                        user_id,
                        public_key,
                    },
                )
                .await;
                Ok(())
            }
            ClientEvent::JoinConversation { conversation_id } => {
                self.rooms.join(connection, user, conversation_id).await?;
                self.reply(connection, ServerEvent::JoinedConversation { conversation_id })
                    .await;
                Ok(())
            }
            ClientEvent::LeaveConversation { conversation_id } => {
                self.rooms.leave(connection, conversation_id).await;
                Ok(())
            }
            ClientEvent::SendMessage {
                conversation_id,
                ciphertext,
                nonce,
            } => {
                self.send_message(connection, user, conversation_id, ciphertext, nonce)
                    .await
            }
            ClientEvent::Typing {
                conversation_id,
                is_typing,
            } => {
                self.rooms
                    .relay_typing(connection, user, conversation_id, is_typing)
                    .await
            }
            ClientEvent::MarkAsDelivered { message_id } => {
                self.rooms
                    .relay_receipt(user, message_id, DeliveryState::Delivered)
                    .await
            }
            ClientEvent::MarkAsRead { message_id } => {
                self.rooms
                    .relay_receipt(user, message_id, DeliveryState::Read)
                    .await
            }
            ClientEvent::LoadHistory {
                conversation_id,
                limit,
                before_message_id,
            } => {
                self.load_history(connection, user, conversation_id, limit, before_message_id)
                    .await
            }
            ClientEvent::CallInitiate {
                to_user_id,
                media,
                offer,
            } => {
                self.calls
                    .handle(user, to_user_id, CallEvent::Initiate { media, offer })
                    .await
            }
            ClientEvent::CallAccept { to_user_id, answer } => {
                self.calls
                    .handle(user, to_user_id, CallEvent::Accept { answer })
                    .await
            }
            ClientEvent::CallReject { to_user_id, reason } => {
                self.calls
                    .handle(user, to_user_id, CallEvent::Reject { reason })
                    .await
            }
            ClientEvent::CallIce {
                to_user_id,
                candidate,
            } => {
                self.calls
                    .handle(user, to_user_id, CallEvent::Ice { candidate })
                    .await
            }
            ClientEvent::CallEnd { to_user_id } => {
                self.calls.handle(user, to_user_id, CallEvent::End).await
            }
            ClientEvent::CallFailed { to_user_id, reason } => {
                self.calls
                    .handle(user, to_user_id, CallEvent::Failed { reason })
                    .await
            }
        }
    }

    async fn authenticate(&self, connection: ConnectionId, user: UserId) -> Result<(), ServerError> {
        match self.registry.verified_user_of(connection).await {
            Some(verified) if verified != user => {
                return Err(ServerError::Unauthenticated(
                    "session token belongs to another user".into(),
                ));
            }
            Some(_) => {}
            None if self.config.allow_unverified_auth => {}
            None => {
                return Err(ServerError::Unauthenticated("no valid session".into()));
            }
        }

        let contacts = self
            .collaborators
            .conversations
            .contacts_of(user)
            .await
            .map_err(lookup_failed)?;

        let auth = self
            .presence
            .authenticate(connection, user, contacts, self.config.session_policy)
            .await?;
        self.registry.bind_user(connection, user).await;
        self.reply(
            connection,
            ServerEvent::PresenceSnapshot {
                online_user_ids: auth.snapshot,
            },
        )
        .await;

        if let Some(old) = auth.replaced {
            self.rooms.drop_connection(old).await;
            self.send_error(old, &ServerError::SessionReplaced).await;
            self.registry.close(old).await;
        }

        info!(conn = %connection.short(), user = %user, "Authenticated");
        Ok(())
    }

    async fn publish_key(
        &self,
        connection: ConnectionId,
        user: UserId,
        key: PublicKey,
    ) -> Result<(), ServerError> {
        if !self.registry.mark_key_published(connection).await {
            return Err(ServerError::IllegalTransition(
                "key already published for this session".into(),
            ));
        }
        if let Err(e) = self.collaborators.key_publisher.set_public_key(user, key).await {
            self.registry.clear_key_published(connection).await;
            return Err(storage_failed(e));
        }
        self.keys.invalidate(user).await;
        Ok(())
    }

    async fn send_message(
        &self,
        connection: ConnectionId,
        user: UserId,
        conversation_id: ConversationId,
        ciphertext: Vec<u8>,
        nonce: Nonce,
    ) -> Result<(), ServerError> {
        if ciphertext.len() < TAG_SIZE {
            return Err(ServerError::Malformed(
                "ciphertext shorter than an authentication tag".into(),
            ));
        }
        if ciphertext.len() > MAX_CIPHERTEXT_SIZE {
            return Err(ServerError::Malformed(format!(
                "ciphertext exceeds {MAX_CIPHERTEXT_SIZE} bytes"
            )));
        }

        self.rooms
            .relay_message(
                connection,
                NewMessage {
                    conversation_id,
                    sender_id: user,
                    ciphertext,
                    nonce,
                },
            )
            .await?;
        Ok(())
    }

    async fn load_history(
        &self,
        connection: ConnectionId,
        user: UserId,
        conversation_id: ConversationId,
        limit: Option<u32>,
        before: Option<MessageId>,
    ) -> Result<(), ServerError> {
        self.rooms.check_participant(user, conversation_id).await?;
        let page = self.history.page(conversation_id, limit, before).await?;
        let has_more = page.has_more();
        self.reply(
            connection,
            ServerEvent::History {
                conversation_id,
                messages: page.chronological(),
                has_more,
            },
        )
        .await;
        Ok(())
    }

    async fn reply(&self, connection: ConnectionId, event: ServerEvent) {
        self.registry.send(connection, event).await;
    }
}
