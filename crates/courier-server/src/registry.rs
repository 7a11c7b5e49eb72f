//! Live connections and their outbound queues.
//!
//! Every socket gets a bounded queue drained by its writer task. Delivery
//! never blocks a sender: a connection whose queue is full is dropped from
//! the registry, which closes its channel and ends the socket.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use courier_shared::protocol::ServerEvent;
use courier_shared::types::{ConnectionId, UserId};

struct Entry {
    /// Set once `authenticate` succeeds.
    user: Option<UserId>,
    /// Identity proven by the session token at upgrade time.
    verified_user: Option<UserId>,
    outbound: mpsc::Sender<ServerEvent>,
    key_published: bool,
}

#[derive(Clone)]
pub struct ConnectionRegistry {
    entries: Arc<RwLock<HashMap<ConnectionId, Entry>>>,
    capacity: usize,
}

impl ConnectionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    pub async fn open(
        &self,
        verified_user: Option<UserId>,
    ) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = ConnectionId::new();
        self.entries.write().await.insert(
            id,
            Entry {
                user: None,
                verified_user,
                outbound: tx,
                key_published: false,
            },
        );
        debug!(conn = %id.short(), "Connection registered");
        (id, rx)
    }

    /// Drop the entry. Returns false if it was already gone.
    pub async fn close(&self, id: ConnectionId) -> bool {
        self.entries.write().await.remove(&id).is_some()
    }

    pub async fn bind_user(&self, id: ConnectionId, user: UserId) {
        if let Some(entry) = self.entries.write().await.get_mut(&id) {
            entry.user = Some(user);
        }
    }

    pub async fn user_of(&self, id: ConnectionId) -> Option<UserId> {
        self.entries.read().await.get(&id).and_then(|e| e.user)
    }

    pub async fn verified_user_of(&self, id: ConnectionId) -> Option<UserId> {
        self.entries
            .read()
            .await
            .get(&id)
            .and_then(|e| e.verified_user)
    }

    /// Mark the connection's key as published. Returns false if it already was.
    pub async fn mark_key_published(&self, id: ConnectionId) -> bool {
        match self.entries.write().await.get_mut(&id) {
            Some(entry) if !entry.key_published => {
                entry.key_published = true;
                true
            }
            _ => false,
        }
    }

    /// Undo [`mark_key_published`](Self::mark_key_published) after a failed write.
    pub async fn clear_key_published(&self, id: ConnectionId) {
        if let Some(entry) = self.entries.write().await.get_mut(&id) {
            entry.key_published = false;
        }
    }

    /// Queue an event. Returns false if the connection is gone or was
    /// dropped for falling behind.
    pub async fn send(&self, id: ConnectionId, event: ServerEvent) -> bool {
        let result = match self.entries.read().await.get(&id) {
            Some(entry) => entry.outbound.try_send(event),
            None => return false,
        };

        match result {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(conn = %id.short(), "Outbound queue full, dropping slow connection");
                self.close(id).await;
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.close(id).await;
                false
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
