//! Who is online, and on which connection.
//!
//! Purely in-memory: nothing here awaits on storage. A user has at most one
//! live connection; the caller's [`SessionPolicy`] decides what a second
//! `authenticate` does.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use courier_shared::protocol::ServerEvent;
use courier_shared::types::{ConnectionId, UserId};

use crate::config::SessionPolicy;
use crate::error::ServerError;
use crate::registry::ConnectionRegistry;

struct PresenceEntry {
    connection: ConnectionId,
    /// Users told about this user's presence changes.
    contacts: HashSet<UserId>,
}

#[derive(Default)]
struct PresenceState {
    by_user: HashMap<UserId, PresenceEntry>,
    by_connection: HashMap<ConnectionId, UserId>,
}

impl PresenceState {
    fn online_contacts(&self, contacts: &HashSet<UserId>) -> Vec<(UserId, ConnectionId)> {
        contacts
            .iter()
            .filter_map(|id| self.by_user.get(id).map(|e| (*id, e.connection)))
            .collect()
    }
}

/// Result of a successful `authenticate`.
#[derive(Debug, PartialEq, Eq)]
pub struct Authenticated {
    /// Online contacts, sorted.
    pub snapshot: Vec<UserId>,
    /// Older connection of the same user that this one displaced.
    pub replaced: Option<ConnectionId>,
}

#[derive(Clone)]
pub struct PresenceTracker {
    state: Arc<RwLock<PresenceState>>,
    registry: ConnectionRegistry,
}

impl PresenceTracker {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Self {
            state: Arc::new(RwLock::new(PresenceState::default())),
            registry,
        }
    }

    /// Bind `connection` to `user` and tell online contacts.
    pub async fn authenticate(
        &self,
        connection: ConnectionId,
        user: UserId,
        contacts: HashSet<UserId>,
        policy: SessionPolicy,
    ) -> Result<Authenticated, ServerError> {
        let mut state = self.state.write().await;

        if let Some(bound) = state.by_connection.get(&connection).copied() {
            if bound != user {
                return Err(ServerError::Unauthenticated(
                    "connection is already bound to another user".into(),
                ));
            }
            // Re-authenticating the same connection only refreshes contacts.
            let snapshot = sorted_ids(state.online_contacts(&contacts));
            if let Some(entry) = state.by_user.get_mut(&user) {
                entry.contacts = contacts;
            }
            return Ok(Authenticated {
                snapshot,
                replaced: None,
            });
        }

        let mut replaced = None;
        if let Some(existing) = state.by_user.get(&user) {
            match policy {
                SessionPolicy::Reject => {
                    return Err(ServerError::Unauthenticated(
                        "already connected from another session".into(),
                    ));
                }
                SessionPolicy::Evict => replaced = Some(existing.connection),
            }
        }

        if let Some(old) = replaced {
            state.by_connection.remove(&old);
            info!(user = %user, old = %old.short(), new = %connection.short(), "Session replaced");
        }

        let online = state.online_contacts(&contacts);
        state.by_connection.insert(connection, user);
        state.by_user.insert(
            user,
            PresenceEntry {
                connection,
                contacts,
            },
        );

        // The user was already visible when a session is replaced.
        if replaced.is_none() {
            for (_, conn) in &online {
                self.registry
                    .send(*conn, ServerEvent::UserOnline { user_id: user })
                    .await;
            }
            debug!(user = %user, notified = online.len(), "User online");
        }

        Ok(Authenticated {
            snapshot: sorted_ids(online),
            replaced,
        })
    }

    /// Remove whatever `connection` was bound to. Returns the user that went
    /// offline, or `None` when the connection was unbound or already replaced.
    pub async fn disconnect(&self, connection: ConnectionId) -> Option<UserId> {
        let mut state = self.state.write().await;
        let user = state.by_connection.remove(&connection)?;

        match state.by_user.get(&user) {
            Some(entry) if entry.connection == connection => {}
            _ => return None,
        }
        let entry = state.by_user.remove(&user)?;

        let online = state.online_contacts(&entry.contacts);
        for (_, conn) in &online {
            self.registry
                .send(*conn, ServerEvent::UserOffline { user_id: user })
                .await;
        }
        debug!(user = %user, notified = online.len(), "User offline");
        Some(user)
    }

    /// Every online user, sorted.
    pub async fn snapshot(&self) -> Vec<UserId> {
        let mut ids: Vec<UserId> = self.state.read().await.by_user.keys().copied().collect();
        ids.sort();
        ids
    }

    pub async fn connection_of(&self, user: UserId) -> Option<ConnectionId> {
        self.state
            .read()
            .await
            .by_user
            .get(&user)
            .map(|e| e.connection)
    }

    pub async fn is_online(&self, user: UserId) -> bool {
        self.state.read().await.by_user.contains_key(&user)
    }

    pub async fn online_count(&self) -> usize {
        self.state.read().await.by_user.len()
    }
}

fn sorted_ids(pairs: Vec<(UserId, ConnectionId)>) -> Vec<UserId> {
    let mut ids: Vec<UserId> = pairs.into_iter().map(|(id, _)| id).collect();
    ids.sort();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn contacts(ids: &[u64]) -> HashSet<UserId> {
        ids.iter().map(|id| UserId(*id)).collect()
    }

    async fn setup() -> (ConnectionRegistry, PresenceTracker) {
        let registry = ConnectionRegistry::new(16);
        let presence = PresenceTracker::new(registry.clone());
        (registry, presence)
    }

    fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_online_broadcast_and_snapshot() {
        let (registry, presence) = setup().await;
        let (a, mut a_rx) = registry.open(None).await;
        let (b, _b_rx) = registry.open(None).await;

        let first = presence
            .authenticate(a, UserId(1), contacts(&[2]), SessionPolicy::Evict)
            .await
            .unwrap();
        assert!(first.snapshot.is_empty());

        let second = presence
            .authenticate(b, UserId(2), contacts(&[1]), SessionPolicy::Evict)
            .await
            .unwrap();
        assert_eq!(second.snapshot, vec![UserId(1)]);
        assert_eq!(
            drain(&mut a_rx),
            vec![ServerEvent::UserOnline { user_id: UserId(2) }]
        );
    }

    #[tokio::test]
    async fn test_non_contacts_are_not_told() {
        let (registry, presence) = setup().await;
        let (a, mut a_rx) = registry.open(None).await;
        let (c, _c_rx) = registry.open(None).await;

        presence
            .authenticate(a, UserId(1), contacts(&[2]), SessionPolicy::Evict)
            .await
            .unwrap();
        let auth = presence
            .authenticate(c, UserId(3), contacts(&[]), SessionPolicy::Evict)
            .await
            .unwrap();

        assert!(auth.snapshot.is_empty());
        assert!(drain(&mut a_rx).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_broadcasts_offline() {
        let (registry, presence) = setup().await;
        let (a, mut a_rx) = registry.open(None).await;
        let (b, _b_rx) = registry.open(None).await;
        presence
            .authenticate(a, UserId(1), contacts(&[2]), SessionPolicy::Evict)
            .await
            .unwrap();
        presence
            .authenticate(b, UserId(2), contacts(&[1]), SessionPolicy::Evict)
            .await
            .unwrap();
        drain(&mut a_rx);

        assert_eq!(presence.disconnect(b).await, Some(UserId(2)));
        assert_eq!(
            drain(&mut a_rx),
            vec![ServerEvent::UserOffline { user_id: UserId(2) }]
        );
        assert!(!presence.is_online(UserId(2)).await);
        assert_eq!(presence.disconnect(b).await, None);
    }

    #[tokio::test]
    async fn test_evict_replaces_without_offline_flicker() {
        let (registry, presence) = setup().await;
        let (watcher, mut watcher_rx) = registry.open(None).await;
        let (old, _old_rx) = registry.open(None).await;
        let (new, _new_rx) = registry.open(None).await;

        presence
            .authenticate(watcher, UserId(9), contacts(&[1]), SessionPolicy::Evict)
            .await
            .unwrap();
        presence
            .authenticate(old, UserId(1), contacts(&[9]), SessionPolicy::Evict)
            .await
            .unwrap();
        drain(&mut watcher_rx);

        let auth = presence
            .authenticate(new, UserId(1), contacts(&[9]), SessionPolicy::Evict)
            .await
            .unwrap();
        assert_eq!(auth.replaced, Some(old));
        assert_eq!(presence.connection_of(UserId(1)).await, Some(new));

        // The displaced connection closing must not mark the user offline.
        assert_eq!(presence.disconnect(old).await, None);
        assert!(presence.is_online(UserId(1)).await);
        assert!(drain(&mut watcher_rx).is_empty());
    }

    #[tokio::test]
    async fn test_reject_policy_refuses_second_session() {
        let (registry, presence) = setup().await;
        let (old, _old_rx) = registry.open(None).await;
        let (new, _new_rx) = registry.open(None).await;

        presence
            .authenticate(old, UserId(1), contacts(&[]), SessionPolicy::Reject)
            .await
            .unwrap();
        let err = presence
            .authenticate(new, UserId(1), contacts(&[]), SessionPolicy::Reject)
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Unauthenticated(_)));
        assert_eq!(presence.connection_of(UserId(1)).await, Some(old));
    }

    #[tokio::test]
    async fn test_rebinding_connection_to_other_user_fails() {
        let (registry, presence) = setup().await;
        let (conn, _rx) = registry.open(None).await;

        presence
            .authenticate(conn, UserId(1), contacts(&[]), SessionPolicy::Evict)
            .await
            .unwrap();
        // Same user again is a no-op.
        assert!(presence
            .authenticate(conn, UserId(1), contacts(&[]), SessionPolicy::Evict)
            .await
            .is_ok());
        assert!(presence
            .authenticate(conn, UserId(2), contacts(&[]), SessionPolicy::Evict)
            .await
            .is_err());
        assert_eq!(presence.online_count().await, 1);
    }
}
