//! Public key resolution and caching.
//!
//! Resolves a user's published encryption key through a [`KeyDirectory`]
//! and remembers the answer, including "this user has no key yet", so that
//! repeated lookups for keyless users do not hammer the directory. A fresh
//! key upload must be followed by [`KeyResolutionCache::invalidate`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::LookupError;
use crate::types::{PublicKey, UserId};

/// Source of truth for published keys (the identity collaborator).
#[async_trait]
pub trait KeyDirectory: Send + Sync {
    /// `Ok(None)` means the user exists but has not published a key.
    async fn get_public_key(&self, user: UserId) -> Result<Option<PublicKey>, LookupError>;
}

/// Result of a successful resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyResolution {
    Known(PublicKey),
    /// Known to be absent. Not an error.
    Absent,
}

impl KeyResolution {
    pub fn key(&self) -> Option<PublicKey> {
        match self {
            KeyResolution::Known(key) => Some(*key),
            KeyResolution::Absent => None,
        }
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<UserId, Option<PublicKey>>,
    // Bumped on every invalidate. A lookup that overlapped one does not
    // write its answer back, since it may predate the new key.
    epoch: u64,
}

/// Process-wide cache in front of a [`KeyDirectory`].
#[derive(Clone)]
pub struct KeyResolutionCache {
    directory: Arc<dyn KeyDirectory>,
    state: Arc<RwLock<CacheState>>,
}

impl KeyResolutionCache {
    pub fn new(directory: Arc<dyn KeyDirectory>) -> Self {
        Self {
            directory,
            state: Arc::new(RwLock::new(CacheState::default())),
        }
    }

    /// Resolve `user`'s public key. Directory failures are returned as
    /// [`LookupError`] and are never cached.
    pub async fn resolve(&self, user: UserId) -> Result<KeyResolution, LookupError> {
        let epoch = {
            let state = self.state.read().await;
            if let Some(entry) = state.entries.get(&user) {
                debug!(user = %user, known = entry.is_some(), "Public key served from cache");
                return Ok(to_resolution(*entry));
            }
            state.epoch
        };

        let fetched = self.directory.get_public_key(user).await?;

        let mut state = self.state.write().await;
        if state.epoch == epoch {
            state.entries.insert(user, fetched);
        } else {
            debug!(user = %user, "Key invalidated during lookup, not caching");
        }

        Ok(to_resolution(fetched))
    }

    /// Forget whatever is cached for `user` (called after a key upload).
    pub async fn invalidate(&self, user: UserId) {
        let mut state = self.state.write().await;
        state.entries.remove(&user);
        state.epoch = state.epoch.wrapping_add(1);
        debug!(user = %user, "Invalidated cached public key");
    }

    /// Cached answer without touching the directory. `None` = not fetched.
    pub async fn peek(&self, user: UserId) -> Option<KeyResolution> {
        self.state
            .read()
            .await
            .entries
            .get(&user)
            .map(|entry| to_resolution(*entry))
    }
}

fn to_resolution(entry: Option<PublicKey>) -> KeyResolution {
    match entry {
        Some(key) => KeyResolution::Known(key),
        None => KeyResolution::Absent,
    }
}
