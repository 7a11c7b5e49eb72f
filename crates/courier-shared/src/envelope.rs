//! Client-side send and render paths for 1:1 conversations.
//!
//! Sending refuses to produce anything when the recipient's key cannot be
//! resolved; there is no plaintext fallback. Rendering degrades to a
//! placeholder that is a different variant from decrypted content, so it can
//! never be mistaken for (or persisted as) a real message body.

use crate::crypto::{self, KeyPair, Sealed};
use crate::error::SendError;
use crate::keys::{KeyResolution, KeyResolutionCache};
use crate::types::{Message, UserId};

/// Seal `plaintext` for `recipient`, resolving their key through the cache.
pub async fn seal_for(
    cache: &KeyResolutionCache,
    recipient: UserId,
    plaintext: &str,
    own: &KeyPair,
) -> Result<Sealed, SendError> {
    let key = match cache.resolve(recipient).await? {
        KeyResolution::Known(key) => key,
        KeyResolution::Absent => return Err(SendError::KeyUnavailable),
    };
    Ok(crypto::encrypt(plaintext.as_bytes(), &key, own.secret())?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unreadable {
    /// Counterpart has no published key.
    KeyUnavailable,
    /// Key lookup failed; retry may succeed.
    LookupFailed,
    /// Authentication tag mismatch, wrong key, or not UTF-8.
    DecryptionFailed,
}

/// What the UI shows for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Decrypted(String),
    Placeholder { reason: Unreadable, text: String },
}

impl MessageBody {
    fn placeholder(reason: Unreadable, counterpart_name: &str) -> Self {
        let text = match reason {
            Unreadable::KeyUnavailable => {
                format!("🔒 {counterpart_name} has not set up encryption yet")
            }
            Unreadable::LookupFailed => {
                format!("🔒 Could not fetch {counterpart_name}'s key, try again later")
            }
            Unreadable::DecryptionFailed => {
                format!("🔒 Unable to decrypt this message from {counterpart_name}")
            }
        };
        MessageBody::Placeholder { reason, text }
    }

    pub fn is_decrypted(&self) -> bool {
        matches!(self, MessageBody::Decrypted(_))
    }

    /// Real content only; placeholders yield `None`.
    pub fn plaintext(&self) -> Option<&str> {
        match self {
            MessageBody::Decrypted(text) => Some(text),
            MessageBody::Placeholder { .. } => None,
        }
    }

    /// Text to render, whichever variant this is.
    pub fn display_text(&self) -> &str {
        match self {
            MessageBody::Decrypted(text) => text,
            MessageBody::Placeholder { text, .. } => text,
        }
    }
}

/// Open a message of a 1:1 conversation between the viewer and
/// `counterpart`. Works for both directions since the pair key is symmetric.
pub async fn open_message(
    cache: &KeyResolutionCache,
    message: &Message,
    counterpart: UserId,
    counterpart_name: &str,
    own: &KeyPair,
) -> MessageBody {
    let key = match cache.resolve(counterpart).await {
        Ok(KeyResolution::Known(key)) => key,
        Ok(KeyResolution::Absent) => {
            return MessageBody::placeholder(Unreadable::KeyUnavailable, counterpart_name)
        }
        Err(_) => return MessageBody::placeholder(Unreadable::LookupFailed, counterpart_name),
    };

    crypto::decrypt(&message.ciphertext, &message.nonce, &key, own.secret())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .map(MessageBody::Decrypted)
        .unwrap_or_else(|| MessageBody::placeholder(Unreadable::DecryptionFailed, counterpart_name))
}
