use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,
}

/// The identity collaborator could not answer. Retryable by the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Key lookup failed: {0}")]
pub struct LookupError(pub String);

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed event: {0}")]
    Malformed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Why an outgoing message could not be sealed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("Recipient has not published an encryption key")]
    KeyUnavailable,

    #[error(transparent)]
    LookupFailed(#[from] LookupError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Machine-readable codes carried by the outbound `error` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthenticated,
    AccessDenied,
    IllegalTransition,
    PeerUnreachable,
    KeyUnavailable,
    LookupFailed,
    StorageFailure,
    MalformedEvent,
    NotFound,
    RateLimited,
    SessionReplaced,
}
