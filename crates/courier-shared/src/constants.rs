/// Protocol version reported by the server and checked by clients
pub const PROTOCOL_VERSION: &str = "/courier/1.0.0";

/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// X25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// X25519 secret key size in bytes
pub const SECRET_KEY_SIZE: usize = 32;

/// Poly1305 authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Maximum ciphertext size accepted on the wire (64 KiB)
pub const MAX_CIPHERTEXT_SIZE: usize = 65_536;

/// Default number of messages returned by a history page
pub const DEFAULT_PAGE_LIMIT: u32 = 50;

/// Upper bound for a single history page
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Unanswered calls are torn down after this many seconds
pub const CALL_RING_TIMEOUT_SECS: u64 = 45;

/// How long an ended call absorbs late termination events (milliseconds)
pub const CALL_END_GRACE_MS: u64 = 3_000;

/// Default HTTP/websocket port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Key derivation context (BLAKE3) for per-pair message keys
pub const KDF_CONTEXT_MESSAGE_KEY: &str = "courier-message-key-v1";
