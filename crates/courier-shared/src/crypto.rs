//! Message codec: authenticated public-key encryption of message bodies.
//!
//! Both parties derive the same pair key from X25519 (own secret, other
//! public), so either side can open any message of the conversation as long
//! as it knows the *other* party's public key. Bodies are sealed with
//! XChaCha20-Poly1305 under a fresh random 192-bit nonce per message.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::StaticSecret;

use crate::constants::{KDF_CONTEXT_MESSAGE_KEY, NONCE_SIZE, SECRET_KEY_SIZE, TAG_SIZE};
use crate::error::CryptoError;
use crate::types::{Nonce, PublicKey};

pub type SymmetricKey = [u8; 32];

/// A user's long-lived X25519 key pair. The public half is what gets
/// published to the identity collaborator.
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    pub fn from_secret_bytes(secret: [u8; SECRET_KEY_SIZE]) -> Self {
        Self::from_secret(StaticSecret::from(secret))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey(x25519_dalek::PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

/// Ciphertext plus the nonce it was sealed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub ciphertext: Vec<u8>,
    pub nonce: Nonce,
}

pub fn generate_nonce() -> Nonce {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    Nonce(nonce)
}

// BLAKE3 KDF over the DH output, bound to both public keys in a fixed order
// so that both directions derive the same key.
fn derive_pair_key(
    own_secret: &StaticSecret,
    other: &PublicKey,
) -> Result<SymmetricKey, CryptoError> {
    let own_public = x25519_dalek::PublicKey::from(own_secret).to_bytes();
    let shared = own_secret.diffie_hellman(&x25519_dalek::PublicKey::from(other.0));
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKeyLength);
    }

    let (lo, hi) = if own_public <= other.0 {
        (own_public, other.0)
    } else {
        (other.0, own_public)
    };

    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_MESSAGE_KEY);
    hasher.update(shared.as_bytes());
    hasher.update(&lo);
    hasher.update(&hi);
    Ok(*hasher.finalize().as_bytes())
}

/// Seal `plaintext` for `recipient` using the sender's own secret key.
pub fn encrypt(
    plaintext: &[u8],
    recipient: &PublicKey,
    own_secret: &StaticSecret,
) -> Result<Sealed, CryptoError> {
    let key = derive_pair_key(own_secret, recipient).map_err(|_| CryptoError::EncryptionFailed)?;
    let cipher = XChaCha20Poly1305::new((&key).into());
    let nonce = generate_nonce();

    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce.0), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    Ok(Sealed { ciphertext, nonce })
}

/// Open a message of the conversation. `other` is always the counterpart's
/// public key, whether the message was sent or received by us.
pub fn decrypt(
    ciphertext: &[u8],
    nonce: &Nonce,
    other: &PublicKey,
    own_secret: &StaticSecret,
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let key = derive_pair_key(own_secret, other).map_err(|_| CryptoError::DecryptionFailed)?;
    let cipher = XChaCha20Poly1305::new((&key).into());

    cipher
        .decrypt(XNonce::from_slice(&nonce.0), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}
