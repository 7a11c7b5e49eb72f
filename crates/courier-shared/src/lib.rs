//! # courier-shared
//!
//! Types shared by the Courier server and its clients: identifiers and the
//! message model, the JSON wire protocol, the end-to-end message codec, and
//! public key resolution.

pub mod constants;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod protocol;
pub mod types;
