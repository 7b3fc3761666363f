// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Cryptographic identity and packet protection for mist nodes.
//!
//! One (username, password) pair is the sole secret of an account.
//! Everything else is derived from it:
//!
//! - an Ed25519 signing keypair — the hex of the public key **is** the
//!   user's overlay identity;
//! - the matching X25519 keypair (standard curve conversion) used for
//!   sealed probe auth and end-to-end message boxes;
//! - an independent 32-byte vault key protecting message content at rest.
//!
//! Route identifiers and target hashes are blake3 over identity strings,
//! so a relaying node only ever sees hashes, never endpoint identities.

pub mod error;
mod identity;
mod vault;

pub use error::CryptoError;
pub use identity::{verify, Identity, PublicHandle};

/// Directional channel identifier for a conversation `a → b`.
///
/// Order-sensitive: `route_id(a, b) != route_id(b, a)`. The two hashes
/// form the forward and return channels of one conversation.
pub fn route_id(a: &str, b: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(a.as_bytes());
    hasher.update(b.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Hash of an identity, used in probes so that only the target itself can
/// recognize who a probe is for.
pub fn target_hash(id: &str) -> String {
    blake3::hash(id.as_bytes()).to_hex().to_string()
}
