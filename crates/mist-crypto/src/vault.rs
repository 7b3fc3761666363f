// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! At-rest field encryption under the per-user vault key.
//!
//! XChaCha20-Poly1305 with a fresh random 24-byte nonce per call, nonce
//! prepended to the ciphertext, base64 on the outside. The empty string is
//! a fixed point in both directions so optional columns stay optional.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, AeadCore, KeyInit, OsRng},
    XChaCha20Poly1305,
};

use crate::error::CryptoError;

const NONCE_LEN: usize = 24;

#[derive(Clone)]
pub(crate) struct VaultCipher {
    cipher: XChaCha20Poly1305,
}

impl VaultCipher {
    pub(crate) fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(GenericArray::from_slice(key)),
        }
    }

    pub(crate) fn encrypt(&self, value: &str) -> Result<String, CryptoError> {
        if value.is_empty() {
            return Ok(String::new());
        }
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ct = self
            .cipher
            .encrypt(&nonce, value.as_bytes())
            .map_err(|_| CryptoError::Decrypt)?;
        let mut wire = nonce.to_vec();
        wire.extend_from_slice(&ct);
        Ok(B64.encode(wire))
    }

    pub(crate) fn decrypt(&self, value: &str) -> Result<String, CryptoError> {
        if value.is_empty() {
            return Ok(String::new());
        }
        let wire = B64
            .decode(value)
            .map_err(|e| CryptoError::Malformed(e.to_string()))?;
        if wire.len() < NONCE_LEN {
            return Err(CryptoError::Malformed("vault field too short".into()));
        }
        let (nonce, ct) = wire.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(GenericArray::from_slice(nonce), ct)
            .map_err(|_| CryptoError::Decrypt)?;
        String::from_utf8(plaintext).map_err(|e| CryptoError::Malformed(e.to_string()))
    }
}
