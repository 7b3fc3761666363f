// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

/// Why a cryptographic operation rejected its input.
///
/// End-to-end decryption distinguishes its failure modes so callers can
/// log the reason; the overlay drops the packet either way.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid public key: {0}")]
    InvalidKey(String),

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("message expired")]
    Expired,

    #[error("sender id mismatch")]
    SenderMismatch,

    #[error("invalid signature")]
    BadSignature,

    #[error("decryption failed")]
    Decrypt,

    #[error("malformed ciphertext: {0}")]
    Malformed(String),
}
