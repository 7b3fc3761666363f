// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    /// The only user-visible send failure: the target id is not a valid
    /// identity. Control adapters map this to a 4xx.
    #[error("invalid target id: {0}")]
    InvalidTarget(String),

    #[error("no user is logged in")]
    NotLoggedIn,

    #[error("overlay error: {0}")]
    Overlay(#[from] mist_overlay::OverlayError),

    #[error("store error: {0}")]
    Store(#[from] mist_store::StoreError),

    #[error("crypto error: {0}")]
    Crypto(#[from] mist_crypto::CryptoError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Task(String),
}
