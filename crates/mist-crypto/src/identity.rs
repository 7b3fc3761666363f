// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Key derivation, signatures, sealed probe auth and end-to-end boxes.
//!
//! # Derivation
//!
//! Both secrets come out of Argon2id over the password. The salt is the
//! first 16 bytes of SHA-256 over the username (with a `:vault` domain tag
//! for the second derivation), so the same credentials always yield the
//! same identity on any node:
//!
//! - **signing seed** — sensitive work factors; seeds the Ed25519 keypair.
//!   The hex of the verifying key is the user id on the overlay.
//! - **vault key** — interactive work factors; encrypts store fields at
//!   rest and never leaves the process.
//!
//! The X25519 keypair used for boxes is the standard conversion of the
//! Ed25519 pair, so publishing one 32-byte identity is enough for peers to
//! both verify signatures and address sealed payloads.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use crypto_box::{
    aead::{generic_array::GenericArray, Aead, AeadCore, OsRng},
    SalsaBox,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::{error::CryptoError, vault::VaultCipher};

/// Argon2id cost for the signing seed (64 MiB, 3 passes).
const KDF_SENSITIVE: (u32, u32, u32) = (64 * 1024, 3, 1);
/// Argon2id cost for the vault key (19 MiB, 2 passes).
const KDF_INTERACTIVE: (u32, u32, u32) = (19 * 1024, 2, 1);

const SALSA_NONCE_LEN: usize = 24;

// ── Remote identities ─────────────────────────────────────────────────────────

/// A parsed remote identity: the Ed25519 verifying key plus its X25519
/// conversion. Everything a node can do *to* a peer without any secret.
pub struct PublicHandle {
    id: String,
    verifying: VerifyingKey,
    box_public: crypto_box::PublicKey,
}

impl PublicHandle {
    /// Parse a 64-char hex identity. Rejects strings that are not a valid
    /// Ed25519 point.
    pub fn from_hex(id: &str) -> Result<Self, CryptoError> {
        let bytes: [u8; 32] = hex::decode(id)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("expected 32-byte hex".into()))?;
        let verifying = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let box_public = crypto_box::PublicKey::from(verifying.to_montgomery().to_bytes());
        Ok(Self {
            id: id.to_string(),
            verifying,
            box_public,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Verify a base64 Ed25519 signature over `data`.
    pub fn verify(&self, data: &str, sig_b64: &str) -> bool {
        let Ok(sig_bytes) = B64.decode(sig_b64) else {
            return false;
        };
        let Ok(sig) = Signature::from_slice(&sig_bytes) else {
            return false;
        };
        self.verifying.verify(data.as_bytes(), &sig).is_ok()
    }

    /// Anonymous sealed box to this identity: the recipient can open it but
    /// learns nothing about who sealed it.
    pub fn seal(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let sealed = self
            .box_public
            .seal(&mut OsRng, plaintext)
            .map_err(|_| CryptoError::Decrypt)?;
        Ok(B64.encode(sealed))
    }
}

/// Verify `sig_b64` over `data` against a hex identity.
pub fn verify(pub_hex: &str, data: &str, sig_b64: &str) -> bool {
    PublicHandle::from_hex(pub_hex).is_ok_and(|h| h.verify(data, sig_b64))
}

// ── Local identity ────────────────────────────────────────────────────────────

/// The full key material of a logged-in user.
#[derive(Clone)]
pub struct Identity {
    signing: SigningKey,
    box_secret: crypto_box::SecretKey,
    vault: VaultCipher,
    user_id: String,
}

/// Inner plaintext of an end-to-end box. The signature binds text, time
/// and claimed sender; `rnd` keeps equal texts from producing related
/// ciphertext lengths across messages.
#[derive(Serialize, Deserialize)]
struct InnerMessage {
    txt: String,
    ts: f64,
    sid: String,
    sig: String,
    rnd: String,
}

impl Identity {
    /// Derive the complete identity from credentials. Deterministic: the
    /// same (username, password) yields the same user id everywhere.
    pub fn derive(username: &str, password: &str) -> Result<Self, CryptoError> {
        let seed = Zeroizing::new(kdf(password, &salt_of(username), KDF_SENSITIVE)?);
        let vault_key = Zeroizing::new(kdf(
            password,
            &salt_of(&format!("{username}:vault")),
            KDF_INTERACTIVE,
        )?);

        let signing = SigningKey::from_bytes(&seed);
        let box_secret = crypto_box::SecretKey::from(signing.to_scalar_bytes());
        let user_id = hex::encode(signing.verifying_key().as_bytes());

        Ok(Self {
            signing,
            box_secret,
            vault: VaultCipher::new(&vault_key),
            user_id,
        })
    }

    /// Hex encoding of the Ed25519 verifying key.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Sign `data`, returning the signature in base64.
    pub fn sign(&self, data: &str) -> String {
        B64.encode(self.signing.sign(data.as_bytes()).to_bytes())
    }

    /// Open an anonymous sealed box addressed to this identity.
    pub fn unseal(&self, sealed_b64: &str) -> Result<Vec<u8>, CryptoError> {
        let sealed = B64
            .decode(sealed_b64)
            .map_err(|e| CryptoError::Malformed(e.to_string()))?;
        self.box_secret
            .unseal(&sealed)
            .map_err(|_| CryptoError::Decrypt)
    }

    /// Encrypt `text` for `target_hex` inside a mutually-authenticated box.
    ///
    /// The inner payload carries the sender id, a timestamp and a signature
    /// over `txt‖ts‖sid`, which the receiver checks in [`box_decrypt`].
    ///
    /// [`box_decrypt`]: Identity::box_decrypt
    pub fn box_encrypt(&self, target_hex: &str, text: &str) -> Result<String, CryptoError> {
        self.box_encrypt_at(target_hex, text, unix_now())
    }

    fn box_encrypt_at(&self, target_hex: &str, text: &str, ts: f64) -> Result<String, CryptoError> {
        let target = PublicHandle::from_hex(target_hex)?;
        let sig = self.sign(&sig_content(text, ts, &self.user_id));

        let mut rnd = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut rnd);
        let inner = InnerMessage {
            txt: text.to_string(),
            ts,
            sid: self.user_id.clone(),
            sig,
            rnd: B64.encode(rnd),
        };
        let plaintext =
            serde_json::to_vec(&inner).map_err(|e| CryptoError::Malformed(e.to_string()))?;

        let salsa = SalsaBox::new(&target.box_public, &self.box_secret);
        let nonce = SalsaBox::generate_nonce(&mut OsRng);
        let ct = salsa
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| CryptoError::Decrypt)?;

        let mut wire = nonce.to_vec();
        wire.extend_from_slice(&ct);
        Ok(B64.encode(wire))
    }

    /// Decrypt and authenticate an end-to-end box from `sender_hex`.
    ///
    /// Enforces, in order: the freshness window, the claimed sender id, and
    /// the signature over `txt‖ts‖sid`. Each failure maps to its own
    /// [`CryptoError`] variant.
    pub fn box_decrypt(
        &self,
        sender_hex: &str,
        ciphertext_b64: &str,
        max_age: Duration,
    ) -> Result<String, CryptoError> {
        let sender = PublicHandle::from_hex(sender_hex)?;
        let wire = B64
            .decode(ciphertext_b64)
            .map_err(|e| CryptoError::Malformed(e.to_string()))?;
        if wire.len() < SALSA_NONCE_LEN {
            return Err(CryptoError::Malformed("ciphertext too short".into()));
        }
        let (nonce, ct) = wire.split_at(SALSA_NONCE_LEN);

        let salsa = SalsaBox::new(&sender.box_public, &self.box_secret);
        let plaintext = salsa
            .decrypt(GenericArray::from_slice(nonce), ct)
            .map_err(|_| CryptoError::Decrypt)?;
        let inner: InnerMessage =
            serde_json::from_slice(&plaintext).map_err(|e| CryptoError::Malformed(e.to_string()))?;

        if unix_now() - inner.ts > max_age.as_secs_f64() {
            return Err(CryptoError::Expired);
        }
        if inner.sid != sender.id {
            return Err(CryptoError::SenderMismatch);
        }
        if !sender.verify(&sig_content(&inner.txt, inner.ts, &inner.sid), &inner.sig) {
            return Err(CryptoError::BadSignature);
        }
        Ok(inner.txt)
    }

    /// Encrypt a store field under the vault key. Empty in, empty out.
    pub fn vault_encrypt(&self, value: &str) -> Result<String, CryptoError> {
        self.vault.encrypt(value)
    }

    /// Decrypt a store field. Empty in, empty out.
    pub fn vault_decrypt(&self, value: &str) -> Result<String, CryptoError> {
        self.vault.decrypt(value)
    }
}

fn sig_content(txt: &str, ts: f64, sid: &str) -> String {
    format!("{txt}{ts}{sid}")
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn salt_of(name: &str) -> [u8; 16] {
    let digest = Sha256::digest(name.as_bytes());
    let mut salt = [0u8; 16];
    salt.copy_from_slice(&digest[..16]);
    salt
}

fn kdf(password: &str, salt: &[u8; 16], (m, t, p): (u32, u32, u32)) -> Result<[u8; 32], CryptoError> {
    let params =
        Params::new(m, t, p, Some(32)).map_err(|e| CryptoError::Kdf(e.to_string()))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut out = [0u8; 32];
    argon
        .hash_password_into(password.as_bytes(), salt, &mut out)
        .map_err(|e| CryptoError::Kdf(e.to_string()))?;
    Ok(out)
}

// ── Unit tests ────────────────────────────────────────────────────────────────
