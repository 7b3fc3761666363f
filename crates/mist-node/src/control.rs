// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Control operations for a local UI adapter.
//!
//! These are the core's obligations toward whatever transport serves the
//! user interface. Everything returns plain serializable values; the
//! adapter decides how they travel.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use mist_crypto::{route_id, CryptoError, Identity};
use mist_overlay::{connect_to, ActiveUser, OverlayError};
use mist_store::{OutboxEntry, RouteEntry, UserStore};

use crate::{error::NodeError, node::Node};

/// Announced in `state()` while nobody is logged in.
const OFFLINE: &str = "OFFLINE";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReceipt {
    pub status: String,
    pub packet_id: String,
    pub packet_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub user_id: String,
    pub nickname: Option<String>,
    pub last_seen: String,
    pub unread_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub packet_id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub text: String,
    pub timestamp: String,
    pub is_outgoing: bool,
    pub is_read: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub user_id: String,
    pub peers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacketStatus {
    pub seen: bool,
    pub received_at: Option<String>,
    pub in_outbox: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutePair {
    pub route_fwd: String,
    pub route_bwd: String,
}

impl Node {
    // ── Session ──────────────────────────────────────────────────────────────

    /// Derive the identity, replace the active user and drain any packets
    /// parked for them while they were away. Logging in the identity that
    /// is already active is a no-op.
    pub async fn login(&self, username: &str, password: &str) -> Result<String, NodeError> {
        let (username, password) = (username.to_string(), password.to_string());
        let identity = tokio::task::spawn_blocking(move || Identity::derive(&username, &password))
            .await
            .map_err(|e| NodeError::Task(e.to_string()))??;
        let user_id = identity.user_id().to_string();

        if self
            .engine
            .active()
            .is_some_and(|u| u.identity.user_id() == user_id)
        {
            return Ok(user_id);
        }

        self.engine.clear_active_user();
        self.system.register_local_user(&user_id)?;
        let store_path = self.config.data_dir.join(format!("user_{user_id}.db"));
        let store = UserStore::open(&store_path)?;
        self.engine.set_active_user(ActiveUser { identity, store });
        info!(user = %short(&user_id), "user logged in");

        if let Some(user) = self.engine.active() {
            for parked in self.system.fetch_mailbox(&user_id)? {
                if let Err(e) = self.engine.deliver_from_mailbox(&user, &parked) {
                    warn!(error = %e, "parked packet not delivered");
                }
            }
        }
        Ok(user_id)
    }

    /// Detach the active user from the overlay and close their store.
    pub fn logout(&self) {
        self.engine.clear_active_user();
        info!("user logged out");
    }

    // ── Overlay ──────────────────────────────────────────────────────────────

    /// Dial a neighbor. Returns the peer's handshake identity.
    pub async fn connect(&self, address: &str) -> Result<String, NodeError> {
        Ok(connect_to(address, std::sync::Arc::clone(&self.engine)).await?)
    }

    /// Write the local echo and put the message on the wire — DATA along a
    /// known channel, otherwise a route-discovery probe.
    pub fn send(&self, target_id: &str, text: &str) -> Result<SendReceipt, NodeError> {
        let user = self.engine.active().ok_or(NodeError::NotLoggedIn)?;
        let outcome = self
            .engine
            .originate(&user, target_id, text)
            .map_err(|e| match e {
                OverlayError::Crypto(CryptoError::InvalidKey(m)) => NodeError::InvalidTarget(m),
                other => NodeError::Overlay(other),
            })?;

        let echo_ct = user.identity.vault_encrypt(text)?;
        user.store.insert_message(
            &outcome.packet_id,
            target_id,
            user.identity.user_id(),
            &echo_ct,
            true,
            true,
        )?;
        user.store.touch_contact(target_id)?;

        let status = match outcome.kind {
            mist_overlay::PacketKind::Data => "sent",
            mist_overlay::PacketKind::Probe => "finding_route",
        };
        Ok(SendReceipt {
            status: status.to_string(),
            packet_id: outcome.packet_id,
            packet_type: outcome.kind.as_str().to_string(),
        })
    }

    // ── Chats ────────────────────────────────────────────────────────────────

    /// Contacts with decrypted nicknames and unread counts.
    pub fn peers(&self) -> Result<Vec<PeerInfo>, NodeError> {
        let user = self.engine.active().ok_or(NodeError::NotLoggedIn)?;
        let contacts = user.store.contacts()?;
        Ok(contacts
            .into_iter()
            .map(|c| PeerInfo {
                user_id: c.user_id,
                nickname: c.nickname.map(|ct| decrypt_or_marker(&user, &ct)),
                last_seen: c.last_seen,
                unread_count: c.unread,
            })
            .collect())
    }

    /// Decrypted history of one chat. Retrieval counts as reading: every
    /// incoming message of the chat is marked read afterwards.
    pub fn messages(&self, chat_id: &str) -> Result<Vec<ChatMessage>, NodeError> {
        let user = self.engine.active().ok_or(NodeError::NotLoggedIn)?;
        let history = user.store.history(chat_id)?;
        let decrypted = history
            .into_iter()
            .map(|m| ChatMessage {
                packet_id: m.packet_id,
                chat_id: m.chat_id,
                sender_id: m.sender_id,
                text: decrypt_or_marker(&user, &m.content),
                timestamp: m.timestamp,
                is_outgoing: m.is_outgoing,
                is_read: m.is_read,
            })
            .collect();
        user.store.mark_read(chat_id)?;
        Ok(decrypted)
    }

    pub fn rename(&self, target_id: &str, name: Option<&str>) -> Result<(), NodeError> {
        let user = self.engine.active().ok_or(NodeError::NotLoggedIn)?;
        let nickname_ct = match name {
            Some(name) => Some(user.identity.vault_encrypt(name)?),
            None => None,
        };
        user.store.rename_contact(target_id, nickname_ct.as_deref())?;
        Ok(())
    }

    pub fn read_chat(&self, chat_id: &str) -> Result<(), NodeError> {
        let user = self.engine.active().ok_or(NodeError::NotLoggedIn)?;
        user.store.mark_read(chat_id)?;
        Ok(())
    }

    pub fn state(&self) -> NodeState {
        NodeState {
            user_id: self
                .engine
                .active()
                .map(|u| u.identity.user_id().to_string())
                .unwrap_or_else(|| OFFLINE.to_string()),
            peers: self.links.peer_ids(),
        }
    }

    // ── Debug surface ────────────────────────────────────────────────────────

    pub fn packet_status(&self, packet_id: &str) -> Result<PacketStatus, NodeError> {
        let received_at = self.system.packet_seen_at(packet_id)?;
        Ok(PacketStatus {
            seen: received_at.is_some(),
            received_at,
            in_outbox: self.system.outbox_count(packet_id)?,
        })
    }

    pub fn outbox(&self) -> Result<Vec<OutboxEntry>, NodeError> {
        Ok(self.system.outbox_all()?)
    }

    pub fn routes(&self) -> Result<Vec<RouteEntry>, NodeError> {
        Ok(self.system.live_routes()?)
    }

    pub fn route_ids(&self, sender_id: &str, receiver_id: &str) -> RoutePair {
        RoutePair {
            route_fwd: route_id(sender_id, receiver_id),
            route_bwd: route_id(receiver_id, sender_id),
        }
    }
}

fn decrypt_or_marker(user: &ActiveUser, ciphertext: &str) -> String {
    user.identity
        .vault_decrypt(ciphertext)
        .unwrap_or_else(|_| "[unreadable]".to_string())
}

fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
