//! The packet processor.
//!
//! One engine per daemon, shared by every link reader task. All of its
//! state transitions go through the system store; the tact engine picks up
//! whatever lands in the outbox on its own clock.
//!
//! Processing contract per inbound frame, from the perspective of the
//! neighbor `P` it arrived on:
//!
//! 1. dummy frames vanish;
//! 2. the payload id is recorded in seen-packets — the insert outcome
//!    gates every side effect that must happen at most once;
//! 3. probes always refresh the reverse route through `P` (that is how
//!    the mesh learns), then either terminate here (we are the target) or
//!    flood on with one less hop to live;
//! 4. data packets walk the routing alternatives best-first: deliver
//!    locally, re-enqueue to a live next hop, fall back to the offline
//!    mailbox for a registered local target, or drop.

use std::sync::{Arc, RwLock};

use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use uuid::Uuid;

use mist_crypto::{route_id, target_hash, Identity, PublicHandle};
use mist_store::{RouteEntry, SystemStore, UserStore, LOCAL_HOP};

use crate::{
    envelope::{Envelope, FrameKind},
    error::OverlayError,
    link::{Links, DAEMON_IDLE_ID},
    packet::{DataPacket, Packet, ProbeAuth, ProbePacket},
};

/// E2E content of the response probe's handshake greeting.
const HANDSHAKE_GREETING: &str = "[system] connection established";

/// Tunables the engine needs; the daemon fills these from its config.
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    pub route_ttl: std::time::Duration,
    pub max_message_age: std::time::Duration,
    pub ttl_initial: i64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            route_ttl: std::time::Duration::from_secs(1800),
            max_message_age: std::time::Duration::from_secs(300),
            ttl_initial: 20,
        }
    }
}

/// The logged-in endpoint this node currently hosts, if any.
pub struct ActiveUser {
    pub identity: Identity,
    pub store: UserStore,
}

/// What `originate` put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Probe,
    Data,
}

impl PacketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PacketKind::Probe => "PROBE",
            PacketKind::Data => "DATA",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub packet_id: String,
    pub kind: PacketKind,
}

pub struct OverlayEngine {
    pub(crate) system: Arc<SystemStore>,
    pub(crate) links: Links,
    active: RwLock<Option<Arc<ActiveUser>>>,
    config: OverlayConfig,
}

impl OverlayEngine {
    pub fn new(system: Arc<SystemStore>, links: Links, config: OverlayConfig) -> Self {
        Self {
            system,
            links,
            active: RwLock::new(None),
            config,
        }
    }

    pub fn system(&self) -> &Arc<SystemStore> {
        &self.system
    }

    pub fn links(&self) -> &Links {
        &self.links
    }

    // ── Active user slot ─────────────────────────────────────────────────────

    /// Attach a logged-in user. Replaces (and drops) any previous one.
    pub fn set_active_user(&self, user: ActiveUser) {
        *self.write_slot() = Some(Arc::new(user));
    }

    pub fn clear_active_user(&self) {
        self.write_slot().take();
    }

    /// Consistent snapshot of the active user for the current operation.
    pub fn active(&self) -> Option<Arc<ActiveUser>> {
        self.active
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Identity string sent in the link handshake.
    pub fn handshake_identity(&self) -> String {
        self.active()
            .map(|u| u.identity.user_id().to_string())
            .unwrap_or_else(|| DAEMON_IDLE_ID.to_string())
    }

    fn write_slot(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<ActiveUser>>> {
        self.active.write().unwrap_or_else(|p| p.into_inner())
    }

    // ── Inbound path ─────────────────────────────────────────────────────────

    /// Entry point for link reader tasks. Failures are logged and the
    /// frame is dropped; nothing here is worth killing a link over.
    pub fn process_frame(&self, raw: &[u8], from_peer: &str) {
        if let Err(e) = self.ingest(raw, from_peer) {
            debug!(peer = %short(from_peer), error = %e, "dropped inbound frame");
        }
    }

    fn ingest(&self, raw: &[u8], from_peer: &str) -> Result<(), OverlayError> {
        let text =
            std::str::from_utf8(raw).map_err(|e| OverlayError::Codec(e.to_string()))?;
        let envelope = Envelope::parse(text)?;
        if envelope.t == FrameKind::Dummy {
            return Ok(());
        }

        match serde_json::from_str::<Packet>(&envelope.d)? {
            Packet::Probe(probe) => {
                let first_seen = self.system.mark_packet_seen(&probe.id)?;
                self.on_probe(probe, from_peer, first_seen)
            }
            Packet::Data(data) => {
                if self.system.mark_packet_seen(&data.id)? {
                    self.on_data(data, from_peer)
                } else {
                    Ok(())
                }
            }
            Packet::Unknown => Ok(()),
        }
    }

    // ── PROBE path ───────────────────────────────────────────────────────────

    fn on_probe(
        &self,
        probe: ProbePacket,
        from_peer: &str,
        first_seen: bool,
    ) -> Result<(), OverlayError> {
        // The reverse channel is how anything ever gets back to the probe's
        // origin. Looked up before install: a LOCAL row means this node
        // originated the conversation and must not relearn it remotely.
        let rev_was_local = self
            .system
            .best_route(&probe.rev_id)?
            .is_some_and(|r| r.is_local);
        if !rev_was_local {
            self.system.add_route(
                &probe.rev_id,
                from_peer,
                probe.metric + 1,
                false,
                None,
                self.config.route_ttl,
            )?;
        }

        if let Some(user) = self.active() {
            let my_hash = target_hash(user.identity.user_id());
            if hashes_match(&my_hash, &probe.target_hash) {
                if first_seen {
                    self.on_probe_for_me(&user, &probe, rev_was_local)?;
                }
                // Terminus either way — the probe stops here.
                return Ok(());
            }
        }

        // Relay. A forwarded packet must still be routable at the next hop,
        // so anything that cannot leave with ttl >= 1 ends here.
        if first_seen && probe.ttl > 1 {
            let mut fwd = probe;
            fwd.ttl -= 1;
            fwd.metric += 1;
            let json = Packet::Probe(fwd.clone()).to_json()?;
            self.system.enqueue(&fwd.id, None, &json, Some(from_peer))?;
        }
        Ok(())
    }

    fn on_probe_for_me(
        &self,
        user: &ActiveUser,
        probe: &ProbePacket,
        rev_was_local: bool,
    ) -> Result<(), OverlayError> {
        let auth_json = user.identity.unseal(&probe.auth)?;
        let auth: ProbeAuth = serde_json::from_slice(&auth_json)?;
        let sender = auth.sid;

        // The signature binds the claimed origin to us as the target.
        let claim = format!("{}{}", sender, user.identity.user_id());
        if !mist_crypto::verify(&sender, &claim, &probe.sig) {
            debug!(peer = %short(&sender), "probe auth signature rejected");
            return Ok(());
        }
        info!(origin = %short(&sender), "probe authenticated");

        // Future DATA on the forward channel is ours to deliver.
        self.system.add_route(
            &probe.route_id,
            LOCAL_HOP,
            0,
            true,
            Some(&sender),
            self.config.route_ttl,
        )?;

        if let Some(content) = probe.content.as_deref().filter(|c| !c.is_empty()) {
            self.deliver_local(user, &probe.id, &sender, content)?;
        }

        if rev_was_local {
            // Our own conversation coming back at us: we are the origin and
            // this is the response probe. The cycle is closed.
            return Ok(());
        }
        self.send_probe_response(user, &sender)
    }

    /// Acting as the target, answer the origin with a symmetric probe so
    /// both directions of the conversation end up installed mesh-wide.
    fn send_probe_response(
        &self,
        user: &ActiveUser,
        requester: &str,
    ) -> Result<(), OverlayError> {
        let me = user.identity.user_id();
        info!(origin = %short(requester), "answering with response probe");

        let fwd = route_id(me, requester);
        let rev = route_id(requester, me);

        // Terminate our own outgoing channel first, or the response coming
        // back through the mesh would trigger yet another response.
        self.system
            .add_route(&fwd, LOCAL_HOP, 0, true, Some(requester), self.config.route_ttl)?;

        let sig = user.identity.sign(&format!("{me}{requester}"));
        let auth = PublicHandle::from_hex(requester)?
            .seal(&serde_json::to_vec(&ProbeAuth { sid: me.to_string() })?)?;
        let content = user
            .identity
            .box_encrypt(requester, HANDSHAKE_GREETING)?;

        let probe = ProbePacket {
            id: Uuid::new_v4().to_string(),
            route_id: fwd,
            rev_id: rev,
            target_hash: target_hash(requester),
            auth,
            sig,
            content: Some(content),
            metric: 0,
            ttl: self.config.ttl_initial,
        };
        self.system.mark_packet_seen(&probe.id)?;
        let json = Packet::Probe(probe.clone()).to_json()?;
        self.system.enqueue(&probe.id, None, &json, None)?;
        Ok(())
    }

    // ── DATA path ────────────────────────────────────────────────────────────

    fn on_data(&self, data: DataPacket, from_peer: &str) -> Result<(), OverlayError> {
        let routes = self.system.routes_for(&data.route_id)?;
        if routes.is_empty() {
            debug!(route = %short(&data.route_id), "no live route, dropping data");
            return Ok(());
        }

        for route in routes {
            if route.is_local {
                return self.deliver_or_mailbox(&data, &route);
            }
            if self.links.contains(&route.next_hop_id) {
                if data.ttl <= 1 {
                    debug!(route = %short(&data.route_id), "data ttl exhausted");
                    return Ok(());
                }
                let mut fwd = data.clone();
                fwd.ttl -= 1;
                let json = Packet::Data(fwd).to_json()?;
                self.system
                    .enqueue(&data.id, Some(&route.next_hop_id), &json, Some(from_peer))?;
                return Ok(());
            }
            // Next hop gone; fall through to the next alternative.
        }
        debug!(route = %short(&data.route_id), "no actionable route, dropping data");
        Ok(())
    }

    /// The channel terminates on this node. Deliver to the active user if
    /// the channel is theirs, otherwise park the packet for whichever
    /// registered local user owns it.
    fn deliver_or_mailbox(
        &self,
        data: &DataPacket,
        route: &RouteEntry,
    ) -> Result<(), OverlayError> {
        let Some(sender) = route.remote_user_id.as_deref() else {
            debug!("local route has no remote user, dropping data");
            return Ok(());
        };

        if let Some(user) = self.active() {
            if route_id(sender, user.identity.user_id()) == data.route_id {
                return self.deliver_local(&user, &data.id, sender, &data.content);
            }
        }

        for local in self.system.local_users()? {
            if route_id(sender, &local) == data.route_id {
                info!(target = %short(&local), "queueing data for offline user");
                let json = Packet::Data(data.clone()).to_json()?;
                self.system.save_to_mailbox(&local, &json)?;
                return Ok(());
            }
        }
        debug!("local channel matches no registered user, dropping data");
        Ok(())
    }

    /// Final delivery into the active user's store. Decrypt failures are
    /// logged and swallowed; the packet id stays consumed either way.
    fn deliver_local(
        &self,
        user: &ActiveUser,
        packet_id: &str,
        sender: &str,
        content: &str,
    ) -> Result<(), OverlayError> {
        let text = match user
            .identity
            .box_decrypt(sender, content, self.config.max_message_age)
        {
            Ok(text) => text,
            Err(e) => {
                debug!(peer = %short(sender), error = %e, "rejected e2e content");
                return Ok(());
            }
        };
        let content_ct = user.identity.vault_encrypt(&text)?;
        if user
            .store
            .insert_message(packet_id, sender, sender, &content_ct, false, false)?
        {
            user.store.touch_contact(sender)?;
            info!(from = %short(sender), "message delivered");
        }
        Ok(())
    }

    // ── Originate ────────────────────────────────────────────────────────────

    /// Put a new message on the wire: DATA along a known channel, or a
    /// route-discovery probe carrying the message when no channel exists.
    pub fn originate(
        &self,
        user: &ActiveUser,
        target_id: &str,
        text: &str,
    ) -> Result<SendOutcome, OverlayError> {
        let me = user.identity.user_id();
        let content = user.identity.box_encrypt(target_id, text)?;
        let fwd = route_id(me, target_id);
        let rev = route_id(target_id, me);
        let packet_id = Uuid::new_v4().to_string();

        // Best live non-local route wins; a LOCAL row on the forward
        // channel (left by our own response probe) is not a way out.
        let known_hop = self
            .system
            .routes_for(&fwd)?
            .into_iter()
            .find(|r| !r.is_local);
        if let Some(route) = known_hop {
            let data = DataPacket {
                id: packet_id.clone(),
                route_id: fwd,
                content,
                ttl: self.config.ttl_initial,
            };
            self.system.mark_packet_seen(&packet_id)?;
            self.system.enqueue(
                &packet_id,
                Some(&route.next_hop_id),
                &Packet::Data(data).to_json()?,
                None,
            )?;
            return Ok(SendOutcome {
                packet_id,
                kind: PacketKind::Data,
            });
        }

        // No channel yet. Mark the return channel as ours, then flood a
        // probe that authenticates us to the target and carries the text.
        self.system
            .add_route(&rev, LOCAL_HOP, 0, true, Some(target_id), self.config.route_ttl)?;
        let sig = user.identity.sign(&format!("{me}{target_id}"));
        let auth = PublicHandle::from_hex(target_id)?
            .seal(&serde_json::to_vec(&ProbeAuth { sid: me.to_string() })?)?;
        let probe = ProbePacket {
            id: packet_id.clone(),
            route_id: fwd,
            rev_id: rev,
            target_hash: target_hash(target_id),
            auth,
            sig,
            content: Some(content),
            metric: 0,
            ttl: self.config.ttl_initial,
        };
        self.system.mark_packet_seen(&packet_id)?;
        self.system
            .enqueue(&packet_id, None, &Packet::Probe(probe).to_json()?, None)?;
        Ok(SendOutcome {
            packet_id,
            kind: PacketKind::Probe,
        })
    }

    // ── Mailbox replay ───────────────────────────────────────────────────────

    /// Deliver one packet parked while its target was logged out. The
    /// sender is recovered from the LOCAL routing row the handshake
    /// installed for the packet's forward channel.
    pub fn deliver_from_mailbox(
        &self,
        user: &ActiveUser,
        packet_json: &str,
    ) -> Result<(), OverlayError> {
        let Packet::Data(data) = serde_json::from_str::<Packet>(packet_json)? else {
            debug!("mailbox entry is not a data packet, dropping");
            return Ok(());
        };
        let sender = self
            .system
            .routes_for(&data.route_id)?
            .into_iter()
            .find(|r| r.is_local)
            .and_then(|r| r.remote_user_id);
        match sender {
            Some(sender) => self.deliver_local(user, &data.id, &sender, &data.content),
            None => {
                warn!(route = %short(&data.route_id), "mailbox channel expired, dropping packet");
                Ok(())
            }
        }
    }
}

/// Constant-time hash comparison; probe targeting should not leak via
/// timing which identities a node hosts.
fn hashes_match(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
