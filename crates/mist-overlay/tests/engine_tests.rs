//! Overlay-engine behavior against real stores: route learning, probe
//! authentication, the response cycle, data forwarding and the offline
//! mailbox. Links are faked with in-memory handles; no sockets here.

use std::sync::{Arc, OnceLock};

use tokio::sync::mpsc;

use mist_crypto::{route_id, target_hash, Identity};
use mist_overlay::{
    ActiveUser, Envelope, LinkHandle, Links, OverlayConfig, OverlayEngine, Packet, PacketKind,
    DEFAULT_PACKET_SIZE,
};
use mist_store::{SystemStore, UserStore, LOCAL_HOP};

// Identity derivation is deliberately expensive; derive each test user
// once per process.
static ALICE: OnceLock<Identity> = OnceLock::new();
static BOB: OnceLock<Identity> = OnceLock::new();

fn alice() -> Identity {
    ALICE
        .get_or_init(|| Identity::derive("alice", "1").expect("derive"))
        .clone()
}

fn bob() -> Identity {
    BOB.get_or_init(|| Identity::derive("bob", "1").expect("derive"))
        .clone()
}

struct TestNode {
    dir: tempfile::TempDir,
    system: Arc<SystemStore>,
    links: Links,
    engine: OverlayEngine,
}

fn node() -> TestNode {
    let dir = tempfile::tempdir().expect("tempdir");
    let system = Arc::new(SystemStore::open(&dir.path().join("system.db")).expect("open"));
    let links = Links::default();
    let engine = OverlayEngine::new(Arc::clone(&system), links.clone(), OverlayConfig::default());
    TestNode {
        dir,
        system,
        links,
        engine,
    }
}

impl TestNode {
    fn login(&self, identity: Identity) {
        let path = self
            .dir
            .path()
            .join(format!("user_{}.db", identity.user_id()));
        let store = UserStore::open(&path).expect("user store");
        self.engine.set_active_user(ActiveUser { identity, store });
    }

    /// Fabricate a connected neighbor; the receiver is returned so the
    /// channel stays open.
    fn fake_link(&self, peer_id: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(16);
        self.links.insert(LinkHandle::new(peer_id, tx));
        rx
    }

    fn feed(&self, payload: &str, from_peer: &str) {
        let frame = Envelope::real(payload, DEFAULT_PACKET_SIZE).expect("frame");
        self.engine.process_frame(frame.as_bytes(), from_peer);
    }

    fn outbox_payloads(&self) -> Vec<String> {
        self.system
            .outbox_all()
            .expect("outbox")
            .into_iter()
            .map(|row| row.packet_json)
            .collect()
    }

    fn clear_outbox(&self) {
        for row in self.system.outbox_all().expect("outbox") {
            self.system.delete_outbox(row.id).expect("delete");
        }
    }
}

/// Originate a probe from a fresh sender node and return its JSON.
fn probe_from(sender: &TestNode, target_id: &str, text: &str) -> String {
    let user = sender.engine.active().expect("active user");
    let outcome = sender
        .engine
        .originate(&user, target_id, text)
        .expect("originate");
    assert_eq!(outcome.kind, PacketKind::Probe);
    let payloads = sender.outbox_payloads();
    payloads.last().expect("probe queued").clone()
}

// ── PROBE relaying ────────────────────────────────────────────────────────────

#[test]
fn probe_installs_reverse_route_and_floods_on() {
    let a = node();
    a.login(alice());
    let probe_json = probe_from(&a, bob().user_id(), "hi");

    let relay = node();
    relay.feed(&probe_json, "peer-a");

    let rev = route_id(bob().user_id(), alice().user_id());
    let installed = relay.system.best_route(&rev).expect("query").expect("route");
    assert_eq!(installed.next_hop_id, "peer-a");
    assert_eq!(installed.metric, 1);
    assert!(!installed.is_local);

    let out = relay.system.outbox_all().expect("outbox");
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].next_hop_id, None, "relay must flood");
    assert_eq!(out[0].exclude_peer.as_deref(), Some("peer-a"));
    let Packet::Probe(fwd) = serde_json::from_str(&out[0].packet_json).expect("parse") else {
        panic!("expected a probe");
    };
    assert_eq!(fwd.ttl, 19, "ttl decremented on relay");
    assert_eq!(fwd.metric, 1, "metric incremented on relay");
}

#[test]
fn probe_with_one_hop_left_is_not_relayed() {
    let a = node();
    a.login(alice());
    let probe_json = probe_from(&a, bob().user_id(), "hi");
    let Packet::Probe(mut probe) = serde_json::from_str(&probe_json).expect("parse") else {
        panic!("expected a probe");
    };
    probe.ttl = 1;
    let payload = Packet::Probe(probe).to_json().expect("json");

    let relay = node();
    relay.feed(&payload, "peer-a");

    // The reverse route is still learned, but nothing is forwarded.
    let rev = route_id(bob().user_id(), alice().user_id());
    assert!(relay.system.best_route(&rev).expect("query").is_some());
    assert!(relay.outbox_payloads().is_empty());
}

#[test]
fn duplicate_probe_is_relayed_only_once() {
    let a = node();
    a.login(alice());
    let probe_json = probe_from(&a, bob().user_id(), "hi");

    let relay = node();
    relay.feed(&probe_json, "peer-a");
    relay.feed(&probe_json, "peer-b");

    assert_eq!(relay.outbox_payloads().len(), 1);
}

// ── PROBE terminating at the target ──────────────────────────────────────────

#[test]
fn probe_reaching_target_installs_delivers_and_responds() {
    let a = node();
    a.login(alice());
    let b = node();
    b.login(bob());
    let alice_id = alice().user_id().to_string();
    let bob_id = bob().user_id().to_string();

    let probe_json = probe_from(&a, &bob_id, "hi");
    b.feed(&probe_json, "peer-a");

    // Forward channel now terminates at bob.
    let fwd = b
        .system
        .best_route(&route_id(&alice_id, &bob_id))
        .expect("query")
        .expect("route");
    assert!(fwd.is_local);
    assert_eq!(fwd.remote_user_id.as_deref(), Some(alice_id.as_str()));

    // The riding message was decrypted and stored.
    let user = b.engine.active().expect("active");
    let history = user.store.history(&alice_id).expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(
        user.identity.vault_decrypt(&history[0].content).expect("vault"),
        "hi"
    );
    assert!(!history[0].is_outgoing);

    // A response probe aimed back at alice is queued as a flood, and bob
    // pre-terminated his own outgoing channel.
    let out = b.outbox_payloads();
    assert_eq!(out.len(), 1);
    let Packet::Probe(resp) = serde_json::from_str(&out[0]).expect("parse") else {
        panic!("expected a probe");
    };
    assert_eq!(resp.target_hash, target_hash(&alice_id));
    assert!(b
        .system
        .best_route(&route_id(&bob_id, &alice_id))
        .expect("query")
        .expect("route")
        .is_local);
}

#[test]
fn response_cycle_terminates_at_the_origin_side() {
    let a = node();
    a.login(alice());
    let b = node();
    b.login(bob());
    let alice_id = alice().user_id().to_string();
    let bob_id = bob().user_id().to_string();

    // Full cycle: probe → response → counter-response, then silence.
    let probe_json = probe_from(&a, &bob_id, "hi");
    b.feed(&probe_json, "peer-a");
    let response = b.outbox_payloads().pop().expect("response probe");

    a.clear_outbox();
    a.feed(&response, "peer-b");

    // Alice got the handshake greeting.
    let user = a.engine.active().expect("active");
    let history = user.store.history(&bob_id).expect("history");
    assert_eq!(history.len(), 1);

    // Her reverse channel was already local, so her counter-response is
    // the last probe of the conversation: bob answers it with nothing.
    let counter = a.outbox_payloads().pop().expect("counter response");
    b.clear_outbox();
    b.feed(&counter, "peer-a");
    assert!(b.outbox_payloads().is_empty(), "cycle must not continue");

    // And from here on the origin emits DATA, not probes.
    let outcome = a
        .engine
        .originate(&a.engine.active().expect("active"), &bob_id, "hi2")
        .expect("send");
    assert_eq!(outcome.kind, PacketKind::Data);
}

#[test]
fn probe_with_forged_signature_is_dropped() {
    let a = node();
    a.login(alice());
    let b = node();
    b.login(bob());
    let bob_id = bob().user_id().to_string();

    let probe_json = probe_from(&a, &bob_id, "hi");
    let Packet::Probe(mut probe) = serde_json::from_str(&probe_json).expect("parse") else {
        panic!("expected a probe");
    };
    // Re-sign with the wrong key.
    probe.sig = bob().sign("not the claim");
    b.feed(&Packet::Probe(probe).to_json().expect("json"), "peer-a");

    let user = b.engine.active().expect("active");
    assert!(user
        .store
        .history(alice().user_id())
        .expect("history")
        .is_empty());
    assert!(b.outbox_payloads().is_empty(), "no response for forgeries");
}

// ── DATA forwarding ───────────────────────────────────────────────────────────

fn data_packet(from: &Identity, to: &Identity, text: &str) -> (String, String) {
    let sender = node();
    sender.login(from.clone());
    // Force the DATA branch with a live-looking remote route.
    let fwd = route_id(from.user_id(), to.user_id());
    sender
        .system
        .add_route(&fwd, "hop", 1, false, None, std::time::Duration::from_secs(60))
        .expect("route");
    let user = sender.engine.active().expect("active");
    let outcome = sender.engine.originate(&user, to.user_id(), text).expect("send");
    assert_eq!(outcome.kind, PacketKind::Data);
    let payload = sender.outbox_payloads().pop().expect("data queued");
    (payload, outcome.packet_id)
}

#[test]
fn data_is_forwarded_to_the_live_next_hop() {
    let (payload, packet_id) = data_packet(&alice(), &bob(), "msg");
    let relay = node();
    let _rx = relay.fake_link("peer-c");
    let fwd = route_id(alice().user_id(), bob().user_id());
    relay
        .system
        .add_route(&fwd, "peer-c", 1, false, None, std::time::Duration::from_secs(60))
        .expect("route");

    relay.feed(&payload, "peer-b");

    let out = relay.system.outbox_all().expect("outbox");
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].packet_id, packet_id);
    assert_eq!(out[0].next_hop_id.as_deref(), Some("peer-c"));
    assert_eq!(out[0].exclude_peer.as_deref(), Some("peer-b"));
    let Packet::Data(fwded) = serde_json::from_str(&out[0].packet_json).expect("parse") else {
        panic!("expected data");
    };
    assert_eq!(fwded.ttl, 19);
}

#[test]
fn data_falls_through_to_an_alternative_hop() {
    let (payload, _) = data_packet(&alice(), &bob(), "msg");
    let relay = node();
    let _rx = relay.fake_link("peer-live");
    let fwd = route_id(alice().user_id(), bob().user_id());
    let ttl = std::time::Duration::from_secs(60);
    // Better metric, but that neighbor is gone.
    relay.system.add_route(&fwd, "peer-dead", 1, false, None, ttl).expect("route");
    relay.system.add_route(&fwd, "peer-live", 3, false, None, ttl).expect("route");

    relay.feed(&payload, "peer-b");

    let out = relay.system.outbox_all().expect("outbox");
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].next_hop_id.as_deref(), Some("peer-live"));
}

#[test]
fn data_without_any_live_route_is_dropped() {
    let (payload, _) = data_packet(&alice(), &bob(), "msg");
    let relay = node();
    let fwd = route_id(alice().user_id(), bob().user_id());
    // Only an expired row.
    relay
        .system
        .add_route(&fwd, "hop", 1, false, None, std::time::Duration::ZERO)
        .expect("route");

    relay.feed(&payload, "peer-b");

    assert!(relay.outbox_payloads().is_empty());
    assert_eq!(relay.system.mailbox_len(bob().user_id()).expect("len"), 0);
}

#[test]
fn duplicate_data_is_processed_once() {
    let (payload, _) = data_packet(&alice(), &bob(), "msg");
    let relay = node();
    let _rx = relay.fake_link("peer-c");
    let fwd = route_id(alice().user_id(), bob().user_id());
    relay
        .system
        .add_route(&fwd, "peer-c", 1, false, None, std::time::Duration::from_secs(60))
        .expect("route");

    relay.feed(&payload, "peer-b");
    relay.feed(&payload, "peer-b");

    assert_eq!(relay.system.outbox_all().expect("outbox").len(), 1);
}

// ── Offline mailbox ───────────────────────────────────────────────────────────

#[test]
fn data_for_registered_offline_user_is_parked_and_replayed() {
    let (payload, _) = data_packet(&alice(), &bob(), "while you were out");
    let alice_id = alice().user_id().to_string();
    let bob_id = bob().user_id().to_string();

    let n = node();
    n.system.register_local_user(&bob_id).expect("register");
    // The LOCAL row a previous login installed for this channel.
    n.system
        .add_route(
            &route_id(&alice_id, &bob_id),
            LOCAL_HOP,
            0,
            true,
            Some(&alice_id),
            std::time::Duration::from_secs(1800),
        )
        .expect("route");

    // Nobody logged in: the packet is parked, not delivered.
    n.feed(&payload, "peer-a");
    assert_eq!(n.system.mailbox_len(&bob_id).expect("len"), 1);

    // Bob logs in and the mailbox drains through local delivery.
    n.login(bob());
    let user = n.engine.active().expect("active");
    for parked in n.system.fetch_mailbox(&bob_id).expect("fetch") {
        n.engine
            .deliver_from_mailbox(&user, &parked)
            .expect("deliver");
    }
    assert_eq!(n.system.mailbox_len(&bob_id).expect("len"), 0);

    let history = user.store.history(&alice_id).expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(
        user.identity.vault_decrypt(&history[0].content).expect("vault"),
        "while you were out"
    );
}

// ── Frame handling ────────────────────────────────────────────────────────────

#[test]
fn dummy_frames_touch_nothing() {
    let n = node();
    let frame = Envelope::dummy(DEFAULT_PACKET_SIZE).expect("dummy");
    n.engine.process_frame(frame.as_bytes(), "peer-a");
    assert!(n.outbox_payloads().is_empty());
    assert!(n.system.live_routes().expect("routes").is_empty());
}

#[test]
fn unknown_packet_types_are_dropped_silently() {
    let n = node();
    n.feed(r#"{"type":"GOSSIP","id":"x","blob":"y"}"#, "peer-a");
    assert!(n.outbox_payloads().is_empty());
}

#[test]
fn garbage_frames_are_dropped() {
    let n = node();
    n.engine.process_frame(b"not json at all", "peer-a");
    n.engine.process_frame(&[0xff, 0xfe, 0x00], "peer-a");
    assert!(n.outbox_payloads().is_empty());
}
