//! The mist overlay: packet taxonomy, the routing engine, the tact
//! cadence engine and the TCP link layer.
//!
//! Every node is a router; a node with a logged-in user is also an
//! endpoint. Two disciplines shape the design:
//!
//! - **Constant-rate, constant-size links.** The tact engine is the only
//!   thing that ever writes to a link, and everything it writes is an
//!   envelope of exactly the configured frame size — a drained outbox row
//!   or an indistinguishable dummy.
//! - **Store-mediated hand-off.** The overlay engine and the tact engine
//!   never call each other. The outbox, routing table and seen-packets log
//!   in the system store are the bus between them.

pub mod engine;
pub mod envelope;
pub mod error;
pub mod link;
pub mod packet;
pub mod tact;

pub use engine::{ActiveUser, OverlayConfig, OverlayEngine, PacketKind, SendOutcome};
pub use envelope::{Envelope, FrameKind, DEFAULT_PACKET_SIZE};
pub use error::OverlayError;
pub use link::{connect_to, run_listener, LinkHandle, Links, DAEMON_IDLE_ID};
pub use packet::{DataPacket, Packet, ProbeAuth, ProbePacket};
pub use tact::TactEngine;
