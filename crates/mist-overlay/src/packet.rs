//! Wire-payload types.
//!
//! All payloads are schemaless JSON discriminated by the `type` field.
//! Anything with an unrecognized tag decodes to [`Packet::Unknown`] and is
//! dropped without a trace — a forward-compatibility valve, and the only
//! polite answer to a malformed flood.

use serde::{Deserialize, Serialize};

/// One overlay packet, as carried in a REAL envelope's `d` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Packet {
    #[serde(rename = "PROBE")]
    Probe(ProbePacket),
    #[serde(rename = "DATA")]
    Data(DataPacket),
    #[serde(other)]
    Unknown,
}

impl Packet {
    /// The packet id that gates deduplication, when the type carries one.
    pub fn id(&self) -> Option<&str> {
        match self {
            Packet::Probe(p) => Some(&p.id),
            Packet::Data(d) => Some(&d.id),
            Packet::Unknown => None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Route-discovery packet. Floods the mesh until it reaches the one node
/// whose local user recognizes `target_hash`; every hop it crosses learns
/// the way back to its origin.
///
/// No endpoint identity appears in the clear: `auth` is a sealed
/// `{sid: origin}` only the target can open, and `sig` (origin's signature
/// over `origin‖target`) proves the claim once it is opened.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbePacket {
    pub id: String,
    /// Forward channel, `route_id(origin, target)`.
    pub route_id: String,
    /// Return channel, `route_id(target, origin)` — what relays install.
    pub rev_id: String,
    pub target_hash: String,
    /// Sealed origin identity, base64.
    pub auth: String,
    /// Origin's signature over `origin‖target`, base64.
    pub sig: String,
    /// Optional end-to-end payload riding along with the discovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub metric: i64,
    pub ttl: i64,
}

/// Unicast data packet. Carries nothing but the channel hash and the
/// sealed content; only the channel's endpoint can decrypt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataPacket {
    pub id: String,
    pub route_id: String,
    pub content: String,
    pub ttl: i64,
}

/// Plaintext inside a probe's `auth` seal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeAuth {
    pub sid: String,
}
