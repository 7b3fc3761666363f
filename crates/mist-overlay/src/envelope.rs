//! The constant-size link frame.
//!
//! Every frame on every link is one JSON object `{"t","d","x"}` whose
//! UTF-8 serialization is exactly the configured frame size. `x` is random
//! alphanumeric padding — one byte of JSON per byte of padding, so the
//! deficit is filled exactly. An observer sees identical frames whether a
//! link is carrying conversation or silence.

use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};

use crate::error::OverlayError;

pub const DEFAULT_PACKET_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    #[serde(rename = "REAL")]
    Real,
    #[serde(rename = "DUMMY")]
    Dummy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub t: FrameKind,
    pub d: String,
    pub x: String,
}

impl Envelope {
    /// Frame a payload, padding the serialization to exactly `size` bytes.
    pub fn real(payload: &str, size: usize) -> Result<String, OverlayError> {
        build(FrameKind::Real, payload, size)
    }

    /// An empty cover frame, indistinguishable in size from a real one.
    pub fn dummy(size: usize) -> Result<String, OverlayError> {
        build(FrameKind::Dummy, "", size)
    }

    pub fn parse(frame: &str) -> Result<Envelope, OverlayError> {
        serde_json::from_str(frame).map_err(|e| OverlayError::Codec(e.to_string()))
    }
}

fn build(t: FrameKind, payload: &str, size: usize) -> Result<String, OverlayError> {
    let mut envelope = Envelope {
        t,
        d: payload.to_string(),
        x: String::new(),
    };
    let base = serde_json::to_string(&envelope)?.len();
    if base > size {
        return Err(OverlayError::Oversize(base));
    }
    envelope.x = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(size - base)
        .map(char::from)
        .collect();
    Ok(serde_json::to_string(&envelope)?)
}
