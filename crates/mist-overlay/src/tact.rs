//! The cadence engine.
//!
//! Every tick: snapshot the connected neighbors, drain a bounded batch of
//! outbox rows into fixed-size envelopes, and when there is nothing to
//! say, say something indistinguishable. Each link therefore emits frames
//! at the same rate and size whether or not anyone is talking.

use std::{sync::Arc, time::Duration};

use tokio::time::Instant;
use tracing::{debug, info, warn};

use mist_store::SystemStore;

use crate::{envelope::Envelope, error::OverlayError, link::Links};

/// Floor on the inter-tick sleep, so a slow drain cannot spin the loop.
const MIN_SLEEP: Duration = Duration::from_millis(100);

pub struct TactEngine {
    system: Arc<SystemStore>,
    links: Links,
    interval: Duration,
    packet_size: usize,
    drain_limit: usize,
}

impl TactEngine {
    pub fn new(
        system: Arc<SystemStore>,
        links: Links,
        interval: Duration,
        packet_size: usize,
        drain_limit: usize,
    ) -> Self {
        Self {
            system,
            links,
            interval,
            packet_size,
            drain_limit,
        }
    }

    /// Run forever. Aborted by the daemon on shutdown.
    pub async fn run(self) {
        info!(interval = ?self.interval, frame = self.packet_size, "tact engine started");
        loop {
            let started = Instant::now();
            if let Err(e) = self.tick().await {
                warn!(error = %e, "tact tick failed");
            }
            let sleep_for = self
                .interval
                .saturating_sub(started.elapsed())
                .max(MIN_SLEEP);
            tokio::time::sleep(sleep_for).await;
        }
    }

    async fn tick(&self) -> Result<(), OverlayError> {
        let neighbors = self.links.snapshot();
        if neighbors.is_empty() {
            return Ok(());
        }

        let rows = self.system.outbox_head(self.drain_limit)?;
        if rows.is_empty() {
            // Idle links get cover traffic at the same cadence.
            let dummy = Envelope::dummy(self.packet_size)?;
            for link in &neighbors {
                link.send(dummy.clone()).await;
            }
            return Ok(());
        }

        for row in rows {
            match Envelope::real(&row.packet_json, self.packet_size) {
                Ok(frame) => match row.next_hop_id.as_deref() {
                    Some(hop) => {
                        // Unicast; a hop that disconnected since enqueue is skipped.
                        if let Some(link) =
                            neighbors.iter().find(|l| l.peer_id() == hop)
                        {
                            link.send(frame).await;
                        }
                    }
                    None => {
                        for link in &neighbors {
                            if Some(link.peer_id()) == row.exclude_peer.as_deref() {
                                continue;
                            }
                            link.send(frame.clone()).await;
                        }
                    }
                },
                Err(OverlayError::Oversize(bytes)) => {
                    warn!(
                        packet = %row.packet_id,
                        bytes,
                        max = self.packet_size,
                        "payload larger than frame size, dropping"
                    );
                }
                Err(e) => {
                    debug!(packet = %row.packet_id, error = %e, "failed to frame payload");
                }
            }
            // The row is consumed whether or not any transmission succeeded.
            self.system.delete_outbox(row.id)?;
        }
        Ok(())
    }
}
