//! TCP link layer: message-framed neighbor sessions.
//!
//! Frames are length-prefixed on the wire; inside each frame sits one
//! fixed-size envelope (or, for the very first frame in each direction,
//! the raw handshake identity string). One writer task and one reader task
//! per link; the reader owns the link's lifetime — write failures are
//! tolerated, read failure tears the link down.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time::timeout,
};
use tokio_util::{
    bytes::Bytes,
    codec::{Framed, LengthDelimitedCodec},
};
use tracing::{debug, info, warn};

use crate::{engine::OverlayEngine, error::OverlayError};

/// Handshake identity announced while no user is logged in.
pub const DAEMON_IDLE_ID: &str = "daemon_node_idle";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_QUEUE: usize = 64;

// ── Registry ──────────────────────────────────────────────────────────────────

/// Sending half of one live link.
#[derive(Clone)]
pub struct LinkHandle {
    peer_id: String,
    tx: mpsc::Sender<String>,
}

impl LinkHandle {
    pub fn new(peer_id: impl Into<String>, tx: mpsc::Sender<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            tx,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Queue a frame for the writer task. A full queue or a dead writer
    /// just drops the frame — the cadence supplies the next one.
    pub async fn send(&self, frame: String) {
        if self.tx.send(frame).await.is_err() {
            debug!(peer = %self.peer_id, "writer gone, frame dropped");
        }
    }
}

/// Process-wide map of currently connected neighbors.
///
/// Mutated only by the acceptor, outbound connects and reader teardown;
/// everyone else takes snapshots.
#[derive(Clone, Default)]
pub struct Links {
    inner: Arc<Mutex<HashMap<String, LinkHandle>>>,
}

impl Links {
    pub fn insert(&self, handle: LinkHandle) {
        self.lock().insert(handle.peer_id.clone(), handle);
    }

    pub fn remove(&self, peer_id: &str) {
        self.lock().remove(peer_id);
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.lock().contains_key(peer_id)
    }

    pub fn get(&self, peer_id: &str) -> Option<LinkHandle> {
        self.lock().get(peer_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<LinkHandle> {
        self.lock().values().cloned().collect()
    }

    pub fn peer_ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, LinkHandle>> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

// ── Accept / connect ──────────────────────────────────────────────────────────

/// Accept neighbor sessions until the listener dies.
pub async fn run_listener(listener: TcpListener, engine: Arc<OverlayEngine>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    if let Err(e) = accept_session(stream, engine).await {
                        debug!(%addr, error = %e, "inbound session ended during handshake");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn accept_session(
    stream: TcpStream,
    engine: Arc<OverlayEngine>,
) -> Result<(), OverlayError> {
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    // Acceptor reads the peer's identity first, then answers with its own.
    let peer_id = read_identity(&mut framed).await?;
    let ours = engine.handshake_identity();
    framed.send(Bytes::from(ours.clone())).await?;

    if peer_id == ours && peer_id != DAEMON_IDLE_ID {
        debug!("self-connection detected, closing");
        return Ok(());
    }
    register(framed, peer_id, "incoming", engine);
    Ok(())
}

/// Dial a neighbor. Returns the peer's handshake identity once the link
/// is registered.
pub async fn connect_to(
    address: &str,
    engine: Arc<OverlayEngine>,
) -> Result<String, OverlayError> {
    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
        .await
        .map_err(|_| OverlayError::ConnectTimeout)??;
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());

    let ours = engine.handshake_identity();
    framed.send(Bytes::from(ours.clone())).await?;
    let peer_id = read_identity(&mut framed).await?;

    if peer_id == ours && peer_id != DAEMON_IDLE_ID {
        return Err(OverlayError::Handshake("connected to self".into()));
    }
    register(framed, peer_id.clone(), address, engine);
    info!(peer = %short(&peer_id), %address, "connected to neighbor");
    Ok(peer_id)
}

async fn read_identity(
    framed: &mut Framed<TcpStream, LengthDelimitedCodec>,
) -> Result<String, OverlayError> {
    let frame = framed
        .next()
        .await
        .ok_or_else(|| OverlayError::Handshake("peer closed before identifying".into()))?
        .map_err(OverlayError::Io)?;
    String::from_utf8(frame.to_vec())
        .map_err(|e| OverlayError::Handshake(e.to_string()))
}

// ── Per-link tasks ────────────────────────────────────────────────────────────

fn register(
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    peer_id: String,
    address: &str,
    engine: Arc<OverlayEngine>,
) {
    let (mut sink, mut stream) = framed.split();
    let (tx, mut rx) = mpsc::channel::<String>(WRITE_QUEUE);

    engine.links().insert(LinkHandle::new(peer_id.clone(), tx));
    if let Err(e) = engine.system().upsert_neighbor(&peer_id, address) {
        warn!(error = %e, "failed to persist neighbor");
    }
    info!(peer = %short(&peer_id), "link up");

    // Writer: transient send failures cost one frame, never the link.
    let writer_peer = peer_id.clone();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(Bytes::from(frame)).await {
                debug!(peer = %short(&writer_peer), error = %e, "link write failed");
            }
        }
    });

    // Reader: owns the link lifetime.
    tokio::spawn(async move {
        while let Some(next) = stream.next().await {
            match next {
                Ok(bytes) => engine.process_frame(&bytes, &peer_id),
                Err(e) => {
                    debug!(peer = %short(&peer_id), error = %e, "link read failed");
                    break;
                }
            }
        }
        engine.links().remove(&peer_id);
        if let Err(e) = engine.system().touch_neighbor(&peer_id) {
            warn!(error = %e, "failed to persist neighbor last_seen");
        }
        info!(peer = %short(&peer_id), "link down");
    });
}

fn short(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}
