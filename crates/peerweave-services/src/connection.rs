//! One live, authenticated connection to a peer.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use peerweave_core::crypto::PeerIdentity;
use peerweave_core::{LocationId, Priority};

use crate::scheduler::Scheduler;

/// Connections are keyed by their session id, identical on both sides.
pub type ConnectionId = [u8; 32];

/// What we know about the peer's tolerance for sliced packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SliceCapability {
    /// No probe seen yet.
    Unknown = 0,
    Supported = 1,
    Unsupported = 2,
}

impl From<u8> for SliceCapability {
    fn from(v: u8) -> Self {
        match v {
            1 => SliceCapability::Supported,
            2 => SliceCapability::Unsupported,
            _ => SliceCapability::Unknown,
        }
    }
}

/// One encoded item waiting in a connection's write queue.
#[derive(Debug)]
pub(crate) struct Outbound {
    pub bytes: Bytes,
    pub priority: Priority,
}

pub struct PeerConnection {
    id: ConnectionId,
    peer: PeerIdentity,
    established_at: Instant,
    scheduler: Scheduler,
    slicing: AtomicU8,
    peer_services: Mutex<HashSet<u16>>,
    services_sent: AtomicBool,
    startup_scheduled: AtomicBool,
    outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    closed: watch::Sender<bool>,
}

impl PeerConnection {
    pub(crate) fn new(id: ConnectionId, peer: PeerIdentity, queue_depth: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let (closed, _) = watch::channel(false);
        let conn = Self {
            id,
            peer,
            established_at: Instant::now(),
            scheduler: Scheduler::new(hex::encode(&id[..8])),
            slicing: AtomicU8::new(SliceCapability::Unknown as u8),
            peer_services: Mutex::new(HashSet::new()),
            services_sent: AtomicBool::new(false),
            startup_scheduled: AtomicBool::new(false),
            outbound: Mutex::new(Some(tx)),
            writer: Mutex::new(None),
            closed,
        };
        (conn, rx)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    pub fn location_id(&self) -> LocationId {
        self.peer.location_id
    }

    pub fn established_at(&self) -> Instant {
        self.established_at
    }

    /// Periodic and delayed tasks attached to this connection.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    // ── Slicing ──────────────────────────────────────────────────────────────

    pub fn slice_capability(&self) -> SliceCapability {
        SliceCapability::from(self.slicing.load(Ordering::Acquire))
    }

    /// Record the probe verdict. Only the first verdict counts; returns
    /// whether this call set it.
    pub fn resolve_slicing(&self, verdict: SliceCapability) -> bool {
        self.slicing
            .compare_exchange(
                SliceCapability::Unknown as u8,
                verdict as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    // ── Service negotiation ──────────────────────────────────────────────────

    /// Replace the set of service types the peer announced.
    pub fn set_peer_services(&self, services: impl IntoIterator<Item = u16>) {
        if let Ok(mut set) = self.peer_services.lock() {
            *set = services.into_iter().collect();
        }
    }

    pub fn peer_supports(&self, service_type: u16) -> bool {
        self.peer_services
            .lock()
            .map(|set| set.contains(&service_type))
            .unwrap_or(false)
    }

    /// Marks our service list as sent. Returns true if it already was.
    pub fn mark_services_sent(&self) -> bool {
        self.services_sent.swap(true, Ordering::AcqRel)
    }

    pub fn services_sent(&self) -> bool {
        self.services_sent.load(Ordering::Acquire)
    }

    /// Marks service startup as scheduled. Returns true if it already was.
    pub(crate) fn mark_startup_scheduled(&self) -> bool {
        self.startup_scheduled.swap(true, Ordering::AcqRel)
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    pub(crate) fn sender(&self) -> Option<mpsc::Sender<Outbound>> {
        self.outbound.lock().ok().and_then(|tx| tx.clone())
    }

    pub(crate) fn set_writer(&self, handle: JoinHandle<()>) {
        if let Ok(mut writer) = self.writer.lock() {
            *writer = Some(handle);
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the connection is closed, from either side.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Tear the connection down: cancel its tasks, stop its writer and fail
    /// every pending write. Idempotent.
    pub(crate) fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        self.scheduler.cancel_all();
        if let Ok(mut tx) = self.outbound.lock() {
            tx.take();
        }
        if let Ok(mut writer) = self.writer.lock() {
            if let Some(handle) = writer.take() {
                handle.abort();
            }
        }
        tracing::debug!(peer = %self.peer.location_id, "connection closed");
    }

    /// Called by the writer when the transport fails underneath it.
    pub(crate) fn mark_closed(&self) {
        self.closed.send_replace(true);
    }
}

impl std::fmt::Debug for PeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnection")
            .field("id", &hex::encode(&self.id[..8]))
            .field("peer", &self.peer.location_id)
            .field("slicing", &self.slice_capability())
            .field("closed", &self.is_closed())
            .finish()
    }
}
