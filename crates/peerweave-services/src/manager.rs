//! Connection manager: the single outbound path from services to peers.
//!
//! Each connection has one bounded write queue drained by one writer task.
//! The writer frames items into packets, seals each packet as one transport
//! record and writes it. Because only the writer touches the transport,
//! records never interleave, and items from one service leave in the order
//! they were queued.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};

use peerweave_core::codec::CodecError;
use peerweave_core::config::NetworkConfig;
use peerweave_core::crypto::{PeerIdentity, SessionCipher};
use peerweave_core::item::{self, service_type};
use peerweave_core::packet::{Packer, SliceMode};
use peerweave_core::{Item, LocationId};

use crate::connection::{ConnectionId, Outbound, PeerConnection, SliceCapability};
use crate::service::ServiceToken;

/// Crypto state shared between a connection's reader and writer.
pub type SharedCipher = Arc<Mutex<SessionCipher>>;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("service {token:#06x} cannot write items of service {item:#06x}")]
    ForeignItem { token: u16, item: u16 },
    #[error("encode failed: {0}")]
    Encode(#[from] CodecError),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("already connected to location {0}")]
    DuplicateLocation(LocationId),
    #[error("session id already in use")]
    DuplicateSession,
}

// ── Settings ──────────────────────────────────────────────────────────────────

/// Process-wide framing settings, fixed after startup.
#[derive(Debug, Clone, Copy)]
pub struct ManagerSettings {
    pub packet_slicing: bool,
    pub packet_grouping: bool,
    pub write_queue_depth: usize,
}

impl ManagerSettings {
    /// Expects a validated config: grouping is only honoured with slicing.
    pub fn from_config(network: &NetworkConfig) -> Self {
        Self {
            packet_slicing: network.packet_slicing,
            packet_grouping: network.packet_slicing && network.packet_grouping,
            write_queue_depth: network.write_queue_depth,
        }
    }

    /// Outbound framing for a peer with the given slicing capability.
    pub fn slice_mode(&self, peer: SliceCapability) -> SliceMode {
        match (self.packet_slicing, peer) {
            (true, SliceCapability::Supported) if self.packet_grouping => SliceMode::Grouping,
            (true, SliceCapability::Supported) => SliceMode::Slicing,
            _ => SliceMode::Whole,
        }
    }
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self { packet_slicing: false, packet_grouping: false, write_queue_depth: 64 }
    }
}

// ── Manager ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct ConnectionManager {
    connections: Arc<DashMap<ConnectionId, Arc<PeerConnection>>>,
    /// One entry per connected location. Claimed before a connection is
    /// inserted, released when it is removed.
    locations: Arc<DashMap<LocationId, ConnectionId>>,
    settings: ManagerSettings,
}

impl ConnectionManager {
    pub fn new(settings: ManagerSettings) -> Self {
        Self { connections: Arc::new(DashMap::new()), locations: Arc::new(DashMap::new()), settings }
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Register an authenticated connection and start its writer.
    pub async fn add<W>(
        &self,
        peer: PeerIdentity,
        cipher: SharedCipher,
        transport: W,
    ) -> Result<Arc<PeerConnection>, ConnectionError>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let id = *cipher.lock().await.session_id();
        let location = peer.location_id;
        match self.locations.entry(location) {
            Entry::Occupied(_) => return Err(ConnectionError::DuplicateLocation(location)),
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }

        let (conn, rx) = PeerConnection::new(id, peer, self.settings.write_queue_depth);
        let conn = Arc::new(conn);
        match self.connections.entry(id) {
            Entry::Occupied(_) => {
                self.locations.remove_if(&location, |_, claimed| *claimed == id);
                return Err(ConnectionError::DuplicateSession);
            }
            Entry::Vacant(slot) => {
                slot.insert(conn.clone());
            }
        }

        let writer = ConnectionWriter::new(conn.clone(), cipher, transport, rx, self.settings);
        conn.set_writer(tokio::spawn(writer.run()));
        tracing::info!(peer = %conn.location_id(), session_id = hex::encode(&id[..8]), "connection added");
        Ok(conn)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<PeerConnection>> {
        self.connections.get(id).map(|c| c.clone())
    }

    pub fn find_location(&self, location: &LocationId) -> Option<Arc<PeerConnection>> {
        let id = *self.locations.get(location)?;
        self.get(&id)
    }

    /// Tear down and forget a connection. Pending and later writes to it
    /// fail with [`WriteError::ConnectionClosed`].
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<PeerConnection>> {
        let (_, conn) = self.connections.remove(id)?;
        self.locations.remove_if(&conn.location_id(), |_, claimed| claimed == id);
        conn.close();
        tracing::info!(peer = %conn.location_id(), "connection removed");
        Some(conn)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Visit every live connection. `f` must not call back into the manager.
    pub fn for_each_connection(&self, mut f: impl FnMut(&Arc<PeerConnection>)) {
        for entry in self.connections.iter() {
            f(entry.value());
        }
    }

    /// Snapshot of live connections, safe to hold across awaits.
    pub fn connections(&self) -> Vec<Arc<PeerConnection>> {
        self.connections.iter().map(|c| c.value().clone()).collect()
    }

    /// Queue `item` on `conn` on behalf of the service holding `token`.
    ///
    /// Waits while the connection's queue is full.
    pub async fn write_item(&self, conn: &PeerConnection, item: &Item, token: ServiceToken) -> Result<(), WriteError> {
        if token.service_type != item.service_type() {
            return Err(WriteError::ForeignItem { token: token.service_type, item: item.service_type() });
        }
        self.enqueue(conn, item).await
    }

    /// Engine-owned items (the slice probe) bypass the token check.
    pub(crate) async fn write_probe(&self, conn: &PeerConnection) -> Result<(), WriteError> {
        debug_assert_eq!(Item::SliceProbe.service_type(), service_type::SLICE_PROBE);
        self.enqueue(conn, &Item::SliceProbe).await
    }

    async fn enqueue(&self, conn: &PeerConnection, item: &Item) -> Result<(), WriteError> {
        let tx = conn.sender().ok_or(WriteError::ConnectionClosed)?;
        let bytes = item::encode(item)?;
        tx.send(Outbound { bytes, priority: item.priority() })
            .await
            .map_err(|_| WriteError::ConnectionClosed)
    }
}

// ── Writer ────────────────────────────────────────────────────────────────────

struct ConnectionWriter<W> {
    conn: Arc<PeerConnection>,
    cipher: SharedCipher,
    transport: W,
    rx: mpsc::Receiver<Outbound>,
    packer: Packer,
    settings: ManagerSettings,
    record: Vec<u8>,
}

impl<W: AsyncWrite + Unpin + Send + 'static> ConnectionWriter<W> {
    fn new(
        conn: Arc<PeerConnection>,
        cipher: SharedCipher,
        transport: W,
        rx: mpsc::Receiver<Outbound>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            conn,
            cipher,
            transport,
            rx,
            packer: Packer::new(SliceMode::Whole),
            settings,
            record: Vec::new(),
        }
    }

    async fn run(mut self) {
        if let Err(e) = self.drain().await {
            tracing::warn!(peer = %self.conn.location_id(), error = %e, "connection writer failed");
        }
        self.conn.mark_closed();
    }

    async fn drain(&mut self) -> anyhow::Result<()> {
        while let Some(first) = self.rx.recv().await {
            self.push(first).await?;
            // Everything already queued joins the same batch before the
            // pending group is flushed.
            while let Ok(next) = self.rx.try_recv() {
                self.push(next).await?;
            }
            if let Some(group) = self.packer.flush() {
                self.send_packet(&group).await?;
            }
            self.transport.flush().await?;
        }
        Ok(())
    }

    async fn push(&mut self, out: Outbound) -> anyhow::Result<()> {
        let mode = self.settings.slice_mode(self.conn.slice_capability());
        if mode != self.packer.mode() {
            if let Some(group) = self.packer.set_mode(mode) {
                self.send_packet(&group).await?;
            }
        }
        for packet in self.packer.push(out.bytes, out.priority) {
            self.send_packet(&packet).await?;
        }
        Ok(())
    }

    async fn send_packet(&mut self, packet: &[u8]) -> anyhow::Result<()> {
        self.record.clear();
        self.cipher.lock().await.seal(packet, &mut self.record)?;
        self.transport.write_all(&self.record).await?;
        Ok(())
    }
}
