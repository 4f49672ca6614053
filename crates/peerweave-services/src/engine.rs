//! Connection engine: drives one transport from handshake to teardown.
//!
//! After the hello exchange the engine registers the connection with the
//! manager (which starts its writer), sends the slice probe as the first
//! sealed record, starts the service-info exchange, and then reads records
//! until the stream ends:
//!
//!   record → open → reassemble → decode → dispatch
//!
//! Framing and decode errors drop the offending packet or item and the
//! connection carries on. A record that fails to open ends the connection,
//! as does a peer that sends nothing within the idle timeout.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;

use peerweave_core::config::NetworkConfig;
use peerweave_core::crypto::{CryptoState, HandshakeParams, IdentityKeypair, Role};
use peerweave_core::item::{self, service_type};
use peerweave_core::packet::Reassembler;
use peerweave_core::wire::ItemHeader;
use peerweave_core::Item;

use crate::connection::{PeerConnection, SliceCapability};
use crate::manager::{ConnectionManager, SharedCipher};
use crate::registry::ServiceRegistry;
use crate::transport::{exchange_hellos, read_frame, MAX_RECORD_LEN};

// ── Settings ──────────────────────────────────────────────────────────────────

/// Connection lifecycle deadlines.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// How long to wait for the peer's slice probe before sending whole.
    pub probe_timeout: Duration,
    /// Bound on the hello exchange.
    pub handshake_timeout: Duration,
    /// Longest silence tolerated from an established peer.
    pub idle_timeout: Duration,
}

impl EngineSettings {
    pub fn from_config(network: &NetworkConfig) -> Self {
        Self {
            probe_timeout: Duration::from_millis(network.slice_probe_timeout_ms),
            handshake_timeout: Duration::from_millis(network.handshake_timeout_ms),
            idle_timeout: Duration::from_millis(network.peer_idle_timeout_ms),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(120),
        }
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Engine {
    registry: Arc<ServiceRegistry>,
    manager: ConnectionManager,
    settings: EngineSettings,
}

impl Engine {
    pub fn new(registry: Arc<ServiceRegistry>, manager: ConnectionManager, settings: EngineSettings) -> Self {
        Self { registry, manager, settings }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Authenticate `stream` and serve it until either side closes it,
    /// the peer goes idle or `shutdown` fires.
    ///
    /// The hello exchange is bounded by the handshake timeout and also gives
    /// way to `shutdown`.
    pub async fn run_connection<S>(
        &self,
        stream: S,
        role: Role,
        identity: &IdentityKeypair,
        params: HandshakeParams,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let mut stream = Box::pin(stream);
        let deadline = self.settings.handshake_timeout;
        let (cipher, peer) = tokio::select! {
            _ = shutdown.recv() => {
                tracing::debug!(?role, "shutdown during handshake");
                return Ok(());
            }
            r = tokio::time::timeout(deadline, exchange_hellos(&mut stream, role, identity, params)) => {
                r.map_err(|_| anyhow::anyhow!("handshake timed out after {deadline:?}"))?
                    .context("handshake failed")?
            }
        };
        let (reader, writer) = tokio::io::split(stream);
        let cipher = Arc::new(Mutex::new(cipher));
        let conn = self.manager.add(peer, cipher.clone(), writer).await?;

        let result = self.serve(&conn, &cipher, reader, &mut shutdown).await;

        self.manager.remove(conn.id());
        self.registry.disconnect(&conn);
        result
    }

    async fn serve<R>(
        &self,
        conn: &Arc<PeerConnection>,
        cipher: &SharedCipher,
        mut reader: R,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> anyhow::Result<()>
    where
        R: AsyncRead + Unpin,
    {
        self.activate(conn).await?;
        let mut reassembler = Reassembler::new();
        let mut packet = Vec::new();
        let idle_timeout = self.settings.idle_timeout;
        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);

        loop {
            let frame = tokio::select! {
                _ = &mut idle => {
                    tracing::warn!(peer = %conn.location_id(), ?idle_timeout, "peer idle, closing connection");
                    anyhow::bail!("peer sent nothing for {idle_timeout:?}");
                }
                _ = shutdown.recv() => {
                    tracing::info!(peer = %conn.location_id(), "connection shutting down");
                    return Ok(());
                }
                _ = conn.closed() => {
                    tracing::info!(peer = %conn.location_id(), "connection closed locally");
                    return Ok(());
                }
                frame = read_frame(&mut reader, MAX_RECORD_LEN) => frame?,
            };
            let Some(record) = frame else {
                tracing::info!(peer = %conn.location_id(), "peer closed the connection");
                return Ok(());
            };
            idle.as_mut().reset(Instant::now() + idle_timeout);

            packet.clear();
            let state = {
                let mut cipher = cipher.lock().await;
                if let Err(e) = cipher.open(&record, &mut packet) {
                    tracing::error!(peer = %conn.location_id(), error = %e, "record rejected, closing connection");
                    return Err(e.into());
                }
                cipher.state()
            };
            if state != CryptoState::EncryptedActive {
                anyhow::bail!("record opened in state {state:?}");
            }
            self.handle_packet(conn, &mut reassembler, &packet).await;
        }
    }

    /// First steps on a fresh connection: probe, probe deadline, service info.
    async fn activate(&self, conn: &Arc<PeerConnection>) -> anyhow::Result<()> {
        self.manager.write_probe(conn).await?;

        let weak = Arc::downgrade(conn);
        conn.scheduler().schedule("slice-probe-timeout", self.settings.probe_timeout, move || {
            async move {
                if let Some(conn) = weak.upgrade() {
                    if conn.resolve_slicing(SliceCapability::Unsupported) {
                        tracing::info!(peer = %conn.location_id(), "no slice probe from peer, slicing unsupported");
                    }
                }
                Ok(())
            }
            .boxed()
        });

        if self.registry.tier_of(service_type::SERVICE_INFO).is_some() {
            self.registry.start_service(&self.manager, conn, service_type::SERVICE_INFO)?;
        }
        Ok(())
    }

    async fn handle_packet(&self, conn: &Arc<PeerConnection>, reassembler: &mut Reassembler, packet: &[u8]) {
        let items = match reassembler.accept(packet) {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(peer = %conn.location_id(), error = %e, "dropping malformed packet");
                return;
            }
        };
        for bytes in items {
            self.handle_item(conn, &bytes).await;
        }
    }

    async fn handle_item(&self, conn: &Arc<PeerConnection>, bytes: &[u8]) {
        let is_probe = ItemHeader::parse(bytes)
            .map(|h| h.service_type() == service_type::SLICE_PROBE)
            .unwrap_or(false);
        if is_probe {
            self.handle_probe(conn, bytes);
            return;
        }
        match item::decode(bytes) {
            Ok(item) => self.registry.dispatch(&self.manager, conn, item).await,
            Err(e) if e.is_unknown_item() => {
                tracing::debug!(peer = %conn.location_id(), error = %e, "unknown item dropped");
            }
            Err(e) => {
                tracing::warn!(peer = %conn.location_id(), error = %e, "dropping undecodable item");
            }
        }
    }

    fn handle_probe(&self, conn: &PeerConnection, bytes: &[u8]) {
        let verdict = match item::decode(bytes) {
            Ok(Item::SliceProbe) => SliceCapability::Supported,
            _ => {
                tracing::debug!(peer = %conn.location_id(), "malformed slice probe");
                SliceCapability::Unsupported
            }
        };
        if conn.resolve_slicing(verdict) {
            tracing::info!(peer = %conn.location_id(), slicing = ?verdict, "slice probe resolved");
        }
    }
}
