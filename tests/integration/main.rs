//! Peerweave integration test harness.
//!
//! Each test runs two complete engines in-process, joined by an in-memory
//! duplex stream, and drives them through the handshake and the service
//! exchange. Timer-driven behaviour runs on tokio's paused clock, so the
//! tens of seconds of staggered startup pass instantly.
//!
//!   cargo test --test integration

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use peerweave_core::config::ServicesConfig;
use peerweave_core::crypto::{AeadFormat, HandshakeParams, IdentityKeypair, Profile, Role};
use peerweave_core::LocationId;
use peerweave_services::services::{register_defaults, DefaultServices};
use peerweave_services::{
    ConnectionManager, Engine, EngineSettings, ManagerSettings, PeerConnection, ServiceRegistry,
};

mod services;
mod sessions;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// One node: an engine with the default services and its own identity.
pub struct Node {
    pub engine: Engine,
    pub identity: Arc<IdentityKeypair>,
    pub services: DefaultServices,
}

impl Node {
    pub fn new() -> Self {
        Self::with_settings(ManagerSettings::default())
    }

    pub fn with_settings(settings: ManagerSettings) -> Self {
        let identity = Arc::new(IdentityKeypair::generate());
        let location = LocationId::from_public_key(&identity.public);
        let mut builder = ServiceRegistry::builder();
        let services = register_defaults(&mut builder, &ServicesConfig::default(), location)
            .expect("default services register");
        let engine = Engine::new(
            builder.build(),
            ConnectionManager::new(settings),
            EngineSettings { probe_timeout: PROBE_TIMEOUT, ..EngineSettings::default() },
        );
        Self { engine, identity, services }
    }

    pub fn location(&self) -> LocationId {
        LocationId::from_public_key(&self.identity.public)
    }

    /// This node's connection to `other`, if it is up.
    pub fn connection_to(&self, other: &Node) -> Option<Arc<PeerConnection>> {
        self.engine.manager().find_location(&other.location())
    }
}

pub fn params(profile: Profile, aead: AeadFormat) -> HandshakeParams {
    HandshakeParams { profile, aead, dh_generator: 2, expected_peer: None }
}

pub fn modern() -> HandshakeParams {
    params(Profile::Modern, AeadFormat::ChaCha20Poly1305)
}

/// A running connection between two nodes.
pub struct Link {
    pub shutdown: broadcast::Sender<()>,
    pub initiator: JoinHandle<Result<()>>,
    pub responder: JoinHandle<Result<()>>,
}

impl Link {
    /// Stop both ends and collect their results.
    pub async fn close(self) -> (Result<()>, Result<()>) {
        let _ = self.shutdown.send(());
        let a = self.initiator.await.expect("initiator task panicked");
        let b = self.responder.await.expect("responder task panicked");
        (a, b)
    }
}

fn spawn_side(
    node: &Node,
    stream: tokio::io::DuplexStream,
    role: Role,
    params: HandshakeParams,
    shutdown: broadcast::Receiver<()>,
) -> JoinHandle<Result<()>> {
    let engine = node.engine.clone();
    let identity = node.identity.clone();
    tokio::spawn(async move { engine.run_connection(stream, role, &identity, params, shutdown).await })
}

/// Connect `a` (initiator) to `b` (responder).
pub fn connect(a: &Node, a_params: HandshakeParams, b: &Node, b_params: HandshakeParams) -> Link {
    let (sa, sb) = tokio::io::duplex(1 << 20);
    let (shutdown, _) = broadcast::channel(1);
    let initiator = spawn_side(a, sa, Role::Initiator, a_params, shutdown.subscribe());
    let responder = spawn_side(b, sb, Role::Responder, b_params, shutdown.subscribe());
    Link { shutdown, initiator, responder }
}

/// Poll `check` every 100 ms until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
