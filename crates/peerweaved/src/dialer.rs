//! Outbound connections to configured peers.
//!
//! Each peer gets a task that dials, serves the connection as the initiator
//! until it ends, then waits and dials again. A peer that is already
//! connected (because it dialled us) is left alone.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::task::JoinSet;

use peerweave_core::config::{CryptoConfig, PeerConfig};
use peerweave_core::crypto::{HandshakeParams, IdentityKeypair, Role};
use peerweave_core::{ConfigError, LocationId};
use peerweave_services::Engine;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const RECONNECT_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct DialTarget {
    pub addr: String,
    pub expected_peer: Option<[u8; 32]>,
    pub expected_location: Option<LocationId>,
}

impl DialTarget {
    pub fn from_config(peer: &PeerConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            addr: peer.addr.clone(),
            expected_peer: peer.public_key_bytes()?,
            expected_location: peer.expected_location()?,
        })
    }
}

pub struct Dialer {
    targets: Vec<DialTarget>,
    engine: Engine,
    identity: Arc<IdentityKeypair>,
    crypto: CryptoConfig,
    shutdown: broadcast::Receiver<()>,
}

impl Dialer {
    pub fn new(
        targets: Vec<DialTarget>,
        engine: Engine,
        identity: Arc<IdentityKeypair>,
        crypto: CryptoConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self { targets, engine, identity, crypto, shutdown }
    }

    /// Keep every target connected until shutdown.
    pub async fn run(mut self) -> Result<()> {
        let mut tasks = JoinSet::new();
        for target in std::mem::take(&mut self.targets) {
            let params = self.crypto.handshake_params(target.expected_peer);
            let engine = self.engine.clone();
            let identity = self.identity.clone();
            let shutdown = self.shutdown.resubscribe();
            tasks.spawn(async move {
                maintain(target, engine, identity, params, shutdown).await;
            });
        }
        let _ = self.shutdown.recv().await;
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "dial task failed");
            }
        }
        tracing::info!("dialer shutting down");
        Ok(())
    }
}

async fn maintain(
    target: DialTarget,
    engine: Engine,
    identity: Arc<IdentityKeypair>,
    params: HandshakeParams,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        if !matches!(shutdown.try_recv(), Err(TryRecvError::Empty)) {
            return;
        }
        let connected = target
            .expected_location
            .is_some_and(|location| engine.manager().find_location(&location).is_some());
        if !connected {
            dial_once(&target, &engine, &identity, &params, shutdown.resubscribe()).await;
        }
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}

async fn dial_once(
    target: &DialTarget,
    engine: &Engine,
    identity: &IdentityKeypair,
    params: &HandshakeParams,
    mut shutdown: broadcast::Receiver<()>,
) {
    let connect = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&target.addr));
    let stream = tokio::select! {
        _ = shutdown.recv() => return,
        r = connect => match r {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::debug!(addr = %target.addr, error = %e, "dial failed");
                return;
            }
            Err(_) => {
                tracing::debug!(addr = %target.addr, "dial timed out");
                return;
            }
        },
    };
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(addr = %target.addr, error = %e, "set_nodelay failed");
    }
    tracing::debug!(addr = %target.addr, "outbound connection");
    match engine
        .run_connection(stream, Role::Initiator, identity, params.clone(), shutdown)
        .await
    {
        Ok(()) => tracing::info!(addr = %target.addr, "outbound connection closed"),
        Err(e) => tracing::warn!(addr = %target.addr, error = %e, "outbound connection failed"),
    }
}
