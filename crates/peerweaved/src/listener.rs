//! Inbound TCP listener. Every accepted stream is served as the responder
//! side of a connection on its own task.

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use peerweave_core::crypto::{HandshakeParams, IdentityKeypair, Role};
use peerweave_services::Engine;

pub struct Listener {
    socket: TcpListener,
    engine: Engine,
    identity: Arc<IdentityKeypair>,
    params: HandshakeParams,
    shutdown: broadcast::Receiver<()>,
}

impl Listener {
    pub fn new(
        socket: TcpListener,
        engine: Engine,
        identity: Arc<IdentityKeypair>,
        params: HandshakeParams,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self { socket, engine, identity, params, shutdown }
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.recv() => {
                    tracing::info!("listener shutting down");
                    return Ok(());
                }

                result = self.socket.accept() => {
                    let (stream, addr) = match result {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(%addr, error = %e, "set_nodelay failed");
                    }
                    tracing::debug!(%addr, "inbound connection");

                    let engine = self.engine.clone();
                    let identity = self.identity.clone();
                    let params = self.params.clone();
                    let shutdown = self.shutdown.resubscribe();
                    tokio::spawn(async move {
                        match engine.run_connection(stream, Role::Responder, &identity, params, shutdown).await {
                            Ok(()) => tracing::info!(%addr, "inbound connection closed"),
                            Err(e) => tracing::warn!(%addr, error = %e, "inbound connection failed"),
                        }
                    });
                }
            }
        }
    }
}
