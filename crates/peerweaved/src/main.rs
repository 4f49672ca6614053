//! peerweaved: Peerweave friend-to-friend overlay daemon.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use peerweave_core::{LocationId, PeerweaveConfig};
use peerweave_services::services::register_defaults;
use peerweave_services::{ConnectionManager, Engine, EngineSettings, ManagerSettings, ServiceRegistry};

mod dialer;
mod identity;
mod listener;

use dialer::{DialTarget, Dialer};
use listener::Listener;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = PeerweaveConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = PeerweaveConfig::load().context("failed to load config")?;
    config.validate().context("invalid configuration")?;

    // Identity
    let identity = Arc::new(
        identity::load_or_create(&config.identity.key_path).context("failed to load identity")?,
    );
    let location = LocationId::from_public_key(&identity.public);
    tracing::info!(
        location = %location,
        node_id = %location.node_id(),
        public_key = hex::encode(identity.public),
        network_mode = ?config.network_mode(),
        "peerweaved starting"
    );

    // Services
    let mut builder = ServiceRegistry::builder();
    let services = register_defaults(&mut builder, &config.services, location)
        .context("failed to register services")?;
    let registry = builder.build();
    tracing::info!(
        heartbeat = config.services.heartbeat,
        rtt = config.services.rtt,
        bandwidth = config.services.bandwidth,
        chat = config.services.chat,
        "services enabled"
    );

    let manager = ConnectionManager::new(ManagerSettings::from_config(&config.network));
    let engine = Engine::new(registry, manager.clone(), EngineSettings::from_config(&config.network));

    let targets = config
        .network
        .peers
        .iter()
        .map(DialTarget::from_config)
        .collect::<Result<Vec<_>, _>>()
        .context("invalid peer entry")?;

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let socket = TcpListener::bind(&config.network.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.network.listen_addr))?;
    tracing::info!(addr = %config.network.listen_addr, "listening");

    let listener_task = tokio::spawn(
        Listener::new(
            socket,
            engine.clone(),
            identity.clone(),
            config.crypto.handshake_params(None),
            shutdown_tx.subscribe(),
        )
        .run(),
    );

    let dialer_task = tokio::spawn(
        Dialer::new(
            targets,
            engine.clone(),
            identity.clone(),
            config.crypto.clone(),
            shutdown_tx.subscribe(),
        )
        .run(),
    );

    let connection_printer = {
        let manager = manager.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            loop {
                interval.tick().await;
                tracing::info!(count = manager.len(), "connection table snapshot");
                for conn in manager.connections() {
                    let rtt_ms = services
                        .rtt
                        .as_ref()
                        .and_then(|rtt| rtt.mean_rtt(conn.id()))
                        .map(|d| d.as_millis() as u64);
                    let allowed = services.bandwidth.as_ref().and_then(|bw| bw.allowed(conn.id()));
                    tracing::info!(
                        peer = %conn.location_id(),
                        slicing = ?conn.slice_capability(),
                        rtt_ms,
                        allowed_bytes_per_sec = allowed,
                        "  connection"
                    );
                }
            }
        })
    };

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()     => tracing::info!("shutting down"),
        r = listener_task          => tracing::error!("listener exited: {:?}", r),
        r = dialer_task            => tracing::error!("dialer exited: {:?}", r),
        r = connection_printer     => tracing::error!("connection printer exited: {:?}", r),
    }

    Ok(())
}
