//! Service discovery between the two ends of a connection.
//!
//! Each side announces the services it runs once, a few seconds after the
//! connection comes up, or straight away in reply to the peer's list if that
//! arrives first. Receiving a list is what kicks off the staggered startup of
//! every other service the two sides have in common.

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use rand::Rng;

use peerweave_core::item::{service_type, ServiceInfo};
use peerweave_core::Item;

use crate::connection::PeerConnection;
use crate::service::{Service, ServiceContext};

/// Announce delay after the connection comes up, in milliseconds.
pub const ANNOUNCE_WINDOW_MS: RangeInclusive<u64> = 2_000..=9_000;

#[derive(Debug, Default)]
pub struct ServiceInfoService;

impl ServiceInfoService {
    pub fn new() -> Self {
        Self
    }

    /// Send our service list unless it already went out on `conn`.
    async fn announce(ctx: &ServiceContext, conn: &PeerConnection) -> anyhow::Result<()> {
        if conn.mark_services_sent() {
            return Ok(());
        }
        let services = ctx.registry().service_infos();
        tracing::debug!(peer = %conn.location_id(), count = services.len(), "announcing services");
        ctx.write(conn, &Item::ServiceList { services }).await?;
        Ok(())
    }
}

impl Service for ServiceInfoService {
    fn info(&self) -> ServiceInfo {
        ServiceInfo {
            name: "serviceinfo".into(),
            service_type: service_type::SERVICE_INFO,
            version_major: 1,
            version_minor: 0,
            min_version_major: 1,
            min_version_minor: 0,
        }
    }

    fn initialize(&self, ctx: &ServiceContext, conn: &Arc<PeerConnection>) -> anyhow::Result<()> {
        let delay = Duration::from_millis(rand::thread_rng().gen_range(ANNOUNCE_WINDOW_MS));
        let ctx = ctx.clone();
        let weak = Arc::downgrade(conn);
        conn.scheduler().schedule("service-announce", delay, move || {
            async move {
                let Some(conn) = weak.upgrade() else { return Ok(()) };
                Self::announce(&ctx, &conn).await
            }
            .boxed()
        });
        Ok(())
    }

    fn handle_item<'a>(
        &'a self,
        ctx: &'a ServiceContext,
        conn: &'a Arc<PeerConnection>,
        item: Item,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            let services = match item {
                Item::ServiceList { services } => services,
                other => anyhow::bail!("unexpected item {}", other.name()),
            };
            tracing::debug!(
                peer = %conn.location_id(),
                services = ?services.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
                "peer services received"
            );
            conn.set_peer_services(services.iter().map(|s| s.service_type));
            Self::announce(ctx, conn).await?;
            ctx.registry().schedule_startup(ctx.manager(), conn);
            Ok(())
        }
        .boxed()
    }
}
