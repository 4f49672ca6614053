//! Heartbeat: an empty item every few seconds in each direction.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;

use peerweave_core::item::{service_type, ServiceInfo};
use peerweave_core::Item;

use crate::connection::{ConnectionId, PeerConnection};
use crate::service::{Service, ServiceContext};

pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(5);

#[derive(Default)]
pub struct HeartbeatService {
    last_seen: Arc<DashMap<ConnectionId, Instant>>,
}

impl HeartbeatService {
    pub fn new() -> Self {
        Self::default()
    }

    /// When the last heartbeat arrived on this connection.
    pub fn last_heartbeat(&self, id: &ConnectionId) -> Option<Instant> {
        self.last_seen.get(id).map(|t| *t)
    }
}

impl Service for HeartbeatService {
    fn info(&self) -> ServiceInfo {
        ServiceInfo {
            name: "heartbeat".into(),
            service_type: service_type::HEARTBEAT,
            version_major: 1,
            version_minor: 0,
            min_version_major: 1,
            min_version_minor: 0,
        }
    }

    fn initialize(&self, ctx: &ServiceContext, conn: &Arc<PeerConnection>) -> anyhow::Result<()> {
        let ctx = ctx.clone();
        let weak = Arc::downgrade(conn);
        conn.scheduler()
            .schedule_at_fixed_rate("heartbeat", HEARTBEAT_PERIOD, HEARTBEAT_PERIOD, move || {
                let ctx = ctx.clone();
                let weak = weak.clone();
                async move {
                    let Some(conn) = weak.upgrade() else { return Ok(()) };
                    ctx.write(&conn, &Item::Heartbeat).await?;
                    Ok(())
                }
                .boxed()
            });
        Ok(())
    }

    fn handle_item<'a>(
        &'a self,
        _ctx: &'a ServiceContext,
        conn: &'a Arc<PeerConnection>,
        item: Item,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        async move {
            match item {
                Item::Heartbeat => {
                    self.last_seen.insert(*conn.id(), Instant::now());
                    tracing::trace!(peer = %conn.location_id(), "heartbeat");
                    Ok(())
                }
                other => anyhow::bail!("unexpected item {}", other.name()),
            }
        }
        .boxed()
    }

    fn on_disconnect(&self, conn: &PeerConnection) {
        self.last_seen.remove(conn.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{InitPriority, ServiceRegistry};
    use crate::testutil::Loopback;

    #[tokio::test(start_paused = true)]
    async fn sends_heartbeats_on_schedule_and_records_incoming() {
        let heartbeat = Arc::new(HeartbeatService::new());
        let mut builder = ServiceRegistry::builder();
        builder.register(heartbeat.clone(), InitPriority::Immediate).unwrap();
        let registry = builder.build();

        let mut lo = Loopback::new().await;
        registry.start_service(&lo.manager, &lo.conn, service_type::HEARTBEAT).unwrap();

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(lo.next_item().await, Item::Heartbeat);
        assert_eq!(lo.next_item().await, Item::Heartbeat);

        assert!(heartbeat.last_heartbeat(lo.conn.id()).is_none());
        registry.dispatch(&lo.manager, &lo.conn, Item::Heartbeat).await;
        assert!(heartbeat.last_heartbeat(lo.conn.id()).is_some());

        registry.disconnect(&lo.conn);
        assert!(heartbeat.last_heartbeat(lo.conn.id()).is_none());
    }
}
