//! Bandwidth control. Each side tells the other, once, how many bytes per
//! second it may send.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;

use peerweave_core::codec::pack_u32_saturating;
use peerweave_core::item::{service_type, ServiceInfo};
use peerweave_core::Item;

use crate::connection::{ConnectionId, PeerConnection};
use crate::service::{Service, ServiceContext};

pub const ANNOUNCE_DELAY: Duration = Duration::from_secs(10);

pub struct BandwidthService {
    /// Our own inbound capacity, in bytes per second.
    capacity: u64,
    allowed: Arc<DashMap<ConnectionId, u32>>,
}

impl BandwidthService {
    pub fn new(capacity: u64) -> Self {
        Self { capacity, allowed: Arc::new(DashMap::new()) }
    }

    /// The rate we offer each peer: three quarters of our capacity.
    pub fn offered_rate(&self) -> u32 {
        let offered = self.capacity.saturating_mul(3) / 4;
        pack_u32_saturating(i64::try_from(offered).unwrap_or(i64::MAX))
    }

    /// What the peer on `id` last allowed us to send.
    pub fn allowed(&self, id: &ConnectionId) -> Option<u32> {
        self.allowed.get(id).map(|r| *r)
    }
}

impl Service for BandwidthService {
    fn info(&self) -> ServiceInfo {
        ServiceInfo {
            name: "bandwidth_ctrl".into(),
            service_type: service_type::BANDWIDTH_CONTROL,
            version_major: 1,
            version_minor: 0,
            min_version_major: 1,
            min_version_minor: 0,
        }
    }

    fn initialize(&self, ctx: &ServiceContext, conn: &Arc<PeerConnection>) -> anyhow::Result<()> {
        let ctx = ctx.clone();
        let weak = Arc::downgrade(conn);
        let item = Item::BandwidthAllowed { bytes_per_sec: self.offered_rate() };
        conn.scheduler().schedule("bandwidth-announce", ANNOUNCE_DELAY, move || {
            async move {
                let Some(conn) = weak.upgrade() else { return Ok(()) };
                ctx.write(&conn, &item).await?;
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
                Item::BandwidthAllowed { bytes_per_sec } => {
                    self.allowed.insert(*conn.id(), bytes_per_sec);
                    tracing::debug!(peer = %conn.location_id(), bytes_per_sec, "bandwidth allowance received");
                    Ok(())
                }
                other => anyhow::bail!("unexpected item {}", other.name()),
            }
        }
        .boxed()
    }

    fn on_disconnect(&self, conn: &PeerConnection) {
        self.allowed.remove(conn.id());
    }
}
