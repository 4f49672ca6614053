//! Round-trip time probe.
//!
//! Timestamps on the wire are `seconds << 32 | microseconds` since the Unix
//! epoch. Each pong yields one sample of round-trip time and of the peer's
//! clock offset; the service keeps the last [`RTT_SAMPLES`] per connection.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;

use peerweave_core::item::{service_type, ServiceInfo};
use peerweave_core::Item;

use crate::connection::{ConnectionId, PeerConnection};
use crate::service::{Service, ServiceContext};

pub const RTT_PERIOD: Duration = Duration::from_secs(10);
pub const RTT_SAMPLES: usize = 10;

#[derive(Debug, Default)]
struct RttState {
    next_seq: u32,
    /// `(rtt, offset)` in seconds, oldest first.
    samples: VecDeque<(f64, f64)>,
}

#[derive(Default)]
pub struct RttService {
    peers: Arc<DashMap<ConnectionId, RttState>>,
}

impl RttService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mean round-trip time over the retained samples.
    pub fn mean_rtt(&self, id: &ConnectionId) -> Option<Duration> {
        let state = self.peers.get(id)?;
        mean(state.samples.iter().map(|s| s.0)).map(Duration::from_secs_f64)
    }

    /// Mean peer clock offset in seconds. Positive means the peer is ahead.
    pub fn mean_offset(&self, id: &ConnectionId) -> Option<f64> {
        let state = self.peers.get(id)?;
        mean(state.samples.iter().map(|s| s.1))
    }

    pub fn sample_count(&self, id: &ConnectionId) -> usize {
        self.peers.get(id).map(|s| s.samples.len()).unwrap_or(0)
    }

    fn record(&self, id: &ConnectionId, ping_ts: u64, pong_ts: u64, now: u64) -> anyhow::Result<()> {
        let rtt = timestamp_secs(now) - timestamp_secs(ping_ts);
        if rtt < 0.0 {
            anyhow::bail!("pong timestamp is in the future");
        }
        let offset = timestamp_secs(pong_ts) - (timestamp_secs(ping_ts) + rtt / 2.0);
        let mut state = self.peers.entry(*id).or_default();
        state.samples.push_back((rtt, offset));
        while state.samples.len() > RTT_SAMPLES {
            state.samples.pop_front();
        }
        Ok(())
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

/// Wire timestamp for `t`.
pub fn encode_timestamp(t: SystemTime) -> u64 {
    let since = t.duration_since(UNIX_EPOCH).unwrap_or_default();
    (since.as_secs() << 32) | u64::from(since.subsec_micros())
}

pub fn timestamp_secs(ts: u64) -> f64 {
    (ts >> 32) as f64 + (ts & 0xffff_ffff) as f64 / 1_000_000.0
}

fn now_timestamp() -> u64 {
    encode_timestamp(SystemTime::now())
}

impl Service for RttService {
    fn info(&self) -> ServiceInfo {
        ServiceInfo {
            name: "rtt".into(),
            service_type: service_type::RTT,
            version_major: 1,
            version_minor: 0,
            min_version_major: 1,
            min_version_minor: 0,
        }
    }

    fn initialize(&self, ctx: &ServiceContext, conn: &Arc<PeerConnection>) -> anyhow::Result<()> {
        self.peers.entry(*conn.id()).or_default();
        let peers = self.peers.clone();
        let ctx = ctx.clone();
        let weak = Arc::downgrade(conn);
        conn.scheduler().schedule_at_fixed_rate("rtt-ping", RTT_PERIOD, RTT_PERIOD, move || {
            let peers = peers.clone();
            let ctx = ctx.clone();
            let weak = weak.clone();
            async move {
                let Some(conn) = weak.upgrade() else { return Ok(()) };
                let seq = {
                    let mut state = peers.entry(*conn.id()).or_default();
                    let seq = state.next_seq;
                    state.next_seq = state.next_seq.wrapping_add(1);
                    seq
                };
                ctx.write(&conn, &Item::RttPing { seq, ping_ts: now_timestamp() }).await?;
                Ok(())
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
            match item {
                Item::RttPing { seq, ping_ts } => {
                    let pong = Item::RttPong { seq, ping_ts, pong_ts: now_timestamp() };
                    ctx.write(conn, &pong).await?;
                }
                Item::RttPong { seq, ping_ts, pong_ts } => {
                    self.record(conn.id(), ping_ts, pong_ts, now_timestamp())?;
                    tracing::trace!(peer = %conn.location_id(), seq, "rtt sample");
                }
                other => anyhow::bail!("unexpected item {}", other.name()),
            }
            Ok(())
        }
        .boxed()
    }

    fn on_disconnect(&self, conn: &PeerConnection) {
        self.peers.remove(conn.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{InitPriority, ServiceRegistry};
    use crate::testutil::Loopback;

    fn ts(secs: u64, micros: u64) -> u64 {
        (secs << 32) | micros
    }

    #[test]
    fn timestamp_encoding() {
        let t = UNIX_EPOCH + Duration::new(1_700_000_000, 250_000_000);
        assert_eq!(encode_timestamp(t), ts(1_700_000_000, 250_000));
        assert_eq!(timestamp_secs(ts(10, 500_000)), 10.5);
    }

    #[test]
    fn samples_give_rtt_and_offset() {
        let rtt = RttService::new();
        let id = [1u8; 32];
        // Ping at 100.0, peer stamps 101.1, pong back at 100.2: rtt 0.2, offset 1.0.
        rtt.record(&id, ts(100, 0), ts(101, 100_000), ts(100, 200_000)).unwrap();
        let mean_rtt = rtt.mean_rtt(&id).unwrap().as_secs_f64();
        assert!((mean_rtt - 0.2).abs() < 1e-6);
        assert!((rtt.mean_offset(&id).unwrap() - 1.0).abs() < 1e-6);

        assert!(rtt.record(&id, ts(200, 0), ts(200, 0), ts(199, 0)).is_err());
    }

    #[test]
    fn only_the_last_ten_samples_are_kept() {
        let rtt = RttService::new();
        let id = [1u8; 32];
        for i in 0..15u64 {
            rtt.record(&id, ts(100, 0), ts(100, 0), ts(100, i * 1_000)).unwrap();
        }
        assert_eq!(rtt.sample_count(&id), RTT_SAMPLES);
        // Samples 5..15 ms remain, mean 9.5 ms.
        let mean_rtt = rtt.mean_rtt(&id).unwrap().as_secs_f64();
        assert!((mean_rtt - 0.0095).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn pings_are_numbered_and_answered() {
        let rtt = Arc::new(RttService::new());
        let mut builder = ServiceRegistry::builder();
        builder.register(rtt.clone(), InitPriority::Normal).unwrap();
        let registry = builder.build();

        let mut lo = Loopback::new().await;
        registry.start_service(&lo.manager, &lo.conn, service_type::RTT).unwrap();
        tokio::time::sleep(Duration::from_millis(20_500)).await;
        assert!(matches!(lo.next_item().await, Item::RttPing { seq: 0, .. }));
        assert!(matches!(lo.next_item().await, Item::RttPing { seq: 1, .. }));

        registry.dispatch(&lo.manager, &lo.conn, Item::RttPing { seq: 7, ping_ts: 42 }).await;
        match lo.next_item().await {
            Item::RttPong { seq: 7, ping_ts: 42, pong_ts } => assert!(pong_ts > 42),
            other => panic!("expected pong, got {other:?}"),
        }
    }
}
