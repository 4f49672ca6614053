//! Service registry: routes incoming items to services and staggers their
//! startup on each new connection.
//!
//! The registry is assembled once through [`RegistryBuilder`] and frozen
//! into an `Arc<ServiceRegistry>` before the first connection comes up.
//! Lookups after that take no locks.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use rand::Rng;
use thiserror::Error;

use peerweave_core::item::{service_type, ServiceInfo};
use peerweave_core::Item;

use crate::connection::PeerConnection;
use crate::manager::ConnectionManager;
use crate::service::{Service, ServiceContext, ServiceToken};

// ── Init priority ─────────────────────────────────────────────────────────────

/// Startup tier. Services start in ascending tier order, each at a random
/// point inside its tier's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InitPriority {
    Immediate,
    High,
    Normal,
    Low,
    /// Never started automatically.
    Off,
}

impl InitPriority {
    pub const ALL: [InitPriority; 5] = [
        InitPriority::Immediate,
        InitPriority::High,
        InitPriority::Normal,
        InitPriority::Low,
        InitPriority::Off,
    ];

    /// `[min, max]` startup window in seconds. Windows never overlap.
    pub fn window(self) -> (u64, u64) {
        match self {
            InitPriority::Off => (0, 0),
            InitPriority::Immediate => (1, 2),
            InitPriority::High => (3, 6),
            InitPriority::Normal => (7, 12),
            InitPriority::Low => (13, 20),
        }
    }

    /// A random delay inside the window.
    pub fn random_delay(self) -> Duration {
        let (min, max) = self.window();
        Duration::from_millis(rand::thread_rng().gen_range(min * 1000..=max * 1000))
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("service type {0:#06x} is already registered")]
    Duplicate(u16),
    #[error("service type {0:#06x} is reserved")]
    Reserved(u16),
}

// ── Builder ───────────────────────────────────────────────────────────────────

struct Entry {
    service: Arc<dyn Service>,
    tier: InitPriority,
    token: ServiceToken,
}

#[derive(Default)]
pub struct RegistryBuilder {
    entries: Vec<Entry>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service under the type it announces.
    pub fn register(&mut self, service: Arc<dyn Service>, tier: InitPriority) -> Result<ServiceToken, RegistryError> {
        let service_type = service.info().service_type;
        if service_type == service_type::SLICE_PROBE {
            return Err(RegistryError::Reserved(service_type));
        }
        if self.entries.iter().any(|e| e.token.service_type == service_type) {
            return Err(RegistryError::Duplicate(service_type));
        }
        let token = ServiceToken { service_type };
        self.entries.push(Entry { service, tier, token });
        Ok(token)
    }

    pub fn build(self) -> Arc<ServiceRegistry> {
        let by_type = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.token.service_type, i))
            .collect();
        Arc::new(ServiceRegistry { entries: self.entries, by_type })
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

pub struct ServiceRegistry {
    entries: Vec<Entry>,
    by_type: HashMap<u16, usize>,
}

impl ServiceRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    fn entry(&self, service_type: u16) -> Option<&Entry> {
        self.by_type.get(&service_type).map(|&i| &self.entries[i])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn tier_of(&self, service_type: u16) -> Option<InitPriority> {
        self.entry(service_type).map(|e| e.tier)
    }

    /// Announced description of every registered service, by type.
    pub fn service_infos(&self) -> Vec<ServiceInfo> {
        let mut infos: Vec<_> = self.entries.iter().map(|e| e.service.info()).collect();
        infos.sort_by_key(|i| i.service_type);
        infos
    }

    /// Context for the service owning `token`.
    pub fn context(self: &Arc<Self>, token: ServiceToken, manager: &ConnectionManager) -> ServiceContext {
        ServiceContext::new(token, self.clone(), manager.clone())
    }

    /// Route one inbound item to its service.
    ///
    /// Items with no registered service are dropped. A handler error or
    /// panic is logged and confined to this item.
    pub async fn dispatch(self: &Arc<Self>, manager: &ConnectionManager, conn: &Arc<PeerConnection>, item: Item) {
        let Some(entry) = self.entry(item.service_type()) else {
            tracing::debug!(
                peer = %conn.location_id(),
                service_type = item.service_type(),
                item = item.name(),
                "no service for item, dropped"
            );
            return;
        };
        let ctx = self.context(entry.token, manager);
        let name = item.name();
        let handled = async { entry.service.handle_item(&ctx, conn, item).await };
        match AssertUnwindSafe(handled).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(
                peer = %conn.location_id(),
                service_type = entry.token.service_type,
                item = name,
                error = %e,
                "service item handling failed"
            ),
            Err(_) => tracing::warn!(
                peer = %conn.location_id(),
                service_type = entry.token.service_type,
                item = name,
                "service item handler panicked"
            ),
        }
    }

    /// Start one service on `conn` right now, whatever its tier.
    pub fn start_service(
        self: &Arc<Self>,
        manager: &ConnectionManager,
        conn: &Arc<PeerConnection>,
        service_type: u16,
    ) -> anyhow::Result<()> {
        let entry = self
            .entry(service_type)
            .ok_or_else(|| anyhow::anyhow!("service type {service_type:#06x} is not registered"))?;
        let ctx = self.context(entry.token, manager);
        entry.service.initialize(&ctx, conn)?;
        tracing::debug!(peer = %conn.location_id(), service_type, tier = ?entry.tier, "service started");
        Ok(())
    }

    /// Schedule the staggered startup of every non-OFF service the peer also
    /// runs. Only the first call per connection has any effect.
    pub fn schedule_startup(self: &Arc<Self>, manager: &ConnectionManager, conn: &Arc<PeerConnection>) {
        if conn.mark_startup_scheduled() {
            return;
        }
        let mut order: Vec<&Entry> = self
            .entries
            .iter()
            .filter(|e| e.tier != InitPriority::Off)
            .filter(|e| conn.peer_supports(e.token.service_type))
            .collect();
        order.sort_by_key(|e| e.tier);

        for entry in order {
            let delay = entry.tier.random_delay();
            let registry = self.clone();
            let manager = manager.clone();
            let weak = Arc::downgrade(conn);
            let service_type = entry.token.service_type;
            tracing::debug!(
                peer = %conn.location_id(),
                service_type,
                delay_ms = delay.as_millis() as u64,
                "service start scheduled"
            );
            conn.scheduler().schedule("service-start", delay, move || {
                async move {
                    match weak.upgrade() {
                        Some(conn) => registry.start_service(&manager, &conn, service_type),
                        None => Ok(()),
                    }
                }
                .boxed()
            });
        }
    }

    /// Tell every service that `conn` is gone.
    pub fn disconnect(&self, conn: &PeerConnection) {
        for entry in &self.entries {
            entry.service.on_disconnect(conn);
        }
    }
}
