//! Service trait for item-based services.
//!
//! Every Peerweave service owns one service type and the items under it.
//! This trait is the contract between the engine (which receives and sends
//! items) and the service logic (which interprets them).

use std::sync::Arc;

use anyhow::Result;
use futures::future::BoxFuture;

use peerweave_core::item::ServiceInfo;
use peerweave_core::Item;

use crate::connection::PeerConnection;
use crate::manager::{ConnectionManager, WriteError};
use crate::registry::ServiceRegistry;

/// Trait for services that handle incoming items and produce outgoing ones.
///
/// Services hold no registry or manager of their own; everything they need
/// to talk to the rest of the engine arrives in the [`ServiceContext`].
pub trait Service: Send + Sync + 'static {
    /// Announced name, type and version.
    fn info(&self) -> ServiceInfo;

    /// Called once per connection when the service starts on it. Periodic
    /// sends are attached to the connection's scheduler here.
    fn initialize(&self, _ctx: &ServiceContext, _conn: &Arc<PeerConnection>) -> Result<()> {
        Ok(())
    }

    /// Handle one decoded item of this service's type.
    fn handle_item<'a>(
        &'a self,
        ctx: &'a ServiceContext,
        conn: &'a Arc<PeerConnection>,
        item: Item,
    ) -> BoxFuture<'a, Result<()>>;

    /// Called when a connection goes away. Drop any per-connection state.
    fn on_disconnect(&self, _conn: &PeerConnection) {}
}

/// Write capability handed out by the registry at registration time.
///
/// A token only writes items of its own service type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceToken {
    pub(crate) service_type: u16,
}

impl ServiceToken {
    pub fn service_type(&self) -> u16 {
        self.service_type
    }
}

/// A service's view of the engine: its token plus the registry and manager.
#[derive(Clone)]
pub struct ServiceContext {
    token: ServiceToken,
    registry: Arc<ServiceRegistry>,
    manager: ConnectionManager,
}

impl ServiceContext {
    pub(crate) fn new(token: ServiceToken, registry: Arc<ServiceRegistry>, manager: ConnectionManager) -> Self {
        Self { token, registry, manager }
    }

    pub fn token(&self) -> ServiceToken {
        self.token
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Queue `item` on `conn`, waiting while its queue is full.
    pub async fn write(&self, conn: &PeerConnection, item: &Item) -> Result<(), WriteError> {
        self.manager.write_item(conn, item, self.token).await
    }

    /// Queue a copy of `item` on every live connection. Returns how many
    /// connections accepted it.
    pub async fn write_all(&self, item: &Item) -> usize {
        let mut sent = 0;
        for conn in self.manager.connections() {
            match self.write(&conn, item).await {
                Ok(()) => sent += 1,
                Err(e) => tracing::debug!(peer = %conn.location_id(), error = %e, "broadcast write skipped"),
            }
        }
        sent
    }
}
