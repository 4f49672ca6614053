//! peerweave-services: connection engine, service registry and the
//! built-in services.

pub mod connection;
pub mod engine;
pub mod manager;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod services;
pub mod transport;

#[cfg(test)]
mod testutil;

pub use connection::{ConnectionId, PeerConnection, SliceCapability};
pub use engine::{Engine, EngineSettings};
pub use manager::{ConnectionError, ConnectionManager, ManagerSettings, WriteError};
pub use registry::{InitPriority, RegistryBuilder, RegistryError, ServiceRegistry};
pub use service::{Service, ServiceContext, ServiceToken};
