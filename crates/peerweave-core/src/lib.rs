//! peerweave-core: wire format, item codec, packet slicing, cryptographic
//! session layer and derived identifiers. All other Peerweave crates depend
//! on this one.

pub mod codec;
pub mod config;
pub mod crypto;
pub mod identity;
pub mod item;
pub mod packet;
pub mod wire;

pub use codec::CodecError;
pub use config::{ConfigError, PeerweaveConfig};
pub use identity::{LocationId, NetworkMode, NodeId};
pub use item::{Item, Priority};
