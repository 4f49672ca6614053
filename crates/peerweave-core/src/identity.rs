//! Derived identifiers: location ids, DHT node ids and network mode.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use thiserror::Error;

pub const LOCATION_ID_LEN: usize = 16;
pub const NODE_ID_LEN: usize = 20;

// ── LocationId ────────────────────────────────────────────────────────────────

/// Identifies one node (one installation) of a peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocationId(pub [u8; LOCATION_ID_LEN]);

impl LocationId {
    /// The location id bound to an identity key: the first 16 bytes of its
    /// BLAKE3 hash.
    pub fn from_public_key(public: &[u8; 32]) -> Self {
        let digest = blake3::hash(public);
        let mut id = [0u8; LOCATION_ID_LEN];
        id.copy_from_slice(&digest.as_bytes()[..LOCATION_ID_LEN]);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; LOCATION_ID_LEN] {
        &self.0
    }

    /// DHT node id of this location.
    pub fn node_id(&self) -> NodeId {
        NodeId::from_location(self)
    }
}

impl fmt::Display for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for LocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocationId({self})")
    }
}

impl FromStr for LocationId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| IdentityError::BadHex(s.to_string()))?;
        let id: [u8; LOCATION_ID_LEN] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| IdentityError::BadLength { expected: LOCATION_ID_LEN, got: b.len() })?;
        Ok(Self(id))
    }
}

// ── NodeId ────────────────────────────────────────────────────────────────────

/// Position of a location in the DHT keyspace: SHA-1 of its location id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; NODE_ID_LEN]);

impl NodeId {
    pub fn from_location(location: &LocationId) -> Self {
        let mut id = [0u8; NODE_ID_LEN];
        id.copy_from_slice(&Sha1::digest(location.0));
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}

// ── Network mode ──────────────────────────────────────────────────────────────

/// Visibility level for one discovery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Off,
    Minimal,
    Full,
}

/// Reachability classification derived from the two visibility flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    Public,
    Private,
    Inverted,
    Darknet,
}

impl NetworkMode {
    pub fn from_flags(discovery_visible: bool, dht_visible: bool) -> Self {
        match (discovery_visible, dht_visible) {
            (true, true) => NetworkMode::Public,
            (true, false) => NetworkMode::Private,
            (false, true) => NetworkMode::Inverted,
            (false, false) => NetworkMode::Darknet,
        }
    }

    /// Only full visibility counts.
    pub fn from_visibility(discovery: Visibility, dht: Visibility) -> Self {
        Self::from_flags(discovery == Visibility::Full, dht == Visibility::Full)
    }

    pub fn is_discoverable(self) -> bool {
        matches!(self, NetworkMode::Public | NetworkMode::Private)
    }

    pub fn has_dht(self) -> bool {
        matches!(self, NetworkMode::Public | NetworkMode::Inverted)
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("invalid hex: {0}")]
    BadHex(String),
    #[error("invalid length: expected {expected} bytes, got {got}")]
    BadLength { expected: usize, got: usize },
}
