//! Configuration system for Peerweave.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $PEERWEAVE_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/peerweave/config.toml
//!   3. ~/.config/peerweave/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::crypto::{AeadFormat, HandshakeParams, Profile};
use crate::identity::{LocationId, NetworkMode, Visibility};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerweaveConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub crypto: CryptoConfig,
    pub services: ServicesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Hex Ed25519 seed. Auto-generated on first run.
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen_addr: String,
    /// Peers dialled at startup.
    pub peers: Vec<PeerConfig>,
    /// Send large items as slices to peers that accept them.
    pub packet_slicing: bool,
    /// Coalesce small items into one slice. Requires `packet_slicing`.
    pub packet_grouping: bool,
    pub slice_probe_timeout_ms: u64,
    /// Hello exchange deadline, for both accepted and dialled streams.
    pub handshake_timeout_ms: u64,
    /// A peer that sends nothing for this long is dropped.
    pub peer_idle_timeout_ms: u64,
    /// Outbound items buffered per connection before writers wait.
    pub write_queue_depth: usize,
    pub discovery_visibility: Visibility,
    pub dht_visibility: Visibility,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub addr: String,
    /// 32 hex chars. Empty = accept whatever the key derives to.
    pub location_id: String,
    /// Ed25519 public key (hex). Empty = not pinned.
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    pub profile: Profile,
    /// Construction used for outbound records. Both are accepted inbound.
    pub aead: AeadFormat,
    pub dh_generator: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub heartbeat: bool,
    pub rtt: bool,
    pub bandwidth: bool,
    pub chat: bool,
    /// Upstream capacity. 75% of it is offered to each peer.
    pub bandwidth_bytes_per_sec: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            key_path: config_dir().join("identity.key"),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7812".to_string(),
            peers: Vec::new(),
            packet_slicing: false,
            packet_grouping: false,
            slice_probe_timeout_ms: 5000,
            handshake_timeout_ms: 10_000,
            peer_idle_timeout_ms: 120_000,
            write_queue_depth: 64,
            discovery_visibility: Visibility::Full,
            dht_visibility: Visibility::Full,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            profile: Profile::Modern,
            aead: AeadFormat::ChaCha20Poly1305,
            dh_generator: 2,
        }
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            heartbeat: true,
            rtt: true,
            bandwidth: true,
            chat: true,
            bandwidth_bytes_per_sec: 1_048_576, // 1 MiB/s
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

pub fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("peerweave")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("packet grouping requires packet slicing")]
    GroupingWithoutSlicing,
    #[error("unsupported DH generator {0} (expected 2 or 5)")]
    BadGenerator(u32),
    #[error("write_queue_depth must be greater than zero")]
    ZeroQueueDepth,
    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),
    #[error("peer {addr}: {reason}")]
    BadPeer { addr: String, reason: String },
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl PeerweaveConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            PeerweaveConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("PEERWEAVE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&PeerweaveConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text)
                .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Check cross-field invariants. Called once at startup; any error is fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.packet_grouping && !self.network.packet_slicing {
            return Err(ConfigError::GroupingWithoutSlicing);
        }
        if !matches!(self.crypto.dh_generator, 2 | 5) {
            return Err(ConfigError::BadGenerator(self.crypto.dh_generator));
        }
        if self.network.write_queue_depth == 0 {
            return Err(ConfigError::ZeroQueueDepth);
        }
        if self.network.handshake_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("handshake_timeout_ms"));
        }
        if self.network.peer_idle_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("peer_idle_timeout_ms"));
        }
        for peer in &self.network.peers {
            peer.validate()?;
        }
        Ok(())
    }

    pub fn network_mode(&self) -> NetworkMode {
        NetworkMode::from_visibility(self.network.discovery_visibility, self.network.dht_visibility)
    }

    /// Apply PEERWEAVE_* env var overrides.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        let flag = |v: String| v == "true" || v == "1";

        if let Some(v) = var("PEERWEAVE_IDENTITY__KEY_PATH") {
            self.identity.key_path = PathBuf::from(v);
        }
        if let Some(v) = var("PEERWEAVE_NETWORK__LISTEN_ADDR") {
            self.network.listen_addr = v;
        }
        if let Some(v) = var("PEERWEAVE_NETWORK__PACKET_SLICING") {
            self.network.packet_slicing = flag(v);
        }
        if let Some(v) = var("PEERWEAVE_NETWORK__PACKET_GROUPING") {
            self.network.packet_grouping = flag(v);
        }
        if let Some(v) = var("PEERWEAVE_NETWORK__SLICE_PROBE_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.network.slice_probe_timeout_ms = ms;
            }
        }
        if let Some(v) = var("PEERWEAVE_NETWORK__HANDSHAKE_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.network.handshake_timeout_ms = ms;
            }
        }
        if let Some(v) = var("PEERWEAVE_NETWORK__PEER_IDLE_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.network.peer_idle_timeout_ms = ms;
            }
        }
        if let Some(v) = var("PEERWEAVE_NETWORK__WRITE_QUEUE_DEPTH") {
            if let Ok(depth) = v.parse() {
                self.network.write_queue_depth = depth;
            }
        }
        if let Some(v) = var("PEERWEAVE_CRYPTO__PROFILE") {
            match v.as_str() {
                "classic" => self.crypto.profile = Profile::Classic,
                "modern" => self.crypto.profile = Profile::Modern,
                _ => tracing::warn!(value = %v, "ignoring unknown PEERWEAVE_CRYPTO__PROFILE"),
            }
        }
        if let Some(v) = var("PEERWEAVE_CRYPTO__DH_GENERATOR") {
            if let Ok(g) = v.parse() {
                self.crypto.dh_generator = g;
            }
        }
        if let Some(v) = var("PEERWEAVE_SERVICES__HEARTBEAT") {
            self.services.heartbeat = flag(v);
        }
        if let Some(v) = var("PEERWEAVE_SERVICES__RTT") {
            self.services.rtt = flag(v);
        }
        if let Some(v) = var("PEERWEAVE_SERVICES__BANDWIDTH") {
            self.services.bandwidth = flag(v);
        }
        if let Some(v) = var("PEERWEAVE_SERVICES__CHAT") {
            self.services.chat = flag(v);
        }
    }
}

impl CryptoConfig {
    pub fn handshake_params(&self, expected_peer: Option<[u8; 32]>) -> HandshakeParams {
        HandshakeParams {
            profile: self.profile,
            aead: self.aead,
            dh_generator: self.dh_generator,
            expected_peer,
        }
    }
}

impl PeerConfig {
    /// Pinned identity key, if one is configured.
    pub fn public_key_bytes(&self) -> Result<Option<[u8; 32]>, ConfigError> {
        if self.public_key.is_empty() {
            return Ok(None);
        }
        let bytes = hex::decode(&self.public_key).map_err(|_| self.bad("public_key is not hex"))?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| self.bad("public_key must be 32 bytes"))?;
        Ok(Some(key))
    }

    /// The peer's location id: the configured one, else the one its pinned
    /// key derives to.
    pub fn expected_location(&self) -> Result<Option<LocationId>, ConfigError> {
        if !self.location_id.is_empty() {
            let location = self.location_id.parse().map_err(|e| self.bad(&format!("location_id: {e}")))?;
            return Ok(Some(location));
        }
        Ok(self.public_key_bytes()?.map(|key| LocationId::from_public_key(&key)))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let location = self.expected_location()?;
        if let (Some(location), Some(key)) = (location, self.public_key_bytes()?) {
            if LocationId::from_public_key(&key) != location {
                return Err(self.bad("location_id does not match public_key"));
            }
        }
        Ok(())
    }

    fn bad(&self, reason: &str) -> ConfigError {
        ConfigError::BadPeer { addr: self.addr.clone(), reason: reason.to_string() }
    }
}
