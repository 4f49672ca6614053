//! Identity key file: a hex-encoded Ed25519 seed, created on first run.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use zeroize::Zeroizing;

use peerweave_core::crypto::IdentityKeypair;

pub fn load_or_create(path: &Path) -> Result<IdentityKeypair> {
    if path.exists() {
        let text = Zeroizing::new(
            std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?,
        );
        let bytes = Zeroizing::new(
            hex::decode(text.trim()).with_context(|| format!("{} is not hex", path.display()))?,
        );
        let seed: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .with_context(|| format!("{} must hold a 32-byte seed", path.display()))?;
        return Ok(IdentityKeypair::from_seed(seed));
    }

    let keypair = IdentityKeypair::generate();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let text = Zeroizing::new(hex::encode(*keypair.seed_bytes()));
    let mut file = create_private(path).with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(text.as_bytes())
        .and_then(|()| file.sync_all())
        .with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!(path = %path.display(), "generated new identity");
    Ok(keypair)
}

/// Create a fresh file readable by the owner only from the first byte.
#[cfg(unix)]
fn create_private(path: &Path) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new().write(true).create_new(true).mode(0o600).open(path)
}

#[cfg(not(unix))]
fn create_private(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().write(true).create_new(true).open(path)
}
