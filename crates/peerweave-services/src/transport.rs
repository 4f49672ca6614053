//! Length-prefixed framing over a byte stream, and the hello exchange that
//! turns a fresh stream into an authenticated session.
//!
//! Every frame is `length: u32 (big-endian) ‖ body`. Hellos travel as plain
//! frames; after the exchange every frame is a sealed transport record.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use peerweave_core::crypto::aead::SEAL_OVERHEAD;
use peerweave_core::crypto::{
    CryptoError, Handshake, HandshakeParams, IdentityKeypair, PeerIdentity, Role, SessionCipher,
};
use peerweave_core::wire::{MAX_ITEM_SIZE, SLICE_HEADER_SIZE};

/// Largest sealed record body accepted from a peer.
pub const MAX_RECORD_LEN: usize = MAX_ITEM_SIZE + SLICE_HEADER_SIZE + SEAL_OVERHEAD;

/// Largest hello accepted. A classic hello is 376 bytes.
pub const MAX_HELLO_LEN: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("peer closed the stream during the handshake")]
    Closed,
    #[error("stream ended inside a frame")]
    Truncated,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Read one frame body. `Ok(None)` means the stream ended cleanly on a
/// frame boundary; ending anywhere else is [`TransportError::Truncated`].
pub async fn read_frame<R>(reader: &mut R, max: usize) -> Result<Option<Vec<u8>>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len = [0u8; 4];
    let mut filled = 0;
    while filled < len.len() {
        match reader.read(&mut len[filled..]).await? {
            0 if filled == 0 => return Ok(None),
            0 => return Err(TransportError::Truncated),
            n => filled += n,
        }
    }
    let len = u32::from_be_bytes(len) as usize;
    if len > max {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    match reader.read_exact(&mut body).await {
        Ok(_) => Ok(Some(body)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(TransportError::Truncated),
        Err(e) => Err(e.into()),
    }
}

pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(body.len()).map_err(|_| TransportError::FrameTooLarge(body.len()))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// Send our hello, read the peer's and derive the session.
///
/// Both sides write before they read, so neither waits on the other.
pub async fn exchange_hellos<S>(
    stream: &mut S,
    role: Role,
    identity: &IdentityKeypair,
    params: HandshakeParams,
) -> Result<(SessionCipher, PeerIdentity), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (handshake, hello) = Handshake::start(role, identity, params)?;
    write_frame(stream, &hello).await?;
    let peer_hello = read_frame(stream, MAX_HELLO_LEN).await?.ok_or(TransportError::Closed)?;
    let (cipher, peer) = handshake.finish(&peer_hello)?;
    tracing::debug!(?role, peer = %peer.location_id, format = ?cipher.format(), "hello exchange complete");
    Ok((cipher, peer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerweave_core::crypto::{AeadFormat, CryptoState, Profile};

    fn params(profile: Profile) -> HandshakeParams {
        HandshakeParams { profile, aead: AeadFormat::ChaCha20Poly1305, dh_generator: 2, expected_peer: None }
    }

    #[tokio::test]
    async fn frames_roundtrip_and_eof_is_clean() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"abc").await.unwrap();
        write_frame(&mut a, b"").await.unwrap();
        drop(a);
        assert_eq!(read_frame(&mut b, 16).await.unwrap().unwrap(), b"abc");
        assert_eq!(read_frame(&mut b, 16).await.unwrap().unwrap(), b"");
        assert!(read_frame(&mut b, 16).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_inside_a_frame_is_truncation() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&[0x00, 0x00]).await.unwrap();
        drop(a);
        assert!(matches!(read_frame(&mut b, 16).await, Err(TransportError::Truncated)));

        let (mut a, mut b) = tokio::io::duplex(1024);
        a.write_all(&[0x00, 0x00, 0x00, 0x08, 0xAA]).await.unwrap();
        drop(a);
        assert!(matches!(read_frame(&mut b, 16).await, Err(TransportError::Truncated)));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, &[0u8; 32]).await.unwrap();
        assert!(matches!(read_frame(&mut b, 16).await, Err(TransportError::FrameTooLarge(32))));
    }

    #[tokio::test]
    async fn hello_exchange_over_duplex() {
        for profile in [Profile::Modern, Profile::Classic] {
            let (mut a, mut b) = tokio::io::duplex(4096);
            let ida = IdentityKeypair::generate();
            let idb = IdentityKeypair::generate();
            let (ra, rb) = tokio::join!(
                exchange_hellos(&mut a, Role::Initiator, &ida, params(profile)),
                exchange_hellos(&mut b, Role::Responder, &idb, params(profile)),
            );
            let (ca, peer_b) = ra.unwrap();
            let (cb, peer_a) = rb.unwrap();
            assert_eq!(ca.session_id(), cb.session_id());
            assert_eq!(ca.state(), CryptoState::KeyAgreed);
            assert_eq!(peer_b.identity_key, idb.public);
            assert_eq!(peer_a.identity_key, ida.public);
        }
    }

    #[tokio::test]
    async fn hello_exchange_fails_when_peer_hangs_up() {
        let (mut a, b) = tokio::io::duplex(4096);
        drop(b);
        let id = IdentityKeypair::generate();
        assert!(exchange_hellos(&mut a, Role::Initiator, &id, params(Profile::Modern)).await.is_err());
    }
}
