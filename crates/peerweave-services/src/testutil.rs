//! In-process connection for unit tests: a live [`PeerConnection`] whose
//! writer feeds a duplex pipe, with the remote half of the session cipher
//! on hand to open what comes out.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::DuplexStream;
use tokio::sync::Mutex;

use peerweave_core::crypto::{
    AeadFormat, Handshake, HandshakeParams, IdentityKeypair, PeerIdentity, Profile, Role, SessionCipher,
};
use peerweave_core::item;
use peerweave_core::packet::Reassembler;
use peerweave_core::Item;

use crate::connection::PeerConnection;
use crate::manager::{ConnectionManager, ManagerSettings, SharedCipher};
use crate::transport::{read_frame, MAX_RECORD_LEN};

/// Run a modern handshake in memory. Returns the local cipher, the remote
/// cipher and the remote identity as the local side sees it.
pub(crate) fn cipher_pair() -> (SessionCipher, SessionCipher, PeerIdentity) {
    let local_id = IdentityKeypair::generate();
    let remote_id = IdentityKeypair::generate();
    let params = HandshakeParams {
        profile: Profile::Modern,
        aead: AeadFormat::ChaCha20Poly1305,
        dh_generator: 2,
        expected_peer: None,
    };
    let (initiator, hello_i) = Handshake::start(Role::Initiator, &local_id, params.clone()).unwrap();
    let (responder, hello_r) = Handshake::start(Role::Responder, &remote_id, params).unwrap();
    let (local, remote_peer) = initiator.finish(&hello_r).unwrap();
    let (remote, _) = responder.finish(&hello_i).unwrap();
    (local, remote, remote_peer)
}

pub(crate) struct Loopback {
    pub manager: ConnectionManager,
    pub conn: Arc<PeerConnection>,
    pub reassembler: Reassembler,
    local_cipher: SharedCipher,
    remote_cipher: SessionCipher,
    remote: DuplexStream,
    pending: VecDeque<Bytes>,
}

impl Loopback {
    pub async fn new() -> Self {
        Self::with_settings(ManagerSettings::default()).await
    }

    pub async fn with_settings(settings: ManagerSettings) -> Self {
        let (local, remote_cipher, peer) = cipher_pair();
        let local_cipher = Arc::new(Mutex::new(local));
        let (transport, remote) = tokio::io::duplex(256 * 1024);
        let manager = ConnectionManager::new(settings);
        let conn = manager.add(peer, local_cipher.clone(), transport).await.unwrap();
        Self {
            manager,
            conn,
            reassembler: Reassembler::new(),
            local_cipher,
            remote_cipher,
            remote,
            pending: VecDeque::new(),
        }
    }

    pub fn into_parts(self) -> (Arc<PeerConnection>, SharedCipher) {
        (self.conn, self.local_cipher)
    }

    /// Next packet the writer produced, opened.
    pub async fn next_packet(&mut self) -> Vec<u8> {
        let record = read_frame(&mut self.remote, MAX_RECORD_LEN)
            .await
            .unwrap()
            .expect("writer closed the stream");
        let mut packet = Vec::new();
        self.remote_cipher.open(&record, &mut packet).unwrap();
        packet
    }

    /// Next whole item the writer produced.
    pub async fn next_item(&mut self) -> Item {
        loop {
            if let Some(bytes) = self.pending.pop_front() {
                return item::decode(&bytes).unwrap();
            }
            let packet = self.next_packet().await;
            self.pending.extend(self.reassembler.accept(&packet).unwrap());
        }
    }
}
