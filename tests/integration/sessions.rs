use crate::*;

use peerweave_services::SliceCapability;

/// Both sides come up with the same session id and see each other's location.
#[tokio::test(start_paused = true)]
async fn test_handshake_connects_both_sides() {
    let a = Node::new();
    let b = Node::new();
    let link = connect(&a, modern(), &b, modern());

    assert!(wait_until(Duration::from_secs(2), || a.connection_to(&b).is_some() && b.connection_to(&a).is_some()).await);
    let ab = a.connection_to(&b).unwrap();
    let ba = b.connection_to(&a).unwrap();
    assert_eq!(ab.id(), ba.id());
    assert_eq!(ab.peer().identity_key, b.identity.public);
    assert_eq!(ba.peer().identity_key, a.identity.public);

    let (ra, rb) = link.close().await;
    ra.unwrap();
    rb.unwrap();
    assert!(a.engine.manager().is_empty());
    assert!(b.engine.manager().is_empty());
}

/// The probes cross on connect, so each side learns the other can slice.
#[tokio::test(start_paused = true)]
async fn test_slice_probe_marks_peers_supported() {
    let settings = ManagerSettings { packet_slicing: true, packet_grouping: true, write_queue_depth: 16 };
    let a = Node::with_settings(settings);
    let b = Node::with_settings(settings);
    let link = connect(&a, modern(), &b, modern());

    let supported = |n: &Node, peer: &Node| {
        n.connection_to(peer).is_some_and(|c| c.slice_capability() == SliceCapability::Supported)
    };
    assert!(wait_until(Duration::from_secs(2), || supported(&a, &b) && supported(&b, &a)).await);

    // The probe deadline passing later does not undo the verdict.
    tokio::time::sleep(PROBE_TIMEOUT * 2).await;
    assert!(supported(&a, &b) && supported(&b, &a));

    // Services still talk over the sliced framing.
    let hb = a.services.heartbeat.as_ref().unwrap();
    let id = *a.connection_to(&b).unwrap().id();
    assert!(wait_until(Duration::from_secs(30), || hb.last_heartbeat(&id).is_some()).await);

    let _ = link.close().await;
}

/// Each side seals with its own AEAD construction and opens the other's.
#[tokio::test(start_paused = true)]
async fn test_mixed_aead_formats_interoperate() {
    let a = Node::new();
    let b = Node::new();
    let link = connect(
        &a,
        params(Profile::Modern, AeadFormat::ChaCha20Poly1305),
        &b,
        params(Profile::Modern, AeadFormat::ChaCha20HmacSha256),
    );

    let exchanged = |n: &Node, peer: &Node| {
        n.connection_to(peer)
            .is_some_and(|c| c.services_sent() && c.peer_supports(peerweave_core::item::service_type::HEARTBEAT))
    };
    assert!(wait_until(Duration::from_secs(15), || exchanged(&a, &b) && exchanged(&b, &a)).await);

    let _ = link.close().await;
}

/// The classic profile (finite-field DH) reaches the same steady state.
#[tokio::test(start_paused = true)]
async fn test_classic_profile_connects() {
    let a = Node::new();
    let b = Node::new();
    let classic = params(Profile::Classic, AeadFormat::ChaCha20Poly1305);
    let link = connect(&a, classic.clone(), &b, classic);

    assert!(wait_until(Duration::from_secs(15), || a
        .connection_to(&b)
        .is_some_and(|c| c.peer_supports(peerweave_core::item::service_type::RTT)))
    .await);

    let _ = link.close().await;
}

/// A pinned key that does not match the peer aborts the initiator.
#[tokio::test]
async fn test_pinned_key_mismatch_is_rejected() {
    let a = Node::new();
    let b = Node::new();
    let stranger = IdentityKeypair::generate();
    let pinned = HandshakeParams { expected_peer: Some(stranger.public), ..modern() };
    let link = connect(&a, pinned, &b, modern());

    let (ra, _) = link.close().await;
    assert!(ra.is_err());
    assert!(a.engine.manager().is_empty());
}

/// Peers on different profiles cannot agree on a session.
#[tokio::test]
async fn test_profile_mismatch_fails_both_sides() {
    let a = Node::new();
    let b = Node::new();
    let link = connect(
        &a,
        params(Profile::Classic, AeadFormat::ChaCha20Poly1305),
        &b,
        modern(),
    );

    let (ra, rb) = link.close().await;
    assert!(ra.is_err());
    assert!(rb.is_err());
    assert!(a.engine.manager().is_empty() && b.engine.manager().is_empty());
}
