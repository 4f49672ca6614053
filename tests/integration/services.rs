use crate::*;

use peerweave_core::item::service_type;

/// After the service-info exchange every default service starts on both
/// sides: heartbeats arrive, RTT samples accumulate, allowances land.
#[tokio::test(start_paused = true)]
async fn test_default_services_start_after_exchange() {
    let a = Node::new();
    let b = Node::new();
    let link = connect(&a, modern(), &b, modern());

    assert!(wait_until(Duration::from_secs(2), || a.connection_to(&b).is_some() && b.connection_to(&a).is_some()).await);
    let a_id = *a.connection_to(&b).unwrap().id();
    let b_id = *b.connection_to(&a).unwrap().id();

    let peers_listed = |n: &Node, peer: &Node| {
        n.connection_to(peer).is_some_and(|c| {
            [service_type::HEARTBEAT, service_type::RTT, service_type::BANDWIDTH_CONTROL, service_type::CHAT]
                .iter()
                .all(|&t| c.peer_supports(t))
        })
    };
    assert!(wait_until(Duration::from_secs(10), || peers_listed(&a, &b) && peers_listed(&b, &a)).await);

    let (a_hb, b_hb) = (a.services.heartbeat.as_ref().unwrap(), b.services.heartbeat.as_ref().unwrap());
    assert!(wait_until(Duration::from_secs(10), || a_hb.last_heartbeat(&a_id).is_some()
        && b_hb.last_heartbeat(&b_id).is_some())
    .await);

    let (a_bw, b_bw) = (a.services.bandwidth.as_ref().unwrap(), b.services.bandwidth.as_ref().unwrap());
    assert!(wait_until(Duration::from_secs(20), || a_bw.allowed(&a_id).is_some() && b_bw.allowed(&b_id).is_some()).await);
    assert_eq!(a_bw.allowed(&a_id), Some(b_bw.offered_rate()));

    let a_rtt = a.services.rtt.as_ref().unwrap();
    assert!(wait_until(Duration::from_secs(30), || a_rtt.sample_count(&a_id) > 0).await);
    assert!(a_rtt.mean_rtt(&a_id).is_some());

    let (ra, rb) = link.close().await;
    ra.unwrap();
    rb.unwrap();

    // Per-connection state goes with the connection.
    assert!(a_hb.last_heartbeat(&a_id).is_none());
    assert_eq!(a_bw.allowed(&a_id), None);
    assert_eq!(a_rtt.sample_count(&a_id), 0);
}

/// Two peers that saw the same recent message in a room find out they
/// share it.
#[tokio::test(start_paused = true)]
async fn test_chat_challenge_detects_shared_room() {
    const ROOM: u64 = 0x5eed_0f_c0ffee;
    const MESSAGE: u64 = 0x0123_4567_89ab_cdef;

    let a = Node::new();
    let b = Node::new();
    let c = Node::new();
    let ab = connect(&a, modern(), &b, modern());
    let ac = connect(&a, modern(), &c, modern());
    assert!(wait_until(Duration::from_secs(2), || a.engine.manager().len() == 2).await);

    let (a_chat, token) = a.services.chat.as_ref().unwrap();
    let (b_chat, _) = b.services.chat.as_ref().unwrap();
    let (c_chat, _) = c.services.chat.as_ref().unwrap();

    a_chat.join_room(ROOM);
    a_chat.record_message(ROOM, MESSAGE);
    b_chat.join_room(ROOM);
    b_chat.record_message(ROOM, MESSAGE);
    // c is in the room but never saw the message.
    c_chat.join_room(ROOM);
    c_chat.record_message(ROOM, MESSAGE ^ 1);

    let ctx = a.engine.registry().context(*token, a.engine.manager());
    assert_eq!(a_chat.send_connection_challenge(&ctx, ROOM).await.unwrap(), 2);

    assert!(wait_until(Duration::from_secs(2), || b_chat.shared_rooms(&a.location()) == vec![ROOM]).await);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(c_chat.shared_rooms(&a.location()).is_empty());

    let _ = ab.close().await;
    let _ = ac.close().await;
}
