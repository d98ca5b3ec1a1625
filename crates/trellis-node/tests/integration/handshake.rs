//! Connect protocol scenarios: plain handshake, simultaneous connect,
//! lookup by node id, graceful disconnect, keepalive.

use std::time::Duration;

use trellis_node::Peer;

use crate::harness::{wait_until, TestNode};

#[tokio::test(flavor = "multi_thread")]
async fn test_basic_handshake() {
    let a = TestNode::spawn().await.unwrap();
    let b = TestNode::spawn().await.unwrap();

    let peer_b = a.connect_to(&b).await.unwrap();
    assert_eq!(peer_b.id(), b.node.id());
    assert!(peer_b.is_connected());

    // Both registries converge to one entry for the other side.
    let b_node = b.node.clone();
    let a_id = a.node.id();
    assert!(
        wait_until(Duration::from_secs(3), || {
            b_node.get_node(a_id).map(|p| p.is_connected()).unwrap_or(false)
        })
        .await
    );
    assert_eq!(a.node.nodes().len(), 1);
    assert_eq!(b.node.nodes().len(), 1);

    // Descriptions travelled with the handshake.
    let learned = b.node.get_node(a_id).unwrap().descs();
    assert_eq!(learned, a.node.connection_descriptions());

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_simultaneous_connect_converges() {
    let n1 = TestNode::spawn().await.unwrap();
    let n2 = TestNode::spawn().await.unwrap();

    let target2 = Peer::unknown();
    target2.set_descs(vec![n2.desc()]);
    let target1 = Peer::unknown();
    target1.set_descs(vec![n1.desc()]);

    let (r1, r2) = tokio::join!(
        n1.node.connect_peer(&target2),
        n2.node.connect_peer(&target1)
    );
    let p2 = r1.unwrap();
    let p1 = r2.unwrap();
    assert!(p2.is_connected());
    assert!(p1.is_connected());
    assert_eq!(p2.id(), n2.node.id());
    assert_eq!(p1.id(), n1.node.id());

    // Exactly one Node entry per side survives the collision.
    let (n1c, n2c) = (n1.node.clone(), n2.node.clone());
    assert!(
        wait_until(Duration::from_secs(3), || {
            n1c.nodes().len() == 1 && n2c.nodes().len() == 1
        })
        .await
    );

    // The surviving connections carry traffic both ways.
    n1.node.ping(&p2).await.unwrap();
    n2.node.ping(&p1).await.unwrap();

    n1.shutdown().await.unwrap();
    n2.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connect_by_node_id() {
    // a -- b -- c: a learns c's descriptions through b.
    let a = TestNode::spawn().await.unwrap();
    let b = TestNode::spawn().await.unwrap();
    let c = TestNode::spawn().await.unwrap();

    a.connect_to(&b).await.unwrap();
    c.connect_to(&b).await.unwrap();

    // Wait until b has registered c.
    let b_node = b.node.clone();
    let c_id = c.node.id();
    assert!(
        wait_until(Duration::from_secs(3), || b_node.get_node(c_id).is_some()).await
    );

    let peer_c = a.node.connect_id(c_id).await.unwrap();
    assert_eq!(peer_c.id(), c_id);
    assert!(peer_c.is_connected());

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
    c.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connect_by_unknown_id_fails() {
    let a = TestNode::spawn().await.unwrap();
    let b = TestNode::spawn().await.unwrap();
    a.connect_to(&b).await.unwrap();

    let bogus = trellis_node::NodeId::random();
    assert!(a.node.connect_id(bogus).await.is_err());

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_graceful_disconnect() {
    let a = TestNode::spawn().await.unwrap();
    let b = TestNode::spawn().await.unwrap();

    let peer_b = a.connect_to(&b).await.unwrap();
    a.node.disconnect(&peer_b).await.unwrap();

    assert!(!peer_b.is_connected());
    assert!(a.node.get_node(b.node.id()).is_none());

    // The other side notices the close as well.
    let b_node = b.node.clone();
    let a_id = a.node.id();
    assert!(
        wait_until(Duration::from_secs(3), || b_node.get_node(a_id).is_none()).await
    );

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ping_refreshes_last_receive() {
    let a = TestNode::spawn().await.unwrap();
    let b = TestNode::spawn().await.unwrap();

    let peer_b = a.connect_to(&b).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let before = peer_b.last_receive();

    a.node.ping(&peer_b).await.unwrap();

    // The PING_REPLY arrival bumps the peer's last-receive stamp.
    let peer = peer_b.clone();
    assert!(
        wait_until(Duration::from_secs(3), || peer.last_receive() > before).await
    );

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ping_idle_nodes_only_pings_silent_peers() {
    let a = TestNode::spawn().await.unwrap();
    let b = TestNode::spawn().await.unwrap();
    a.connect_to(&b).await.unwrap();

    // Fresh connection: nothing is idle yet.
    assert!(!a.node.ping_idle_nodes().await);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dynamic_listener_add_remove() {
    let a = TestNode::spawn().await.unwrap();
    let b = TestNode::spawn().await.unwrap();
    let peer_b = a.connect_to(&b).await.unwrap();
    let _ = peer_b;

    let extra = a
        .node
        .add_listener("tcpip:127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    assert_ne!(extra.port, 0);
    assert!(a.node.connection_descriptions().contains(&extra));

    // The peer learns the new description.
    let b_node = b.node.clone();
    let a_id = a.node.id();
    let extra_c = extra.clone();
    assert!(
        wait_until(Duration::from_secs(3), move || {
            b_node
                .get_node(a_id)
                .map(|p| p.descs().contains(&extra_c))
                .unwrap_or(false)
        })
        .await
    );

    // And forgets it again on removal.
    a.node.remove_listeners(&[extra.clone()]).await.unwrap();
    assert!(!a.node.connection_descriptions().contains(&extra));
    let b_node = b.node.clone();
    let extra_c = extra.clone();
    assert!(
        wait_until(Duration::from_secs(3), move || {
            b_node
                .get_node(a_id)
                .map(|p| !p.descs().contains(&extra_c))
                .unwrap_or(false)
        })
        .await
    );

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}
