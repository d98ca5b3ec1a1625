//! Send-token arbitration: distributed mutual exclusion with FIFO
//! service, lost-token regeneration and stale-release handling.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::harness::{TestNode, TestNodeBuilder};

#[tokio::test(flavor = "multi_thread")]
async fn test_token_mutual_exclusion() {
    let a = TestNode::spawn().await.unwrap();
    let b = TestNode::spawn().await.unwrap();
    let peer_b = a.connect_to(&b).await.unwrap();

    let holders = Arc::new(AtomicUsize::new(0));
    let grants = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for i in 0..5 {
        let node = a.node.clone();
        let peer = peer_b.clone();
        let holders = holders.clone();
        let grants = grants.clone();
        tasks.push(tokio::spawn(async move {
            let token = node.acquire_send_token(&peer).await.unwrap();
            grants.fetch_add(1, Ordering::SeqCst);

            // At any instant at most one task holds the token.
            let concurrent = holders.fetch_add(1, Ordering::SeqCst);
            assert_eq!(concurrent, 0, "task {i} found another holder");
            tokio::time::sleep(Duration::from_millis(1 + (i as u64 * 2) % 10)).await;
            holders.fetch_sub(1, Ordering::SeqCst);

            node.release_send_token(token).await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(grants.load(Ordering::SeqCst), 5);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_token_fifo_order() {
    let a = TestNode::spawn().await.unwrap();
    let b = TestNode::spawn().await.unwrap();
    let peer_b = a.connect_to(&b).await.unwrap();

    // Hold the token, then queue three more requests.
    let first = a.node.acquire_send_token(&peer_b).await.unwrap();

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut tasks = Vec::new();
    for i in 0..3 {
        let node = a.node.clone();
        let peer = peer_b.clone();
        let order = order.clone();
        tasks.push(tokio::spawn(async move {
            // Stagger the submissions so the queue order is deterministic.
            tokio::time::sleep(Duration::from_millis(50 * (i as u64 + 1))).await;
            let token = node.acquire_send_token(&peer).await.unwrap();
            order.lock().unwrap().push(i);
            node.release_send_token(token).await;
        }));
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    a.node.release_send_token(first).await;

    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_lost_token_regenerated_and_stale_release_ignored() {
    // Short global timeout so the lost-token path triggers quickly.
    let short = |g: &mut trellis_node::Globals| g.timeout_ms = 300;
    let a = TestNodeBuilder::new().globals(short).build().await.unwrap();
    let b = TestNodeBuilder::new().globals(short).build().await.unwrap();
    let c = TestNodeBuilder::new().globals(short).build().await.unwrap();
    let a_to_b = a.connect_to(&b).await.unwrap();
    let c_to_b = c.connect_to(&b).await.unwrap();

    // C acquires and never releases; the grant expires server-side.
    let lost = c.node.acquire_send_token(&c_to_b).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    // B declares the token lost and grants A a fresh one.
    let fresh = a.node.acquire_send_token(&a_to_b).await.unwrap();

    // C's late release is stale: A stays the holder, so another acquire
    // from C queues and times out.
    c.node.release_send_token(lost).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let err = c.node.acquire_send_token(&c_to_b).await.unwrap_err();
    assert!(matches!(err, trellis_node::NodeError::TokenTimeout));

    // The legitimate holder hands the token back; it lands on C's
    // abandoned queued request (the one-shot dropped the late reply), so
    // the zombie grant has to expire before the cycle is healthy again.
    a.node.release_send_token(fresh).await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    let again = a.node.acquire_send_token(&a_to_b).await.unwrap();
    a.node.release_send_token(again).await;

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
    c.shutdown().await.unwrap();
}
