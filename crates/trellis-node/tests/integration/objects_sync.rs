//! Distributed object scenarios: map then sync across versions, slave
//! deltas, disconnect mid-burst, deregister with mapped slaves, child
//! reconciliation, push and the instance cache.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use trellis_node::objects::{read_children, reconcile_children, write_children, ChildEntry};
use trellis_node::{
    NodeError, Object, ObjectId, ObjectRef, SharedObject, Version,
};
use trellis_protocol::packet::{encode_object_packet, ObjectData, ObjectOp};
use trellis_stream::{DataIStream, DataOStream, StreamError};

use crate::harness::{unique_group, wait_until, TestNode, TestNodeBuilder};

/// Simple replicated value used throughout these scenarios.
#[derive(Default)]
struct TestObject {
    value: i64,
    text: String,
}

impl Object for TestObject {
    fn serialize(&mut self, os: &mut DataOStream, _dirty: u64) {
        os.write(self.value);
        os.write_string(&self.text);
    }

    fn deserialize(&mut self, is: &mut DataIStream, _dirty: u64) -> Result<(), StreamError> {
        self.value = is.read()?;
        self.text = is.read_string()?;
        Ok(())
    }
}

fn shared(value: i64, text: &str) -> (Arc<Mutex<TestObject>>, SharedObject) {
    let typed = Arc::new(Mutex::new(TestObject { value, text: text.into() }));
    let dynamic: SharedObject = typed.clone();
    (typed, dynamic)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_map_then_sync_versions_in_order() {
    let a = TestNode::spawn().await.unwrap();
    let b = TestNode::spawn().await.unwrap();
    b.connect_to(&a).await.unwrap();

    let (master, master_dyn) = shared(0, "");
    let master_ref = a.node.register_object(master_dyn).await.unwrap();
    assert!(master_ref.is_master());
    assert_eq!(master_ref.version(), Version::NONE);

    // Commit versions 1, 2, 3.
    for (v, text) in [(10, "one"), (20, "two"), (30, "three")] {
        {
            let mut obj = master.lock().unwrap();
            obj.value = v;
            obj.text = text.into();
        }
        a.node.objects().commit(&master_ref).await.unwrap();
    }
    assert_eq!(master_ref.version(), Version(3));

    // Map at version 2: the slave lands exactly there, with version 3
    // queued but not applied.
    let (slave, slave_dyn) = shared(0, "");
    let slave_ref = b
        .node
        .map_object(slave_dyn, master_ref.id(), Version(2))
        .await
        .unwrap();
    assert!(!slave_ref.is_master());
    assert_eq!(slave_ref.version(), Version(2));
    {
        let obj = slave.lock().unwrap();
        assert_eq!(obj.value, 20);
        assert_eq!(obj.text, "two");
    }

    // sync(HEAD) applies the queued version 3.
    let head = b.node.objects().sync(&slave_ref, Version::HEAD).await.unwrap();
    assert_eq!(head, Version(3));
    {
        let obj = slave.lock().unwrap();
        assert_eq!(obj.value, 30);
        assert_eq!(obj.text, "three");
    }

    b.node.unmap_object(&slave_ref).await.unwrap();
    assert!(!slave_ref.is_attached());

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_map_old_version_unmappable() {
    // History shorter than the commit count: version 1 ages out.
    let a = TestNodeBuilder::new()
        .globals(|g| g.commit_history = 2)
        .build()
        .await
        .unwrap();
    let b = TestNode::spawn().await.unwrap();
    b.connect_to(&a).await.unwrap();

    let (master, master_dyn) = shared(0, "");
    let master_ref = a.node.register_object(master_dyn).await.unwrap();
    for v in 1..=4 {
        master.lock().unwrap().value = v;
        a.node.objects().commit(&master_ref).await.unwrap();
    }

    let (_slave, slave_dyn) = shared(0, "");
    let err = b
        .node
        .map_object(slave_dyn, master_ref.id(), Version(1))
        .await
        .unwrap_err();
    match err {
        NodeError::VersionUnmappable { requested, oldest, .. } => {
            assert_eq!(requested, Version(1));
            assert_eq!(oldest, Version(3));
        }
        other => panic!("expected VersionUnmappable, got {other}"),
    }

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_map_unknown_object_fails() {
    let a = TestNode::spawn().await.unwrap();
    let b = TestNode::spawn().await.unwrap();
    b.connect_to(&a).await.unwrap();

    let (_slave, slave_dyn) = shared(0, "");
    let err = b
        .node
        .map_object(slave_dyn, ObjectId::random(), Version::HEAD)
        .await
        .unwrap_err();
    assert!(matches!(err, NodeError::NotMapped(_)));

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_slave_delta_reaches_master() {
    let a = TestNode::spawn().await.unwrap();
    let b = TestNode::spawn().await.unwrap();
    b.connect_to(&a).await.unwrap();

    let (master, master_dyn) = shared(1, "initial");
    let master_ref = a.node.register_object(master_dyn).await.unwrap();

    let (slave, slave_dyn) = shared(0, "");
    let slave_ref = b
        .node
        .map_object(slave_dyn, master_ref.id(), Version::HEAD)
        .await
        .unwrap();
    assert_eq!(slave.lock().unwrap().value, 1);

    // Slave-side commit travels up; the master applies it on sync.
    {
        let mut obj = slave.lock().unwrap();
        obj.value = 99;
        obj.text = "from-slave".into();
    }
    b.node.objects().commit(&slave_ref).await.unwrap();
    a.node.objects().sync(&master_ref, Version::HEAD).await.unwrap();
    {
        let obj = master.lock().unwrap();
        assert_eq!(obj.value, 99);
        assert_eq!(obj.text, "from-slave");
    }

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disconnect_mid_burst_surfaces_short_read() {
    let a = TestNode::spawn().await.unwrap();
    let b = TestNode::spawn().await.unwrap();
    b.connect_to(&a).await.unwrap();

    let (_master, master_dyn) = shared(5, "hello");
    let master_ref = a.node.register_object(master_dyn).await.unwrap();

    let (_slave, slave_dyn) = shared(0, "");
    let slave_ref = b
        .node
        .map_object(slave_dyn, master_ref.id(), Version::HEAD)
        .await
        .unwrap();

    // A pending sync for a version that will never complete.
    let b_node = b.node.clone();
    let pending_ref = slave_ref.clone();
    let pending = tokio::spawn(async move {
        b_node.objects().sync(&pending_ref, Version(1)).await
    });

    // Hand-feed 3 chunks of an 8-chunk burst, then kill the transport.
    let peer_b = a.node.get_node(b.node.id()).unwrap();
    for seq in 0..3u32 {
        let mut body = Vec::new();
        body.extend_from_slice(&64u64.to_le_bytes());
        body.extend_from_slice(&[seq as u8; 64]);
        let pkt = encode_object_packet(ObjectOp::Delta, |buf| {
            ObjectData {
                object_id: master_ref.id(),
                version: Version(1),
                sequence: seq,
                last: false,
                compressor: 0,
                n_chunks: 0,
                data_size: 64,
                body: body.into(),
            }
            .encode(buf)
        });
        peer_b.send(pkt).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    a.shutdown().await.unwrap();

    // The in-flight stream is dropped and the sync fails with ShortRead.
    let result = pending.await.unwrap();
    match result {
        Err(NodeError::Stream(StreamError::ShortRead)) => {}
        other => panic!("expected ShortRead, got {other:?}"),
    }

    b.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_deregister_with_mapped_slaves_sends_removed() {
    let a = TestNode::spawn().await.unwrap();
    let b = TestNode::spawn().await.unwrap();
    b.connect_to(&a).await.unwrap();

    let (_master, master_dyn) = shared(3, "here");
    let master_ref = a.node.register_object(master_dyn).await.unwrap();

    let (_slave, slave_dyn) = shared(0, "");
    let slave_ref = b
        .node
        .map_object(slave_dyn, master_ref.id(), Version::HEAD)
        .await
        .unwrap();

    a.node.deregister_object(&master_ref).await.unwrap();
    assert!(!master_ref.is_attached());

    // The slave silently detaches on its next sync.
    b.node.objects().sync(&slave_ref, Version::HEAD).await.unwrap();
    assert!(!slave_ref.is_attached());

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

// ============================================================================
// Child reconciliation
// ============================================================================

/// Parent object carrying a reconciled child collection.
#[derive(Default)]
struct TestParent {
    children: Vec<Option<ObjectRef>>,
    wire: Vec<ChildEntry>,
}

impl Object for TestParent {
    fn serialize(&mut self, os: &mut DataOStream, _dirty: u64) {
        write_children(os, &self.children);
    }

    fn deserialize(&mut self, is: &mut DataIStream, _dirty: u64) -> Result<(), StreamError> {
        self.wire = read_children(is)?;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_child_reconciliation() {
    let a = TestNode::spawn().await.unwrap();
    let b = TestNode::spawn().await.unwrap();
    b.connect_to(&a).await.unwrap();

    // Master: parent with two children.
    let (child1, child1_dyn) = shared(11, "c1");
    let (_child2, child2_dyn) = shared(22, "c2");
    let child1_ref = a.node.register_object(child1_dyn).await.unwrap();
    let child2_ref = a.node.register_object(child2_dyn).await.unwrap();

    let parent = Arc::new(Mutex::new(TestParent {
        children: vec![Some(child1_ref.clone()), Some(child2_ref.clone())],
        wire: Vec::new(),
    }));
    let parent_dyn: SharedObject = parent.clone();
    let parent_ref = a.node.register_object(parent_dyn).await.unwrap();
    a.node.objects().commit(&parent_ref).await.unwrap();

    // Slave: map the parent, then rebuild the children from the wire.
    let parent_slave = Arc::new(Mutex::new(TestParent::default()));
    let parent_slave_dyn: SharedObject = parent_slave.clone();
    let parent_slave_ref = b
        .node
        .map_object(parent_slave_dyn, parent_ref.id(), Version::HEAD)
        .await
        .unwrap();

    let wire = parent_slave.lock().unwrap().wire.clone();
    assert_eq!(wire.len(), 2);

    let slaves: Arc<Mutex<Vec<Arc<Mutex<TestObject>>>>> = Arc::new(Mutex::new(Vec::new()));
    let factory_slaves = slaves.clone();
    let mut factory = move || {
        let (typed, dynamic) = shared(0, "");
        factory_slaves.lock().unwrap().push(typed);
        dynamic
    };
    let rebuilt = reconcile_children(&b.node, wire, Vec::new(), false, &mut factory)
        .await
        .unwrap();
    assert_eq!(rebuilt.len(), 2);
    assert!(rebuilt.iter().all(|c| c.is_some()));
    {
        let slaves = slaves.lock().unwrap();
        assert_eq!(slaves[0].lock().unwrap().value, 11);
        assert_eq!(slaves[1].lock().unwrap().value, 22);
    }
    // Wire order is preserved exactly.
    assert_eq!(rebuilt[0].as_ref().unwrap().id(), child1_ref.id());
    assert_eq!(rebuilt[1].as_ref().unwrap().id(), child2_ref.id());

    // Master drops the second child and commits a new value on the first.
    child1.lock().unwrap().value = 111;
    a.node.objects().commit(&child1_ref).await.unwrap();
    parent.lock().unwrap().children = vec![Some(child1_ref.clone())];
    a.node.objects().commit(&parent_ref).await.unwrap();

    b.node.objects().sync(&parent_slave_ref, Version::HEAD).await.unwrap();
    let wire = parent_slave.lock().unwrap().wire.clone();
    assert_eq!(wire.len(), 1);

    let mut noop_factory = || -> SharedObject { unreachable!("no new children expected") };
    let rebuilt2 = reconcile_children(&b.node, wire, rebuilt, false, &mut noop_factory)
        .await
        .unwrap();
    assert_eq!(rebuilt2.len(), 1);
    assert_eq!(rebuilt2[0].as_ref().unwrap().id(), child1_ref.id());
    // The surviving child caught up with the master's commit.
    assert_eq!(slaves.lock().unwrap()[0].lock().unwrap().value, 111);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

// ============================================================================
// Push and multicast
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_object_push_routed_to_handler() {
    let a = TestNode::spawn().await.unwrap();
    let b = TestNode::spawn().await.unwrap();
    b.connect_to(&a).await.unwrap();

    let received: Arc<Mutex<Option<(u128, ObjectId, i64, String)>>> =
        Arc::new(Mutex::new(None));
    let sink = received.clone();
    b.node.register_push_handler(
        7,
        Arc::new(move |group, _typ, id, istream| {
            let value: i64 = istream.read().unwrap();
            let text = istream.read_string().unwrap();
            *sink.lock().unwrap() = Some((group, id, value, text));
        }),
    );

    let (_obj, obj_dyn) = shared(64, "pushed");
    let obj_ref = a.node.register_object(obj_dyn).await.unwrap();
    let peer_b = a.node.get_node(b.node.id()).unwrap();
    a.node
        .objects()
        .push(&obj_ref, 7, 9, &[peer_b])
        .await
        .unwrap();

    let received_c = received.clone();
    assert!(
        wait_until(Duration::from_secs(3), move || {
            received_c.lock().unwrap().is_some()
        })
        .await
    );
    let got = received.lock().unwrap().take().unwrap();
    assert_eq!(got, (7, obj_ref.id(), 64, "pushed".to_string()));

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_multicast_group_discovery() {
    let group = unique_group("wall");
    let a = TestNodeBuilder::new().group(&group).build().await.unwrap();
    let b = TestNodeBuilder::new().group(&group).build().await.unwrap();

    b.connect_to(&a).await.unwrap();

    // Both ends pair the shared group during connect-ack handling.
    let (an, bn) = (a.node.clone(), b.node.clone());
    let (aid, bid) = (a.node.id(), b.node.id());
    assert!(
        wait_until(Duration::from_secs(3), move || {
            an.get_node(bid).and_then(|p| p.multicast()).is_some()
                && bn.get_node(aid).and_then(|p| p.multicast()).is_some()
        })
        .await
    );

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_send_on_register_announces_on_multicast() {
    let group = unique_group("prime");
    let a = TestNodeBuilder::new().group(&group).build().await.unwrap();
    let c = TestNodeBuilder::new().group(&group).build().await.unwrap();

    // c never dials a: it learns about it from the ID announcement that
    // precedes the primed instance burst on the group.
    a.node.objects().enable_send_on_register();
    let (_obj, obj_dyn) = shared(42, "primed");
    let obj_ref = a.node.register_object(obj_dyn).await.unwrap();

    let (cn, aid) = (c.node.clone(), a.node.id());
    assert!(
        wait_until(Duration::from_secs(3), move || cn.get_node(aid).is_some()).await
    );

    // The learned entry carries a's descriptions; dialling it works.
    let learned = c.node.get_node(a.node.id()).unwrap();
    assert!(!learned.is_connected());
    let peer_a = c.node.connect_peer(&learned).await.unwrap();
    assert!(peer_a.is_connected());

    // And the announced object is mappable now.
    let (slave, slave_dyn) = shared(0, "");
    c.node
        .map_object(slave_dyn, obj_ref.id(), Version::HEAD)
        .await
        .unwrap();
    assert_eq!(slave.lock().unwrap().value, 42);

    a.shutdown().await.unwrap();
    c.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_instance_cache_replay_on_remap() {
    let a = TestNode::spawn().await.unwrap();
    let b = TestNode::spawn().await.unwrap();
    b.connect_to(&a).await.unwrap();

    let (master, master_dyn) = shared(0, "");
    let master_ref = a.node.register_object(master_dyn).await.unwrap();
    master.lock().unwrap().value = 7;
    a.node.objects().commit(&master_ref).await.unwrap();

    let (_s1, s1_dyn) = shared(0, "");
    let first = b
        .node
        .map_object(s1_dyn, master_ref.id(), Version::HEAD)
        .await
        .unwrap();
    b.node.unmap_object(&first).await.unwrap();

    // Remap replays the cached instance; the slave still converges.
    let (s2, s2_dyn) = shared(0, "");
    let second = b
        .node
        .map_object(s2_dyn, master_ref.id(), Version::HEAD)
        .await
        .unwrap();
    assert_eq!(second.version(), Version(1));
    assert_eq!(s2.lock().unwrap().value, 7);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disabled_instance_cache_still_maps() {
    let a = TestNode::spawn().await.unwrap();
    let b = TestNode::spawn().await.unwrap();
    b.connect_to(&a).await.unwrap();
    b.node.disable_instance_cache();

    let (master, master_dyn) = shared(0, "");
    let master_ref = a.node.register_object(master_dyn).await.unwrap();
    master.lock().unwrap().value = 5;
    a.node.objects().commit(&master_ref).await.unwrap();

    let (slave, slave_dyn) = shared(0, "");
    b.node
        .map_object(slave_dyn, master_ref.id(), Version::HEAD)
        .await
        .unwrap();
    assert_eq!(slave.lock().unwrap().value, 5);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}
