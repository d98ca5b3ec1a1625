//! In-process test harness: spawn real nodes in the same tokio runtime,
//! wire them up over loopback TCP (plus in-process multicast groups),
//! and poll for convergence.

use std::time::Duration;

use trellis_node::{ConnectionDesc, Globals, LocalNode, Peer};

/// A running in-process node.
pub struct TestNode {
    pub node: LocalNode,
}

#[allow(dead_code)]
impl TestNode {
    pub async fn spawn() -> anyhow::Result<TestNode> {
        TestNodeBuilder::new().build().await
    }

    /// First advertised point-to-point description.
    pub fn desc(&self) -> ConnectionDesc {
        self.node
            .connection_descriptions()
            .into_iter()
            .find(|d| !d.is_multicast())
            .expect("node has a tcp listener")
    }

    /// Dial and handshake another test node; returns the registry peer.
    pub async fn connect_to(&self, other: &TestNode) -> anyhow::Result<Peer> {
        let target = Peer::unknown();
        target.set_descs(vec![other.desc()]);
        Ok(self.node.connect_peer(&target).await?)
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.node.close().await?;
        Ok(())
    }
}

/// Builder configuring globals, listeners and multicast groups.
pub struct TestNodeBuilder {
    globals: Globals,
    groups: Vec<String>,
}

#[allow(dead_code)]
impl TestNodeBuilder {
    pub fn new() -> Self {
        let mut globals = Globals::default();
        // Tests fail fast rather than hanging for the production 10s.
        globals.timeout_ms = 3_000;
        Self { globals, groups: Vec::new() }
    }

    pub fn globals(mut self, f: impl FnOnce(&mut Globals)) -> Self {
        f(&mut self.globals);
        self
    }

    pub fn group(mut self, name: &str) -> Self {
        self.groups.push(name.to_string());
        self
    }

    pub async fn build(self) -> anyhow::Result<TestNode> {
        let node = LocalNode::new(self.globals);
        node.add_connection_description(ConnectionDesc::tcp("127.0.0.1", 0));
        for group in &self.groups {
            node.add_connection_description(ConnectionDesc::multicast(group.clone()));
        }
        node.listen().await?;
        Ok(TestNode { node })
    }
}

/// Poll `check` until it returns true or the timeout expires.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Unique multicast group name per test; the in-process bus is global.
#[allow(dead_code)]
pub fn unique_group(prefix: &str) -> String {
    format!("{prefix}-{:08x}", rand::random::<u32>())
}
