//! Request handler -- integer-keyed one-shot rendezvous between a waiter
//! and an async reply. Used by the handshake, send-token arbitration,
//! disconnects, commits and maps. Late replies to an abandoned request are
//! dropped silently by the one-shot semantics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

use trellis_protocol::Version;

use crate::error::NodeError;
use crate::node::Peer;

/// Reply payload delivered through the rendezvous.
#[derive(Debug, Clone)]
pub enum Reply {
    Unit,
    Flag(bool),
    Version(Version),
    MaybePeer(Option<Peer>),
    Map { result: u32, version: Version },
}

/// Context attached at registration, readable before the reply arrives.
#[derive(Clone)]
pub enum RequestCtx {
    Peer(Peer),
}

struct Slot {
    tx: oneshot::Sender<Reply>,
    ctx: Option<RequestCtx>,
}

pub struct PendingRequest {
    pub id: u32,
    rx: oneshot::Receiver<Reply>,
}

#[derive(Default)]
pub struct RequestHandler {
    next: AtomicU32,
    slots: Mutex<HashMap<u32, Slot>>,
}

impl RequestHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> PendingRequest {
        self.register_with(None)
    }

    pub fn register_ctx(&self, ctx: RequestCtx) -> PendingRequest {
        self.register_with(Some(ctx))
    }

    fn register_with(&self, ctx: Option<RequestCtx>) -> PendingRequest {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.slots.lock().unwrap().insert(id, Slot { tx, ctx });
        PendingRequest { id, rx }
    }

    /// Context stored at registration, if any.
    pub fn context(&self, id: u32) -> Option<RequestCtx> {
        self.slots.lock().unwrap().get(&id).and_then(|s| s.ctx.clone())
    }

    /// Fulfil a request. Returns false for unknown (abandoned) ids; the
    /// reply is dropped silently in that case.
    pub fn serve(&self, id: u32, reply: Reply) -> bool {
        let slot = self.slots.lock().unwrap().remove(&id);
        match slot {
            Some(slot) => slot.tx.send(reply).is_ok(),
            None => {
                tracing::debug!(request = id, "late reply dropped");
                false
            }
        }
    }

    /// Block on the reply, at most `timeout`. Expiry abandons the request.
    pub async fn wait(&self, pending: PendingRequest, timeout: Duration) -> Result<Reply, NodeError> {
        match tokio::time::timeout(timeout, pending.rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(NodeError::Closed),
            Err(_) => {
                self.slots.lock().unwrap().remove(&pending.id);
                Err(NodeError::Timeout)
            }
        }
    }

    /// Shutdown is the aggregate cancel: drop every slot so all blocked
    /// waits fail.
    pub fn fail_all(&self) {
        self.slots.lock().unwrap().clear();
    }

    pub fn has_pending(&self) -> bool {
        !self.slots.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_serve_then_wait() {
        let handler = RequestHandler::new();
        let pending = handler.register();
        assert!(handler.serve(pending.id, Reply::Flag(true)));
        match handler.wait(pending, Duration::from_secs(1)).await.unwrap() {
            Reply::Flag(v) => assert!(v),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_abandons_request() {
        let handler = RequestHandler::new();
        let pending = handler.register();
        let id = pending.id;
        let err = handler.wait(pending, Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, NodeError::Timeout));
        // Late reply is dropped silently.
        assert!(!handler.serve(id, Reply::Unit));
    }

    #[tokio::test]
    async fn test_one_shot_double_serve() {
        let handler = RequestHandler::new();
        let pending = handler.register();
        assert!(handler.serve(pending.id, Reply::Unit));
        assert!(!handler.serve(pending.id, Reply::Unit));
    }

    #[tokio::test]
    async fn test_fail_all_wakes_waiters() {
        let handler = RequestHandler::new();
        let pending = handler.register();
        handler.fail_all();
        let err = handler.wait(pending, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, NodeError::Closed));
        assert!(!handler.has_pending());
    }

    #[tokio::test]
    async fn test_ids_unique() {
        let handler = RequestHandler::new();
        let a = handler.register();
        let b = handler.register();
        assert_ne!(a.id, b.id);
    }
}
