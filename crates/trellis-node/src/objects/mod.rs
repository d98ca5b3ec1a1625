//! Distributed objects: registration, mapping, commit/sync by version.

mod cache;
mod children;
mod store;

pub use cache::{CachedInstance, InstanceCache};
pub use children::{read_children, reconcile_children, write_children, ChildEntry};
pub use store::{MapAttempt, ObjectStore, SharedObject};

use std::sync::Weak;

use trellis_protocol::{ObjectId, Version};
use trellis_stream::{DataIStream, DataOStream, StreamError};

use crate::error::NodeError;

/// Dirty mask bit reserved for the silent "master deregistered" signal.
pub const DIRTY_REMOVED: u64 = 1 << 63;

/// All user-visible dirty bits: a full instance serialization.
pub const DIRTY_ALL: u64 = !DIRTY_REMOVED;

/// A replicated entity. One master instance per object cluster-wide;
/// mapped slave instances receive committed versions in order.
pub trait Object: Send + 'static {
    /// Write the state selected by `dirty` to the stream. Called with
    /// [`DIRTY_ALL`] for full instances.
    fn serialize(&mut self, os: &mut DataOStream, dirty: u64);

    /// Apply a received instance or delta.
    fn deserialize(&mut self, is: &mut DataIStream, dirty: u64) -> Result<(), StreamError>;

    /// Bits changed since the last commit. Committing clears them.
    fn dirty_bits(&self) -> u64 {
        DIRTY_ALL
    }

    fn clear_dirty(&mut self) {}

    /// Expected serialized size; seeds the first-chunk threshold.
    fn instance_size_hint(&self) -> usize {
        4096
    }

    /// Execute a child-removal request. Intermediate types that do not
    /// manage children keep the default and surface a typed error.
    fn remove_child(&mut self, _id: ObjectId) -> Result<(), NodeError> {
        Err(NodeError::UnsupportedChildRemoval)
    }
}

/// Role of a local object instance. A slave never becomes master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Slave,
}

/// Application handle to an attached object.
#[derive(Clone)]
pub struct ObjectRef {
    pub(crate) id: ObjectId,
    pub(crate) store: Weak<store::StoreInner>,
}

impl ObjectRef {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn version(&self) -> Version {
        self.store
            .upgrade()
            .and_then(|s| store::entry_version(&s, self.id))
            .unwrap_or(Version::NONE)
    }

    pub fn is_master(&self) -> bool {
        self.store
            .upgrade()
            .and_then(|s| store::entry_role(&s, self.id))
            .map(|r| r == Role::Master)
            .unwrap_or(false)
    }

    pub fn is_attached(&self) -> bool {
        self.store
            .upgrade()
            .map(|s| store::entry_exists(&s, self.id))
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRef")
            .field("id", &self.id)
            .field("version", &self.version())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Leafless;

    impl Object for Leafless {
        fn serialize(&mut self, _os: &mut DataOStream, _dirty: u64) {}
        fn deserialize(&mut self, _is: &mut DataIStream, _dirty: u64) -> Result<(), StreamError> {
            Ok(())
        }
    }

    #[test]
    fn test_remove_child_defaults_to_typed_error() {
        let mut obj = Leafless;
        let err = obj.remove_child(ObjectId::random()).unwrap_err();
        assert!(matches!(err, NodeError::UnsupportedChildRemoval));
    }

    #[test]
    fn test_dirty_masks_disjoint() {
        assert_eq!(DIRTY_ALL & DIRTY_REMOVED, 0);
        assert_eq!(DIRTY_ALL | DIRTY_REMOVED, u64::MAX);
    }

    #[test]
    fn test_detached_ref_reports_defaults() {
        let r = ObjectRef { id: ObjectId::random(), store: Weak::new() };
        assert!(!r.is_attached());
        assert!(!r.is_master());
        assert_eq!(r.version(), Version::NONE);
    }
}
