//! Child-collection serialization and reconciliation.
//!
//! A parent object serializes its heterogeneous children as a list of
//! `(id, version)` pairs. On the slave side the received list is
//! reconciled against the current children: matching entries sync to the
//! received version, new entries are created and mapped, local leftovers
//! are released. The rebuilt list preserves wire order exactly.

use trellis_protocol::{ObjectId, Version};
use trellis_stream::{DataIStream, DataOStream, StreamError};

use crate::error::NodeError;
use crate::local_node::LocalNode;
use crate::objects::{ObjectRef, SharedObject};

/// One wire entry of a child list; `None` encodes a hole in the
/// collection (id zero on the wire).
pub type ChildEntry = Option<(ObjectId, Version)>;

/// Serialize a child list as `(id, version)` pairs, holes as id zero.
pub fn write_children(os: &mut DataOStream, children: &[Option<ObjectRef>]) {
    os.write(children.len() as u64);
    for child in children {
        match child {
            Some(child) => {
                os.write(child.id().0);
                os.write(child.version().0);
            }
            None => {
                os.write(0u128);
                os.write(0u128);
            }
        }
    }
}

/// Read a serialized child list. Deserialization stops here; the async
/// reconciliation against the store happens after the sync returns.
pub fn read_children(is: &mut DataIStream) -> Result<Vec<ChildEntry>, StreamError> {
    let n: u64 = is.read()?;
    if n >= trellis_stream::MAX_STREAM_LEN {
        return Err(StreamError::CorruptLength(n));
    }
    let mut out = Vec::with_capacity(n.min(4096) as usize);
    for _ in 0..n {
        let id = ObjectId(is.read()?);
        let version = Version(is.read()?);
        out.push(if id.is_zero() { None } else { Some((id, version)) });
    }
    Ok(out)
}

/// Rebuild a child collection from a received wire list.
///
/// Entries present locally are synced to the received version (masters
/// sync to HEAD, applying queued slave deltas). New entries are created
/// through `create` and mapped at the received version. Children missing
/// from the wire are unmapped and dropped. The result matches the wire
/// sequence exactly.
pub async fn reconcile_children(
    local: &LocalNode,
    wire: Vec<ChildEntry>,
    old: Vec<Option<ObjectRef>>,
    parent_is_master: bool,
    create: &mut dyn FnMut() -> SharedObject,
) -> Result<Vec<Option<ObjectRef>>, NodeError> {
    let mut leftovers: Vec<ObjectRef> = old.into_iter().flatten().collect();
    let mut result = Vec::with_capacity(wire.len());

    for entry in wire {
        let Some((id, version)) = entry else {
            result.push(None);
            continue;
        };

        if let Some(at) = leftovers.iter().position(|c| c.id() == id) {
            let child = leftovers.remove(at);
            if parent_is_master {
                local.objects().sync(&child, Version::HEAD).await.ok();
            } else {
                local.objects().sync(&child, version).await?;
            }
            result.push(Some(child));
        } else {
            let child = local.objects().map(create(), id, version).await?;
            result.push(Some(child));
        }
    }

    for child in leftovers {
        if child.is_attached() && !child.is_master() {
            local.objects().unmap(&child).await?;
        }
    }

    Ok(result)
}
