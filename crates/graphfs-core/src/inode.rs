//! Object identities.
//!
//! An [`INode`] is the in-process identity of one node id inside one
//! partition. Every cache entry and handle bound to that id shares the same
//! `Arc<INode>`; the owning superblock hands them out through an
//! [`InodeTable`] so there is never more than one live INode per id.
//!
//! Reference counting is `Arc`'s: when the last holder drops its clone the
//! INode notifies its superblock through [`SuperBlock::release_inode`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use crate::error::{GraphError, GraphResult};
use crate::path::EdgeKey;
use crate::superblock::SuperBlock;
use crate::types::{NodeFlags, SerializedEdge, SerializedNode};

/// Set once any handle or entry has taken a reference.
pub const INODE_REFERENCED: u32 = 1 << 0;
/// Id was allocated in this process and has no durable record yet.
pub const INODE_NEW: u32 = 1 << 1;

#[derive(Default)]
struct INodeCache {
    last_version: Option<SerializedNode>,
    edges: HashMap<EdgeKey, SerializedEdge>,
}

pub struct INode {
    id: i64,
    sb: Weak<dyn SuperBlock>,
    flags: AtomicU32,
    cache: RwLock<INodeCache>,
}

impl INode {
    pub(crate) fn new(sb: Weak<dyn SuperBlock>, id: i64) -> Self {
        Self {
            id,
            sb,
            flags: AtomicU32::new(0),
            cache: RwLock::new(INodeCache::default()),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    /// The owning superblock, or Closed if it has been dropped.
    pub fn superblock(&self) -> GraphResult<Arc<dyn SuperBlock>> {
        self.sb.upgrade().ok_or(GraphError::Closed("superblock"))
    }

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    pub fn set_flags(&self, flags: u32) {
        self.flags.fetch_or(flags, Ordering::AcqRel);
    }

    pub fn clear_flags(&self, flags: u32) {
        self.flags.fetch_and(!flags, Ordering::AcqRel);
    }

    /// Last known node state, if present and not invalidated.
    pub fn cached_node(&self) -> Option<SerializedNode> {
        self.cache
            .read()
            .last_version
            .as_ref()
            .filter(|n| n.is_valid())
            .cloned()
    }

    pub(crate) fn store_node(&self, node: &SerializedNode) {
        let mut frozen = node.clone();
        frozen.flags.remove(NodeFlags::INVALID);
        self.cache.write().last_version = Some(frozen);
    }

    /// Drop cached state so the next read goes to the backing store.
    pub fn invalidate(&self) {
        let mut cache = self.cache.write();
        cache.last_version = None;
        cache.edges.clear();
    }

    pub(crate) fn cached_edge(&self, key: &EdgeKey) -> Option<SerializedEdge> {
        self.cache.read().edges.get(key).cloned()
    }

    pub(crate) fn store_edge(&self, edge: &SerializedEdge) {
        self.cache.write().edges.insert(edge.key.clone(), edge.clone());
    }

    pub(crate) fn forget_edge(&self, key: &EdgeKey) {
        self.cache.write().edges.remove(key);
    }
}

impl std::fmt::Debug for INode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("INode")
            .field("id", &self.id)
            .field("flags", &self.flags())
            .finish()
    }
}

impl Drop for INode {
    fn drop(&mut self) {
        if let Some(sb) = self.sb.upgrade() {
            sb.release_inode(self.id);
        }
    }
}

/// Id → live INode map owned by a superblock.
///
/// Holds only weak references; an INode lives as long as some entry or
/// handle holds it.
#[derive(Default)]
pub struct InodeTable {
    live: Mutex<HashMap<i64, Weak<INode>>>,
}

impl InodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The live INode for `id`, creating it if none exists.
    pub fn get_or_insert(&self, sb: &Weak<dyn SuperBlock>, id: i64) -> Arc<INode> {
        let mut live = self.live.lock();
        if let Some(existing) = live.get(&id).and_then(Weak::upgrade) {
            existing.set_flags(INODE_REFERENCED);
            return existing;
        }
        let inode = Arc::new(INode::new(sb.clone(), id));
        inode.set_flags(INODE_REFERENCED);
        live.insert(id, Arc::downgrade(&inode));
        inode
    }

    pub fn get(&self, id: i64) -> Option<Arc<INode>> {
        self.live.lock().get(&id).and_then(Weak::upgrade)
    }

    /// Remove the slot for `id` if its INode is gone. A replacement created
    /// between the drop and this call is left alone.
    pub fn forget(&self, id: i64) {
        let mut live = self.live.lock();
        if live.get(&id).map_or(false, |w| w.strong_count() == 0) {
            live.remove(&id);
        }
    }

    /// Number of ids with a live INode.
    pub fn live_count(&self) -> usize {
        self.live.lock().values().filter(|w| w.strong_count() > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::KvSuperBlock;

    #[test]
    fn test_table_shares_identity() {
        let sb = KvSuperBlock::in_memory("R");
        let a = sb.make_inode(7).unwrap();
        let b = sb.make_inode(7).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_ne!(a.flags() & INODE_REFERENCED, 0);
        assert_eq!(sb.live_inodes(), 1);
    }

    #[test]
    fn test_drop_releases_slot() {
        let sb = KvSuperBlock::in_memory("R");
        let inode = sb.make_inode(3).unwrap();
        assert_eq!(sb.live_inodes(), 1);
        drop(inode);
        assert_eq!(sb.live_inodes(), 0);
    }

    #[test]
    fn test_cache_ignores_invalid_nodes() {
        let sb = KvSuperBlock::in_memory("R");
        let inode = sb.make_inode(1).unwrap();

        let mut node = SerializedNode { index: 1, version: 2, ..Default::default() };
        node.flags.insert(NodeFlags::INVALID);
        inode.store_node(&node);
        assert_eq!(inode.cached_node().unwrap().version, 2);

        inode.invalidate();
        assert!(inode.cached_node().is_none());
    }
}
