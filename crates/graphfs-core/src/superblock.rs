//! The backing-store contract.
//!
//! A [`SuperBlock`] owns one partition: it allocates ids, resolves names to
//! ids, and stores node and edge records. The engine never inspects which
//! implementation it is talking to; the virtual graph obtains one per
//! partition from a [`SuperBlockProvider`].

use std::sync::Arc;

use crate::entry::CacheEntry;
use crate::error::GraphResult;
use crate::inode::INode;
use crate::path::{EdgeKey, PathElement};
use crate::transaction::Transaction;
use crate::types::{SerializedEdge, SerializedNode};

bitflags::bitflags! {
    /// Capabilities requested when opening a node.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// Create the node if the path does not resolve
        const CREATE = 1 << 2;
        const APPEND = 1 << 3;
        const TRUNCATE = 1 << 4;
        /// Fail with AlreadyExists if the node exists
        const EXCLUSIVE = 1 << 5;
    }
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self::empty()
    }
}

#[derive(Clone, Default)]
pub struct OpenOptions {
    pub flags: OpenFlags,
    /// Id a create must use instead of allocating one (transaction replay)
    pub force_inode: Option<i64>,
    /// Route every handle operation through this transaction's overlay
    pub transaction: Option<Arc<Transaction>>,
}

impl OpenOptions {
    pub fn new(flags: OpenFlags) -> Self {
        Self { flags, ..Default::default() }
    }

    pub fn read() -> Self {
        Self::new(OpenFlags::READ)
    }

    pub fn read_write() -> Self {
        Self::new(OpenFlags::READ | OpenFlags::WRITE | OpenFlags::APPEND)
    }

    pub fn create_if_missing() -> Self {
        Self::new(OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::APPEND)
    }

    pub fn with_flags(mut self, flags: OpenFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn force_inode(mut self, id: i64) -> Self {
        self.force_inode = Some(id);
        self
    }

    pub fn transaction(mut self, tx: Arc<Transaction>) -> Self {
        self.transaction = Some(tx);
        self
    }
}

impl std::fmt::Debug for OpenOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenOptions")
            .field("flags", &self.flags)
            .field("force_inode", &self.force_inode)
            .field("transaction", &self.transaction.as_ref().map(|tx| tx.xid()))
            .finish()
    }
}

/// Backing store for one partition.
///
/// Allocation and root creation are serialized inside the implementation;
/// reads and writes of already-allocated ids may run concurrently.
pub trait SuperBlock: Send + Sync {
    /// Partition identifier this store serves.
    fn uuid(&self) -> &str;

    /// Short backend name used in errors and logs.
    fn backend(&self) -> &'static str;

    /// The single root cache entry of the partition (bound to id 0).
    fn root(&self) -> GraphResult<Arc<CacheEntry>>;

    /// Allocate a fresh id and return its INode.
    fn allocate_inode(&self) -> GraphResult<Arc<INode>>;

    /// INode for an id that already exists.
    fn make_inode(&self, id: i64) -> GraphResult<Arc<INode>>;

    /// Materialize a node for the negative `entry`: obtain an id (forced,
    /// reused from an existing parent edge, or freshly allocated), record the
    /// parent edge and bind the entry. Idempotent under a forced id.
    fn create(&self, entry: &Arc<CacheEntry>, options: &OpenOptions) -> GraphResult<Arc<INode>>;

    /// Resolve `name` under `parent`. `None` is a confirmed absence.
    fn lookup(&self, parent: &INode, name: &PathElement) -> GraphResult<Option<Arc<INode>>>;

    fn read(&self, inode: &INode) -> GraphResult<SerializedNode>;

    fn write(&self, inode: &INode, node: &SerializedNode) -> GraphResult<()>;

    fn set_edge(&self, inode: &INode, edge: &SerializedEdge) -> GraphResult<()>;

    /// Remove an edge. Removing a missing edge succeeds.
    fn remove_edge(&self, inode: &INode, key: &EdgeKey) -> GraphResult<()>;

    fn read_edge(&self, inode: &INode, key: &EdgeKey) -> GraphResult<Option<SerializedEdge>>;

    /// All edges of `inode`, ordered by key.
    fn read_edges(&self, inode: &INode) -> GraphResult<Vec<SerializedEdge>>;

    /// Return an allocated id that never received a durable record.
    fn free_id(&self, id: i64) -> GraphResult<()>;

    /// Called when the last reference to an INode is dropped.
    fn release_inode(&self, id: i64);

    /// True if this store rejects every mutation.
    fn read_only(&self) -> bool {
        false
    }

    /// Make all completed mutations durable.
    fn flush(&self) -> GraphResult<()>;

    fn close(&self) -> GraphResult<()>;
}

/// Lazily supplies the superblock for a partition id.
pub trait SuperBlockProvider: Send + Sync {
    fn provide(&self, partition: &str) -> GraphResult<Arc<dyn SuperBlock>>;
}

impl<F> SuperBlockProvider for F
where
    F: Fn(&str) -> GraphResult<Arc<dyn SuperBlock>> + Send + Sync,
{
    fn provide(&self, partition: &str) -> GraphResult<Arc<dyn SuperBlock>> {
        self(partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_presets() {
        let create = OpenOptions::create_if_missing();
        assert!(create.flags.contains(OpenFlags::CREATE));
        assert!(create.flags.contains(OpenFlags::READ | OpenFlags::WRITE));
        assert!(!OpenOptions::read().flags.contains(OpenFlags::WRITE));
        assert!(OpenOptions::default().flags.is_empty());
    }

    #[test]
    fn test_builder_accumulates() {
        let opts = OpenOptions::read().with_flags(OpenFlags::EXCLUSIVE).force_inode(5);
        assert!(opts.flags.contains(OpenFlags::READ | OpenFlags::EXCLUSIVE));
        assert_eq!(opts.force_inode, Some(5));
    }
}
