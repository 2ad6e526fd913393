//! Node handles: an open session on one node.
//!
//! A handle pins its INode and cache entry until it is closed or dropped.
//! Without a transaction every call goes straight to the superblock and the
//! INode's cached state; with one, calls are routed through the
//! transaction's staged overlay and mutations are journaled. A read-only
//! superblock mirrors state owned elsewhere, so its nodes and edges are
//! always read through rather than served from the INode.

use std::sync::Arc;

use crate::entry::EntryRef;
use crate::error::{GraphError, GraphResult};
use crate::inode::INode;
use crate::path::{EdgeKey, Path};
use crate::record::JournalEntry;
use crate::superblock::{OpenFlags, OpenOptions, SuperBlock};
use crate::transaction::Transaction;
use crate::types::{SerializedEdge, SerializedNode};

pub struct NodeHandle {
    sb: Arc<dyn SuperBlock>,
    inode: Option<Arc<INode>>,
    entry: Option<EntryRef>,
    path: Path,
    options: OpenOptions,
}

impl NodeHandle {
    pub(crate) fn new(
        sb: Arc<dyn SuperBlock>,
        inode: Arc<INode>,
        entry: Option<EntryRef>,
        path: Path,
        options: OpenOptions,
    ) -> Self {
        Self {
            sb,
            inode: Some(inode),
            entry,
            path,
            options,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &OpenOptions {
        &self.options
    }

    pub fn transaction(&self) -> Option<&Arc<Transaction>> {
        self.options.transaction.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.inode.is_none()
    }

    /// The pinned INode.
    pub fn inode(&self) -> GraphResult<&Arc<INode>> {
        self.inode.as_ref().ok_or(GraphError::Closed("node handle"))
    }

    pub fn id(&self) -> GraphResult<i64> {
        Ok(self.inode()?.id())
    }

    fn require(&self, flag: OpenFlags, what: &str) -> GraphResult<&Arc<INode>> {
        let inode = self.inode()?;
        if !self.options.flags.contains(flag) {
            return Err(GraphError::PermissionDenied(format!("{} on {} requires {:?}", what, self.path, flag)));
        }
        Ok(inode)
    }

    pub fn read(&self) -> GraphResult<SerializedNode> {
        let inode = self.require(OpenFlags::READ, "read")?;

        if let Some(tx) = self.transaction() {
            return tx.read_node(&self.sb, &self.path, inode);
        }

        if let Some(node) = self.cached_node(inode) {
            if node.is_removed() {
                return Err(GraphError::NotFound(self.path.to_string()));
            }
            return Ok(node);
        }

        let node = self.sb.read(inode)?;
        if node.is_removed() {
            return Err(GraphError::NotFound(self.path.to_string()));
        }
        inode.store_node(&node);
        Ok(node)
    }

    pub fn write(&self, node: &SerializedNode) -> GraphResult<()> {
        let inode = self.require(OpenFlags::WRITE, "write")?;

        if let Some(tx) = self.transaction() {
            return tx.append(JournalEntry::write(inode.id(), Some(self.path.clone()), node.clone()));
        }

        self.sb.write(inode, node)?;
        inode.store_node(node);
        Ok(())
    }

    pub fn set_edge(&self, edge: &SerializedEdge) -> GraphResult<()> {
        let inode = self.require(OpenFlags::WRITE, "set_edge")?;

        if let Some(tx) = self.transaction() {
            return tx.append(JournalEntry::set_edge(inode.id(), Some(self.path.clone()), edge.clone()));
        }

        self.sb.set_edge(inode, edge)?;
        inode.store_edge(edge);
        self.invalidate_child(&edge.key);
        Ok(())
    }

    pub fn remove_edge(&self, key: &EdgeKey) -> GraphResult<()> {
        let inode = self.require(OpenFlags::WRITE, "remove_edge")?;

        if let Some(tx) = self.transaction() {
            let tombstone = SerializedEdge::tombstone(inode.id(), key.clone());
            return tx.append(JournalEntry::remove_edge(inode.id(), Some(self.path.clone()), tombstone));
        }

        self.sb.remove_edge(inode, key)?;
        inode.forget_edge(key);
        self.invalidate_child(key);
        Ok(())
    }

    pub fn read_edge(&self, key: &EdgeKey) -> GraphResult<SerializedEdge> {
        let inode = self.require(OpenFlags::READ, "read_edge")?;
        let not_found = || GraphError::NotFound(self.path.child(key.clone()).to_string());

        if let Some(tx) = self.transaction() {
            return tx.read_edge(&self.sb, &self.path, inode, key)?.ok_or_else(not_found);
        }

        if let Some(edge) = inode.cached_edge(key).filter(|_| !self.sb.read_only()) {
            return Ok(edge);
        }
        let edge = self.sb.read_edge(inode, key)?.ok_or_else(not_found)?;
        inode.store_edge(&edge);
        Ok(edge)
    }

    pub fn read_edges(&self) -> GraphResult<Vec<SerializedEdge>> {
        let inode = self.require(OpenFlags::READ, "read_edges")?;

        if let Some(tx) = self.transaction() {
            return tx.read_edges(&self.sb, &self.path, inode);
        }
        self.sb.read_edges(inode)
    }

    /// Release the INode and cache entry. Idempotent.
    pub fn close(&mut self) {
        self.entry = None;
        self.inode = None;
    }

    fn cached_node(&self, inode: &INode) -> Option<SerializedNode> {
        if self.sb.read_only() {
            return None;
        }
        inode.cached_node()
    }

    /// A changed edge may rebind the child cached under the same name.
    fn invalidate_child(&self, key: &EdgeKey) {
        if let Some(entry) = &self.entry {
            entry.invalidate_child(key);
        }
    }
}

impl Drop for NodeHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle")
            .field("path", &self.path.to_string())
            .field("inode", &self.inode.as_ref().map(|i| i.id()))
            .field("options", &self.options)
            .finish()
    }
}
