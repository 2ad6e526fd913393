//! Superblock backed by the embedded key-value store.
//!
//! Layout inside the store (one store may host many partitions):
//!
//! ```text
//! node/<partition>/<id:016x>          -> SerializedNode (MessagePack)
//! edge/<partition>/<id:016x>/<key>    -> SerializedEdge (MessagePack)
//! bitmap/<partition>/<word:016x>     -> u64 bitmap word (big-endian)
//! ```
//!
//! Only the bitmap word an allocation touched is rewritten, and a word with
//! no ids left is deleted.
//!
//! Tree structure lives entirely in edges: a child is found by reading the
//! edge `(parent id, name)` and following its `to_index`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::bitmap::SparseBitmap;
use crate::entry::CacheEntry;
use crate::error::{GraphError, GraphResult};
use crate::inode::{INode, InodeTable, INODE_NEW};
use crate::kv::KvStore;
use crate::path::{EdgeKey, PathElement};
use crate::superblock::{OpenOptions, SuperBlock, SuperBlockProvider};
use crate::types::{SerializedEdge, SerializedNode};

const BACKEND: &str = "kv";

pub struct KvSuperBlock {
    uuid: String,
    store: Arc<KvStore>,
    owns_store: bool,
    this: Weak<KvSuperBlock>,
    inodes: InodeTable,
    /// Allocation mutex; also guards bitmap persistence.
    bitmap: Mutex<SparseBitmap>,
    /// Serializes creates so two racing opens bind one id.
    create_lock: Mutex<()>,
    root: Mutex<Option<Arc<CacheEntry>>>,
    lookups: AtomicU64,
    closed: AtomicBool,
}

impl KvSuperBlock {
    /// Serve partition `uuid` out of `store`, restoring its allocation bitmap.
    pub fn open(store: Arc<KvStore>, uuid: &str) -> GraphResult<Arc<Self>> {
        Self::build(store, uuid, false)
    }

    /// A partition that lives only in RAM.
    pub fn in_memory(uuid: &str) -> Arc<Self> {
        let store = Arc::new(KvStore::in_memory());
        let bitmap = SparseBitmap::new();
        Arc::new_cyclic(|this| Self::assemble(store, uuid, true, this.clone(), bitmap))
    }

    fn build(store: Arc<KvStore>, uuid: &str, owns_store: bool) -> GraphResult<Arc<Self>> {
        let mut bitmap = SparseBitmap::new();
        for (suffix, bytes) in store.prefix_scan(bitmap_prefix(uuid).as_bytes()) {
            let index = std::str::from_utf8(&suffix)
                .ok()
                .and_then(|hex| u64::from_str_radix(hex, 16).ok())
                .ok_or_else(|| GraphError::Codec(format!("bad bitmap word key in partition {}", uuid)))?;
            let raw: [u8; 8] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| GraphError::Codec(format!("bitmap word {} of {} is {} bytes", index, uuid, bytes.len())))?;
            bitmap.set_word(index, u64::from_be_bytes(raw));
        }
        debug!(partition = uuid, allocated = bitmap.count(), "opened kv superblock");
        Ok(Arc::new_cyclic(|this| Self::assemble(store, uuid, owns_store, this.clone(), bitmap)))
    }

    fn assemble(store: Arc<KvStore>, uuid: &str, owns_store: bool, this: Weak<Self>, bitmap: SparseBitmap) -> Self {
        Self {
            uuid: uuid.to_string(),
            store,
            owns_store,
            this,
            inodes: InodeTable::new(),
            bitmap: Mutex::new(bitmap),
            create_lock: Mutex::new(()),
            root: Mutex::new(None),
            lookups: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Provider serving every partition out of one shared `store`.
    pub fn provider(store: Arc<KvStore>) -> impl SuperBlockProvider {
        move |partition: &str| -> GraphResult<Arc<dyn SuperBlock>> {
            let sb: Arc<dyn SuperBlock> = KvSuperBlock::open(Arc::clone(&store), partition)?;
            Ok(sb)
        }
    }

    /// Backing-store lookups served so far.
    pub fn lookup_count(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }

    /// Ids that currently have a live INode.
    pub fn live_inodes(&self) -> usize {
        self.inodes.live_count()
    }

    fn weak_self(&self) -> Weak<dyn SuperBlock> {
        let weak: Weak<dyn SuperBlock> = self.this.clone();
        weak
    }

    fn check_open(&self) -> GraphResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GraphError::Closed("superblock"));
        }
        Ok(())
    }

    /// Write back the word holding `id`.
    fn persist_word(&self, bitmap: &SparseBitmap, id: u64) -> GraphResult<()> {
        let index = SparseBitmap::word_index(id);
        let key = format!("{}{:016x}", bitmap_prefix(&self.uuid), index);
        match bitmap.word(index) {
            0 => self.store.delete(key.as_bytes()),
            bits => self.store.put(key.as_bytes(), &bits.to_be_bytes()),
        }
    }

    fn mark_allocated(&self, id: i64) -> GraphResult<()> {
        let mut bitmap = self.bitmap.lock();
        if bitmap.mark_allocated(id as u64) {
            self.persist_word(&bitmap, id as u64)?;
        }
        Ok(())
    }

    fn node_key(&self, id: i64) -> String {
        format!("node/{}/{:016x}", self.uuid, id as u64)
    }

    fn edge_prefix(&self, id: i64) -> String {
        format!("edge/{}/{:016x}/", self.uuid, id as u64)
    }

    fn edge_key(&self, id: i64, key: &EdgeKey) -> String {
        format!("{}{}", self.edge_prefix(id), key)
    }

    fn get_edge(&self, id: i64, key: &EdgeKey) -> GraphResult<Option<SerializedEdge>> {
        match self.store.get(self.edge_key(id, key).as_bytes())? {
            Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

fn bitmap_prefix(uuid: &str) -> String {
    format!("bitmap/{}/", uuid)
}

impl SuperBlock for KvSuperBlock {
    fn uuid(&self) -> &str {
        &self.uuid
    }

    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn root(&self) -> GraphResult<Arc<CacheEntry>> {
        self.check_open()?;
        let mut root = self.root.lock();
        if let Some(entry) = root.as_ref() {
            return Ok(Arc::clone(entry));
        }
        self.mark_allocated(0)?;
        let entry = CacheEntry::new_root(&self.uuid, self.make_inode(0)?)?;
        *root = Some(Arc::clone(&entry));
        Ok(entry)
    }

    fn allocate_inode(&self) -> GraphResult<Arc<INode>> {
        self.check_open()?;
        let id = {
            let mut bitmap = self.bitmap.lock();
            let id = bitmap.allocate();
            self.persist_word(&bitmap, id)?;
            id as i64
        };
        let inode = self.make_inode(id)?;
        inode.set_flags(INODE_NEW);
        Ok(inode)
    }

    fn make_inode(&self, id: i64) -> GraphResult<Arc<INode>> {
        if id < 0 {
            return Err(GraphError::InvalidArgument(format!("negative inode id {}", id)));
        }
        Ok(self.inodes.get_or_insert(&self.weak_self(), id))
    }

    fn create(&self, entry: &Arc<CacheEntry>, options: &OpenOptions) -> GraphResult<Arc<INode>> {
        self.check_open()?;
        let _create = self.create_lock.lock();
        if let Some(inode) = entry.inode() {
            return Ok(inode);
        }
        let (Some(parent), Some(name)) = (entry.parent(), entry.name()) else {
            return Err(GraphError::InvalidArgument("cannot create a partition root".into()));
        };
        let parent_inode = parent
            .inode()
            .ok_or_else(|| GraphError::NotFound(parent.path().to_string()))?;

        let inode = match options.force_inode {
            Some(id) => {
                self.mark_allocated(id)?;
                self.make_inode(id)?
            }
            None => match self.get_edge(parent_inode.id(), name)? {
                Some(existing) if !existing.is_removed() => {
                    self.mark_allocated(existing.to_index)?;
                    self.make_inode(existing.to_index)?
                }
                _ => self.allocate_inode()?,
            },
        };

        let mut edge = SerializedEdge::new(parent_inode.id(), name.clone(), inode.id());
        edge.to_path = Some(entry.path());
        self.set_edge(&parent_inode, &edge)?;

        entry.instantiate(Arc::clone(&inode));
        debug!(partition = %self.uuid, inode = inode.id(), path = %entry.path(), "created node");
        Ok(inode)
    }

    fn lookup(&self, parent: &INode, name: &PathElement) -> GraphResult<Option<Arc<INode>>> {
        self.check_open()?;
        self.lookups.fetch_add(1, Ordering::Relaxed);
        match self.get_edge(parent.id(), name)? {
            Some(edge) if !edge.is_removed() => {
                self.mark_allocated(edge.to_index)?;
                Ok(Some(self.make_inode(edge.to_index)?))
            }
            _ => Ok(None),
        }
    }

    fn read(&self, inode: &INode) -> GraphResult<SerializedNode> {
        self.check_open()?;
        match self.store.get(self.node_key(inode.id()).as_bytes())? {
            Some(bytes) => Ok(rmp_serde::from_slice(&bytes)?),
            None => Err(GraphError::NotFound(format!("{}#{}", self.uuid, inode.id()))),
        }
    }

    fn write(&self, inode: &INode, node: &SerializedNode) -> GraphResult<()> {
        self.check_open()?;
        let bytes = rmp_serde::to_vec_named(node)?;
        self.store.put(self.node_key(inode.id()).as_bytes(), &bytes)?;
        inode.clear_flags(INODE_NEW);
        Ok(())
    }

    fn set_edge(&self, inode: &INode, edge: &SerializedEdge) -> GraphResult<()> {
        self.check_open()?;
        let bytes = rmp_serde::to_vec_named(edge)?;
        self.store.put(self.edge_key(inode.id(), &edge.key).as_bytes(), &bytes)
    }

    fn remove_edge(&self, inode: &INode, key: &EdgeKey) -> GraphResult<()> {
        self.check_open()?;
        self.store.delete(self.edge_key(inode.id(), key).as_bytes())
    }

    fn read_edge(&self, inode: &INode, key: &EdgeKey) -> GraphResult<Option<SerializedEdge>> {
        self.check_open()?;
        self.get_edge(inode.id(), key)
    }

    fn read_edges(&self, inode: &INode) -> GraphResult<Vec<SerializedEdge>> {
        self.check_open()?;
        self.store
            .prefix_scan(self.edge_prefix(inode.id()).as_bytes())
            .into_iter()
            .map(|(_, bytes)| Ok(rmp_serde::from_slice(&bytes)?))
            .collect()
    }

    fn free_id(&self, id: i64) -> GraphResult<()> {
        self.check_open()?;
        let mut bitmap = self.bitmap.lock();
        if bitmap.free(id as u64) {
            self.persist_word(&bitmap, id as u64)?;
        }
        Ok(())
    }

    fn release_inode(&self, id: i64) {
        self.inodes.forget(id);
    }

    fn flush(&self) -> GraphResult<()> {
        self.check_open()?;
        self.store.sync()
    }

    fn close(&self) -> GraphResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.root.lock().take();
        self.store.sync()?;
        if self.owns_store {
            self.store.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::path::Path;
    use tempfile::TempDir;

    fn name(s: &str) -> PathElement {
        PathElement::new(s).unwrap()
    }

    fn create_child(sb: &Arc<KvSuperBlock>, parent: &Arc<CacheEntry>, n: &str) -> Arc<CacheEntry> {
        let entry = parent.lookup_child(sb.as_ref(), &name(n)).unwrap();
        sb.create(&entry, &OpenOptions::create_if_missing()).unwrap();
        entry
    }

    #[test]
    fn test_create_records_parent_edge() {
        let sb = KvSuperBlock::in_memory("R");
        let root = sb.root().unwrap();
        let a = create_child(&sb, &root, "a");
        let id = a.inode().unwrap().id();
        assert_eq!(id, 1);

        let edge = sb.read_edge(&root.inode().unwrap(), &name("a")).unwrap().unwrap();
        assert_eq!(edge.to_index, id);
        assert_eq!(edge.to_path, Some(Path::parse("R/a").unwrap()));
    }

    #[test]
    fn test_create_with_forced_id_is_idempotent() {
        let sb = KvSuperBlock::in_memory("R");
        let root = sb.root().unwrap();
        let entry = root.lookup_child(sb.as_ref(), &name("pinned")).unwrap();
        let opts = OpenOptions::create_if_missing().force_inode(42);

        let first = sb.create(&entry, &opts).unwrap();
        let second = sb.create(&entry, &opts).unwrap();
        assert_eq!(first.id(), 42);
        assert!(Arc::ptr_eq(&first, &second));

        let next = sb.allocate_inode().unwrap();
        assert_eq!(next.id(), 1);
    }

    #[test]
    fn test_read_write_and_edges() {
        let sb = KvSuperBlock::in_memory("R");
        let root = sb.root().unwrap();
        let a = create_child(&sb, &root, "a");
        let inode = a.inode().unwrap();

        assert!(sb.read(&inode).unwrap_err().is_not_found());
        let node = SerializedNode { index: inode.id(), version: 1, data: Some(b"{\"x\":1}".to_vec()), ..Default::default() };
        sb.write(&inode, &node).unwrap();
        assert_eq!(sb.read(&inode).unwrap(), node);

        sb.set_edge(&inode, &SerializedEdge::new(inode.id(), name("b"), 9)).unwrap();
        sb.set_edge(&inode, &SerializedEdge::new(inode.id(), name("a"), 8)).unwrap();
        let keys: Vec<String> = sb.read_edges(&inode).unwrap().iter().map(|e| e.key.to_string()).collect();
        assert_eq!(keys, vec!["a", "b"]);

        sb.remove_edge(&inode, &name("b")).unwrap();
        sb.remove_edge(&inode, &name("b")).unwrap();
        assert_eq!(sb.read_edges(&inode).unwrap().len(), 1);
    }

    #[test]
    fn test_partitions_share_store_without_collisions() {
        let store = Arc::new(KvStore::in_memory());
        let r = KvSuperBlock::open(Arc::clone(&store), "R").unwrap();
        let r2 = KvSuperBlock::open(Arc::clone(&store), "R2").unwrap();

        let root = r.root().unwrap();
        create_child(&r, &root, "only-in-r");

        let root2 = r2.root().unwrap();
        let missing = root2.lookup_child(r2.as_ref(), &name("only-in-r")).unwrap();
        assert!(missing.is_negative());
        assert_eq!(r2.read_edges(&root2.inode().unwrap()).unwrap().len(), 0);
    }

    #[test]
    fn test_bitmap_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = Arc::new(KvStore::open(dir.path(), Config::default()).unwrap());
            let sb = KvSuperBlock::open(Arc::clone(&store), "R").unwrap();
            sb.allocate_inode().unwrap();
            sb.allocate_inode().unwrap();
            sb.close().unwrap();
        }
        let store = Arc::new(KvStore::open(dir.path(), Config::default()).unwrap());
        let sb = KvSuperBlock::open(store, "R").unwrap();
        assert_eq!(sb.allocate_inode().unwrap().id(), 3);
    }

    #[test]
    fn test_allocation_rewrites_one_word() {
        let store = Arc::new(KvStore::in_memory());
        let sb = KvSuperBlock::open(Arc::clone(&store), "R").unwrap();
        for _ in 0..70 {
            sb.allocate_inode().unwrap();
        }
        assert_eq!(store.prefix_count(b"bitmap/R/"), 2);
        let second = store.get(b"bitmap/R/0000000000000001").unwrap().unwrap();
        assert_eq!(u64::from_be_bytes(second.as_slice().try_into().unwrap()), (1u64 << 7) - 1);

        for id in 64..=70 {
            sb.free_id(id).unwrap();
        }
        assert_eq!(store.prefix_count(b"bitmap/R/"), 1);
        let reopened = KvSuperBlock::open(store, "R").unwrap();
        assert_eq!(reopened.allocate_inode().unwrap().id(), 64);
    }

    #[test]
    fn test_free_id_returns_to_pool() {
        let sb = KvSuperBlock::in_memory("R");
        let id = sb.allocate_inode().unwrap().id();
        sb.free_id(id).unwrap();
        assert_eq!(sb.allocate_inode().unwrap().id(), id);
    }

    #[test]
    fn test_closed_superblock_rejects_reads() {
        let sb = KvSuperBlock::in_memory("R");
        let root = sb.root().unwrap();
        sb.close().unwrap();
        assert!(matches!(sb.read(&root.inode().unwrap()), Err(GraphError::Closed(_))));
        assert!(matches!(sb.root(), Err(GraphError::Closed(_))));
    }
}
