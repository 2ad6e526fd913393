//! The virtual graph: entry point for path-addressed access.
//!
//! A [`VirtualGraph`] maps partition ids to superblocks (obtained lazily
//! from a [`SuperBlockProvider`] and cached for the graph's lifetime), walks
//! the cache entry tree to open node handles, and owns the journal,
//! checkpoint, transaction manager and replication slots.
//!
//! On-disk layout under the graph directory:
//!
//! ```text
//! journal/     journal segments
//! checkpoint   8-byte big-endian rid
//! metadata/    key-value log (replication cursors)
//! ```

use std::path::Path as FsPath;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::checkpoint::{Checkpoint, FileCheckpoint};
use crate::config::Config;
use crate::entry::{resolve, CacheEntry};
use crate::error::{GraphError, GraphResult};
use crate::handle::NodeHandle;
use crate::journal::Journal;
use crate::kv::KvStore;
use crate::path::{EdgeKey, Path};
use crate::record::{JournalEntry, JournalOp};
use crate::replication::{ReplicationManager, ReplicationSlot, ReplicationSlotOptions};
use crate::superblock::{OpenFlags, OpenOptions, SuperBlock, SuperBlockProvider};
use crate::transaction::{validate_log, Transaction};
use crate::txmgr::{RecoveryReport, TransactionManager};
use crate::types::{SerializedEdge, SerializedNode};

/// Synchronous commit hook for collaborators that cannot wait for a
/// replication slot. Called after a transaction's log has been applied and
/// before its `commit` returns. No lock of the committing transaction is
/// held, so the listener may inspect it or start new transactions. During
/// recovery the manager's commit lock is held and a listener must not
/// commit.
pub trait TransactionListener: Send + Sync {
    fn on_commit(&self, xid: u64, log: &[JournalEntry]) -> GraphResult<()>;
}

impl<F> TransactionListener for F
where
    F: Fn(u64, &[JournalEntry]) -> GraphResult<()> + Send + Sync,
{
    fn on_commit(&self, xid: u64, log: &[JournalEntry]) -> GraphResult<()> {
        self(xid, log)
    }
}

/// Where a path stands from the point of view of one transaction.
enum Located {
    Existing(Arc<CacheEntry>),
    Staged(i64),
    Missing { parent_id: i64 },
}

pub struct VirtualGraph {
    provider: Box<dyn SuperBlockProvider>,
    superblocks: Mutex<HashMap<String, Arc<dyn SuperBlock>>>,
    journal: Arc<Journal>,
    checkpoint: Arc<dyn Checkpoint>,
    metadata: Arc<KvStore>,
    transactions: Arc<TransactionManager>,
    replication: ReplicationManager,
    listener: RwLock<Option<Arc<dyn TransactionListener>>>,
    last_recovery: Mutex<RecoveryReport>,
    config: Config,
    closed: AtomicBool,
}

impl VirtualGraph {
    /// Open the graph stored in `dir` and run recovery.
    ///
    /// A graph with an empty journal and no checkpoint is new; its
    /// checkpoint is initialized to 0 so later recoveries scan from the
    /// first record.
    pub fn open<P, S>(dir: P, config: Config, provider: S) -> GraphResult<Arc<Self>>
    where
        P: AsRef<FsPath>,
        S: SuperBlockProvider + 'static,
    {
        let dir = dir.as_ref();
        config.validate().map_err(GraphError::InvalidArgument)?;

        let journal = Arc::new(Journal::open(dir.join("journal"), config.clone())?);
        let checkpoint: Arc<dyn Checkpoint> = Arc::new(FileCheckpoint::open(dir.join("checkpoint"))?);
        let metadata = Arc::new(KvStore::open(dir.join("metadata"), config.clone())?);

        if checkpoint.get()?.is_none() && journal.head() == 0 {
            checkpoint.update(0, false)?;
        }

        let graph = Arc::new_cyclic(|this: &Weak<VirtualGraph>| Self {
            provider: Box::new(provider),
            superblocks: Mutex::new(HashMap::new()),
            transactions: Arc::new(TransactionManager::new(
                this.clone(),
                Arc::clone(&journal),
                Arc::clone(&checkpoint),
                Arc::clone(&metadata),
            )),
            replication: ReplicationManager::new(Arc::clone(&journal), Arc::clone(&metadata)),
            journal,
            checkpoint,
            metadata,
            listener: RwLock::new(None),
            last_recovery: Mutex::new(RecoveryReport::default()),
            config,
            closed: AtomicBool::new(false),
        });

        let report = graph.recover()?;
        info!(
            dir = %dir.display(),
            applied = report.applied,
            forced_rollbacks = report.forced_rollbacks,
            "opened virtual graph"
        );
        Ok(graph)
    }

    fn check_open(&self) -> GraphResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GraphError::Closed("virtual graph"));
        }
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    pub fn checkpoint(&self) -> &Arc<dyn Checkpoint> {
        &self.checkpoint
    }

    pub fn metadata(&self) -> &Arc<KvStore> {
        &self.metadata
    }

    pub fn transaction_manager(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    /// Replay committed work past the checkpoint.
    pub fn recover(&self) -> GraphResult<RecoveryReport> {
        self.check_open()?;
        let report = self.transactions.recover()?;
        *self.last_recovery.lock() = report.clone();
        Ok(report)
    }

    /// Report of the most recent recovery, including the one run by `open`.
    pub fn last_recovery(&self) -> RecoveryReport {
        self.last_recovery.lock().clone()
    }

    /// Superblock serving `partition`, asking the provider on first use.
    pub fn superblock(&self, partition: &str) -> GraphResult<Arc<dyn SuperBlock>> {
        self.check_open()?;
        let mut superblocks = self.superblocks.lock();
        if let Some(sb) = superblocks.get(partition) {
            return Ok(Arc::clone(sb));
        }
        let sb = self.provider.provide(partition)?;
        debug!(partition, backend = sb.backend(), "attached superblock");
        superblocks.insert(partition.to_string(), Arc::clone(&sb));
        Ok(sb)
    }

    /// Cache entry for `path`; negative if the node does not exist.
    pub fn resolve(&self, path: &Path) -> GraphResult<Arc<CacheEntry>> {
        let sb = self.superblock(path.partition())?;
        let root = sb.root()?;
        resolve(sb.as_ref(), &root, path)
    }

    /// Forget what the cache knows about `path`: its binding in the parent
    /// (positive or negative) and its INode's cached state. Only already
    /// cached entries are touched; nothing is looked up. Returns whether a
    /// binding was dropped.
    pub fn invalidate(&self, path: &Path) -> GraphResult<bool> {
        let sb = self.superblock(path.partition())?;
        let mut entry = sb.root()?;
        let Some(name) = path.name() else {
            if let Some(inode) = entry.inode() {
                inode.invalidate();
            }
            return Ok(false);
        };

        let parents = &path.elements()[..path.elements().len() - 1];
        for element in parents {
            match entry.cached_child(element) {
                Some(child) => entry = child,
                None => return Ok(false),
            }
        }
        if let Some(inode) = entry.cached_child(name).and_then(|child| child.inode()) {
            inode.invalidate();
        }
        Ok(entry.invalidate_child(name))
    }

    /// Open a handle on `path`.
    ///
    /// Without CREATE a missing node is NotFound; with EXCLUSIVE an
    /// existing one is AlreadyExists. A handle bound to a transaction sees
    /// that transaction's staged creates, and a create through it is staged
    /// too.
    pub fn open_node(&self, path: &Path, options: OpenOptions) -> GraphResult<NodeHandle> {
        let sb = self.superblock(path.partition())?;
        let root = sb.root()?;

        if let Some(tx) = options.transaction.clone() {
            return self.open_in_transaction(sb, &root, path, options, &tx);
        }

        let entry = resolve(sb.as_ref(), &root, path)?;
        let inode = match entry.inode() {
            Some(inode) => {
                if options.flags.contains(OpenFlags::EXCLUSIVE) {
                    return Err(GraphError::AlreadyExists(path.to_string()));
                }
                inode
            }
            None if options.flags.contains(OpenFlags::CREATE) => sb.create(&entry, &options)?,
            None => return Err(GraphError::NotFound(path.to_string())),
        };
        let pinned = entry.acquire();
        Ok(NodeHandle::new(sb, inode, Some(pinned), path.clone(), options))
    }

    fn open_in_transaction(
        &self,
        sb: Arc<dyn SuperBlock>,
        root: &Arc<CacheEntry>,
        path: &Path,
        options: OpenOptions,
        tx: &Arc<Transaction>,
    ) -> GraphResult<NodeHandle> {
        let exclusive = options.flags.contains(OpenFlags::EXCLUSIVE);
        match self.locate(sb.as_ref(), root, path, tx)? {
            Located::Existing(entry) => {
                if exclusive {
                    return Err(GraphError::AlreadyExists(path.to_string()));
                }
                let inode = entry.inode().ok_or_else(|| GraphError::NotFound(path.to_string()))?;
                let pinned = entry.acquire();
                Ok(NodeHandle::new(sb, inode, Some(pinned), path.clone(), options))
            }
            Located::Staged(id) => {
                if exclusive {
                    return Err(GraphError::AlreadyExists(path.to_string()));
                }
                let inode = sb.make_inode(id)?;
                Ok(NodeHandle::new(sb, inode, None, path.clone(), options))
            }
            Located::Missing { parent_id } => {
                if !options.flags.contains(OpenFlags::CREATE) {
                    return Err(GraphError::NotFound(path.to_string()));
                }
                let (inode, allocated) = match options.force_inode {
                    Some(id) => (sb.make_inode(id)?, false),
                    None => (sb.allocate_inode()?, true),
                };
                if let Err(err) = tx.stage_create(&sb, path, parent_id, inode.id(), allocated) {
                    if allocated {
                        if let Err(free_err) = sb.free_id(inode.id()) {
                            warn!(inode = inode.id(), error = %free_err, "failed to return id of failed create");
                        }
                    }
                    return Err(err);
                }
                debug!(xid = tx.xid(), inode = inode.id(), path = %path, "staged create");
                Ok(NodeHandle::new(sb, inode, None, path.clone(), options))
            }
        }
    }

    /// Where `path` lands as `tx` sees it. The transaction's own edge
    /// changes on the parent win over staged creates and the entry cache.
    fn locate(&self, sb: &dyn SuperBlock, root: &Arc<CacheEntry>, path: &Path, tx: &Transaction) -> GraphResult<Located> {
        let (Some(parent), Some(name)) = (path.parent(), path.name()) else {
            return Ok(Located::Existing(Arc::clone(root)));
        };

        let located_parent = self.locate(sb, root, &parent, tx)?;
        let parent_id = match &located_parent {
            Located::Existing(entry) => entry
                .inode()
                .map(|i| i.id())
                .ok_or_else(|| GraphError::NotFound(parent.to_string()))?,
            Located::Staged(id) => *id,
            Located::Missing { .. } => return Err(GraphError::NotFound(parent.to_string())),
        };

        if let Some(edge) = tx.staged_edge(path.partition(), parent_id, name) {
            if edge.is_removed() {
                return Ok(Located::Missing { parent_id });
            }
            return Ok(Located::Staged(edge.to_index));
        }
        if let Some(id) = tx.staged_inode(path) {
            return Ok(Located::Staged(id));
        }

        match located_parent {
            Located::Existing(parent_entry) => {
                let child = parent_entry.lookup_child(sb, name)?;
                if child.is_negative() {
                    Ok(Located::Missing { parent_id })
                } else {
                    Ok(Located::Existing(child))
                }
            }
            _ => Ok(Located::Missing { parent_id }),
        }
    }

    pub fn read(&self, path: &Path) -> GraphResult<SerializedNode> {
        self.open_node(path, OpenOptions::read())?.read()
    }

    /// Write `node` at `path`, creating the node if needed.
    pub fn write(&self, path: &Path, node: &SerializedNode) -> GraphResult<()> {
        self.open_node(path, OpenOptions::create_if_missing())?.write(node)
    }

    pub fn read_edge(&self, path: &Path, key: &EdgeKey) -> GraphResult<SerializedEdge> {
        self.open_node(path, OpenOptions::read())?.read_edge(key)
    }

    pub fn read_edges(&self, path: &Path) -> GraphResult<Vec<SerializedEdge>> {
        self.open_node(path, OpenOptions::read())?.read_edges()
    }

    pub fn begin_transaction(&self) -> GraphResult<Arc<Transaction>> {
        self.check_open()?;
        self.transactions.begin(false)
    }

    pub fn begin_read_only_transaction(&self) -> GraphResult<Arc<Transaction>> {
        self.check_open()?;
        self.transactions.begin(true)
    }

    pub fn create_replication_slot(&self, options: ReplicationSlotOptions) -> GraphResult<Arc<ReplicationSlot>> {
        self.check_open()?;
        self.replication.create_slot(options)
    }

    pub fn set_listener(&self, listener: Option<Arc<dyn TransactionListener>>) {
        *self.listener.write() = listener;
    }

    /// Reject a log that mutates a read-only partition.
    pub(crate) fn check_writable(&self, log: &[JournalEntry]) -> GraphResult<()> {
        for entry in log.iter().filter(|e| e.op.is_mutation()) {
            let Some(path) = &entry.path else {
                continue;
            };
            let sb = self.superblock(path.partition())?;
            if sb.read_only() {
                return Err(GraphError::Unsupported {
                    backend: sb.backend(),
                    operation: op_name(entry.op),
                });
            }
        }
        Ok(())
    }

    /// Replay a complete committed log against the backing stores.
    ///
    /// Mutations are applied in log order through one handle per touched
    /// inode, each opened by path with its logged id forced, so replaying
    /// the same log again lands on the same ids and values. Touched
    /// superblocks are flushed before the listener is told.
    pub fn apply_transaction(&self, log: &[JournalEntry]) -> GraphResult<()> {
        self.apply_log(log)?;
        self.notify_listener(log.first().map_or(0, |e| e.xid), log);
        Ok(())
    }

    /// Apply without telling the listener; commit notifies once the
    /// transaction's own lock is released.
    pub(crate) fn apply_log(&self, log: &[JournalEntry]) -> GraphResult<()> {
        self.check_open()?;
        validate_log(log, true)?;
        let xid = log.first().map_or(0, |e| e.xid);
        if log.last().map(|e| e.op) != Some(JournalOp::Commit) {
            return Err(GraphError::invalid_log(xid, "only committed logs can be applied"));
        }

        let mut handles: HashMap<(String, i64), NodeHandle> = HashMap::new();
        for entry in log.iter().filter(|e| e.op.is_mutation()) {
            let path = entry
                .path
                .as_ref()
                .ok_or_else(|| GraphError::invalid_log(xid, "mutation without a path"))?;
            let key = (path.partition().to_string(), entry.inode);
            if !handles.contains_key(&key) {
                let handle = self.open_for_apply(path, entry.inode)?;
                handles.insert(key.clone(), handle);
            }
            let Some(handle) = handles.get(&key) else {
                continue;
            };

            match (entry.op, &entry.node, &entry.edge) {
                (JournalOp::Write, Some(node), _) => handle.write(node)?,
                (JournalOp::SetEdge, _, Some(edge)) => handle.set_edge(edge)?,
                (JournalOp::RemoveEdge, _, Some(edge)) => handle.remove_edge(&edge.key)?,
                _ => return Err(GraphError::invalid_log(xid, format!("malformed {:?} at rid {}", entry.op, entry.rid))),
            }
        }

        let mut flushed: Vec<String> = Vec::new();
        for (partition, _) in handles.keys() {
            if flushed.contains(partition) {
                continue;
            }
            self.superblock(partition)?.flush()?;
            flushed.push(partition.clone());
        }
        drop(handles);

        debug!(xid, entries = log.len(), "applied transaction");
        Ok(())
    }

    fn open_for_apply(&self, path: &Path, id: i64) -> GraphResult<NodeHandle> {
        let options = OpenOptions::create_if_missing().force_inode(id);
        let handle = self.open_node(path, options.clone())?;
        if handle.id()? == id {
            return Ok(handle);
        }

        warn!(path = %path, resolved = handle.id()?, logged = id, "path rebound since logged; applying to logged id");
        let sb = self.superblock(path.partition())?;
        let inode = sb.make_inode(id)?;
        Ok(NodeHandle::new(sb, inode, None, path.clone(), options))
    }

    pub(crate) fn notify_listener(&self, xid: u64, log: &[JournalEntry]) {
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            if let Err(err) = listener.on_commit(xid, log) {
                error!(xid, error = %err, "commit listener failed");
            }
        }
    }

    /// Evict unreferenced cache entries in every attached partition.
    pub fn prune_cache(&self) -> GraphResult<usize> {
        let superblocks: Vec<Arc<dyn SuperBlock>> = self.superblocks.lock().values().cloned().collect();
        let mut evicted = 0;
        for sb in superblocks {
            evicted += sb.root()?.prune();
        }
        Ok(evicted)
    }

    /// Close slots, roll back open transactions, then close superblocks,
    /// journal, checkpoint and metadata. Idempotent; the first error wins.
    pub fn close(&self) -> GraphResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut first_err = None;
        let mut keep = |result: GraphResult<()>| {
            if let Err(err) = result {
                warn!(error = %err, "error while closing virtual graph");
                first_err.get_or_insert(err);
            }
        };

        keep(self.replication.close());
        keep(self.transactions.close());
        let superblocks: Vec<Arc<dyn SuperBlock>> = self.superblocks.lock().drain().map(|(_, sb)| sb).collect();
        for sb in superblocks {
            keep(sb.close());
        }
        keep(self.journal.close());
        keep(self.checkpoint.close());
        keep(self.metadata.close());

        info!("closed virtual graph");
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for VirtualGraph {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "close on drop failed");
        }
    }
}

fn op_name(op: JournalOp) -> &'static str {
    match op {
        JournalOp::Write => "write",
        JournalOp::SetEdge => "set_edge",
        JournalOp::RemoveEdge => "remove_edge",
        _ => "journal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::KvSuperBlock;
    use crate::path::PathElement;
    use tempfile::TempDir;

    fn open_graph(dir: &TempDir) -> (Arc<VirtualGraph>, Arc<KvStore>) {
        let store = Arc::new(KvStore::in_memory());
        let graph = VirtualGraph::open(dir.path(), Config::relaxed(), KvSuperBlock::provider(Arc::clone(&store))).unwrap();
        (graph, store)
    }

    fn path(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    fn node(version: i64, data: &[u8]) -> SerializedNode {
        SerializedNode {
            version,
            data: Some(data.to_vec()),
            ..Default::default()
        }
    }

    #[test]
    fn test_fresh_graph_initializes_checkpoint() {
        let dir = TempDir::new().unwrap();
        let (graph, _store) = open_graph(&dir);
        assert_eq!(graph.checkpoint().get().unwrap(), Some(0));
    }

    #[test]
    fn test_open_flags() {
        let dir = TempDir::new().unwrap();
        let (graph, _store) = open_graph(&dir);
        let p = path("R/a");

        assert!(graph.open_node(&p, OpenOptions::read()).unwrap_err().is_not_found());
        graph.write(&p, &node(1, b"v")).unwrap();

        let exclusive = OpenOptions::create_if_missing().with_flags(OpenFlags::EXCLUSIVE);
        assert!(matches!(graph.open_node(&p, exclusive), Err(GraphError::AlreadyExists(_))));
        assert_eq!(graph.read(&p).unwrap().version, 1);
    }

    #[test]
    fn test_superblocks_are_cached() {
        let dir = TempDir::new().unwrap();
        let (graph, _store) = open_graph(&dir);
        let a = graph.superblock("R").unwrap();
        let b = graph.superblock("R").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_staged_create_visible_only_in_transaction() {
        let dir = TempDir::new().unwrap();
        let (graph, _store) = open_graph(&dir);
        let tx = graph.begin_transaction().unwrap();
        let opts = OpenOptions::create_if_missing().transaction(Arc::clone(&tx));

        let a = graph.open_node(&path("R/a"), opts.clone()).unwrap();
        let b = graph.open_node(&path("R/a/b"), opts.clone()).unwrap();
        b.write(&node(1, b"staged")).unwrap();

        assert_eq!(b.read().unwrap().data, Some(b"staged".to_vec()));
        let edges = a.read_edges().unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].key, PathElement::new("b").unwrap());
        assert!(graph.read(&path("R/a/b")).unwrap_err().is_not_found());

        drop((a, b));
        tx.commit().unwrap();
        assert_eq!(graph.read(&path("R/a/b")).unwrap().data, Some(b"staged".to_vec()));
    }

    #[test]
    fn test_listener_sees_committed_log() {
        let dir = TempDir::new().unwrap();
        let (graph, _store) = open_graph(&dir);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: Arc<dyn TransactionListener> = Arc::new(move |xid: u64, log: &[JournalEntry]| -> GraphResult<()> {
            sink.lock().push((xid, log.len()));
            Ok(())
        });
        graph.set_listener(Some(listener));

        let tx = graph.begin_transaction().unwrap();
        let h = graph
            .open_node(&path("R/x"), OpenOptions::create_if_missing().transaction(Arc::clone(&tx)))
            .unwrap();
        h.write(&node(1, b"x")).unwrap();
        drop(h);
        tx.commit().unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], (tx.xid(), 4));
    }

    #[test]
    fn test_listener_can_inspect_committing_transaction() {
        let dir = TempDir::new().unwrap();
        let (graph, _store) = open_graph(&dir);
        let tx = graph.begin_transaction().unwrap();
        let watched = Arc::downgrade(&tx);
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        let listener: Arc<dyn TransactionListener> = Arc::new(move |_: u64, _: &[JournalEntry]| -> GraphResult<()> {
            if let Some(tx) = watched.upgrade() {
                *sink.lock() = Some((tx.is_open(), tx.log().len()));
            }
            Ok(())
        });
        graph.set_listener(Some(listener));

        tx.notify(b"n".to_vec()).unwrap();
        tx.commit().unwrap();
        assert_eq!(*seen.lock(), Some((false, 3)));
    }

    #[test]
    fn test_failing_listener_does_not_fail_commit() {
        let dir = TempDir::new().unwrap();
        let (graph, _store) = open_graph(&dir);
        let listener: Arc<dyn TransactionListener> =
            Arc::new(|_: u64, _: &[JournalEntry]| -> GraphResult<()> { Err(GraphError::Closed("indexer")) });
        graph.set_listener(Some(listener));

        let tx = graph.begin_transaction().unwrap();
        tx.notify(b"n".to_vec()).unwrap();
        tx.commit().unwrap();
        assert_eq!(graph.checkpoint().get().unwrap(), Some(graph.journal().head()));
    }

    #[test]
    fn test_apply_rejects_incomplete_log() {
        let dir = TempDir::new().unwrap();
        let (graph, _store) = open_graph(&dir);
        let begin = JournalEntry { xid: 1, rid: 1, ..JournalEntry::new(JournalOp::Begin) };
        assert!(graph.apply_transaction(&[begin]).unwrap_err().is_integrity());
    }

    #[test]
    fn test_prune_and_close() {
        let dir = TempDir::new().unwrap();
        let (graph, _store) = open_graph(&dir);
        graph.write(&path("R/a"), &node(1, b"a")).unwrap();
        graph.resolve(&path("R/missing")).unwrap();
        assert_eq!(graph.prune_cache().unwrap(), 2);

        let tx = graph.begin_transaction().unwrap();
        tx.notify(vec![]).unwrap();
        graph.close().unwrap();
        graph.close().unwrap();
        assert!(!tx.is_open());
        assert!(matches!(graph.read(&path("R/a")), Err(GraphError::Closed(_))));
    }
}
