//! Transactions and their staged overlay.
//!
//! A [`Transaction`] collects an ordered log of journal entries. Every entry
//! is written to the journal before it is accepted, and mutations are
//! mirrored into an in-memory overlay so handles bound to the transaction
//! read their own uncommitted writes. Nothing reaches a backing store until
//! commit, where the transaction manager replays the log. Rollback only has
//! to discard the overlay.
//!
//! State machine: open → committed | rolled back. Both terminal transitions
//! are single-use; a second attempt fails with `Closed`.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{GraphError, GraphResult};
use crate::inode::INode;
use crate::journal::Journal;
use crate::path::{EdgeKey, Path};
use crate::record::{now_nanos, JournalEntry, JournalOp};
use crate::superblock::SuperBlock;
use crate::txmgr::TransactionManager;
use crate::types::{EdgeFlags, SerializedEdge, SerializedNode};

/// Staged view of one inode: last node state and edges touched so far.
/// Removed edges stay in the map as tombstones.
#[derive(Debug, Default)]
struct StagedNode {
    node: Option<SerializedNode>,
    edges: BTreeMap<EdgeKey, SerializedEdge>,
}

/// Overlay key: (partition, inode id)
type StagedKey = (String, i64);

#[derive(Default)]
pub(crate) struct TxState {
    pub(crate) xid: u64,
    pub(crate) log: Vec<JournalEntry>,
    pub(crate) done: bool,
    overlay: HashMap<StagedKey, StagedNode>,
    staged_paths: HashMap<Path, i64>,
    /// Ids allocated for staged creates; returned to their store on rollback
    allocated: Vec<(Arc<dyn SuperBlock>, i64)>,
}

impl TxState {
    fn stage(&mut self, entry: &JournalEntry) {
        let Some(path) = &entry.path else {
            return;
        };
        let key = (path.partition().to_string(), entry.inode);
        match (entry.op, &entry.node, &entry.edge) {
            (JournalOp::Write, Some(node), _) => {
                self.overlay.entry(key).or_default().node = Some(node.clone());
            }
            (JournalOp::SetEdge, _, Some(edge)) => {
                self.overlay.entry(key).or_default().edges.insert(edge.key.clone(), edge.clone());
            }
            (JournalOp::RemoveEdge, _, Some(edge)) => {
                let mut tombstone = edge.clone();
                tombstone.flags.insert(EdgeFlags::REMOVED);
                self.overlay.entry(key).or_default().edges.insert(edge.key.clone(), tombstone);
            }
            _ => {}
        }
    }
}

pub struct Transaction {
    manager: Weak<TransactionManager>,
    serial: u64,
    journal: Arc<Journal>,
    read_only: bool,
    state: Mutex<TxState>,
}

impl Transaction {
    pub(crate) fn new(manager: Weak<TransactionManager>, serial: u64, journal: Arc<Journal>, read_only: bool) -> Self {
        Self {
            manager,
            serial,
            journal,
            read_only,
            state: Mutex::new(TxState::default()),
        }
    }

    /// Transaction id; 0 until the first entry has been journaled.
    pub fn xid(&self) -> u64 {
        self.state.lock().xid
    }

    pub fn is_open(&self) -> bool {
        !self.state.lock().done
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Snapshot of the entries appended so far.
    pub fn log(&self) -> Vec<JournalEntry> {
        self.state.lock().log.clone()
    }

    /// Journal `entry` and stage its effect.
    ///
    /// A Begin is synthesized first when the log is empty. Terminal entries
    /// are reserved for [`commit`](Self::commit) and
    /// [`rollback`](Self::rollback).
    pub fn append(&self, entry: JournalEntry) -> GraphResult<()> {
        let mut state = self.state.lock();
        if state.done {
            return Err(GraphError::Closed("transaction"));
        }
        if self.read_only {
            return Err(GraphError::PermissionDenied(format!(
                "read-only transaction cannot append {:?}",
                entry.op
            )));
        }
        if entry.op.is_terminal() {
            return Err(GraphError::invalid_log(state.xid, "terminal entries are appended by commit or rollback"));
        }
        self.write_entry(&mut state, entry)
    }

    /// Append a pass-through Notify entry carrying `payload`.
    pub fn notify(&self, payload: Vec<u8>) -> GraphResult<()> {
        self.append(JournalEntry {
            payload: Some(payload),
            ..JournalEntry::new(JournalOp::Notify)
        })
    }

    pub(crate) fn write_entry(&self, state: &mut TxState, mut entry: JournalEntry) -> GraphResult<()> {
        if state.done {
            return Err(GraphError::Closed("transaction"));
        }
        check_entry(state.xid, &entry)?;

        if entry.op == JournalOp::Begin {
            if !state.log.is_empty() {
                return Err(GraphError::invalid_log(state.xid, "begin inside an open transaction"));
            }
        } else {
            if state.log.is_empty() {
                let mut begin = JournalEntry::new(JournalOp::Begin);
                self.journal_begin(&mut begin)?;
                state.xid = begin.xid;
                state.log.push(begin);
            }
            entry.xid = state.xid;
        }
        if entry.ts == 0 {
            entry.ts = now_nanos();
        }

        if entry.op == JournalOp::Begin {
            self.journal_begin(&mut entry)?;
            state.xid = entry.xid;
        } else {
            self.journal.write(&mut entry)?;
        }
        state.stage(&entry);
        let terminal = entry.op.is_terminal();
        state.log.push(entry);
        if terminal {
            state.done = true;
        }
        Ok(())
    }

    fn journal_begin(&self, begin: &mut JournalEntry) -> GraphResult<()> {
        match self.manager.upgrade() {
            Some(manager) => manager.journal_begin(begin),
            None => self.journal.write(begin).map(|_| ()),
        }
    }

    /// Apply the log to the backing stores and close the transaction.
    ///
    /// An empty or read-only transaction simply closes. If validation fails
    /// the transaction stays open so the caller can roll it back. The commit
    /// listener runs after this transaction's lock is released.
    pub fn commit(&self) -> GraphResult<()> {
        let mut state = self.state.lock();
        if state.done {
            return Err(GraphError::Closed("transaction"));
        }
        if state.log.is_empty() || self.read_only {
            self.finish(&mut state);
            return Ok(());
        }

        let manager = self.manager.upgrade().ok_or(GraphError::Closed("transaction manager"))?;
        let result = manager.commit_locked(self, &mut state);
        if state.done {
            self.finish(&mut state);
        }
        let committed = result.is_ok().then(|| (state.xid, state.log.clone()));
        drop(state);

        if let Some((xid, log)) = committed {
            manager.notify_committed(xid, &log);
        }
        result
    }

    /// Journal a Rollback, return staged ids and close the transaction.
    pub fn rollback(&self) -> GraphResult<()> {
        let mut state = self.state.lock();
        if state.done {
            return Err(GraphError::Closed("transaction"));
        }

        let result = if state.log.is_empty() {
            Ok(())
        } else {
            self.write_entry(&mut state, JournalEntry::new(JournalOp::Rollback))
        };
        for (sb, id) in state.allocated.drain(..) {
            if let Err(err) = sb.free_id(id) {
                warn!(partition = sb.uuid(), inode = id, error = %err, "failed to return staged id");
            }
        }
        debug!(xid = state.xid, entries = state.log.len(), "rolled back transaction");
        self.finish(&mut state);
        result
    }

    fn finish(&self, state: &mut TxState) {
        state.done = true;
        state.overlay.clear();
        state.staged_paths.clear();
        state.allocated.clear();
        if let Some(manager) = self.manager.upgrade() {
            manager.unregister(self.serial, state.xid);
        }
    }

    /// Node state as this transaction sees it: the staged copy if any,
    /// otherwise the backing store's, which becomes the staged baseline.
    pub(crate) fn read_node(&self, sb: &Arc<dyn SuperBlock>, path: &Path, inode: &INode) -> GraphResult<SerializedNode> {
        let key = (path.partition().to_string(), inode.id());
        let mut state = self.state.lock();
        if state.done {
            return Err(GraphError::Closed("transaction"));
        }

        let node = match state.overlay.get(&key).and_then(|s| s.node.clone()) {
            Some(node) => node,
            None => {
                let node = sb.read(inode)?;
                state.overlay.entry(key).or_default().node = Some(node.clone());
                node
            }
        };
        if node.is_removed() {
            return Err(GraphError::NotFound(path.to_string()));
        }
        Ok(node)
    }

    pub(crate) fn read_edge(
        &self,
        sb: &Arc<dyn SuperBlock>,
        path: &Path,
        inode: &INode,
        edge_key: &EdgeKey,
    ) -> GraphResult<Option<SerializedEdge>> {
        let key = (path.partition().to_string(), inode.id());
        let mut state = self.state.lock();
        if state.done {
            return Err(GraphError::Closed("transaction"));
        }

        if let Some(edge) = state.overlay.get(&key).and_then(|s| s.edges.get(edge_key)) {
            return Ok(Some(edge.clone()).filter(|e| !e.is_removed()));
        }
        let edge = sb.read_edge(inode, edge_key)?;
        if let Some(edge) = &edge {
            state.overlay.entry(key).or_default().edges.insert(edge_key.clone(), edge.clone());
        }
        Ok(edge)
    }

    /// Backing-store edges with staged edges laid over them, ordered by key.
    pub(crate) fn read_edges(&self, sb: &Arc<dyn SuperBlock>, path: &Path, inode: &INode) -> GraphResult<Vec<SerializedEdge>> {
        let key = (path.partition().to_string(), inode.id());
        let state = self.state.lock();
        if state.done {
            return Err(GraphError::Closed("transaction"));
        }

        let mut merged: BTreeMap<EdgeKey, SerializedEdge> =
            sb.read_edges(inode)?.into_iter().map(|e| (e.key.clone(), e)).collect();
        if let Some(staged) = state.overlay.get(&key) {
            for (k, edge) in &staged.edges {
                merged.insert(k.clone(), edge.clone());
            }
        }
        Ok(merged.into_values().filter(|e| !e.is_removed()).collect())
    }

    /// Edge `key` of node `id` as staged by this transaction, tombstones
    /// included. `None` when the transaction never touched it.
    pub(crate) fn staged_edge(&self, partition: &str, id: i64, key: &EdgeKey) -> Option<SerializedEdge> {
        let state = self.state.lock();
        state
            .overlay
            .get(&(partition.to_string(), id))
            .and_then(|staged| staged.edges.get(key))
            .cloned()
    }

    /// Id staged for `path` by a create inside this transaction.
    pub(crate) fn staged_inode(&self, path: &Path) -> Option<i64> {
        self.state.lock().staged_paths.get(path).copied()
    }

    /// Stage the creation of `path` as node `id`: journal the parent edge
    /// and make the path visible to this transaction only.
    pub(crate) fn stage_create(
        &self,
        sb: &Arc<dyn SuperBlock>,
        path: &Path,
        parent_id: i64,
        id: i64,
        allocated: bool,
    ) -> GraphResult<()> {
        let (Some(parent), Some(name)) = (path.parent(), path.name()) else {
            return Err(GraphError::InvalidArgument(format!("cannot create partition root {}", path)));
        };
        let mut edge = SerializedEdge::new(parent_id, name.clone(), id);
        edge.to_path = Some(path.clone());

        let mut state = self.state.lock();
        if self.read_only {
            return Err(GraphError::PermissionDenied(format!("read-only transaction cannot create {}", path)));
        }
        self.write_entry(&mut state, JournalEntry::set_edge(parent_id, Some(parent), edge))?;
        state.staged_paths.insert(path.clone(), id);
        if allocated {
            state.allocated.push((Arc::clone(sb), id));
        }
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.state.get_mut().done {
            if let Err(err) = self.rollback() {
                warn!(xid = self.state.get_mut().xid, error = %err, "rollback of dropped transaction failed");
            }
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Transaction")
            .field("xid", &state.xid)
            .field("entries", &state.log.len())
            .field("done", &state.done)
            .field("read_only", &self.read_only)
            .finish()
    }
}

/// Mutations must name their target path and carry their payload.
fn check_entry(xid: u64, entry: &JournalEntry) -> GraphResult<()> {
    if !entry.op.is_mutation() {
        return Ok(());
    }
    if entry.path.is_none() {
        return Err(GraphError::invalid_log(xid, format!("{:?} without a target path", entry.op)));
    }
    let has_payload = match entry.op {
        JournalOp::Write => entry.node.is_some(),
        _ => entry.edge.is_some(),
    };
    if !has_payload {
        return Err(GraphError::invalid_log(xid, format!("{:?} without a payload", entry.op)));
    }
    Ok(())
}

/// Check the shape of a transaction log.
///
/// It must start with Begin, every entry must carry the Begin's xid, and
/// mutations must be well formed. A `complete` log ends with exactly one
/// terminal entry; an incomplete one has none.
pub fn validate_log(log: &[JournalEntry], complete: bool) -> GraphResult<()> {
    let Some(first) = log.first() else {
        return Err(GraphError::invalid_log(0, "empty transaction log"));
    };
    let xid = first.xid;
    if first.op != JournalOp::Begin {
        return Err(GraphError::invalid_log(xid, format!("log starts with {:?} instead of Begin", first.op)));
    }

    for (i, entry) in log.iter().enumerate().skip(1) {
        if entry.xid != xid {
            return Err(GraphError::invalid_log(xid, format!("entry {} belongs to transaction {}", entry.rid, entry.xid)));
        }
        if entry.op == JournalOp::Begin {
            return Err(GraphError::invalid_log(xid, format!("second Begin at rid {}", entry.rid)));
        }
        if entry.op.is_terminal() && (!complete || i + 1 != log.len()) {
            return Err(GraphError::invalid_log(xid, format!("{:?} at rid {} is not the last entry", entry.op, entry.rid)));
        }
        check_entry(xid, entry)?;
    }

    let ends_terminal = log.last().map_or(false, |e| e.op.is_terminal());
    if complete && !ends_terminal {
        return Err(GraphError::invalid_log(xid, "log has no terminal entry"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::path::PathElement;
    use tempfile::TempDir;

    fn journal() -> (Arc<Journal>, TempDir) {
        let dir = TempDir::new().unwrap();
        let journal = Arc::new(Journal::open(dir.path(), Config::relaxed()).unwrap());
        (journal, dir)
    }

    fn detached(journal: &Arc<Journal>) -> Transaction {
        Transaction::new(Weak::new(), 1, Arc::clone(journal), false)
    }

    fn path(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    #[test]
    fn test_begin_is_synthesized() {
        let (journal, _dir) = journal();
        let tx = detached(&journal);
        tx.append(JournalEntry::write(5, Some(path("R/a")), SerializedNode::default())).unwrap();

        let log = tx.log();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].op, JournalOp::Begin);
        assert_eq!(tx.xid(), log[0].rid);
        assert!(log.iter().all(|e| e.xid == tx.xid()));
        assert_eq!(journal.head(), 2);
    }

    #[test]
    fn test_terminal_append_rejected() {
        let (journal, _dir) = journal();
        let tx = detached(&journal);
        let err = tx.append(JournalEntry::new(JournalOp::Commit)).unwrap_err();
        assert!(err.is_integrity());
        assert!(tx.log().is_empty());
    }

    #[test]
    fn test_malformed_mutation_never_reaches_journal() {
        let (journal, _dir) = journal();
        let tx = detached(&journal);
        let err = tx.append(JournalEntry::new(JournalOp::Write)).unwrap_err();
        assert!(err.is_integrity());
        assert_eq!(journal.head(), 0);
    }

    #[test]
    fn test_rollback_is_single_use() {
        let (journal, _dir) = journal();
        let tx = detached(&journal);
        tx.notify(b"ping".to_vec()).unwrap();
        tx.rollback().unwrap();
        assert!(!tx.is_open());
        assert_eq!(tx.log().last().unwrap().op, JournalOp::Rollback);
        assert!(matches!(tx.rollback(), Err(GraphError::Closed(_))));
        assert!(matches!(tx.commit(), Err(GraphError::Closed(_))));
    }

    #[test]
    fn test_empty_commit_writes_nothing() {
        let (journal, _dir) = journal();
        let tx = detached(&journal);
        tx.commit().unwrap();
        assert_eq!(journal.head(), 0);
    }

    #[test]
    fn test_read_only_rejects_mutation() {
        let (journal, _dir) = journal();
        let tx = Transaction::new(Weak::new(), 1, Arc::clone(&journal), true);
        let err = tx.append(JournalEntry::write(1, Some(path("R/a")), SerializedNode::default())).unwrap_err();
        assert!(matches!(err, GraphError::PermissionDenied(_)));
        tx.commit().unwrap();
    }

    #[test]
    fn test_drop_rolls_back() {
        let (journal, _dir) = journal();
        {
            let tx = detached(&journal);
            tx.notify(vec![1]).unwrap();
        }
        let last = journal.read(journal.head()).unwrap().unwrap();
        assert_eq!(last.op, JournalOp::Rollback);
    }

    #[test]
    fn test_overlay_shadows_store() {
        use crate::datastore::KvSuperBlock;

        let (journal, _dir) = journal();
        let kv = KvSuperBlock::in_memory("R");
        let sb: Arc<dyn SuperBlock> = kv.clone();
        let inode = sb.make_inode(4).unwrap();
        let stored = SerializedNode { index: 4, version: 1, ..Default::default() };
        sb.write(&inode, &stored).unwrap();
        let key = PathElement::new("k").unwrap();
        sb.set_edge(&inode, &SerializedEdge::new(4, key.clone(), 9)).unwrap();

        let tx = detached(&journal);
        let p = path("R/n");
        assert_eq!(tx.read_node(&sb, &p, &inode).unwrap(), stored);

        let staged = SerializedNode { index: 4, version: 2, ..Default::default() };
        tx.append(JournalEntry::write(4, Some(p.clone()), staged.clone())).unwrap();
        tx.append(JournalEntry::remove_edge(4, Some(p.clone()), SerializedEdge::tombstone(4, key.clone()))).unwrap();

        assert_eq!(tx.read_node(&sb, &p, &inode).unwrap(), staged);
        assert!(tx.read_edge(&sb, &p, &inode, &key).unwrap().is_none());
        assert!(tx.read_edges(&sb, &p, &inode).unwrap().is_empty());

        assert_eq!(sb.read(&inode).unwrap(), stored);
        assert_eq!(sb.read_edges(&inode).unwrap().len(), 1);
    }

    #[test]
    fn test_validate_log_shapes() {
        let begin = JournalEntry { xid: 1, rid: 1, ..JournalEntry::new(JournalOp::Begin) };
        let commit = JournalEntry { xid: 1, rid: 2, ..JournalEntry::new(JournalOp::Commit) };
        let stray = JournalEntry { xid: 1, rid: 3, ..JournalEntry::new(JournalOp::Notify) };

        assert!(validate_log(&[begin.clone(), commit.clone()], true).is_ok());
        assert!(validate_log(&[begin.clone()], false).is_ok());
        assert!(validate_log(&[begin.clone()], true).is_err());
        assert!(validate_log(&[commit.clone()], true).is_err());
        assert!(validate_log(&[begin.clone(), commit.clone(), stray], true).is_err());
        assert!(validate_log(&[begin, commit.clone(), commit], true).is_err());
        assert!(validate_log(&[], false).is_err());
    }
}
