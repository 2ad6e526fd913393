//! Transaction manager: commit protocol and crash recovery.
//!
//! Commit, in order:
//! 1. Validate the log shape and that every mutated partition is writable
//!    (a rejection leaves the transaction open)
//! 2. Journal the Commit record (synced)
//! 3. Replay the log against the backing stores
//! 4. Advance the checkpoint to the Commit's rid
//!
//! If step 3 fails the Commit is already durable. The checkpoint is then
//! held where it is so the next recovery replays the transaction; replay is
//! idempotent because every mutation is a by-value overwrite.
//!
//! A failed apply therefore does not stop the transaction from existing:
//! its Commit is in the journal, replication slots emit it, and the
//! checkpoint stays behind it until the next recovery replays it.
//!
//! Recovery scans the journal from the recovery horizon, regroups records by
//! xid, applies each transaction whose Commit lies past the checkpoint and
//! journals a Rollback for every transaction the crash left open. The
//! horizon is the lower of `checkpoint + 1` and the Begin of the oldest
//! transaction that was open when the checkpoint last moved; it lives in the
//! metadata store under `recovery-horizon` (8 bytes, big-endian). Without a
//! stored horizon the scan starts at the first record.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::checkpoint::Checkpoint;
use crate::error::{GraphError, GraphResult};
use crate::graph::VirtualGraph;
use crate::journal::{Journal, SCAN_BATCH};
use crate::kv::KvStore;
use crate::record::{JournalEntry, JournalOp};
use crate::transaction::{validate_log, Transaction, TxState};

/// What a recovery pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Checkpoint the scan started from (None: never checkpointed)
    pub checkpoint: Option<u64>,
    /// Journal records read
    pub scanned: u64,
    /// Committed transactions replayed
    pub applied: u64,
    /// Transactions that had already rolled back
    pub rolled_back: u64,
    /// Incomplete transactions closed with a journaled Rollback
    pub forced_rollbacks: u64,
}

const HORIZON_KEY: &[u8] = b"recovery-horizon";

pub struct TransactionManager {
    graph: Weak<VirtualGraph>,
    journal: Arc<Journal>,
    checkpoint: Arc<dyn Checkpoint>,
    metadata: Arc<KvStore>,
    /// Xids whose Begin is journaled and whose transaction is still open.
    /// Begin records are written under this lock.
    open_xids: Mutex<BTreeSet<u64>>,
    /// Last horizon written to the metadata store.
    horizon: Mutex<Option<u64>>,
    /// Serializes commits so the checkpoint tracks the latest applied Commit.
    commit_lock: Mutex<()>,
    /// Set after a failed apply; the checkpoint stays put until recovery.
    held: Mutex<Option<u64>>,
    active: Mutex<HashMap<u64, Weak<Transaction>>>,
    next_serial: AtomicU64,
    closed: AtomicBool,
}

impl TransactionManager {
    pub(crate) fn new(
        graph: Weak<VirtualGraph>,
        journal: Arc<Journal>,
        checkpoint: Arc<dyn Checkpoint>,
        metadata: Arc<KvStore>,
    ) -> Self {
        Self {
            graph,
            journal,
            checkpoint,
            metadata,
            open_xids: Mutex::new(BTreeSet::new()),
            horizon: Mutex::new(None),
            commit_lock: Mutex::new(()),
            held: Mutex::new(None),
            active: Mutex::new(HashMap::new()),
            next_serial: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    fn check_open(&self) -> GraphResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GraphError::Closed("transaction manager"));
        }
        Ok(())
    }

    fn graph(&self) -> GraphResult<Arc<VirtualGraph>> {
        self.graph.upgrade().ok_or(GraphError::Closed("virtual graph"))
    }

    pub fn begin(self: &Arc<Self>, read_only: bool) -> GraphResult<Arc<Transaction>> {
        self.check_open()?;
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let tx = Arc::new(Transaction::new(Arc::downgrade(self), serial, Arc::clone(&self.journal), read_only));
        self.active.lock().insert(serial, Arc::downgrade(&tx));
        Ok(tx)
    }

    /// Open transactions.
    pub fn active_count(&self) -> usize {
        self.active.lock().values().filter(|w| w.strong_count() > 0).count()
    }

    pub(crate) fn unregister(&self, serial: u64, xid: u64) {
        self.active.lock().remove(&serial);
        self.open_xids.lock().remove(&xid);
    }

    /// Journal a transaction's Begin and record its xid as open in one step,
    /// so a concurrent checkpoint advance either sees the xid or precedes
    /// the Begin in the journal.
    pub(crate) fn journal_begin(&self, begin: &mut JournalEntry) -> GraphResult<()> {
        let mut open = self.open_xids.lock();
        self.journal.write(begin)?;
        open.insert(begin.xid);
        Ok(())
    }

    /// Oldest rid a recovery must read for the checkpoint to be enough.
    fn horizon_for(&self, checkpoint: u64) -> u64 {
        let open = self.open_xids.lock();
        open.iter().next().map_or(checkpoint + 1, |&oldest| oldest.min(checkpoint + 1))
    }

    fn load_horizon(&self) -> GraphResult<Option<u64>> {
        let Some(bytes) = self.metadata.get(HORIZON_KEY)? else {
            return Ok(None);
        };
        let raw: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| GraphError::Codec(format!("recovery horizon is {} bytes, expected 8", bytes.len())))?;
        Ok(Some(u64::from_be_bytes(raw)))
    }

    /// Persist `horizon` if it moved. Synced before the checkpoint it covers.
    fn store_horizon(&self, horizon: u64) -> GraphResult<()> {
        let mut stored = self.horizon.lock();
        if *stored == Some(horizon) {
            return Ok(());
        }
        self.metadata.put(HORIZON_KEY, &horizon.to_be_bytes())?;
        self.metadata.sync()?;
        *stored = Some(horizon);
        Ok(())
    }

    /// Checkpoint value the manager is holding back, if an apply failed.
    pub fn held_checkpoint(&self) -> Option<u64> {
        *self.held.lock()
    }

    pub(crate) fn commit_locked(&self, tx: &Transaction, state: &mut TxState) -> GraphResult<()> {
        self.check_open()?;
        let graph = self.graph()?;
        let _commit = self.commit_lock.lock();

        validate_log(&state.log, false)?;
        graph.check_writable(&state.log)?;

        tx.write_entry(state, JournalEntry::new(JournalOp::Commit))?;
        let xid = state.xid;
        let commit_rid = state.log.last().map_or(0, |e| e.rid);

        if let Err(err) = graph.apply_log(&state.log) {
            let mut held = self.held.lock();
            if held.is_none() {
                *held = Some(commit_rid);
            }
            error!(xid, rid = commit_rid, error = %err, "apply failed after commit was journaled; checkpoint held for recovery");
            return Err(err);
        }
        self.advance_checkpoint(commit_rid)
    }

    /// Tell the listener about a commit, outside every transaction lock.
    pub(crate) fn notify_committed(&self, xid: u64, log: &[JournalEntry]) {
        if let Ok(graph) = self.graph() {
            graph.notify_listener(xid, log);
        }
    }

    fn advance_checkpoint(&self, rid: u64) -> GraphResult<()> {
        if self.held.lock().is_some() {
            return Ok(());
        }
        self.store_horizon(self.horizon_for(rid))?;
        self.checkpoint.update(rid, true)
    }

    /// Replay the journal past the checkpoint. See the module docs.
    ///
    /// Transactions opened by this process are left alone; only those with
    /// no live owner are force-rolled-back.
    pub fn recover(&self) -> GraphResult<RecoveryReport> {
        let graph = self.graph()?;
        let _commit = self.commit_lock.lock();

        let mut report = RecoveryReport {
            checkpoint: self.checkpoint.get()?,
            ..Default::default()
        };
        let Some(checkpoint) = report.checkpoint else {
            info!("no checkpoint; skipping recovery");
            return Ok(report);
        };
        let start = match self.load_horizon()? {
            Some(horizon) => horizon.clamp(1, checkpoint + 1),
            None => 1,
        };
        info!(checkpoint, start, head = self.journal.head(), "recovery started");

        let mut open: BTreeMap<u64, Vec<JournalEntry>> = BTreeMap::new();
        let mut rid = start;
        loop {
            let batch = self.journal.iterate(rid, SCAN_BATCH)?;
            let Some(last) = batch.last() else {
                break;
            };
            rid = last.rid + 1;

            for entry in batch {
                report.scanned += 1;
                let xid = entry.xid;
                if entry.op == JournalOp::Begin {
                    if open.insert(xid, vec![entry]).is_some() {
                        return Err(GraphError::invalid_log(xid, "transaction begun twice"));
                    }
                    continue;
                }

                if !open.contains_key(&xid) {
                    if xid == 0 || xid >= start {
                        return Err(GraphError::invalid_log(xid, format!("record {} for unknown transaction", entry.rid)));
                    }
                    open.insert(xid, self.journal.collect_transaction(xid, start - 1)?);
                }

                let op = entry.op;
                let commit_rid = entry.rid;
                if let Some(log) = open.get_mut(&xid) {
                    log.push(entry);
                }
                if !op.is_terminal() {
                    continue;
                }

                let log = open.remove(&xid).unwrap_or_default();
                if commit_rid <= checkpoint {
                    // Closed before the checkpoint; read only to learn it ended.
                    continue;
                }
                if op == JournalOp::Commit {
                    graph.apply_transaction(&log)?;
                    self.checkpoint.update(commit_rid, true)?;
                    report.applied += 1;
                } else {
                    report.rolled_back += 1;
                }
            }
        }

        let live: BTreeSet<u64> = self.open_xids.lock().clone();
        for xid in open.into_keys() {
            if live.contains(&xid) {
                continue;
            }
            let mut rollback = JournalEntry {
                xid,
                ..JournalEntry::new(JournalOp::Rollback)
            };
            self.journal.write(&mut rollback)?;
            warn!(xid, rid = rollback.rid, "rolled back incomplete transaction");
            report.forced_rollbacks += 1;
        }

        *self.held.lock() = None;
        let checkpoint = self.checkpoint.get()?.unwrap_or(checkpoint);
        self.store_horizon(self.horizon_for(checkpoint))?;
        info!(
            scanned = report.scanned,
            applied = report.applied,
            rolled_back = report.rolled_back,
            forced_rollbacks = report.forced_rollbacks,
            "recovery finished"
        );
        Ok(report)
    }

    /// Roll back every open transaction and refuse new ones. Idempotent.
    pub fn close(&self) -> GraphResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let open: Vec<Arc<Transaction>> = self.active.lock().values().filter_map(Weak::upgrade).collect();
        for tx in open {
            if !tx.is_open() {
                continue;
            }
            match tx.rollback() {
                Ok(()) => warn!(xid = tx.xid(), "rolled back transaction left open at shutdown"),
                Err(err) => warn!(xid = tx.xid(), error = %err, "forced rollback at shutdown failed"),
            }
        }
        self.active.lock().clear();
        Ok(())
    }
}
