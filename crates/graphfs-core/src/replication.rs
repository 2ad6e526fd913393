//! Replication slots: committed transactions as an ordered change stream.
//!
//! A slot is a cursor (`last_lsn`, the rid of the last journal record it
//! consumed) over the journal. Reading regroups records by xid and emits one
//! [`ReplicationMessage`] per transaction when its Commit is reached, so the
//! stream follows commit order and never exposes uncommitted or rolled-back
//! work. End of journal is not an error: `read` simply fills less than the
//! whole buffer and the caller polls again later.
//!
//! Persistent slots keep their cursor in the metadata store under
//! `replication-slot-lsn:<name>` (8 bytes, big-endian) and only write it on
//! [`ReplicationSlot::flush_position`] or [`ReplicationSlot::set_last_lsn`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{GraphError, GraphResult};
use crate::journal::{Journal, SCAN_BATCH};
use crate::kv::KvStore;
use crate::record::{JournalEntry, JournalOp};

const CURSOR_PREFIX: &str = "replication-slot-lsn:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationSlotOptions {
    pub name: String,
    /// Keep the cursor across restarts
    pub persistent: bool,
}

impl ReplicationSlotOptions {
    pub fn persistent(name: impl Into<String>) -> Self {
        Self { name: name.into(), persistent: true }
    }

    pub fn transient(name: impl Into<String>) -> Self {
        Self { name: name.into(), persistent: false }
    }
}

/// One committed transaction: its xid and every entry from Begin to Commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationMessage {
    pub xid: u64,
    pub entries: Vec<JournalEntry>,
}

#[derive(Default)]
struct SlotState {
    last_lsn: u64,
    loaded: bool,
    in_flight: BTreeMap<u64, Vec<JournalEntry>>,
}

pub struct ReplicationSlot {
    name: String,
    persistent: bool,
    journal: Arc<Journal>,
    metadata: Arc<KvStore>,
    state: Mutex<SlotState>,
    closed: AtomicBool,
}

impl ReplicationSlot {
    fn new(options: ReplicationSlotOptions, journal: Arc<Journal>, metadata: Arc<KvStore>) -> Self {
        Self {
            name: options.name,
            persistent: options.persistent,
            journal,
            metadata,
            state: Mutex::new(SlotState::default()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    fn check_open(&self) -> GraphResult<()> {
        if self.is_closed() {
            return Err(GraphError::Closed("replication slot"));
        }
        Ok(())
    }

    fn cursor_key(&self) -> String {
        format!("{}{}", CURSOR_PREFIX, self.name)
    }

    fn load(&self, state: &mut SlotState) -> GraphResult<()> {
        if state.loaded {
            return Ok(());
        }
        if self.persistent {
            if let Some(bytes) = self.metadata.get(self.cursor_key().as_bytes())? {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    GraphError::Codec(format!("slot {} cursor is {} bytes, expected 8", self.name, bytes.len()))
                })?;
                state.last_lsn = u64::from_be_bytes(raw);
            }
        }
        state.loaded = true;
        debug!(slot = %self.name, last_lsn = state.last_lsn, "loaded replication cursor");
        Ok(())
    }

    fn persist(&self, lsn: u64) -> GraphResult<()> {
        if !self.persistent {
            return Ok(());
        }
        self.metadata.put(self.cursor_key().as_bytes(), &lsn.to_be_bytes())
    }

    /// Fill `buf` with committed transactions past the cursor.
    ///
    /// Returns how many messages were written. Rolled-back transactions are
    /// consumed but never emitted. Reading stops as soon as the buffer is
    /// full so no record is consumed without being delivered.
    pub fn read(&self, buf: &mut [ReplicationMessage]) -> GraphResult<usize> {
        self.check_open()?;
        let mut state = self.state.lock();
        self.load(&mut state)?;

        let mut filled = 0;
        'scan: while filled < buf.len() {
            let batch = self.journal.iterate(state.last_lsn + 1, SCAN_BATCH)?;
            if batch.is_empty() {
                break;
            }
            for entry in batch {
                if filled == buf.len() {
                    break 'scan;
                }
                let xid = entry.xid;
                let rid = entry.rid;

                if entry.op == JournalOp::Begin {
                    state.in_flight.insert(xid, vec![entry]);
                } else {
                    if !state.in_flight.contains_key(&xid) {
                        // Begin lies behind the cursor: rebuild from the journal.
                        let earlier = self.journal.collect_transaction(xid, rid - 1)?;
                        state.in_flight.insert(xid, earlier);
                    }
                    let op = entry.op;
                    if let Some(log) = state.in_flight.get_mut(&xid) {
                        log.push(entry);
                    }
                    if op.is_terminal() {
                        let entries = state.in_flight.remove(&xid).unwrap_or_default();
                        if op == JournalOp::Commit {
                            buf[filled] = ReplicationMessage { xid, entries };
                            filled += 1;
                        }
                    }
                }
                state.last_lsn = rid;
            }
        }
        Ok(filled)
    }

    /// Rid of the last record consumed.
    pub fn last_lsn(&self) -> GraphResult<u64> {
        self.check_open()?;
        let mut state = self.state.lock();
        self.load(&mut state)?;
        Ok(state.last_lsn)
    }

    /// Move the cursor. In-flight transactions are discarded and rebuilt
    /// from the journal as their records come up again.
    pub fn set_last_lsn(&self, lsn: u64) -> GraphResult<()> {
        self.check_open()?;
        let mut state = self.state.lock();
        state.last_lsn = lsn;
        state.loaded = true;
        state.in_flight.clear();
        self.persist(lsn)
    }

    /// Persist the current cursor. A no-op for transient slots.
    pub fn flush_position(&self) -> GraphResult<()> {
        self.check_open()?;
        let mut state = self.state.lock();
        self.load(&mut state)?;
        self.persist(state.last_lsn)
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(slot = %self.name, "closed replication slot");
        }
    }
}

impl std::fmt::Debug for ReplicationSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationSlot")
            .field("name", &self.name)
            .field("persistent", &self.persistent)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Creates slots and closes them with the graph.
pub struct ReplicationManager {
    journal: Arc<Journal>,
    metadata: Arc<KvStore>,
    slots: Mutex<HashMap<String, Arc<ReplicationSlot>>>,
}

impl ReplicationManager {
    pub fn new(journal: Arc<Journal>, metadata: Arc<KvStore>) -> Self {
        Self {
            journal,
            metadata,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Open slot `options.name`, reusing a live slot of the same name.
    pub fn create_slot(&self, options: ReplicationSlotOptions) -> GraphResult<Arc<ReplicationSlot>> {
        if options.name.is_empty() {
            return Err(GraphError::InvalidArgument("replication slot name must not be empty".into()));
        }

        let mut slots = self.slots.lock();
        if let Some(existing) = slots.get(&options.name).filter(|s| !s.is_closed()) {
            if existing.persistent != options.persistent {
                return Err(GraphError::AlreadyExists(format!(
                    "replication slot {} with different persistence",
                    options.name
                )));
            }
            return Ok(Arc::clone(existing));
        }

        let slot = Arc::new(ReplicationSlot::new(
            options.clone(),
            Arc::clone(&self.journal),
            Arc::clone(&self.metadata),
        ));
        slots.insert(options.name.clone(), Arc::clone(&slot));
        info!(slot = %options.name, persistent = options.persistent, "created replication slot");
        Ok(slot)
    }

    pub fn close(&self) -> GraphResult<()> {
        for (_, slot) in self.slots.lock().drain() {
            slot.close();
        }
        Ok(())
    }
}
