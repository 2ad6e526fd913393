//! Write-ahead journal of transaction records.
//!
//! The journal is a single-writer segmented log of [`JournalEntry`] frames.
//! The frame sequence number is the record id (`rid`): ids start at 1 and
//! are strictly increasing across every transaction. The writer mutex is the
//! only source of that order.
//!
//! On open every segment is scanned once to rebuild an in-memory index
//! `rid → FrameLocation`; reads then seek straight to the frame.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{GraphError, GraphResult};
use crate::format::{encode_frame, FrameKind};
use crate::record::{now_nanos, JournalEntry, JournalOp};
use crate::wal::{FrameLocation, SegmentReader, SegmentWriter};

const JOURNAL_PREFIX: &str = "journal";

/// First rid ever handed out.
pub const FIRST_RID: u64 = 1;

/// Records fetched per step by linear scans.
pub(crate) const SCAN_BATCH: usize = 256;

pub struct Journal {
    dir: PathBuf,
    config: Config,
    writer: Mutex<SegmentWriter>,
    reader: SegmentReader,
    /// `locations[i]` holds rid `FIRST_RID + i`
    locations: RwLock<Vec<FrameLocation>>,
    closed: AtomicBool,
}

impl Journal {
    /// Open or create the journal in `dir`, truncating a torn tail.
    pub fn open<P: AsRef<Path>>(dir: P, config: Config) -> GraphResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        config.validate().map_err(GraphError::InvalidArgument)?;

        let reader = SegmentReader::new(&dir, JOURNAL_PREFIX);
        let frames = reader.recover()?;

        let mut locations = Vec::with_capacity(frames.len());
        for recovered in &frames {
            let expected = FIRST_RID + locations.len() as u64;
            if recovered.frame.kind != FrameKind::JournalRecord {
                return Err(GraphError::WalCorrupted {
                    path: dir.clone(),
                    offset: recovered.location.offset,
                    reason: format!("unexpected {:?} frame in journal", recovered.frame.kind),
                });
            }
            if recovered.frame.sequence != expected {
                return Err(GraphError::WalCorrupted {
                    path: dir.clone(),
                    offset: recovered.location.offset,
                    reason: format!("record id {} where {} was expected", recovered.frame.sequence, expected),
                });
            }
            locations.push(recovered.location);
        }

        let writer = SegmentWriter::open(&dir, JOURNAL_PREFIX, config.journal_rotation_size_bytes)?;
        info!(dir = %dir.display(), records = locations.len(), "opened journal");

        Ok(Self {
            dir,
            config,
            writer: Mutex::new(writer),
            reader,
            locations: RwLock::new(locations),
            closed: AtomicBool::new(false),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn check_open(&self) -> GraphResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GraphError::Closed("journal"));
        }
        Ok(())
    }

    /// Append `entry`, assigning and returning its rid.
    ///
    /// A Begin with no transaction id takes its own rid as the xid. Any other
    /// entry must already carry an xid. Terminal entries are always synced;
    /// other entries are synced only under the durable preset.
    pub fn write(&self, entry: &mut JournalEntry) -> GraphResult<u64> {
        self.check_open()?;
        let mut writer = self.writer.lock();
        let rid = FIRST_RID + self.locations.read().len() as u64;

        if entry.xid == 0 {
            if entry.op != JournalOp::Begin {
                return Err(GraphError::invalid_log(0, format!("{:?} record without a transaction id", entry.op)));
            }
            entry.xid = rid;
        }
        if entry.ts == 0 {
            entry.ts = now_nanos();
        }
        entry.rid = rid;

        let payload = entry.encode()?;
        let frame = encode_frame(FrameKind::JournalRecord, rid, &payload, self.config.max_record_size)?;
        let sync = self.config.sync_each_append() || entry.op.is_terminal();
        let location = writer.append(&frame, sync)?;
        self.locations.write().push(location);

        debug!(rid, xid = entry.xid, op = ?entry.op, "journal append");
        Ok(rid)
    }

    /// Record `rid`, or None past the write frontier.
    pub fn read(&self, rid: u64) -> GraphResult<Option<JournalEntry>> {
        self.check_open()?;
        let location = match rid.checked_sub(FIRST_RID) {
            Some(index) => self.locations.read().get(index as usize).copied(),
            None => None,
        };
        let Some(location) = location else {
            return Ok(None);
        };

        let frame = self.reader.read_at(location)?;
        let entry = JournalEntry::decode(&frame.payload)?;
        if entry.rid != rid {
            return Err(GraphError::WalCorrupted {
                path: self.dir.clone(),
                offset: location.offset,
                reason: format!("record {} decoded with rid {}", rid, entry.rid),
            });
        }
        Ok(Some(entry))
    }

    /// Up to `count` records starting at `from`. Stops quietly at the frontier.
    pub fn iterate(&self, from: u64, count: usize) -> GraphResult<Vec<JournalEntry>> {
        let from = from.max(FIRST_RID);
        let mut entries = Vec::new();
        for rid in from..from.saturating_add(count as u64) {
            match self.read(rid)? {
                Some(entry) => entries.push(entry),
                None => break,
            }
        }
        Ok(entries)
    }

    /// Records of transaction `xid` with rid in `xid..=through`.
    ///
    /// Used to rebuild a transaction whose Begin lies behind a reader's
    /// starting point. The first record must be that Begin, and no terminal
    /// record may appear in the range.
    pub fn collect_transaction(&self, xid: u64, through: u64) -> GraphResult<Vec<JournalEntry>> {
        let begin = match self.read(xid)? {
            Some(entry) if entry.op == JournalOp::Begin && entry.xid == xid => entry,
            _ => return Err(GraphError::invalid_log(xid, "no begin record at the transaction id")),
        };

        let mut log = vec![begin];
        let mut rid = xid + 1;
        while rid <= through {
            let batch = self.iterate(rid, SCAN_BATCH.min((through - rid + 1) as usize))?;
            let Some(last) = batch.last() else {
                break;
            };
            rid = last.rid + 1;
            for entry in batch.into_iter().filter(|e| e.xid == xid) {
                if entry.op == JournalOp::Begin || entry.op.is_terminal() {
                    return Err(GraphError::invalid_log(xid, format!("unexpected {:?} at rid {}", entry.op, entry.rid)));
                }
                log.push(entry);
            }
        }
        Ok(log)
    }

    /// Rid of the last record written; 0 for an empty journal.
    pub fn head(&self) -> u64 {
        self.locations.read().len() as u64
    }

    pub fn sync(&self) -> GraphResult<()> {
        self.check_open()?;
        self.writer.lock().sync()
    }

    /// Flush and refuse further use. Idempotent.
    pub fn close(&self) -> GraphResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.writer.lock().sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn begin() -> JournalEntry {
        JournalEntry::new(JournalOp::Begin)
    }

    fn tagged(op: JournalOp, xid: u64) -> JournalEntry {
        JournalEntry { xid, ..JournalEntry::new(op) }
    }

    #[test]
    fn test_rids_are_sequential_and_begin_takes_xid() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(dir.path(), Config::relaxed()).unwrap();
        assert_eq!(journal.head(), 0);

        let mut b = begin();
        assert_eq!(journal.write(&mut b).unwrap(), 1);
        assert_eq!(b.xid, 1);
        assert!(b.ts > 0);

        let mut c = tagged(JournalOp::Commit, b.xid);
        assert_eq!(journal.write(&mut c).unwrap(), 2);
        assert_eq!(journal.head(), 2);

        let read = journal.read(2).unwrap().unwrap();
        assert_eq!(read, c);
    }

    #[test]
    fn test_preset_xid_kept_on_begin() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(dir.path(), Config::relaxed()).unwrap();
        let mut b = tagged(JournalOp::Begin, 77);
        journal.write(&mut b).unwrap();
        assert_eq!(b.xid, 77);
    }

    #[test]
    fn test_entry_without_xid_rejected() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(dir.path(), Config::relaxed()).unwrap();
        let err = journal.write(&mut JournalEntry::new(JournalOp::Commit)).unwrap_err();
        assert!(err.is_integrity());
        assert_eq!(journal.head(), 0);
    }

    #[test]
    fn test_iterate_stops_at_frontier() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(dir.path(), Config::relaxed()).unwrap();
        let mut b = begin();
        journal.write(&mut b).unwrap();
        for _ in 0..3 {
            journal.write(&mut tagged(JournalOp::Notify, b.xid)).unwrap();
        }

        assert_eq!(journal.iterate(0, 100).unwrap().len(), 4);
        let tail = journal.iterate(3, 100).unwrap();
        assert_eq!(tail.iter().map(|e| e.rid).collect::<Vec<_>>(), vec![3, 4]);
        assert!(journal.iterate(5, 10).unwrap().is_empty());
        assert!(journal.read(0).unwrap().is_none());
    }

    #[test]
    fn test_reopen_continues_numbering() {
        let dir = TempDir::new().unwrap();
        {
            let journal = Journal::open(dir.path(), Config::default()).unwrap();
            let mut b = begin();
            journal.write(&mut b).unwrap();
            journal.write(&mut tagged(JournalOp::Rollback, b.xid)).unwrap();
            journal.close().unwrap();
        }
        let journal = Journal::open(dir.path(), Config::default()).unwrap();
        assert_eq!(journal.head(), 2);
        assert_eq!(journal.write(&mut begin()).unwrap(), 3);
        assert_eq!(journal.read(2).unwrap().unwrap().op, JournalOp::Rollback);
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let dir = TempDir::new().unwrap();
        let segment = {
            let journal = Journal::open(dir.path(), Config::default()).unwrap();
            journal.write(&mut begin()).unwrap();
            let path = journal.writer.lock().current_path().to_path_buf();
            path
        };

        let mut file = std::fs::OpenOptions::new().append(true).open(&segment).unwrap();
        file.write_all(b"GFSR\x40\x00\x00\x00partial").unwrap();
        drop(file);

        let journal = Journal::open(dir.path(), Config::default()).unwrap();
        assert_eq!(journal.head(), 1);
        assert_eq!(journal.write(&mut begin()).unwrap(), 2);
        assert_eq!(journal.read(2).unwrap().unwrap().xid, 2);
    }

    #[test]
    fn test_collect_transaction_skips_other_xids() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(dir.path(), Config::relaxed()).unwrap();
        let mut a = begin();
        journal.write(&mut a).unwrap();
        let mut b = begin();
        journal.write(&mut b).unwrap();
        journal.write(&mut tagged(JournalOp::Notify, a.xid)).unwrap();
        journal.write(&mut tagged(JournalOp::Notify, b.xid)).unwrap();
        journal.write(&mut tagged(JournalOp::Signal, a.xid)).unwrap();

        let log = journal.collect_transaction(a.xid, 5).unwrap();
        assert_eq!(log.iter().map(|e| e.rid).collect::<Vec<_>>(), vec![1, 3, 5]);

        assert!(journal.collect_transaction(3, 5).unwrap_err().is_integrity());
    }

    #[test]
    fn test_closed_journal_rejects_use() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(dir.path(), Config::relaxed()).unwrap();
        journal.close().unwrap();
        journal.close().unwrap();
        assert!(matches!(journal.write(&mut begin()), Err(GraphError::Closed(_))));
        assert!(matches!(journal.read(1), Err(GraphError::Closed(_))));
    }
}
