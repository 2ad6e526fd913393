//! Embedded key-value store backing superblocks and replication cursors.
//!
//! KvStore combines a RAM hash table with a segmented mutation log:
//!
//! **Read path**: RAM only (RwLock)
//! **Write path**: log first, then RAM. If the log append fails RAM is untouched.
//! **Open**: replay every Put/Delete frame in log order
//!
//! An in-memory store has no log at all and is used for transient sessions
//! and tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{GraphError, GraphResult};
use crate::format::{encode_frame, FrameKind};
use crate::platform_durability::sync_dir;
use crate::wal::{list_segments, SegmentReader, SegmentWriter};

const KV_PREFIX: &str = "kv";

struct KvLog {
    writer: SegmentWriter,
    next_sequence: u64,
}

/// Outcome of [`KvStore::compact`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionResult {
    /// Live pairs rewritten into the fresh segment
    pub live_entries: usize,
    /// Older segments deleted
    pub removed_segments: usize,
    /// Total log bytes before compaction
    pub original_bytes: u64,
    /// Total log bytes after compaction
    pub compacted_bytes: u64,
}

impl CompactionResult {
    /// Space saved in bytes.
    pub fn bytes_saved(&self) -> u64 {
        self.original_bytes.saturating_sub(self.compacted_bytes)
    }
}

/// RAM hash table + optional durable mutation log.
///
/// All methods take `&self`. Readers share the RwLock; writers serialize on
/// the log Mutex and then briefly take the table's write lock.
pub struct KvStore {
    data: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
    log: Option<Mutex<KvLog>>,
    dir: Option<PathBuf>,
    config: Config,
    closed: AtomicBool,
}

impl KvStore {
    /// Open or create a durable store in `dir`, replaying its log.
    pub fn open<P: AsRef<Path>>(dir: P, config: Config) -> GraphResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        config.validate().map_err(GraphError::InvalidArgument)?;

        let reader = SegmentReader::new(&dir, KV_PREFIX);
        let frames = reader.recover()?;

        let mut data = HashMap::new();
        let mut next_sequence = 0u64;
        for recovered in &frames {
            let frame = &recovered.frame;
            let (key, value) = decode_kv_payload(&frame.payload)?;
            match frame.kind {
                FrameKind::KvPut => {
                    data.insert(key.to_vec(), value.to_vec());
                }
                FrameKind::KvDelete => {
                    data.remove(key);
                }
                FrameKind::JournalRecord => {
                    return Err(GraphError::WalCorrupted {
                        path: dir.clone(),
                        offset: recovered.location.offset,
                        reason: "journal record in key-value log".into(),
                    });
                }
            }
            next_sequence = frame.sequence + 1;
        }

        if !frames.is_empty() {
            info!(
                dir = %dir.display(),
                frames = frames.len(),
                live = data.len(),
                "replayed key-value log"
            );
        }

        let writer = SegmentWriter::open(&dir, KV_PREFIX, config.kv_rotation_size_bytes)?;

        Ok(Self {
            data: RwLock::new(data),
            log: Some(Mutex::new(KvLog { writer, next_sequence })),
            dir: Some(dir),
            config,
            closed: AtomicBool::new(false),
        })
    }

    /// A store that lives only in RAM.
    pub fn in_memory() -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            log: None,
            dir: None,
            config: Config::relaxed(),
            closed: AtomicBool::new(false),
        }
    }

    /// True if mutations are persisted.
    pub fn is_durable(&self) -> bool {
        self.log.is_some()
    }

    fn check_open(&self) -> GraphResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GraphError::Closed("key-value store"));
        }
        Ok(())
    }

    fn check_key(&self, key: &[u8]) -> GraphResult<()> {
        if key.len() > self.config.max_key_size {
            return Err(GraphError::OversizedEntry {
                entry_size: key.len() as u64,
                max_size: self.config.max_key_size as u64,
                component: "key".into(),
            });
        }
        Ok(())
    }

    fn append(&self, kind: FrameKind, key: &[u8], value: &[u8]) -> GraphResult<()> {
        let Some(log) = &self.log else {
            return Ok(());
        };
        let payload = encode_kv_payload(key, value);
        let mut log = log.lock();
        let frame = encode_frame(kind, log.next_sequence, &payload, self.config.max_record_size)?;
        log.writer.append(&frame, self.config.sync_each_append())?;
        log.next_sequence += 1;
        Ok(())
    }

    /// Get the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> GraphResult<Option<Vec<u8>>> {
        self.check_open()?;
        Ok(self.data.read().get(key).cloned())
    }

    /// Insert or replace. Log first, RAM second.
    pub fn put(&self, key: &[u8], value: &[u8]) -> GraphResult<()> {
        self.check_open()?;
        self.check_key(key)?;
        self.append(FrameKind::KvPut, key, value)?;
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    /// Remove `key`. Deleting a missing key still logs the tombstone.
    pub fn delete(&self, key: &[u8]) -> GraphResult<()> {
        self.check_open()?;
        self.check_key(key)?;
        self.append(FrameKind::KvDelete, key, &[])?;
        self.data.write().remove(key);
        Ok(())
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.data.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// All pairs whose key starts with `prefix`, prefix stripped, sorted by key.
    pub fn prefix_scan(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let data = self.data.read();
        let mut results: Vec<(Vec<u8>, Vec<u8>)> = data
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k[prefix.len()..].to_vec(), v.clone()))
            .collect();
        results.sort_by(|(a, _), (b, _)| a.cmp(b));
        results
    }

    /// Count keys starting with `prefix` without cloning.
    pub fn prefix_count(&self, prefix: &[u8]) -> usize {
        self.data.read().keys().filter(|k| k.starts_with(prefix)).count()
    }

    /// Make every logged mutation durable with a single sync.
    pub fn sync(&self) -> GraphResult<()> {
        match &self.log {
            Some(log) => log.lock().writer.sync(),
            None => Ok(()),
        }
    }

    /// Rewrite the live set into a fresh segment and drop older segments.
    ///
    /// Crash safety follows from replay order: until the old segments are
    /// removed, replaying them followed by the (possibly torn) compacted
    /// segment yields the same table.
    pub fn compact(&self) -> GraphResult<CompactionResult> {
        self.check_open()?;
        let (Some(log), Some(dir)) = (&self.log, &self.dir) else {
            return Ok(CompactionResult {
                live_entries: self.len(),
                removed_segments: 0,
                original_bytes: 0,
                compacted_bytes: 0,
            });
        };

        let mut log = log.lock();
        let before = list_segments(dir, KV_PREFIX)?;
        let original_bytes = segment_bytes(&before)?;

        log.writer.rotate()?;
        let first_kept = log.writer.sequence();

        let snapshot: Vec<(Vec<u8>, Vec<u8>)> = self
            .data
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, value) in &snapshot {
            let payload = encode_kv_payload(key, value);
            let frame = encode_frame(FrameKind::KvPut, log.next_sequence, &payload, self.config.max_record_size)?;
            log.writer.append(&frame, false)?;
            log.next_sequence += 1;
        }
        log.writer.sync()?;

        let mut removed_segments = 0;
        for (seq, path) in before.iter().filter(|(seq, _)| *seq < first_kept) {
            std::fs::remove_file(path).map_err(|e| GraphError::io_at(path, e, "failed to remove compacted segment"))?;
            debug!(segment = *seq, "removed compacted segment");
            removed_segments += 1;
        }
        sync_dir(dir).map_err(|e| GraphError::io_at(dir, e, "failed to sync log directory"))?;

        let compacted_bytes = segment_bytes(&list_segments(dir, KV_PREFIX)?)?;
        info!(
            live = snapshot.len(),
            removed_segments,
            original_bytes,
            compacted_bytes,
            "compacted key-value log"
        );

        Ok(CompactionResult {
            live_entries: snapshot.len(),
            removed_segments,
            original_bytes,
            compacted_bytes,
        })
    }

    /// Sync and refuse further use. Idempotent.
    pub fn close(&self) -> GraphResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.sync()
    }
}

fn segment_bytes(segments: &[(u64, PathBuf)]) -> GraphResult<u64> {
    let mut total = 0;
    for (_, path) in segments {
        total += std::fs::metadata(path)
            .map_err(|e| GraphError::io_at(path, e, "failed to stat segment"))?
            .len();
    }
    Ok(total)
}

/// `key_len (u32 LE) + key + value`
fn encode_kv_payload(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + key.len() + value.len());
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    buf
}

fn decode_kv_payload(payload: &[u8]) -> GraphResult<(&[u8], &[u8])> {
    if payload.len() < 4 {
        return Err(GraphError::Codec("key-value payload shorter than length prefix".into()));
    }
    let key_len = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
    if payload.len() < 4 + key_len {
        return Err(GraphError::Codec(format!(
            "key length {} exceeds payload of {} bytes",
            key_len,
            payload.len()
        )));
    }
    Ok((&payload[4..4 + key_len], &payload[4 + key_len..]))
}
