//! Segmented append-only log shared by the journal and the key-value store
//!
//! The log provides durability through careful write ordering:
//! 1. Encode the record into a frame (`format::encode_frame`)
//! 2. Append the frame to the current segment
//! 3. Call durable_sync() when the caller's sync policy requires it
//! 4. Return the frame location (caller updates in-memory state AFTER this)
//!
//! Segments are named `<prefix>-<16 hex digits>.log` and are rotated once they
//! exceed the configured size. On recovery a torn frame at the tail of the
//! newest segment is the crash point and is truncated away; damage anywhere
//! else is reported, never skipped.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{GraphError, GraphResult};
use crate::format::{decode_frame, Frame, HEADER_SIZE, MAGIC_ARRAY};
use crate::platform_durability::{durable_sync, sync_dir};

const SEGMENT_EXT: &str = ".log";

/// Where a frame lives on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLocation {
    /// Segment sequence number
    pub segment: u64,
    /// Byte offset of the frame header within the segment
    pub offset: u64,
    /// Total frame length (header + payload)
    pub len: u32,
}

/// A frame read back during recovery together with its location.
#[derive(Debug, Clone)]
pub struct RecoveredFrame {
    pub location: FrameLocation,
    pub frame: Frame,
}

/// Path of segment `sequence` for `prefix` in `dir`.
pub fn segment_path(dir: &Path, prefix: &str, sequence: u64) -> PathBuf {
    dir.join(format!("{}-{:016x}{}", prefix, sequence, SEGMENT_EXT))
}

fn parse_segment_name(name: &str, prefix: &str) -> Option<u64> {
    let hex = name.strip_prefix(prefix)?.strip_prefix('-')?.strip_suffix(SEGMENT_EXT)?;
    if hex.len() != 16 {
        return None;
    }
    u64::from_str_radix(hex, 16).ok()
}

/// List `(sequence, path)` of every segment for `prefix`, oldest first.
pub fn list_segments(dir: &Path, prefix: &str) -> GraphResult<Vec<(u64, PathBuf)>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(GraphError::io_at(dir, e, "failed to read log directory")),
    };

    let mut segments = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| GraphError::io_at(dir, e, "failed to read directory entry"))?;
        if let Some(seq) = entry.file_name().to_str().and_then(|n| parse_segment_name(n, prefix)) {
            segments.push((seq, entry.path()));
        }
    }
    segments.sort_by_key(|(seq, _)| *seq);
    Ok(segments)
}

/// Appends frames to the newest segment, rotating by size.
///
/// Single writer: callers serialize access (journal and KV store each wrap
/// their writer in a Mutex).
pub struct SegmentWriter {
    file: File,
    path: PathBuf,
    size: u64,
    dir: PathBuf,
    prefix: String,
    sequence: u64,
    rotation_size: u64,
    /// Set when a failed append could not be cut back off the segment.
    poisoned: bool,
}

impl SegmentWriter {
    /// Open the writer at the highest existing segment, creating segment 0
    /// in an empty directory.
    pub fn open<P: AsRef<Path>>(dir: P, prefix: &str, rotation_size: u64) -> GraphResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| GraphError::io_at(&dir, e, "failed to create log directory"))?;

        let sequence = list_segments(&dir, prefix)?.last().map(|(seq, _)| *seq).unwrap_or(0);
        let path = segment_path(&dir, prefix, sequence);
        let file = open_append(&path)?;
        let size = file
            .metadata()
            .map_err(|e| GraphError::io_at(&path, e, "failed to stat segment"))?
            .len();
        sync_dir(&dir).map_err(|e| GraphError::io_at(&dir, e, "failed to sync log directory"))?;

        Ok(Self {
            file,
            path,
            size,
            dir,
            prefix: prefix.to_string(),
            sequence,
            rotation_size,
            poisoned: false,
        })
    }

    /// Append an encoded frame. With `sync` set the frame is durable when this
    /// returns; otherwise it has only reached the OS page cache.
    ///
    /// A failed write or sync is cut back off the segment so the next frame
    /// lands where this one started. If the cut itself fails the writer
    /// refuses further appends.
    pub fn append(&mut self, frame: &[u8], sync: bool) -> GraphResult<FrameLocation> {
        self.append_with(frame, sync, |file, bytes| file.write_all(bytes))
    }

    fn append_with<F>(&mut self, frame: &[u8], sync: bool, write: F) -> GraphResult<FrameLocation>
    where
        F: FnOnce(&mut File, &[u8]) -> std::io::Result<()>,
    {
        if self.poisoned {
            return Err(GraphError::io_at(
                &self.path,
                std::io::Error::new(std::io::ErrorKind::Other, "segment holds a partial frame"),
                "log writer disabled after failed append",
            ));
        }
        if self.size > 0 && self.size + frame.len() as u64 > self.rotation_size {
            self.rotate()?;
        }

        let offset = self.size;
        let written = write(&mut self.file, frame)
            .map_err(|e| GraphError::io_at(&self.path, e, "log write failed"))
            .and_then(|()| {
                if sync {
                    durable_sync(&self.file).map_err(|e| GraphError::io_at(&self.path, e, "log durable_sync failed"))
                } else {
                    Ok(())
                }
            });
        if let Err(err) = written {
            if let Err(cut) = self.file.set_len(offset) {
                self.poisoned = true;
                warn!(path = %self.path.display(), offset, error = %cut, "could not truncate failed append");
            }
            return Err(err);
        }
        self.size += frame.len() as u64;

        Ok(FrameLocation {
            segment: self.sequence,
            offset,
            len: frame.len() as u32,
        })
    }

    /// Close the current segment and continue in a fresh one.
    pub fn rotate(&mut self) -> GraphResult<()> {
        durable_sync(&self.file).map_err(|e| GraphError::io_at(&self.path, e, "sync before rotation failed"))?;

        self.sequence += 1;
        let new_path = segment_path(&self.dir, &self.prefix, self.sequence);
        self.file = open_append(&new_path)?;
        self.path = new_path;
        self.size = 0;
        sync_dir(&self.dir).map_err(|e| GraphError::io_at(&self.dir, e, "failed to sync log directory"))?;

        debug!(segment = self.sequence, prefix = %self.prefix, "rotated log segment");
        Ok(())
    }

    /// Sync the current segment without writing anything.
    pub fn sync(&self) -> GraphResult<()> {
        durable_sync(&self.file).map_err(|e| GraphError::io_at(&self.path, e, "log sync failed"))
    }

    pub fn current_path(&self) -> &Path {
        &self.path
    }

    pub fn current_size(&self) -> u64 {
        self.size
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

fn open_append(path: &Path) -> GraphResult<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| GraphError::io_at(path, e, "failed to open segment"))
}

/// Reads segments back, for recovery and random access.
pub struct SegmentReader {
    dir: PathBuf,
    prefix: String,
}

impl SegmentReader {
    pub fn new<P: AsRef<Path>>(dir: P, prefix: &str) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            prefix: prefix.to_string(),
        }
    }

    /// Read every frame from every segment in order.
    ///
    /// A torn or garbled frame that runs to the end of the newest segment is
    /// truncated off the file. The same damage in an older segment, or a bad
    /// frame followed by more data, fails with the decoding error.
    pub fn recover(&self) -> GraphResult<Vec<RecoveredFrame>> {
        let segments = list_segments(&self.dir, &self.prefix)?;
        let mut frames = Vec::new();

        for (i, (seq, path)) in segments.iter().enumerate() {
            let is_last = i + 1 == segments.len();
            self.recover_segment(*seq, path, is_last, &mut frames)?;
        }

        Ok(frames)
    }

    fn recover_segment(&self, seq: u64, path: &Path, is_last: bool, out: &mut Vec<RecoveredFrame>) -> GraphResult<()> {
        let mut file = File::open(path).map_err(|e| GraphError::io_at(path, e, "failed to open segment for recovery"))?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)
            .map_err(|e| GraphError::io_at(path, e, "failed to read segment"))?;

        let mut offset = 0usize;
        while offset < buffer.len() {
            match decode_frame(&buffer[offset..]) {
                Ok(frame) => {
                    let len = frame.encoded_len();
                    out.push(RecoveredFrame {
                        location: FrameLocation {
                            segment: seq,
                            offset: offset as u64,
                            len: len as u32,
                        },
                        frame,
                    });
                    offset += len;
                }
                Err(err) => {
                    if is_last && is_tail_damage(&buffer[offset..], &err) {
                        warn!(
                            path = %path.display(),
                            offset,
                            discarded = buffer.len() - offset,
                            "truncating torn tail of log segment"
                        );
                        truncate_segment(path, offset as u64)?;
                        break;
                    }
                    return Err(relocate(err, path, offset as u64));
                }
            }
        }

        Ok(())
    }

    /// Read the single frame at `location`.
    pub fn read_at(&self, location: FrameLocation) -> GraphResult<Frame> {
        let path = segment_path(&self.dir, &self.prefix, location.segment);
        let mut file = File::open(&path).map_err(|e| GraphError::io_at(&path, e, "failed to open segment"))?;
        file.seek(SeekFrom::Start(location.offset))
            .map_err(|e| GraphError::io_at(&path, e, "seek failed"))?;
        let mut buffer = vec![0u8; location.len as usize];
        file.read_exact(&mut buffer)
            .map_err(|e| GraphError::io_at(&path, e, "short read"))?;
        decode_frame(&buffer).map_err(|e| relocate(e, &path, location.offset))
    }
}

/// A frame error is tail damage if nothing decodable follows it: either the
/// frame itself runs past EOF, or its declared extent reaches EOF, or the
/// remainder is zero fill.
fn is_tail_damage(rest: &[u8], err: &GraphError) -> bool {
    match err {
        GraphError::TornWrite { .. } => true,
        GraphError::ChecksumMismatch { .. } => {
            let declared = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
            HEADER_SIZE + declared >= rest.len()
        }
        GraphError::NoMagicFound { .. } => rest.iter().all(|b| *b == 0) || !contains_magic(rest),
        _ => false,
    }
}

fn contains_magic(data: &[u8]) -> bool {
    data.windows(MAGIC_ARRAY.len()).any(|w| w == MAGIC_ARRAY)
}

fn truncate_segment(path: &Path, len: u64) -> GraphResult<()> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| GraphError::io_at(path, e, "failed to open segment for truncation"))?;
    file.set_len(len)
        .map_err(|e| GraphError::io_at(path, e, "failed to truncate segment"))?;
    durable_sync(&file).map_err(|e| GraphError::io_at(path, e, "sync after truncation failed"))
}

/// Attach the real file and offset to an error produced on a buffer.
fn relocate(err: GraphError, path: &Path, base: u64) -> GraphError {
    let path = path.to_path_buf();
    match err {
        GraphError::TornWrite { expected_size, available_bytes, offset, .. } => GraphError::TornWrite {
            path,
            expected_size,
            available_bytes,
            offset: base + offset,
        },
        GraphError::ChecksumMismatch { expected, actual, offset, .. } => GraphError::ChecksumMismatch {
            path,
            expected,
            actual,
            offset: base + offset,
        },
        GraphError::NoMagicFound { offset, found_bytes, .. } => GraphError::NoMagicFound {
            path,
            offset: base + offset,
            found_bytes,
        },
        GraphError::WalCorrupted { offset, reason, .. } => GraphError::WalCorrupted {
            path,
            offset: base + offset,
            reason,
        },
        other => other,
    }
}
