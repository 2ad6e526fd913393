//! Binary framing for every durable GraphFS record
//!
//! Journal entries and key-value log mutations share one frame layout:
//! FrameHeader (32 bytes) + payload. The payload is opaque to this module;
//! journal frames carry a MessagePack-encoded `JournalEntry`, KV frames carry
//! `key_len(u32) + key + value`.

use std::path::PathBuf;

use crate::error::{GraphError, GraphResult};

/// Magic bytes identifying a GraphFS record: "GFSR"
pub const MAGIC_ARRAY: [u8; 4] = [0x47, 0x46, 0x53, 0x52];

/// Header size in bytes
pub const HEADER_SIZE: usize = 32;

/// Current frame format version
pub const FORMAT_VERSION: u8 = 1;

/// What a frame's payload contains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Encoded journal entry; `sequence` is the record id
    JournalRecord = 1,
    /// Insert or update a key-value pair
    KvPut = 2,
    /// Delete a key
    KvDelete = 3,
}

impl FrameKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(FrameKind::JournalRecord),
            2 => Some(FrameKind::KvPut),
            3 => Some(FrameKind::KvDelete),
            _ => None,
        }
    }
}

/// Fixed-size header preceding every payload
///
/// Layout:
///   [0..4]   magic:    "GFSR"
///   [4..8]   length:   u32 LE, payload length in bytes
///   [8..12]  checksum: u32 LE, CRC32C of payload followed by header[12..24]
///   [12]     kind:     u8
///   [13]     version:  u8
///   [14..16] reserved
///   [16..24] sequence: u64 LE
///   [24..32] padding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: [u8; 4],
    pub length: u32,
    pub checksum: u32,
    pub kind: u8,
    pub version: u8,
    pub sequence: u64,
}

impl FrameHeader {
    /// Serialize header to bytes for writing
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic);
        buf[4..8].copy_from_slice(&self.length.to_le_bytes());
        buf[8..12].copy_from_slice(&self.checksum.to_le_bytes());
        buf[12] = self.kind;
        buf[13] = self.version;
        buf[16..24].copy_from_slice(&self.sequence.to_le_bytes());
        buf
    }

    /// Parse header from bytes
    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&bytes[16..24]);

        Self {
            magic,
            length: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            checksum: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            kind: bytes[12],
            version: bytes[13],
            sequence: u64::from_le_bytes(seq),
        }
    }
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub version: u8,
    pub sequence: u64,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Total encoded size (header + payload)
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

fn frame_checksum(header: &[u8; HEADER_SIZE], payload: &[u8]) -> u32 {
    let crc = crc32c::crc32c(payload);
    crc32c::crc32c_append(crc, &header[12..24])
}

fn buffer_path() -> PathBuf {
    PathBuf::from("<buffer>")
}

/// Encode a payload into a complete frame
pub fn encode_frame(kind: FrameKind, sequence: u64, payload: &[u8], max_record_size: usize) -> GraphResult<Vec<u8>> {
    if payload.len() > max_record_size || payload.len() > u32::MAX as usize {
        return Err(GraphError::OversizedEntry {
            entry_size: payload.len() as u64,
            max_size: max_record_size as u64,
            component: "record".to_string(),
        });
    }

    let mut header = FrameHeader {
        magic: MAGIC_ARRAY,
        length: payload.len() as u32,
        checksum: 0,
        kind: kind as u8,
        version: FORMAT_VERSION,
        sequence,
    };
    header.checksum = frame_checksum(&header.to_bytes(), payload);

    let mut buffer = Vec::with_capacity(HEADER_SIZE + payload.len());
    buffer.extend_from_slice(&header.to_bytes());
    buffer.extend_from_slice(payload);

    Ok(buffer)
}

/// Decode a frame from the start of `data`
pub fn decode_frame(data: &[u8]) -> GraphResult<Frame> {
    if data.len() < HEADER_SIZE {
        return Err(GraphError::TornWrite {
            path: buffer_path(),
            expected_size: HEADER_SIZE as u32,
            available_bytes: data.len() as u64,
            offset: 0,
        });
    }

    let mut header_bytes = [0u8; HEADER_SIZE];
    header_bytes.copy_from_slice(&data[..HEADER_SIZE]);
    let header = FrameHeader::from_bytes(&header_bytes);

    if header.magic != MAGIC_ARRAY {
        return Err(GraphError::NoMagicFound {
            path: buffer_path(),
            offset: 0,
            found_bytes: header.magic,
        });
    }

    let payload_end = HEADER_SIZE + header.length as usize;
    if data.len() < payload_end {
        return Err(GraphError::TornWrite {
            path: buffer_path(),
            expected_size: header.length,
            available_bytes: (data.len() - HEADER_SIZE) as u64,
            offset: HEADER_SIZE as u64,
        });
    }

    let payload = &data[HEADER_SIZE..payload_end];

    let computed = frame_checksum(&header_bytes, payload);
    if computed != header.checksum {
        return Err(GraphError::ChecksumMismatch {
            path: buffer_path(),
            expected: header.checksum,
            actual: computed,
            offset: HEADER_SIZE as u64,
        });
    }

    if header.version != FORMAT_VERSION {
        return Err(GraphError::WalCorrupted {
            path: buffer_path(),
            offset: 13,
            reason: format!("unsupported format version {}", header.version),
        });
    }

    let kind = FrameKind::from_u8(header.kind).ok_or_else(|| GraphError::WalCorrupted {
        path: buffer_path(),
        offset: 12,
        reason: format!("invalid frame kind: {}", header.kind),
    })?;

    Ok(Frame {
        kind,
        version: header.version,
        sequence: header.sequence,
        payload: payload.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1024 * 1024;

    #[test]
    fn test_encode_decode() {
        let data = encode_frame(FrameKind::JournalRecord, 42, b"entry-bytes", MAX).unwrap();
        let frame = decode_frame(&data).unwrap();

        assert_eq!(frame.kind, FrameKind::JournalRecord);
        assert_eq!(frame.sequence, 42);
        assert_eq!(frame.payload, b"entry-bytes");
        assert_eq!(frame.encoded_len(), data.len());
    }

    #[test]
    fn test_empty_payload() {
        let data = encode_frame(FrameKind::KvDelete, 0, b"", MAX).unwrap();
        assert_eq!(data.len(), HEADER_SIZE);
        assert_eq!(decode_frame(&data).unwrap().kind, FrameKind::KvDelete);
    }

    #[test]
    fn test_oversized_record_rejected() {
        let payload = vec![0u8; 17];
        let result = encode_frame(FrameKind::KvPut, 0, &payload, 16);
        assert!(matches!(result, Err(GraphError::OversizedEntry { component, .. }) if component == "record"));
    }

    #[test]
    fn test_corrupted_magic_detected() {
        let mut data = encode_frame(FrameKind::KvPut, 1, b"value", MAX).unwrap();
        data[0] = 0xFF;
        assert!(matches!(decode_frame(&data), Err(GraphError::NoMagicFound { .. })));
    }

    #[test]
    fn test_corrupted_payload_detected() {
        let mut data = encode_frame(FrameKind::KvPut, 1, b"value", MAX).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        assert!(matches!(decode_frame(&data), Err(GraphError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_sequence_is_checksummed() {
        let mut data = encode_frame(FrameKind::JournalRecord, 7, b"x", MAX).unwrap();
        data[16] ^= 0x01;
        assert!(matches!(decode_frame(&data), Err(GraphError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_truncated_payload_is_torn() {
        let data = encode_frame(FrameKind::JournalRecord, 3, b"0123456789", MAX).unwrap();
        let result = decode_frame(&data[..data.len() - 4]);
        assert!(matches!(result, Err(GraphError::TornWrite { .. })));
    }
}
