//! Error types for GraphFS operations
//!
//! All GraphFS errors are represented by the [`GraphError`] enum. The first
//! group of variants is the engine taxonomy handed up to collaborators
//! (not-found, permission, closed, integrity); the second group carries
//! storage-level context for journal and key-value log failures.

use std::path::PathBuf;

use thiserror::Error;

/// GraphFS error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum GraphError {
    /// Path, node, edge or record does not exist. Expected; not logged.
    #[error("not found: {0}")]
    NotFound(String),

    /// The handle or transaction lacks the capability for this operation
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Operation on a closed handle, journal, slot, transaction or manager
    #[error("{0} is closed")]
    Closed(&'static str),

    /// Exclusive open of a node that already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Transaction log has an invalid shape; fatal for that transaction
    #[error("invalid transaction log (xid {xid}): {reason}")]
    InvalidTransactionLog {
        /// Transaction the violation was detected in (0 if unknown)
        xid: u64,
        /// What was wrong with the log
        reason: String,
    },

    /// Backend does not implement this operation (e.g. writes on a read-only store)
    #[error("operation {operation} not supported by {backend}")]
    Unsupported {
        /// Backend name
        backend: &'static str,
        /// Rejected operation
        operation: &'static str,
    },

    /// Caller supplied a malformed argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O operation failed
    #[error("{}", display_io(.path, .kind, .message))]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// Log segment is corrupted somewhere other than its tail
    #[error("log corrupted in {} at offset {offset}: {reason}", .path.display())]
    WalCorrupted {
        /// Path to the corrupted segment
        path: PathBuf,
        /// Byte offset where corruption was detected
        offset: u64,
        /// Description of the corruption
        reason: String,
    },

    /// Checksum verification failed
    #[error("checksum mismatch in {} at offset {offset}: expected 0x{expected:08x}, got 0x{actual:08x}", .path.display())]
    ChecksumMismatch {
        /// File where checksum failed
        path: PathBuf,
        /// Expected checksum value
        expected: u32,
        /// Actual checksum computed
        actual: u32,
        /// Byte offset of the corrupted data
        offset: u64,
    },

    /// Partial record at the end of a buffer
    #[error("torn write in {} at offset {offset}: expected {expected_size} bytes, only {available_bytes} available", .path.display())]
    TornWrite {
        /// File with torn write
        path: PathBuf,
        /// Expected record payload size
        expected_size: u32,
        /// Actual bytes available
        available_bytes: u64,
        /// Offset where torn write begins
        offset: u64,
    },

    /// Record or key exceeds the configured maximum
    #[error("{component} too large: {entry_size} bytes exceeds limit of {max_size} bytes")]
    OversizedEntry {
        /// Size of the oversized component
        entry_size: u64,
        /// Maximum allowed size
        max_size: u64,
        /// Which component was oversized ("key", "record")
        component: String,
    },

    /// Magic bytes not found at expected location
    #[error("magic bytes not found in {} at offset {offset}: found {:02x}{:02x}{:02x}{:02x}",
        .path.display(), .found_bytes[0], .found_bytes[1], .found_bytes[2], .found_bytes[3])]
    NoMagicFound {
        /// File being read
        path: PathBuf,
        /// Offset where magic was expected
        offset: u64,
        /// Bytes actually found
        found_bytes: [u8; 4],
    },

    /// Record payload could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(String),
}

fn display_io(path: &Option<PathBuf>, kind: &std::io::ErrorKind, message: &str) -> String {
    match path {
        Some(path) => format!("I/O error in {}: {} ({})", path.display(), message, kind),
        None => format!("I/O error: {} ({})", message, kind),
    }
}

impl GraphError {
    /// Shorthand for an integrity violation in transaction `xid`.
    pub fn invalid_log(xid: u64, reason: impl Into<String>) -> Self {
        GraphError::InvalidTransactionLog { xid, reason: reason.into() }
    }

    /// Wrap an I/O error with the path it happened on.
    pub fn io_at(path: impl Into<PathBuf>, err: std::io::Error, what: &str) -> Self {
        GraphError::Io {
            path: Some(path.into()),
            kind: err.kind(),
            message: format!("{}: {}", what, err),
        }
    }

    /// True for the expected "does not exist" condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, GraphError::NotFound(_))
    }

    /// True for violations that must abort the enclosing transaction.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            GraphError::InvalidTransactionLog { .. } | GraphError::Unsupported { .. }
        )
    }
}

/// Convert std::io::Error to GraphError::Io
impl From<std::io::Error> for GraphError {
    fn from(err: std::io::Error) -> Self {
        GraphError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<rmp_serde::encode::Error> for GraphError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        GraphError::Codec(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for GraphError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        GraphError::Codec(err.to_string())
    }
}

/// Result type alias for GraphFS operations
pub type GraphResult<T> = Result<T, GraphError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GraphError::ChecksumMismatch {
            path: PathBuf::from("/tmp/journal-0000000000000000.log"),
            expected: 0x12345678,
            actual: 0x87654321,
            offset: 1024,
        };

        let display = format!("{}", err);
        assert!(display.contains("checksum mismatch"));
        assert!(display.contains("0x12345678"));
        assert!(display.contains("0x87654321"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: GraphError = io_err.into();

        match err {
            GraphError::Io { kind, path, .. } => {
                assert_eq!(kind, std::io::ErrorKind::NotFound);
                assert!(path.is_none());
            }
            _ => panic!("Expected Io error"),
        }
    }

    #[test]
    fn test_taxonomy_helpers() {
        assert!(GraphError::NotFound("R/a".into()).is_not_found());
        assert!(GraphError::invalid_log(7, "missing begin").is_integrity());
        assert!(GraphError::Unsupported { backend: "remote", operation: "write" }.is_integrity());
        assert!(!GraphError::Closed("journal").is_integrity());
    }

    #[test]
    fn test_io_at_keeps_path() {
        let err = GraphError::io_at("/data/checkpoint", std::io::Error::from(std::io::ErrorKind::Other), "write failed");
        assert!(err.to_string().contains("/data/checkpoint"));
    }
}
