//! Configuration management for GraphFS
//!
//! Provides durability presets and validation for the journal, the metadata
//! key-value log and the replication consumer.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// When appended records are forced to persistent storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Every append is followed by a durable sync before it is acknowledged
    Durable,
    /// Appends reach the OS page cache; durable sync happens at commit boundaries
    Relaxed,
}

/// GraphFS configuration with durability presets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Journal segment rotation threshold (bytes)
    pub journal_rotation_size_bytes: u64,
    /// Key-value log segment rotation threshold (bytes)
    pub kv_rotation_size_bytes: u64,
    /// Maximum key size in bytes for the key-value store
    pub max_key_size: usize,
    /// Maximum encoded record size in bytes (journal entries and KV values)
    pub max_record_size: usize,
    /// Sync policy for journal and key-value appends
    pub sync_mode: SyncMode,
    /// Backoff between replication polls that hit the end of the journal
    pub replication_poll_interval: Duration,
    /// Messages requested from a replication slot per poll
    pub replication_batch_size: usize,
}

impl Config {
    /// Durable preset: each record is synced before it is acknowledged
    pub fn durable() -> Self {
        Self {
            journal_rotation_size_bytes: 64 * 1024 * 1024,
            kv_rotation_size_bytes: 64 * 1024 * 1024,
            max_key_size: 1024,
            max_record_size: 32 * 1024 * 1024,
            sync_mode: SyncMode::Durable,
            replication_poll_interval: Duration::from_millis(500),
            replication_batch_size: 64,
        }
    }

    /// Relaxed preset: commits sync the journal once, individual appends do not
    pub fn relaxed() -> Self {
        Self {
            journal_rotation_size_bytes: 16 * 1024 * 1024,
            kv_rotation_size_bytes: 16 * 1024 * 1024,
            max_key_size: 1024,
            max_record_size: 16 * 1024 * 1024,
            sync_mode: SyncMode::Relaxed,
            replication_poll_interval: Duration::from_millis(50),
            replication_batch_size: 256,
        }
    }

    /// Whether every append must be durably synced on its own.
    pub fn sync_each_append(&self) -> bool {
        self.sync_mode == SyncMode::Durable
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.journal_rotation_size_bytes < 1024 * 1024 {
            return Err("journal_rotation_size_bytes must be >= 1MB".into());
        }
        if self.kv_rotation_size_bytes < 1024 * 1024 {
            return Err("kv_rotation_size_bytes must be >= 1MB".into());
        }
        if self.max_key_size == 0 || self.max_key_size > 64 * 1024 {
            return Err("max_key_size must be in [1, 64KB]".into());
        }
        if self.max_record_size == 0 || self.max_record_size > 128 * 1024 * 1024 {
            return Err("max_record_size must be in [1, 128MB]".into());
        }
        if self.replication_poll_interval.as_millis() == 0 {
            return Err("replication_poll_interval must be > 0".into());
        }
        if self.replication_batch_size == 0 {
            return Err("replication_batch_size must be > 0".into());
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self { Self::durable() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_presets_valid() {
        assert!(Config::durable().validate().is_ok());
        assert!(Config::relaxed().validate().is_ok());
    }

    #[test]
    fn test_default_is_durable() {
        let c = Config::default();
        assert!(c.sync_each_append());
        assert!(!Config::relaxed().sync_each_append());
    }

    #[test]
    fn test_invalid_batch_rejected() {
        let mut c = Config::relaxed();
        c.replication_batch_size = 0;
        assert!(c.validate().is_err());
    }
}
