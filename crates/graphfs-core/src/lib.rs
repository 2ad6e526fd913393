//! GraphFS Core: Transactional Graph Storage Engine
//!
//! Nodes are addressed by `/`-separated paths across partitions. Each
//! partition is served by a [`SuperBlock`]; the engine in front of them adds
//! a shared node cache, transactions and crash recovery.
//!
//! # Architecture
//!
//! - **Read path**: resolve through the [`CacheEntry`] tree (negative results
//!   cached too), then read from the partition's superblock
//! - **Write path**: transactions journal every entry before staging it in a
//!   private overlay; commit journals a Commit record, replays the log against
//!   the superblocks and advances the checkpoint
//! - **Recovery**: on open, replay committed transactions past the checkpoint
//!   and roll back whatever a crash left open
//! - **Replication**: slots turn the journal into a stream of committed
//!   transactions, optionally consumed on a background thread
//!
//! The journal and the metadata store share one framed, CRC32C-checked,
//! segmented log format (see [`wal`] and [`format`]).

pub mod bitmap;
pub mod checkpoint;
pub mod config;
pub mod consumer;
pub mod datastore;
pub mod entry;
pub mod error;
pub mod format;
pub mod graph;
pub mod handle;
pub mod inode;
pub mod journal;
pub mod kv;
pub mod path;
pub mod platform_durability;
pub mod record;
pub mod replication;
pub mod superblock;
pub mod transaction;
pub mod txmgr;
pub mod types;
pub mod wal;

// Re-export key types for convenience
pub use checkpoint::{Checkpoint, FileCheckpoint, MemoryCheckpoint};
pub use config::{Config, SyncMode};
pub use consumer::{ConsumerHandle, ReplicationHandler};
pub use datastore::KvSuperBlock;
pub use entry::{CacheEntry, EntryRef};
pub use error::{GraphError, GraphResult};
pub use graph::{TransactionListener, VirtualGraph};
pub use handle::NodeHandle;
pub use inode::{INode, InodeTable};
pub use journal::Journal;
pub use kv::KvStore;
pub use path::{EdgeKey, Path, PathElement};
pub use record::{JournalEntry, JournalOp};
pub use replication::{ReplicationManager, ReplicationMessage, ReplicationSlot, ReplicationSlotOptions};
pub use superblock::{OpenFlags, OpenOptions, SuperBlock, SuperBlockProvider};
pub use transaction::{validate_log, Transaction};
pub use txmgr::{RecoveryReport, TransactionManager};
pub use types::{EdgeFlags, NodeFlags, SerializedEdge, SerializedNode};
