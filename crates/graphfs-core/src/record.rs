//! Journal entry model and its wire encoding.
//!
//! Entries are encoded as named-field MessagePack maps so fields can be added
//! without breaking older journals; unknown fields are ignored on decode.

use serde::{Deserialize, Serialize};

use crate::error::GraphResult;
use crate::path::Path;
use crate::types::{SerializedEdge, SerializedNode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JournalOp {
    Begin,
    Commit,
    Rollback,
    Write,
    SetEdge,
    RemoveEdge,
    /// Pass-through kinds carried for collaborators; never applied to a store.
    Notify,
    Confirm,
    Wait,
    Signal,
}

impl JournalOp {
    pub fn is_terminal(self) -> bool {
        matches!(self, JournalOp::Commit | JournalOp::Rollback)
    }

    /// Operations replayed against a backing store on commit.
    pub fn is_mutation(self) -> bool {
        matches!(self, JournalOp::Write | JournalOp::SetEdge | JournalOp::RemoveEdge)
    }

    pub fn is_pass_through(self) -> bool {
        matches!(self, JournalOp::Notify | JournalOp::Confirm | JournalOp::Wait | JournalOp::Signal)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Unix timestamp in nanoseconds; stamped on append when zero
    #[serde(default)]
    pub ts: i64,
    pub op: JournalOp,
    /// Transaction id (rid of the transaction's Begin record)
    #[serde(default)]
    pub xid: u64,
    /// Journal-assigned record id
    #[serde(default)]
    pub rid: u64,
    #[serde(default)]
    pub inode: i64,
    #[serde(default)]
    pub path: Option<Path>,
    #[serde(default)]
    pub node: Option<SerializedNode>,
    #[serde(default)]
    pub edge: Option<SerializedEdge>,
    /// Opaque collaborator payload for pass-through kinds
    #[serde(default)]
    pub payload: Option<Vec<u8>>,
}

impl JournalEntry {
    pub fn new(op: JournalOp) -> Self {
        Self {
            ts: 0,
            op,
            xid: 0,
            rid: 0,
            inode: 0,
            path: None,
            node: None,
            edge: None,
            payload: None,
        }
    }

    pub fn write(inode: i64, path: Option<Path>, node: SerializedNode) -> Self {
        Self {
            inode,
            path,
            node: Some(node),
            ..Self::new(JournalOp::Write)
        }
    }

    pub fn set_edge(inode: i64, path: Option<Path>, edge: SerializedEdge) -> Self {
        Self {
            inode,
            path,
            edge: Some(edge),
            ..Self::new(JournalOp::SetEdge)
        }
    }

    pub fn remove_edge(inode: i64, path: Option<Path>, edge: SerializedEdge) -> Self {
        Self {
            inode,
            path,
            edge: Some(edge),
            ..Self::new(JournalOp::RemoveEdge)
        }
    }

    pub fn encode(&self) -> GraphResult<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(bytes: &[u8]) -> GraphResult<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Current time as Unix nanoseconds.
pub(crate) fn now_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
