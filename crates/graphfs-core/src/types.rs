//! Serialized node and edge records.
//!
//! The engine stores these opaque to their payload: `data` bytes and the
//! `type_tag` string belong to the object-mapping layer above.

use serde::{Deserialize, Serialize};

use crate::path::{EdgeKey, Path};

bitflags::bitflags! {
    /// Node record flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct NodeFlags: u32 {
        const NONE = 0;
        /// Payload is stored inline in `data`
        const HAS_DATA = 1 << 0;
        /// `link` points at content stored elsewhere
        const HAS_LINK = 1 << 1;
        /// Node was deleted; reads report not-found
        const REMOVED = 1 << 2;
        /// Cached copy must be refetched
        const INVALID = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Edge record flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct EdgeFlags: u32 {
        const NONE = 0;
        /// Target identified by path instead of index
        const LINK = 1 << 0;
        /// Edge was removed; kept as a tombstone in overlays
        const REMOVED = 1 << 1;
    }
}

impl Default for NodeFlags {
    fn default() -> Self {
        Self::empty()
    }
}

impl Default for EdgeFlags {
    fn default() -> Self {
        Self::empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedNode {
    pub index: i64,
    pub parent: i64,
    pub version: i64,
    pub path: Option<Path>,
    pub flags: NodeFlags,
    pub type_tag: String,
    pub data: Option<Vec<u8>>,
    pub link: Option<String>,
}

impl SerializedNode {
    pub fn is_removed(&self) -> bool {
        self.flags.contains(NodeFlags::REMOVED)
    }

    pub fn is_valid(&self) -> bool {
        !self.flags.contains(NodeFlags::INVALID)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedEdge {
    pub index: i64,
    pub version: i64,
    pub flags: EdgeFlags,
    pub key: EdgeKey,
    pub to_index: i64,
    pub to_path: Option<Path>,
    pub data: Option<Vec<u8>>,
    pub xmin: u64,
    pub xmax: u64,
}

impl SerializedEdge {
    /// A plain tree/graph edge from `index` to `to_index`.
    pub fn new(index: i64, key: EdgeKey, to_index: i64) -> Self {
        Self {
            index,
            version: 0,
            flags: EdgeFlags::NONE,
            key,
            to_index,
            to_path: None,
            data: None,
            xmin: 0,
            xmax: 0,
        }
    }

    pub fn is_removed(&self) -> bool {
        self.flags.contains(EdgeFlags::REMOVED)
    }

    /// Tombstone standing in for `key` in a staged edge map.
    pub fn tombstone(index: i64, key: EdgeKey) -> Self {
        let mut edge = Self::new(index, key, 0);
        edge.flags.insert(EdgeFlags::REMOVED);
        edge
    }
}
