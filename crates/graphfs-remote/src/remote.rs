//! Read-through superblock for a partition owned by a remote authority.
//!
//! Lookups and reads are forwarded over a [`RemoteDriver`]; identity is kept
//! locally (one INode per remote id, one root entry). Every mutation is
//! refused with `Unsupported`, so a transaction that touches a remote
//! partition fails at commit and stays open for the caller to roll back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use graphfs_core::{
    CacheEntry, EdgeKey, GraphError, GraphResult, INode, InodeTable, OpenOptions, PathElement, SerializedEdge,
    SerializedNode, SuperBlock, SuperBlockProvider,
};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::driver::RemoteDriver;
use crate::wire::{Request, Response};

const BACKEND: &str = "remote";

pub struct RemoteSuperBlock {
    uuid: String,
    driver: Arc<dyn RemoteDriver>,
    this: Weak<RemoteSuperBlock>,
    inodes: InodeTable,
    root: Mutex<Option<Arc<CacheEntry>>>,
    closed: AtomicBool,
}

impl RemoteSuperBlock {
    /// Attach to `uuid` through `driver`. The authority is pinged once so a
    /// missing partition fails here rather than on first read.
    pub fn open(driver: Arc<dyn RemoteDriver>, uuid: &str) -> GraphResult<Arc<Self>> {
        match driver.call(&Request::Ping { partition: uuid.to_string() })? {
            Response::Pong => {}
            Response::Fault(fault) => return Err(fault.into_error("ping")),
            other => return Err(unexpected("ping", &other)),
        }
        debug!(partition = uuid, "attached remote superblock");
        Ok(Arc::new_cyclic(|this| Self {
            uuid: uuid.to_string(),
            driver,
            this: this.clone(),
            inodes: InodeTable::new(),
            root: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }

    /// Provider serving every partition through one shared driver.
    pub fn provider(driver: Arc<dyn RemoteDriver>) -> impl SuperBlockProvider {
        move |partition: &str| -> GraphResult<Arc<dyn SuperBlock>> {
            let sb: Arc<dyn SuperBlock> = RemoteSuperBlock::open(Arc::clone(&driver), partition)?;
            Ok(sb)
        }
    }

    fn check_open(&self) -> GraphResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GraphError::Closed("superblock"));
        }
        Ok(())
    }

    fn weak_self(&self) -> Weak<dyn SuperBlock> {
        let weak: Weak<dyn SuperBlock> = self.this.clone();
        weak
    }

    fn call(&self, operation: &'static str, request: Request) -> GraphResult<Response> {
        self.check_open()?;
        match self.driver.call(&request)? {
            Response::Fault(fault) => Err(fault.into_error(operation)),
            response => Ok(response),
        }
    }

    fn denied(operation: &'static str) -> GraphError {
        GraphError::Unsupported { backend: BACKEND, operation }
    }
}

fn unexpected(operation: &str, response: &Response) -> GraphError {
    GraphError::Codec(format!("unexpected response to remote {}: {:?}", operation, response))
}

impl SuperBlock for RemoteSuperBlock {
    fn uuid(&self) -> &str {
        &self.uuid
    }

    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn root(&self) -> GraphResult<Arc<CacheEntry>> {
        self.check_open()?;
        let mut root = self.root.lock();
        if let Some(entry) = root.as_ref() {
            return Ok(Arc::clone(entry));
        }
        let entry = CacheEntry::new_root(&self.uuid, self.make_inode(0)?)?;
        *root = Some(Arc::clone(&entry));
        Ok(entry)
    }

    fn allocate_inode(&self) -> GraphResult<Arc<INode>> {
        Err(Self::denied("allocate"))
    }

    fn make_inode(&self, id: i64) -> GraphResult<Arc<INode>> {
        if id < 0 {
            return Err(GraphError::InvalidArgument(format!("negative inode id {}", id)));
        }
        Ok(self.inodes.get_or_insert(&self.weak_self(), id))
    }

    /// Only an entry that is already bound succeeds; nothing is created.
    fn create(&self, entry: &Arc<CacheEntry>, _options: &OpenOptions) -> GraphResult<Arc<INode>> {
        self.check_open()?;
        entry.inode().ok_or_else(|| Self::denied("create"))
    }

    fn lookup(&self, parent: &INode, name: &PathElement) -> GraphResult<Option<Arc<INode>>> {
        let request = Request::Lookup {
            partition: self.uuid.clone(),
            parent: parent.id(),
            name: name.clone(),
        };
        match self.call("lookup", request)? {
            Response::Id(Some(id)) => Ok(Some(self.make_inode(id)?)),
            Response::Id(None) => Ok(None),
            other => Err(unexpected("lookup", &other)),
        }
    }

    fn read(&self, inode: &INode) -> GraphResult<SerializedNode> {
        let request = Request::Read { partition: self.uuid.clone(), id: inode.id() };
        match self.call("read", request)? {
            Response::Node(node) => Ok(node),
            other => Err(unexpected("read", &other)),
        }
    }

    fn write(&self, _inode: &INode, _node: &SerializedNode) -> GraphResult<()> {
        Err(Self::denied("write"))
    }

    fn set_edge(&self, _inode: &INode, _edge: &SerializedEdge) -> GraphResult<()> {
        Err(Self::denied("set_edge"))
    }

    fn remove_edge(&self, _inode: &INode, _key: &EdgeKey) -> GraphResult<()> {
        Err(Self::denied("remove_edge"))
    }

    fn read_edge(&self, inode: &INode, key: &EdgeKey) -> GraphResult<Option<SerializedEdge>> {
        let request = Request::ReadEdge {
            partition: self.uuid.clone(),
            id: inode.id(),
            key: key.clone(),
        };
        match self.call("read_edge", request)? {
            Response::Edge(edge) => Ok(edge),
            other => Err(unexpected("read_edge", &other)),
        }
    }

    fn read_edges(&self, inode: &INode) -> GraphResult<Vec<SerializedEdge>> {
        let request = Request::ReadEdges { partition: self.uuid.clone(), id: inode.id() };
        match self.call("read_edges", request)? {
            Response::Edges(edges) => Ok(edges),
            other => Err(unexpected("read_edges", &other)),
        }
    }

    fn free_id(&self, _id: i64) -> GraphResult<()> {
        Err(Self::denied("free_id"))
    }

    fn release_inode(&self, id: i64) {
        self.inodes.forget(id);
    }

    fn read_only(&self) -> bool {
        true
    }

    fn flush(&self) -> GraphResult<()> {
        self.check_open()
    }

    fn close(&self) -> GraphResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.root.lock().take();
        match self.driver.call(&Request::Close { partition: self.uuid.clone() }) {
            Ok(Response::Done) => Ok(()),
            Ok(Response::Fault(fault)) => {
                warn!(partition = %self.uuid, message = %fault.message, "remote close refused");
                Ok(())
            }
            Ok(other) => Err(unexpected("close", &other)),
            Err(err) => Err(err),
        }
    }
}

impl std::fmt::Debug for RemoteSuperBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSuperBlock")
            .field("uuid", &self.uuid)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::LoopbackDriver;
    use graphfs_core::KvSuperBlock;

    fn remote_over(authority: Arc<KvSuperBlock>) -> (Arc<RemoteSuperBlock>, Arc<LoopbackDriver>) {
        let driver = Arc::new(LoopbackDriver::new());
        driver.attach("R", authority);
        let sb = RemoteSuperBlock::open(driver.clone(), "R").unwrap();
        (sb, driver)
    }

    #[test]
    fn test_open_unknown_partition_fails() {
        let driver = Arc::new(LoopbackDriver::new());
        assert!(RemoteSuperBlock::open(driver, "nowhere").unwrap_err().is_not_found());
    }

    #[test]
    fn test_mutations_are_unsupported() {
        let (sb, _driver) = remote_over(KvSuperBlock::in_memory("R"));
        let root = sb.root().unwrap();
        let inode = root.inode().unwrap();

        assert!(sb.read_only());
        assert!(matches!(sb.allocate_inode(), Err(GraphError::Unsupported { backend: "remote", .. })));
        assert!(matches!(
            sb.write(&inode, &SerializedNode::default()),
            Err(GraphError::Unsupported { operation: "write", .. })
        ));
        let missing = root.lookup_child(sb.as_ref(), &PathElement::new("x").unwrap()).unwrap();
        assert!(matches!(
            sb.create(&missing, &OpenOptions::create_if_missing()),
            Err(GraphError::Unsupported { operation: "create", .. })
        ));
    }

    #[test]
    fn test_closed_remote_stops_forwarding() {
        let (sb, driver) = remote_over(KvSuperBlock::in_memory("R"));
        let inode = sb.make_inode(0).unwrap();
        sb.close().unwrap();
        let calls = driver.calls();
        assert!(matches!(sb.read_edges(&inode), Err(GraphError::Closed(_))));
        assert_eq!(driver.calls(), calls);
        sb.close().unwrap();
    }
}
