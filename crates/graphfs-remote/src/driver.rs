//! The RPC boundary and an in-process loopback implementation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use graphfs_core::{GraphError, GraphResult, SuperBlock};
use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::wire::{self, Fault, Request, Response};

/// Carries one request to the remote authority and returns its answer.
///
/// Calls may block for a full round trip. A transport failure is an error;
/// a failure on the remote side comes back as `Response::Fault`.
pub trait RemoteDriver: Send + Sync {
    fn call(&self, request: &Request) -> GraphResult<Response>;
}

/// Answer `request` from a local superblock. This is the server half of
/// the protocol; transports call it after decoding a request.
pub fn serve(sb: &dyn SuperBlock, request: &Request) -> Response {
    let result = match request {
        Request::Ping { .. } => Ok(Response::Pong),
        Request::Lookup { parent, name, .. } => sb
            .make_inode(*parent)
            .and_then(|parent| sb.lookup(&parent, name))
            .map(|found| Response::Id(found.map(|inode| inode.id()))),
        Request::Read { id, .. } => sb.make_inode(*id).and_then(|inode| sb.read(&inode)).map(Response::Node),
        Request::ReadEdge { id, key, .. } => sb
            .make_inode(*id)
            .and_then(|inode| sb.read_edge(&inode, key))
            .map(Response::Edge),
        Request::ReadEdges { id, .. } => sb
            .make_inode(*id)
            .and_then(|inode| sb.read_edges(&inode))
            .map(Response::Edges),
        // Ends the session only; the authority stays up.
        Request::Close { .. } => Ok(Response::Done),
    };
    result.unwrap_or_else(|err| Response::Fault(Fault::from(&err)))
}

/// Driver that serves requests from local superblocks, pushing every
/// request and response through the wire codec on the way.
#[derive(Default)]
pub struct LoopbackDriver {
    authorities: RwLock<HashMap<String, Arc<dyn SuperBlock>>>,
    calls: AtomicU64,
}

impl LoopbackDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `partition` from `sb`.
    pub fn attach(&self, partition: &str, sb: Arc<dyn SuperBlock>) {
        self.authorities.write().insert(partition.to_string(), sb);
    }

    pub fn detach(&self, partition: &str) -> Option<Arc<dyn SuperBlock>> {
        self.authorities.write().remove(partition)
    }

    /// Round trips made so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl RemoteDriver for LoopbackDriver {
    fn call(&self, request: &Request) -> GraphResult<Response> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let request = wire::decode_request(&wire::encode_request(request)?)?;

        let sb = self.authorities.read().get(request.partition()).cloned();
        let response = match sb {
            Some(sb) => serve(sb.as_ref(), &request),
            None => Response::Fault(Fault::from(&GraphError::NotFound(format!(
                "partition {}",
                request.partition()
            )))),
        };
        debug!(partition = request.partition(), ?response, "loopback call");

        wire::decode_response(&wire::encode_response(&response)?)
    }
}
