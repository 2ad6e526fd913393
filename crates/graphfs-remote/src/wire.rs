//! Request/response messages exchanged with a remote authority.
//!
//! Messages travel as named-field MessagePack. Errors cross the boundary as a
//! [`Fault`] so the not-found / denied / unsupported distinction survives the
//! round trip; anything else comes back as [`FaultKind::Other`].

use graphfs_core::{EdgeKey, GraphError, GraphResult, PathElement, SerializedEdge, SerializedNode};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Liveness check; answered with `Pong`
    Ping { partition: String },
    Lookup { partition: String, parent: i64, name: PathElement },
    Read { partition: String, id: i64 },
    ReadEdge { partition: String, id: i64, key: EdgeKey },
    ReadEdges { partition: String, id: i64 },
    Close { partition: String },
}

impl Request {
    pub fn partition(&self) -> &str {
        match self {
            Request::Ping { partition }
            | Request::Lookup { partition, .. }
            | Request::Read { partition, .. }
            | Request::ReadEdge { partition, .. }
            | Request::ReadEdges { partition, .. }
            | Request::Close { partition } => partition,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Pong,
    Id(Option<i64>),
    Node(SerializedNode),
    Edge(Option<SerializedEdge>),
    Edges(Vec<SerializedEdge>),
    Done,
    Fault(Fault),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    NotFound,
    PermissionDenied,
    Unsupported,
    Closed,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
}

impl From<&GraphError> for Fault {
    fn from(err: &GraphError) -> Self {
        let kind = match err {
            GraphError::NotFound(_) => FaultKind::NotFound,
            GraphError::PermissionDenied(_) => FaultKind::PermissionDenied,
            GraphError::Unsupported { .. } => FaultKind::Unsupported,
            GraphError::Closed(_) => FaultKind::Closed,
            _ => FaultKind::Other,
        };
        let message = match err {
            GraphError::NotFound(what) | GraphError::PermissionDenied(what) => what.clone(),
            other => other.to_string(),
        };
        Fault { kind, message }
    }
}

impl Fault {
    /// Rebuild a local error. `operation` names the call that faulted.
    pub fn into_error(self, operation: &'static str) -> GraphError {
        match self.kind {
            FaultKind::NotFound => GraphError::NotFound(self.message),
            FaultKind::PermissionDenied => GraphError::PermissionDenied(self.message),
            FaultKind::Unsupported => GraphError::Unsupported { backend: "remote", operation },
            FaultKind::Closed => GraphError::Closed("remote partition"),
            FaultKind::Other => GraphError::Codec(format!("remote {} failed: {}", operation, self.message)),
        }
    }
}

pub fn encode_request(request: &Request) -> GraphResult<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(request)?)
}

pub fn decode_request(bytes: &[u8]) -> GraphResult<Request> {
    Ok(rmp_serde::from_slice(bytes)?)
}

pub fn encode_response(response: &Response) -> GraphResult<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(response)?)
}

pub fn decode_response(bytes: &[u8]) -> GraphResult<Response> {
    Ok(rmp_serde::from_slice(bytes)?)
}
