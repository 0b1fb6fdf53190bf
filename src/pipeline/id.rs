//! Identity types for the user node stage.
//!
//! Node ids come from the host application and are opaque strings. Worker and
//! request ids are allocated locally by the pool and the RPC channel.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identity of a user node, assigned by the host.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        NodeId(value.to_string())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        NodeId(value)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a sandbox worker, unique for the lifetime of a pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct WorkerId(pub u32);

impl fmt::Debug for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkerId({})", self.0)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Correlation id of a single RPC call on a worker channel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl RequestId {
    #[inline]
    pub fn next(self) -> Self {
        RequestId(self.0.wrapping_add(1))
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_display() {
        let id = NodeId::from("node-1");
        assert_eq!(id.to_string(), "node-1");
        assert_eq!(format!("{:?}", id), "NodeId(node-1)");
        assert_eq!(id.as_str(), "node-1");
    }

    #[test]
    fn test_node_id_serde_is_transparent() {
        let id = NodeId::from("abc");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
        let back: NodeId = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_worker_id_display() {
        assert_eq!(WorkerId(3).to_string(), "worker-3");
    }

    #[test]
    fn test_request_id_next_wraps() {
        assert_eq!(RequestId(1).next(), RequestId(2));
        assert_eq!(RequestId(u64::MAX).next(), RequestId(0));
    }
}
