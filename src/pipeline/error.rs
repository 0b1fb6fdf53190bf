//! Stage-specific error types.
//!
//! Per-node failures never surface as `PipelineError`; they become diagnostics
//! and player problems. These errors describe failures of the stage itself.

use crate::pipeline::id::{NodeId, RequestId, WorkerId};
use thiserror::Error;

/// Errors that can occur within the user node stage.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A node consumes the output of another node. The graph builder rejects
    /// this before it can happen, so reaching it is an internal fault.
    #[error("Node {node_id} subscribes to {topic}, which is the output of another user node")]
    ChainedNode { node_id: NodeId, topic: String },

    #[error("Failed to spawn sandbox worker: {0}")]
    WorkerSpawn(String),

    #[error("Sandbox {worker_id} disconnected")]
    WorkerDisconnected { worker_id: WorkerId },

    #[error("Sandbox {worker_id} replied to {actual:?}, expected {expected:?}")]
    ResponseMismatch {
        worker_id: WorkerId,
        expected: RequestId,
        actual: RequestId,
    },

    #[error("Sandbox {worker_id} sent a reply of the wrong kind")]
    UnexpectedReply { worker_id: WorkerId },

    #[error("Script error: {0}")]
    Script(String),

    #[error("Processing task failed: {0}")]
    TaskJoin(String),

    #[error("Channel send error")]
    ChannelSend,

    #[error("Stage is not active")]
    NotActive,
}

impl PipelineError {
    /// Whether the worker that produced this error must be discarded.
    pub fn is_worker_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::WorkerDisconnected { .. }
                | PipelineError::ResponseMismatch { .. }
                | PipelineError::UnexpectedReply { .. }
        )
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(err: tokio::task::JoinError) -> Self {
        PipelineError::TaskJoin(err.to_string())
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_fatal_classification() {
        assert!(PipelineError::WorkerDisconnected { worker_id: WorkerId(1) }.is_worker_fatal());
        assert!(PipelineError::UnexpectedReply { worker_id: WorkerId(1) }.is_worker_fatal());
        assert!(!PipelineError::NotActive.is_worker_fatal());
        assert!(!PipelineError::ChainedNode {
            node_id: NodeId::from("n"),
            topic: "/t".into()
        }
        .is_worker_fatal());
    }

    #[test]
    fn test_mismatch_display() {
        let err = PipelineError::ResponseMismatch {
            worker_id: WorkerId(2),
            expected: RequestId(5),
            actual: RequestId(4),
        };
        assert_eq!(
            err.to_string(),
            "Sandbox worker-2 replied to RequestId(4), expected RequestId(5)"
        );
    }
}
