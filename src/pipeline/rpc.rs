//! Typed request/response protocol between the stage and sandbox workers.
//!
//! Requests travel over a `crossbeam_channel` to the worker thread, each in an
//! [`RpcEnvelope`] that carries a correlation id and a `oneshot` reply slot.
//! The async side awaits the reply and verifies the correlation id.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::{RequestId, WorkerId};
use crate::types::{Diagnostic, GlobalVariables, Time, UserNodeLog};
use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

/// The message handed to a worker for one `process` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMessage {
    pub topic: String,
    pub receive_time: Time,
    pub message: serde_json::Value,
    /// Schema name of the input message.
    pub datatype: String,
}

/// Requests a worker understands.
#[derive(Debug, Clone)]
pub enum WorkerRequest {
    /// Handshake: load the generated library and the node code.
    RegisterNode {
        project_code: String,
        node_code: String,
    },
    /// Run the registered node over one message.
    ProcessMessage {
        message: WorkerMessage,
        global_variables: GlobalVariables,
    },
}

impl WorkerRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerRequest::RegisterNode { .. } => "register",
            WorkerRequest::ProcessMessage { .. } => "process",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrationReply {
    pub error: Option<String>,
    pub diagnostics: Vec<Diagnostic>,
    pub logs: Vec<UserNodeLog>,
}

impl RegistrationReply {
    pub fn is_ok(&self) -> bool {
        self.error.is_none() && self.diagnostics.iter().all(|d| !d.is_error())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessReply {
    pub message: Option<serde_json::Value>,
    pub error: Option<String>,
    pub diagnostics: Vec<Diagnostic>,
    pub logs: Vec<UserNodeLog>,
}

/// Replies a worker produces, one per request.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerResponse {
    Registered(RegistrationReply),
    Processed(ProcessReply),
}

/// A request in flight to a worker.
#[derive(Debug)]
pub struct RpcEnvelope {
    pub id: RequestId,
    pub request: WorkerRequest,
    pub reply: oneshot::Sender<RpcReply>,
}

impl RpcEnvelope {
    /// Answer this envelope. A receiver that has gone away is not an error
    /// for the worker: the caller timed out or was cancelled.
    pub fn respond(self, response: WorkerResponse) {
        let _ = self.reply.send(RpcReply {
            id: self.id,
            response,
        });
    }
}

#[derive(Debug)]
pub struct RpcReply {
    pub id: RequestId,
    pub response: WorkerResponse,
}

/// Something that can host sandbox workers.
///
/// `spawn` starts a worker that serves `requests` until the channel
/// disconnects. Implementations must not block the caller.
pub trait SandboxRuntime: Send + Sync {
    fn spawn(&self, worker_id: WorkerId, requests: Receiver<RpcEnvelope>) -> PipelineResult<()>;
}

/// The stage side of one worker connection.
#[derive(Debug)]
pub struct RpcChannel {
    worker_id: WorkerId,
    requests: Sender<RpcEnvelope>,
    next_id: RequestId,
}

impl RpcChannel {
    pub fn new(worker_id: WorkerId, requests: Sender<RpcEnvelope>) -> Self {
        Self {
            worker_id,
            requests,
            next_id: RequestId(1),
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Send one request and wait for its reply.
    pub async fn call(&mut self, request: WorkerRequest) -> PipelineResult<WorkerResponse> {
        let id = self.next_id;
        self.next_id = id.next();
        let (reply_tx, reply_rx) = oneshot::channel();

        tracing::trace!("{} <- {} {:?}", self.worker_id, request.kind(), id);
        self.requests
            .send(RpcEnvelope {
                id,
                request,
                reply: reply_tx,
            })
            .map_err(|_| PipelineError::WorkerDisconnected {
                worker_id: self.worker_id,
            })?;

        let reply = reply_rx
            .await
            .map_err(|_| PipelineError::WorkerDisconnected {
                worker_id: self.worker_id,
            })?;

        if reply.id != id {
            return Err(PipelineError::ResponseMismatch {
                worker_id: self.worker_id,
                expected: id,
                actual: reply.id,
            });
        }
        Ok(reply.response)
    }

    pub async fn register(
        &mut self,
        project_code: String,
        node_code: String,
    ) -> PipelineResult<RegistrationReply> {
        match self
            .call(WorkerRequest::RegisterNode {
                project_code,
                node_code,
            })
            .await?
        {
            WorkerResponse::Registered(reply) => Ok(reply),
            WorkerResponse::Processed(_) => Err(PipelineError::UnexpectedReply {
                worker_id: self.worker_id,
            }),
        }
    }

    pub async fn process(
        &mut self,
        message: WorkerMessage,
        global_variables: GlobalVariables,
    ) -> PipelineResult<ProcessReply> {
        match self
            .call(WorkerRequest::ProcessMessage {
                message,
                global_variables,
            })
            .await?
        {
            WorkerResponse::Processed(reply) => Ok(reply),
            WorkerResponse::Registered(_) => Err(PipelineError::UnexpectedReply {
                worker_id: self.worker_id,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    fn echo_worker(requests: Receiver<RpcEnvelope>) {
        std::thread::spawn(move || {
            while let Ok(envelope) = requests.recv() {
                let response = match &envelope.request {
                    WorkerRequest::RegisterNode { .. } => {
                        WorkerResponse::Registered(RegistrationReply::default())
                    }
                    WorkerRequest::ProcessMessage { message, .. } => {
                        WorkerResponse::Processed(ProcessReply {
                            message: Some(message.message.clone()),
                            ..Default::default()
                        })
                    }
                };
                envelope.respond(response);
            }
        });
    }

    fn message() -> WorkerMessage {
        WorkerMessage {
            topic: "/a".into(),
            receive_time: Time::from_secs(1),
            message: serde_json::json!({"v": 1}),
            datatype: "Num".into(),
        }
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let (tx, rx) = unbounded();
        echo_worker(rx);
        let mut channel = RpcChannel::new(WorkerId(1), tx);

        let reply = channel.register(String::new(), String::new()).await.unwrap();
        assert!(reply.is_ok());

        let reply = channel.process(message(), GlobalVariables::new()).await.unwrap();
        assert_eq!(reply.message, Some(serde_json::json!({"v": 1})));
    }

    #[tokio::test]
    async fn test_dropped_worker_is_disconnected() {
        let (tx, rx) = unbounded();
        drop(rx);
        let mut channel = RpcChannel::new(WorkerId(7), tx);
        let err = channel.process(message(), GlobalVariables::new()).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::WorkerDisconnected { worker_id } if worker_id == WorkerId(7)
        ));
    }

    #[tokio::test]
    async fn test_mismatched_reply_id_is_rejected() {
        let (tx, rx) = unbounded::<RpcEnvelope>();
        std::thread::spawn(move || {
            while let Ok(envelope) = rx.recv() {
                let _ = envelope.reply.send(RpcReply {
                    id: RequestId(999),
                    response: WorkerResponse::Registered(RegistrationReply::default()),
                });
            }
        });
        let mut channel = RpcChannel::new(WorkerId(1), tx);
        let err = channel.register(String::new(), String::new()).await.unwrap_err();
        assert!(err.is_worker_fatal());
    }

    #[tokio::test]
    async fn test_wrong_reply_kind_is_rejected() {
        let (tx, rx) = unbounded::<RpcEnvelope>();
        std::thread::spawn(move || {
            while let Ok(envelope) = rx.recv() {
                envelope.respond(WorkerResponse::Registered(RegistrationReply::default()));
            }
        });
        let mut channel = RpcChannel::new(WorkerId(1), tx);
        let err = channel.process(message(), GlobalVariables::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::UnexpectedReply { .. }));
    }
}
