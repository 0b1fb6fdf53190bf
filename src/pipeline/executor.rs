//! Per-registration message execution.
//!
//! A [`NodeExecutor`] owns at most one sandbox worker, acquired lazily on the
//! first message. Every worker call is raced against the registration's
//! cancellation token and the configured timeout:
//!
//! ```text
//! process ──► handshake (first call) ──► ProcessMessage ──┬─► derived event
//!                                                        ├─► runtime error → diagnostics
//!                                                        ├─► no message    → warning
//!                                                        └─► cancel/timeout → "timed out"
//! ```
//!
//! A [`NodeRegistration`] holds two executors, one for streaming messages
//! and one for pre-loaded blocks, so stateful scripts never see the two
//! sequences interleaved.

use crate::pipeline::bridge::DiagnosticsSink;
use crate::pipeline::compiler::{CompiledNode, OutputSchema};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::NodeId;
use crate::pipeline::problems::{ProblemKey, ProblemStore};
use crate::pipeline::rpc::WorkerMessage;
use crate::pipeline::worker_pool::{WorkerHandle, WorkerPool};
use crate::types::{
    Diagnostic, DiagnosticCode, DiagnosticSource, GlobalVariables, MessageEvent, PlayerProblem,
    Severity,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Shared collaborators of every executor in a stage.
pub struct NodeServices {
    pub pool: Arc<WorkerPool>,
    pub problems: Arc<ProblemStore>,
    pub sink: Arc<dyn DiagnosticsSink>,
    pub process_timeout: Duration,
}

/// The topic a registration publishes on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputTopic {
    pub name: String,
    pub schema_name: String,
    pub schema: OutputSchema,
}

enum CallOutcome<T> {
    Done(PipelineResult<T>),
    TimedOut,
    Cancelled,
}

#[derive(Default)]
struct ExecutorState {
    worker: Option<WorkerHandle>,
    /// Runtime diagnostics were published and must be reset on success.
    runtime_diagnostics: bool,
}

pub struct NodeExecutor {
    node_id: NodeId,
    node_name: String,
    output: OutputTopic,
    project_code: Arc<str>,
    node_code: Arc<str>,
    base_diagnostics: Vec<Diagnostic>,
    services: Arc<NodeServices>,
    token: CancellationToken,
    state: Mutex<ExecutorState>,
}

impl NodeExecutor {
    fn new(
        node_id: NodeId,
        node_name: String,
        compiled: &CompiledNode,
        output: OutputTopic,
        services: Arc<NodeServices>,
        token: CancellationToken,
    ) -> Self {
        Self {
            node_id,
            node_name,
            output,
            project_code: compiled.library_code.clone(),
            node_code: compiled.node_code.as_str().into(),
            base_diagnostics: compiled.diagnostics.clone(),
            services,
            token,
            state: Mutex::new(ExecutorState::default()),
        }
    }

    fn problem_key(&self) -> ProblemKey {
        ProblemKey::Node(self.node_id.clone())
    }

    fn set_problem(&self, problem: PlayerProblem) {
        self.services.problems.set(self.problem_key(), problem);
    }

    async fn race<T>(&self, call: impl Future<Output = PipelineResult<T>>) -> CallOutcome<T> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => CallOutcome::Cancelled,
            result = tokio::time::timeout(self.services.process_timeout, call) => match result {
                Ok(result) => CallOutcome::Done(result),
                Err(_) => CallOutcome::TimedOut,
            },
        }
    }

    fn timed_out(&self, state: &mut ExecutorState) {
        tracing::warn!("Node {} ({}) timed out", self.node_name, self.node_id);
        self.set_problem(PlayerProblem::new(
            Severity::Warn,
            format!("User node {} timed out", self.node_name),
        ));
        if let Some(handle) = state.worker.take() {
            self.services.pool.discard(handle);
        }
    }

    /// Return a worker after a failed call. Only a broken connection costs
    /// the worker; anything else leaves it usable.
    fn retire(&self, handle: WorkerHandle, err: &PipelineError) -> Option<WorkerHandle> {
        if err.is_worker_fatal() {
            self.services.pool.discard(handle);
            None
        } else {
            Some(handle)
        }
    }

    fn publish_runtime_diagnostics(&self, state: &mut ExecutorState, extra: Vec<Diagnostic>) {
        let mut diagnostics = self.base_diagnostics.clone();
        diagnostics.extend(extra);
        self.services.sink.set_diagnostics(&self.node_id, diagnostics);
        state.runtime_diagnostics = true;
    }

    /// Acquire a worker and run the handshake. Failures leave no worker so the
    /// next message retries with a fresh one.
    async fn start_worker(&self, state: &mut ExecutorState) {
        let pool = &self.services.pool;
        let mut handle = match pool.acquire() {
            Ok(handle) => handle,
            Err(err) => {
                tracing::error!("Node {}: {}", self.node_id, err);
                self.set_problem(
                    PlayerProblem::new(
                        Severity::Error,
                        format!("Failed to start a worker for user node {}", self.node_name),
                    )
                    .with_error(err.to_string()),
                );
                return;
            }
        };

        let outcome = self
            .race(pool.register(&mut handle, &self.project_code, &self.node_code))
            .await;
        match outcome {
            CallOutcome::Done(Ok(reply)) => {
                self.services.sink.add_logs(&self.node_id, reply.logs.clone());
                if reply.is_ok() {
                    tracing::debug!("Node {} registered on {}", self.node_id, handle.id());
                    state.worker = Some(handle);
                    return;
                }
                let mut diagnostics = reply.diagnostics;
                let error = reply.error.unwrap_or_else(|| "registration failed".to_string());
                if diagnostics.is_empty() {
                    diagnostics.push(Diagnostic::error(
                        DiagnosticSource::Registration,
                        DiagnosticCode::RegistrationFailed,
                        error.clone(),
                    ));
                }
                self.publish_runtime_diagnostics(state, diagnostics);
                self.set_problem(
                    PlayerProblem::new(
                        Severity::Error,
                        format!("Failed to register user node {}", self.node_name),
                    )
                    .with_error(error),
                );
                pool.discard(handle);
            }
            CallOutcome::Done(Err(err)) => {
                tracing::warn!("Node {}: handshake failed: {}", self.node_id, err);
                self.set_problem(
                    PlayerProblem::new(
                        Severity::Error,
                        format!("Failed to register user node {}", self.node_name),
                    )
                    .with_error(err.to_string()),
                );
                if let Some(handle) = self.retire(handle, &err) {
                    pool.release(handle);
                }
            }
            CallOutcome::TimedOut | CallOutcome::Cancelled => {
                state.worker = Some(handle);
                self.timed_out(state);
            }
        }
    }

    /// Run the node over one message.
    pub async fn process(
        &self,
        event: &MessageEvent,
        globals: &GlobalVariables,
    ) -> Option<MessageEvent> {
        if self.token.is_cancelled() {
            return None;
        }
        let mut state = tokio::select! {
            biased;
            _ = self.token.cancelled() => return None,
            state = self.state.lock() => state,
        };

        if state.worker.is_none() {
            self.start_worker(&mut state).await;
        }
        let mut handle = state.worker.take()?;

        let message = WorkerMessage {
            topic: event.topic.clone(),
            receive_time: event.receive_time,
            message: event.message.clone(),
            datatype: event.schema_name.clone(),
        };
        let outcome = self.race(handle.process(message, globals.clone())).await;

        let reply = match outcome {
            CallOutcome::Done(Ok(reply)) => {
                state.worker = Some(handle);
                reply
            }
            CallOutcome::Done(Err(err)) => {
                tracing::warn!("Node {} lost its worker: {}", self.node_id, err);
                self.set_problem(
                    PlayerProblem::new(
                        Severity::Error,
                        format!("User node {} worker failed", self.node_name),
                    )
                    .with_error(err.to_string()),
                );
                state.worker = self.retire(handle, &err);
                return None;
            }
            CallOutcome::TimedOut | CallOutcome::Cancelled => {
                state.worker = Some(handle);
                self.timed_out(&mut state);
                return None;
            }
        };

        self.services.sink.add_logs(&self.node_id, reply.logs);

        if reply.error.is_some() || !reply.diagnostics.is_empty() {
            let error = reply.error.unwrap_or_else(|| "runtime error".to_string());
            let mut diagnostics = reply.diagnostics;
            if diagnostics.is_empty() {
                diagnostics.push(Diagnostic::error(
                    DiagnosticSource::Runtime,
                    DiagnosticCode::RuntimeError,
                    error.clone(),
                ));
            }
            for diagnostic in &mut diagnostics {
                diagnostic.severity = Severity::Error;
            }
            self.publish_runtime_diagnostics(&mut state, diagnostics);
            self.set_problem(
                PlayerProblem::new(
                    Severity::Error,
                    format!("User node {} encountered an error", self.node_name),
                )
                .with_error(error),
            );
            return None;
        }

        let Some(message) = reply.message else {
            self.set_problem(
                PlayerProblem::new(
                    Severity::Warn,
                    format!("User node {} did not produce a message", self.node_name),
                )
                .with_tip("Return a map from process(), or () to skip a message deliberately"),
            );
            return None;
        };

        if state.runtime_diagnostics {
            self.services
                .sink
                .set_diagnostics(&self.node_id, self.base_diagnostics.clone());
            state.runtime_diagnostics = false;
        }
        self.services.problems.clear(&self.problem_key());

        Some(MessageEvent {
            topic: self.output.name.clone(),
            receive_time: event.receive_time,
            message,
            schema_name: self.output.schema_name.clone(),
            size_in_bytes: event.size_in_bytes,
        })
    }

    /// Release the worker and forget the node's problem. The cancellation
    /// token must already be cancelled.
    async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if let Some(handle) = state.worker.take() {
            self.services.pool.release(handle);
        }
    }
}

/// A compiled user node wired to its executors.
pub struct NodeRegistration {
    pub node_id: NodeId,
    pub node_name: String,
    pub inputs: Vec<String>,
    pub output: OutputTopic,
    pub diagnostics: Vec<Diagnostic>,
    services: Arc<NodeServices>,
    token: CancellationToken,
    stream: NodeExecutor,
    block: NodeExecutor,
}

impl NodeRegistration {
    pub fn new(
        node_id: NodeId,
        node_name: impl Into<String>,
        compiled: &CompiledNode,
        services: Arc<NodeServices>,
    ) -> Self {
        let node_name = node_name.into();
        let output = OutputTopic {
            name: compiled.output_topic.clone(),
            schema_name: compiled.output_schema.name.clone(),
            schema: compiled.output_schema.clone(),
        };
        let token = CancellationToken::new();
        let executor = |token: CancellationToken| {
            NodeExecutor::new(
                node_id.clone(),
                node_name.clone(),
                compiled,
                output.clone(),
                services.clone(),
                token,
            )
        };
        let stream = executor(token.child_token());
        let block = executor(token.child_token());

        Self {
            node_id,
            node_name,
            inputs: compiled.inputs.clone(),
            output,
            diagnostics: compiled.diagnostics.clone(),
            services,
            token,
            stream,
            block,
        }
    }

    /// Process a streaming message.
    pub async fn process(
        &self,
        event: &MessageEvent,
        globals: &GlobalVariables,
    ) -> Option<MessageEvent> {
        self.stream.process(event, globals).await
    }

    /// Process a message from a pre-loaded block.
    pub async fn process_block(
        &self,
        event: &MessageEvent,
        globals: &GlobalVariables,
    ) -> Option<MessageEvent> {
        self.block.process(event, globals).await
    }

    pub fn consumes(&self, topic: &str) -> bool {
        self.inputs.iter().any(|input| input == topic)
    }

    pub fn is_terminated(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel in-flight calls, return workers to the pool and clear the
    /// node's problem. Idempotent.
    pub async fn terminate(&self) {
        self.token.cancel();
        self.stream.shutdown().await;
        self.block.shutdown().await;
        self.services
            .problems
            .clear(&ProblemKey::Node(self.node_id.clone()));
    }
}

impl std::fmt::Debug for NodeRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistration")
            .field("node_id", &self.node_id)
            .field("inputs", &self.inputs)
            .field("output", &self.output.name)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}
