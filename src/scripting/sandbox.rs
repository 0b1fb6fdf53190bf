//! Rhai-backed sandbox workers.
//!
//! Every worker is a dedicated OS thread owning its own [`ScriptEngine`]. It
//! serves [`RpcEnvelope`]s until the request channel disconnects. A panic
//! while handling a request ends the thread without replying, which the
//! caller observes as a disconnected worker.

use crate::config::ScriptLimits;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::WorkerId;
use crate::pipeline::rpc::{
    ProcessReply, RegistrationReply, RpcEnvelope, SandboxRuntime, WorkerMessage, WorkerRequest,
    WorkerResponse,
};
use crate::scripting::engine::{
    eval_error_diagnostic, from_script_value, has_function, parse_error_diagnostic,
    to_script_value, ScriptEngine,
};
use crate::types::{DiagnosticCode, DiagnosticSource, GlobalVariables, LogSource};
use crossbeam_channel::Receiver;
use rhai::{Dynamic, Scope, AST};
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Spawns one thread per worker.
#[derive(Debug, Clone)]
pub struct RhaiSandbox {
    limits: ScriptLimits,
    thread_prefix: String,
}

impl RhaiSandbox {
    pub fn new(limits: ScriptLimits, thread_prefix: impl Into<String>) -> Self {
        Self {
            limits,
            thread_prefix: thread_prefix.into(),
        }
    }
}

impl Default for RhaiSandbox {
    fn default() -> Self {
        Self::new(ScriptLimits::default(), "scriptflow-worker")
    }
}

impl SandboxRuntime for RhaiSandbox {
    fn spawn(&self, worker_id: WorkerId, requests: Receiver<RpcEnvelope>) -> PipelineResult<()> {
        let limits = self.limits.clone();
        std::thread::Builder::new()
            .name(format!("{}-{}", self.thread_prefix, worker_id.0))
            .spawn(move || {
                let mut worker = SandboxWorker::new(&limits);
                worker.serve(worker_id, requests);
            })
            .map(|_| ())
            .map_err(|e| PipelineError::WorkerSpawn(e.to_string()))
    }
}

/// State of one worker thread.
struct SandboxWorker {
    engine: ScriptEngine,
    scope: Scope<'static>,
    ast: Option<AST>,
    /// Bound as `this` in `process`, kept between messages.
    state: Dynamic,
}

impl SandboxWorker {
    fn new(limits: &ScriptLimits) -> Self {
        Self {
            engine: ScriptEngine::new(limits),
            scope: Scope::new(),
            ast: None,
            state: Dynamic::from_map(rhai::Map::new()),
        }
    }

    fn serve(&mut self, worker_id: WorkerId, requests: Receiver<RpcEnvelope>) {
        tracing::debug!("Sandbox {} started", worker_id);
        while let Ok(envelope) = requests.recv() {
            let handled = catch_unwind(AssertUnwindSafe(|| self.handle(&envelope.request)));
            match handled {
                Ok(response) => envelope.respond(response),
                Err(_) => {
                    tracing::error!("Sandbox {} crashed handling a request", worker_id);
                    return;
                }
            }
        }
        tracing::debug!("Sandbox {} stopped", worker_id);
    }

    fn handle(&mut self, request: &WorkerRequest) -> WorkerResponse {
        match request {
            WorkerRequest::RegisterNode {
                project_code,
                node_code,
            } => WorkerResponse::Registered(self.register(project_code, node_code)),
            WorkerRequest::ProcessMessage {
                message,
                global_variables,
            } => WorkerResponse::Processed(self.process(message, global_variables)),
        }
    }

    fn register(&mut self, project_code: &str, node_code: &str) -> RegistrationReply {
        self.ast = None;
        self.scope = Scope::new();
        self.state = Dynamic::from_map(rhai::Map::new());
        // Discard anything left over from a previous node on this worker.
        let _ = self.engine.take_logs(LogSource::Registration);

        let ast = match self.engine.compile_with_library(project_code, node_code) {
            Ok(ast) => ast,
            Err(err) => {
                return RegistrationReply {
                    error: Some(err.to_string()),
                    diagnostics: vec![parse_error_diagnostic(
                        &err,
                        DiagnosticSource::Registration,
                        DiagnosticCode::RegistrationFailed,
                    )],
                    logs: self.engine.take_logs(LogSource::Registration),
                }
            }
        };

        if !has_function(&ast, "process", 2) {
            return RegistrationReply {
                error: Some("node does not define fn process(event, globals)".to_string()),
                logs: self.engine.take_logs(LogSource::Registration),
                ..Default::default()
            };
        }

        if let Err(err) = self.engine.run(&mut self.scope, &ast) {
            return RegistrationReply {
                error: Some(err.to_string()),
                diagnostics: vec![eval_error_diagnostic(
                    &err,
                    DiagnosticSource::Registration,
                    DiagnosticCode::RegistrationFailed,
                )],
                logs: self.engine.take_logs(LogSource::Registration),
            };
        }

        self.ast = Some(ast);
        RegistrationReply {
            logs: self.engine.take_logs(LogSource::Registration),
            ..Default::default()
        }
    }

    fn process(&mut self, message: &WorkerMessage, globals: &GlobalVariables) -> ProcessReply {
        let Some(ast) = self.ast.as_ref() else {
            return ProcessReply {
                error: Some("no node registered on this worker".to_string()),
                ..Default::default()
            };
        };

        let args = to_script_value(message).and_then(|event| {
            to_script_value(globals).map(|globals| (event, globals))
        });
        let result = args.and_then(|(event, globals)| {
            self.engine.call_with_state(
                &mut self.scope,
                ast,
                "process",
                (event, globals),
                &mut self.state,
            )
        });
        let logs = self.engine.take_logs(LogSource::Processing);

        match result {
            Ok(value) => match output_message(&value) {
                Ok(message) => ProcessReply {
                    message,
                    logs,
                    ..Default::default()
                },
                Err(error) => ProcessReply {
                    error: Some(error.clone()),
                    diagnostics: vec![crate::types::Diagnostic::error(
                        DiagnosticSource::Runtime,
                        DiagnosticCode::RuntimeError,
                        error,
                    )],
                    logs,
                    ..Default::default()
                },
            },
            Err(err) => ProcessReply {
                error: Some(err.to_string()),
                diagnostics: vec![eval_error_diagnostic(
                    &err,
                    DiagnosticSource::Runtime,
                    DiagnosticCode::RuntimeError,
                )],
                logs,
                ..Default::default()
            },
        }
    }
}

/// `()` means no message; a map is the derived message.
fn output_message(value: &Dynamic) -> Result<Option<serde_json::Value>, String> {
    if value.is_unit() {
        return Ok(None);
    }
    if !value.is_map() {
        return Err(format!(
            "process() must return an object map or (), got {}",
            value.type_name()
        ));
    }
    from_script_value(value)
        .map(Some)
        .map_err(|e| format!("process() returned an unserializable value: {}", e))
}
