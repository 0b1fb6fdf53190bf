//! Fake collaborators for stage tests

use crossbeam_channel::{unbounded, Receiver};
use scriptflow_rs::config::ScriptLimits;
use scriptflow_rs::pipeline::{
    CompileRequest, CompiledNode, NodeCompiler, OutputSchema, PipelineResult, RpcEnvelope,
    SandboxRuntime, WorkerId, WorkerRequest,
};
use scriptflow_rs::scripting::RhaiSandbox;
use std::collections::HashMap;

/// Marker that makes [`StallingSandbox`] never answer `process` calls.
pub const STALL_MARKER: &str = "// stall";

/// Rhai sandbox whose workers stop answering once they register a node
/// containing [`STALL_MARKER`]. Unanswered requests are held until the
/// worker is dropped, so callers see a timeout rather than a disconnect.
pub struct StallingSandbox {
    inner: RhaiSandbox,
}

impl StallingSandbox {
    pub fn new() -> Self {
        Self {
            inner: RhaiSandbox::new(ScriptLimits::default(), "stalling-worker"),
        }
    }
}

impl Default for StallingSandbox {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxRuntime for StallingSandbox {
    fn spawn(&self, worker_id: WorkerId, requests: Receiver<RpcEnvelope>) -> PipelineResult<()> {
        let (forward_tx, forward_rx) = unbounded();
        self.inner.spawn(worker_id, forward_rx)?;
        std::thread::spawn(move || {
            let mut stalled = false;
            let mut held = Vec::new();
            for envelope in requests {
                let hold = match &envelope.request {
                    WorkerRequest::RegisterNode { node_code, .. } => {
                        stalled = node_code.contains(STALL_MARKER);
                        false
                    }
                    WorkerRequest::ProcessMessage { .. } => stalled,
                };
                if hold {
                    held.push(envelope);
                } else if forward_tx.send(envelope).is_err() {
                    break;
                }
            }
        });
        Ok(())
    }
}

/// Compiler returning fixed descriptors by node name.
pub struct FixedCompiler {
    nodes: HashMap<String, CompiledNode>,
}

impl FixedCompiler {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
        }
    }

    /// Declare a valid node with the given inputs and output.
    pub fn node(mut self, name: &str, inputs: &[&str], output: &str, node_code: &str) -> Self {
        self.nodes.insert(
            name.to_string(),
            CompiledNode {
                inputs: inputs.iter().map(|s| s.to_string()).collect(),
                output_topic: output.to_string(),
                output_schema: OutputSchema {
                    name: format!("user_nodes/{}", name),
                    definition: None,
                },
                node_code: node_code.to_string(),
                library_code: "".into(),
                diagnostics: Vec::new(),
            },
        );
        self
    }
}

impl Default for FixedCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeCompiler for FixedCompiler {
    fn compile(&self, request: &CompileRequest) -> CompiledNode {
        self.nodes.get(&request.name).cloned().unwrap_or_default()
    }
}
