//! Test data builders for recordings, nodes and stages

use scriptflow_rs::config::StageConfig;
use scriptflow_rs::pipeline::{
    DiagnosticsBridge, DiagnosticsFeed, NodeCompiler, RhaiNodeCompiler, SandboxRuntime,
    StageServices, UserNodePlayer,
};
use scriptflow_rs::player::{MemoryPlayer, Player, PlayerState, Recording};
use scriptflow_rs::scripting::RhaiSandbox;
use scriptflow_rs::types::{Datatypes, MessageEvent, Time, Topic, UserNode, UserNodes};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, Receiver};

/// Builder for recordings of `{ value }` messages
pub struct RecordingBuilder {
    topics: Vec<Topic>,
    messages: Vec<MessageEvent>,
}

impl RecordingBuilder {
    pub fn new() -> Self {
        Self {
            topics: Vec::new(),
            messages: Vec::new(),
        }
    }

    pub fn topic(mut self, name: &str) -> Self {
        self.topics.push(Topic::new(name, "Num"));
        self
    }

    /// Add a message at `millis` after time zero
    pub fn value(mut self, topic: &str, millis: u64, value: i64) -> Self {
        self.messages.push(MessageEvent::new(
            topic,
            Time::from_nanos(millis * 1_000_000),
            json!({ "value": value }),
            "Num",
        ));
        self
    }

    pub fn build(self) -> Recording {
        Recording::new(self.topics, Datatypes::new(), self.messages)
    }
}

impl Default for RecordingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Source of a node reading `input` and writing `output` with the given body
pub fn node_source(input: &str, output: &str, body: &str) -> String {
    format!(
        "fn inputs() {{ [\"{input}\"] }}\n\
         fn output() {{ \"{output}\" }}\n\
         fn process(event, globals) {{\n    {body}\n}}\n"
    )
}

/// A node doubling the `value` field
pub fn doubling_node(id: &str, input: &str, output: &str) -> UserNode {
    UserNode::new(
        id,
        id,
        node_source(input, output, "#{ value: event.message.value * 2 }"),
    )
}

pub fn user_nodes(nodes: impl IntoIterator<Item = UserNode>) -> UserNodes {
    nodes.into_iter().map(|node| (node.id.clone(), node)).collect()
}

/// Stage config with a short process timeout
pub fn test_config() -> StageConfig {
    StageConfig {
        process_timeout_ms: 1_000,
        ..StageConfig::default()
    }
}

/// A stage over a memory player, with a diagnostics feed and a listener
pub struct TestStage {
    pub upstream: Arc<MemoryPlayer>,
    pub stage: UserNodePlayer,
    pub feed: DiagnosticsFeed,
    pub states: Receiver<PlayerState>,
}

pub struct StageBuilder {
    recording: Recording,
    config: StageConfig,
    compiler: Option<Arc<dyn NodeCompiler>>,
    sandbox: Option<Arc<dyn SandboxRuntime>>,
    block_duration: Duration,
}

impl StageBuilder {
    pub fn new(recording: Recording) -> Self {
        Self {
            recording,
            config: test_config(),
            compiler: None,
            sandbox: None,
            block_duration: Duration::from_secs(1),
        }
    }

    pub fn compiler(mut self, compiler: Arc<dyn NodeCompiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    pub fn sandbox(mut self, sandbox: Arc<dyn SandboxRuntime>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn block_duration(mut self, block_duration: Duration) -> Self {
        self.block_duration = block_duration;
        self
    }

    /// Build the stage and attach a listener. Needs a tokio runtime.
    pub fn build(self) -> TestStage {
        let upstream = Arc::new(
            MemoryPlayer::new(self.recording).with_block_duration(self.block_duration),
        );
        let (bridge, feed) = DiagnosticsBridge::new();
        let services = StageServices {
            compiler: self
                .compiler
                .unwrap_or_else(|| Arc::new(RhaiNodeCompiler::new(&self.config.limits))),
            sandbox: self.sandbox.unwrap_or_else(|| {
                Arc::new(RhaiSandbox::new(self.config.limits.clone(), "test-worker"))
            }),
            sink: Arc::new(bridge),
        };
        let stage = UserNodePlayer::new(upstream.clone(), services, self.config);
        let (tx, states) = mpsc::channel(16);
        stage.set_listener(tx);
        TestStage {
            upstream,
            stage,
            feed,
            states,
        }
    }
}
