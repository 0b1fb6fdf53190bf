//! The user node stage.
//!
//! [`UserNodePlayer`] wraps an upstream [`Player`] and is itself a player. A
//! driver task owns the stream and block processors and serialises upstream
//! states with commands:
//!
//! ```text
//! upstream states ──┐
//!                   ├─► driver ──► rebuild graph (locked) ──► process (unlocked) ──► listener
//! commands ─────────┘
//! ```
//!
//! The graph is rebuilt when the node set changes, the topic or datatype
//! catalog changes identity, or playback seeks. A failure while handling a
//! state never escapes: it is logged, recorded as the `player-state-update`
//! problem and the upstream state is passed on unchanged.

use crate::config::StageConfig;
use crate::pipeline::blocks::BlockProcessor;
use crate::pipeline::bridge::DiagnosticsSink;
use crate::pipeline::compiler::{CompileRequest, NodeCompiler, RhaiNodeCompiler};
use crate::pipeline::error::PipelineResult;
use crate::pipeline::executor::{NodeRegistration, NodeServices};
use crate::pipeline::graph::{Candidate, DataflowGraph};
use crate::pipeline::id::NodeId;
use crate::pipeline::problems::{ProblemKey, ProblemStore};
use crate::pipeline::registration_cache::RegistrationCache;
use crate::pipeline::rpc::SandboxRuntime;
use crate::pipeline::stream::{merge_by_receive_time, Registrations, StreamProcessor};
use crate::pipeline::subscriptions::{translate, SubscriptionIndex};
use crate::pipeline::worker_pool::WorkerPool;
use crate::player::{ActiveData, Player, PlayerListener, PlayerState};
use crate::scripting::{GeneratedLibraryCache, RhaiSandbox};
use crate::types::{
    AdvertiseOptions, Datatypes, GlobalVariables, MessageEvent, PlayerProblem, PublishPayload,
    Severity, SubscribePayload, Time, Topic, UserNodes,
};
use indexmap::{IndexMap, IndexSet};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, MutexGuard};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Collaborators a stage is built from.
pub struct StageServices {
    pub compiler: Arc<dyn NodeCompiler>,
    pub sandbox: Arc<dyn SandboxRuntime>,
    pub sink: Arc<dyn DiagnosticsSink>,
}

impl StageServices {
    /// Rhai compiler and sandbox configured from `config`.
    pub fn with_rhai(config: &StageConfig, sink: Arc<dyn DiagnosticsSink>) -> Self {
        Self {
            compiler: Arc::new(RhaiNodeCompiler::new(&config.limits)),
            sandbox: Arc::new(RhaiSandbox::new(
                config.limits.clone(),
                config.worker_thread_prefix.clone(),
            )),
            sink,
        }
    }
}

#[derive(Debug)]
enum StageCommand {
    SetSubscriptions(Vec<SubscribePayload>),
    SetGlobalVariables(GlobalVariables),
    Reemit,
    Close,
}

/// Upstream catalogs extended with the registrations' outputs.
struct OutputCatalog {
    upstream_topics: Arc<Vec<Topic>>,
    upstream_datatypes: Arc<Datatypes>,
    registrations: Registrations,
    topics: Arc<Vec<Topic>>,
    datatypes: Arc<Datatypes>,
}

struct ProtectedState {
    user_nodes: UserNodes,
    nodes_changed: bool,
    registrations: Registrations,
    registration_cache: RegistrationCache,
    library_cache: GeneratedLibraryCache,
    inputs_by_output_topic: IndexMap<String, Vec<String>>,
    /// Nodes that currently have diagnostics published.
    diagnosed_nodes: IndexSet<NodeId>,
    last_topics: Option<Arc<Vec<Topic>>>,
    last_datatypes: Option<Arc<Datatypes>>,
    last_seek_time: Option<u64>,
    last_player_state: Option<PlayerState>,
    subscriptions: Vec<SubscribePayload>,
    upstream_subscriptions: Vec<SubscribePayload>,
    subscription_index: Arc<SubscriptionIndex>,
    global_variables: Arc<GlobalVariables>,
    last_message_by_topic: HashMap<String, MessageEvent>,
    nodes_needing_update: IndexSet<NodeId>,
    output_catalog: Option<OutputCatalog>,
}

impl ProtectedState {
    fn new() -> Self {
        Self {
            user_nodes: UserNodes::new(),
            nodes_changed: false,
            registrations: Arc::new(Vec::new()),
            registration_cache: RegistrationCache::new(),
            library_cache: GeneratedLibraryCache::new(),
            inputs_by_output_topic: IndexMap::new(),
            diagnosed_nodes: IndexSet::new(),
            last_topics: None,
            last_datatypes: None,
            last_seek_time: None,
            last_player_state: None,
            subscriptions: Vec::new(),
            upstream_subscriptions: Vec::new(),
            subscription_index: Arc::new(SubscriptionIndex::default()),
            global_variables: Arc::new(GlobalVariables::new()),
            last_message_by_topic: HashMap::new(),
            nodes_needing_update: IndexSet::new(),
            output_catalog: None,
        }
    }
}

/// Everything processing needs, taken under the lock.
struct Snapshot {
    registrations: Registrations,
    globals: Arc<GlobalVariables>,
    index: Arc<SubscriptionIndex>,
    recompute: Vec<(Arc<NodeRegistration>, Vec<MessageEvent>)>,
    topics: Arc<Vec<Topic>>,
    datatypes: Arc<Datatypes>,
}

#[derive(Default)]
struct Processors {
    stream: StreamProcessor,
    blocks: BlockProcessor,
}

struct StageInner {
    upstream: Arc<dyn Player>,
    config: StageConfig,
    compiler: Arc<dyn NodeCompiler>,
    services: Arc<NodeServices>,
    commands: mpsc::UnboundedSender<StageCommand>,
    state: Mutex<ProtectedState>,
}

impl StageInner {
    fn request_reemit(&self) {
        let _ = self.commands.send(StageCommand::Reemit);
    }

    async fn set_user_nodes(&self, nodes: UserNodes) {
        let mut state = self.state.lock().await;
        if state.user_nodes.iter().eq(nodes.iter()) {
            return;
        }
        for (id, node) in &nodes {
            if state.user_nodes.get(id) != Some(node) {
                state.nodes_needing_update.insert(id.clone());
            }
        }
        tracing::debug!("User nodes changed: {} nodes", nodes.len());
        state.user_nodes = nodes;
        state.nodes_changed = true;
        drop(state);
        self.request_reemit();
    }

    async fn update_subscriptions(&self, subscriptions: Vec<SubscribePayload>) {
        let mut state = self.state.lock().await;
        let previous = state.subscription_index.clone();
        state.subscriptions = subscriptions;
        self.retranslate(&mut state);

        let newly_subscribed: Vec<NodeId> = state
            .registrations
            .iter()
            .filter(|r| {
                state.subscription_index.has_subscriber(&r.output.name)
                    && !previous.has_subscriber(&r.output.name)
            })
            .map(|r| r.node_id.clone())
            .collect();
        if newly_subscribed.is_empty() {
            return;
        }
        state.nodes_needing_update.extend(newly_subscribed);
        drop(state);
        self.request_reemit();
    }

    async fn update_global_variables(&self, global_variables: GlobalVariables) {
        self.upstream.set_global_variables(global_variables.clone());
        let mut state = self.state.lock().await;
        if *state.global_variables == global_variables {
            return;
        }
        state.global_variables = Arc::new(global_variables);
        let ids: Vec<NodeId> = state.registrations.iter().map(|r| r.node_id.clone()).collect();
        state.nodes_needing_update.extend(ids);
        drop(state);
        self.request_reemit();
    }

    async fn output_topics(&self) -> Vec<Topic> {
        let state = self.state.lock().await;
        state
            .registrations
            .iter()
            .map(|r| Topic::new(r.output.name.clone(), r.output.schema_name.clone()))
            .collect()
    }

    /// Recompute upstream subscriptions, forwarding them when they changed.
    fn retranslate(&self, state: &mut ProtectedState) {
        let translated = translate(&state.subscriptions, &state.inputs_by_output_topic);
        state.subscription_index = Arc::new(translated.index);
        if translated.upstream != state.upstream_subscriptions {
            state.upstream_subscriptions = translated.upstream.clone();
            self.upstream.set_subscriptions(translated.upstream);
        }
    }

    async fn handle_command(
        &self,
        command: StageCommand,
        processors: &mut Processors,
    ) -> Option<PlayerState> {
        match command {
            StageCommand::SetSubscriptions(subscriptions) => {
                self.update_subscriptions(subscriptions).await;
                None
            }
            StageCommand::SetGlobalVariables(global_variables) => {
                self.update_global_variables(global_variables).await;
                None
            }
            StageCommand::Reemit => self.reemit(processors).await,
            StageCommand::Close => None,
        }
    }

    async fn handle_state(
        &self,
        upstream: PlayerState,
        processors: &mut Processors,
    ) -> PlayerState {
        let result = self.process_state(&upstream, false, processors).await;
        self.finish(upstream, result)
    }

    /// Run the last upstream state again with an empty message batch, so
    /// recomputed outputs reach the listener without repeating inputs.
    async fn reemit(&self, processors: &mut Processors) -> Option<PlayerState> {
        let mut last = self.state.lock().await.last_player_state.clone()?;
        if let Some(active) = last.active_data.as_mut() {
            active.messages = Arc::new(Vec::new());
        }
        let result = self.process_state(&last, true, processors).await;
        Some(self.finish(last, result))
    }

    fn finish(&self, upstream: PlayerState, result: PipelineResult<PlayerState>) -> PlayerState {
        match result {
            Ok(state) => state,
            Err(err) => {
                tracing::error!("User node stage failed to process a state: {}", err);
                self.services.problems.set(
                    ProblemKey::StateUpdate,
                    PlayerProblem::new(Severity::Error, "Failed to process user nodes")
                        .with_error(err.to_string()),
                );
                let mut passthrough = upstream;
                passthrough.problems.extend(self.services.problems.snapshot());
                passthrough
            }
        }
    }

    async fn process_state(
        &self,
        upstream: &PlayerState,
        reemit: bool,
        processors: &mut Processors,
    ) -> PipelineResult<PlayerState> {
        let Some(active) = upstream.active_data.as_ref() else {
            if !reemit {
                self.state.lock().await.last_player_state = Some(upstream.clone());
            }
            let mut state = upstream.clone();
            state.problems.extend(self.services.problems.snapshot());
            return Ok(state);
        };

        let snapshot = {
            let mut state = self.state.lock().await;
            if !reemit {
                state.last_player_state = Some(upstream.clone());
            }
            self.rebuild_if_needed(&mut state, active).await?;
            self.take_snapshot(&mut state, active)
        };
        self.services.problems.clear(&ProblemKey::StateUpdate);

        let combined = processors
            .stream
            .process(
                &active.messages,
                &snapshot.globals,
                &snapshot.registrations,
                &snapshot.index,
            )
            .await?;
        let derived = StreamProcessor::recompute(snapshot.recompute, &snapshot.globals).await?;
        let messages = if derived.is_empty() {
            combined
        } else {
            Arc::new(merge_by_receive_time(combined.as_ref().clone(), derived))
        };

        let mut progress = upstream.progress.clone();
        if let Some(cache) = progress.message_cache.as_mut() {
            cache.blocks = processors
                .blocks
                .process(
                    &cache.blocks,
                    &snapshot.globals,
                    &snapshot.registrations,
                    &snapshot.index,
                )
                .await?;
        }

        let mut problems = upstream.problems.clone();
        problems.extend(self.services.problems.snapshot());
        Ok(PlayerState {
            presence: upstream.presence,
            progress,
            name: upstream.name.clone(),
            player_id: upstream.player_id.clone(),
            active_data: Some(ActiveData {
                messages,
                topics: snapshot.topics,
                datatypes: snapshot.datatypes,
                ..active.clone()
            }),
            problems,
        })
    }

    async fn rebuild_if_needed(
        &self,
        state: &mut ProtectedState,
        active: &ActiveData,
    ) -> PipelineResult<()> {
        let topics_changed = !state
            .last_topics
            .as_ref()
            .is_some_and(|t| Arc::ptr_eq(t, &active.topics));
        let datatypes_changed = !state
            .last_datatypes
            .as_ref()
            .is_some_and(|d| Arc::ptr_eq(d, &active.datatypes));
        let seeked = state.last_seek_time != Some(active.last_seek_time);

        if topics_changed || datatypes_changed {
            state.registration_cache.clear();
        }
        if seeked {
            state.last_message_by_topic.clear();
        }
        if !(state.nodes_changed || topics_changed || datatypes_changed || seeked) {
            return Ok(());
        }

        // Compilation runs on the blocking pool. Commands that need the state
        // lock wait for it to finish.
        let library = state.library_cache.get(&active.datatypes);
        let ProtectedState {
            user_nodes,
            registration_cache,
            ..
        } = &mut *state;
        let compiled = registration_cache
            .resolve(user_nodes, &self.compiler, |node| CompileRequest {
                name: node.name.clone(),
                source_code: node.source_code.clone(),
                topics: active.topics.clone(),
                datatypes: active.datatypes.clone(),
                generated_library: library.clone(),
            })
            .await?;
        let candidates: Vec<Candidate> = compiled
            .into_iter()
            .map(|(node_id, compiled)| Candidate {
                node_name: user_nodes
                    .get(&node_id)
                    .map(|node| node.name.clone())
                    .unwrap_or_default(),
                node_id,
                compiled,
            })
            .collect();

        let plan = DataflowGraph::build(candidates, &active.topics)?;

        let mut diagnosed = IndexSet::new();
        for (node_id, diagnostics) in &plan.diagnostics_by_node {
            self.services.sink.set_diagnostics(node_id, diagnostics.clone());
            diagnosed.insert(node_id.clone());
        }
        for stale in state.diagnosed_nodes.iter().filter(|id| !diagnosed.contains(*id)) {
            self.services.sink.set_diagnostics(stale, Vec::new());
        }
        state.diagnosed_nodes = diagnosed;

        let previous = std::mem::replace(&mut state.registrations, Arc::new(Vec::new()));
        for registration in previous.iter() {
            registration.terminate().await;
        }

        let registrations: Vec<Arc<NodeRegistration>> = plan
            .accepted
            .iter()
            .map(|candidate| {
                Arc::new(NodeRegistration::new(
                    candidate.node_id.clone(),
                    candidate.node_name.clone(),
                    &candidate.compiled,
                    self.services.clone(),
                ))
            })
            .collect();
        tracing::debug!(
            "Rebuilt user node graph: {} active, {} rejected",
            registrations.len(),
            plan.rejected.len()
        );

        state.registrations = Arc::new(registrations);
        state.inputs_by_output_topic = plan.inputs_by_output_topic;
        state.output_catalog = None;
        let limit = state.user_nodes.len() + self.config.registration_cache_slack;
        state.registration_cache.truncate_to(limit);

        state.last_topics = Some(active.topics.clone());
        state.last_datatypes = Some(active.datatypes.clone());
        state.last_seek_time = Some(active.last_seek_time);
        state.nodes_changed = false;
        self.retranslate(state);
        Ok(())
    }

    fn take_snapshot(&self, state: &mut ProtectedState, active: &ActiveData) -> Snapshot {
        let index = state.subscription_index.clone();
        let batch_topics: HashSet<&str> =
            active.messages.iter().map(|m| m.topic.as_str()).collect();

        let mut recompute = Vec::new();
        if !state.nodes_needing_update.is_empty() {
            for registration in state.registrations.iter() {
                if !state.nodes_needing_update.contains(&registration.node_id)
                    || !index.has_subscriber(&registration.output.name)
                {
                    continue;
                }
                let inputs: Vec<MessageEvent> = registration
                    .inputs
                    .iter()
                    .filter(|topic| !batch_topics.contains(topic.as_str()))
                    .filter_map(|topic| state.last_message_by_topic.get(topic).cloned())
                    .collect();
                if !inputs.is_empty() {
                    recompute.push((registration.clone(), inputs));
                }
            }
            state.nodes_needing_update.clear();
        }

        for message in active.messages.iter() {
            if state.registrations.iter().any(|r| r.consumes(&message.topic)) {
                state
                    .last_message_by_topic
                    .insert(message.topic.clone(), message.clone());
            }
        }

        let (topics, datatypes) = Self::output_catalog(state, active);
        Snapshot {
            registrations: state.registrations.clone(),
            globals: state.global_variables.clone(),
            index,
            recompute,
            topics,
            datatypes,
        }
    }

    fn output_catalog(
        state: &mut ProtectedState,
        active: &ActiveData,
    ) -> (Arc<Vec<Topic>>, Arc<Datatypes>) {
        if state.registrations.is_empty() {
            return (active.topics.clone(), active.datatypes.clone());
        }
        if let Some(catalog) = &state.output_catalog {
            if Arc::ptr_eq(&catalog.upstream_topics, &active.topics)
                && Arc::ptr_eq(&catalog.upstream_datatypes, &active.datatypes)
                && Arc::ptr_eq(&catalog.registrations, &state.registrations)
            {
                return (catalog.topics.clone(), catalog.datatypes.clone());
            }
        }

        let mut topics = active.topics.as_ref().clone();
        let mut datatypes = active.datatypes.as_ref().clone();
        for registration in state.registrations.iter() {
            let output = &registration.output;
            topics.push(Topic::new(output.name.clone(), output.schema_name.clone()));
            if let Some(definition) = &output.schema.definition {
                datatypes.insert(output.schema_name.clone(), definition.clone());
            }
        }
        let topics = Arc::new(topics);
        let datatypes = Arc::new(datatypes);
        state.output_catalog = Some(OutputCatalog {
            upstream_topics: active.topics.clone(),
            upstream_datatypes: active.datatypes.clone(),
            registrations: state.registrations.clone(),
            topics: topics.clone(),
            datatypes: datatypes.clone(),
        });
        (topics, datatypes)
    }

    /// Terminate every registration and release stage resources. Idempotent.
    async fn teardown(&self) {
        let mut state = self.state.lock().await;
        let registrations = std::mem::replace(&mut state.registrations, Arc::new(Vec::new()));
        for registration in registrations.iter() {
            registration.terminate().await;
        }
        state.registration_cache.clear();
        state.library_cache.clear();
        state.last_message_by_topic.clear();
        state.last_player_state = None;
        state.output_catalog = None;
        drop(state);
        self.services.pool.shutdown();
        self.services.problems.clear_all();
        tracing::debug!("User node stage closed");
    }
}

async fn drive(
    inner: Arc<StageInner>,
    mut commands: mpsc::UnboundedReceiver<StageCommand>,
    mut states: mpsc::Receiver<PlayerState>,
    listener: PlayerListener,
) {
    let mut processors = Processors::default();
    loop {
        let output = tokio::select! {
            biased;
            command = commands.recv() => match command {
                None | Some(StageCommand::Close) => break,
                Some(command) => inner.handle_command(command, &mut processors).await,
            },
            state = states.recv() => match state {
                Some(state) => Some(inner.handle_state(state, &mut processors).await),
                None => break,
            },
        };
        if let Some(output) = output {
            if listener.send(output).await.is_err() {
                tracing::debug!("Stage listener dropped");
                break;
            }
        }
    }
    inner.teardown().await;
}

/// A [`Player`] that runs user nodes over an upstream player's messages.
pub struct UserNodePlayer {
    inner: Arc<StageInner>,
    pending_commands: std::sync::Mutex<Option<mpsc::UnboundedReceiver<StageCommand>>>,
    driver: std::sync::Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl UserNodePlayer {
    pub fn new(upstream: Arc<dyn Player>, services: StageServices, config: StageConfig) -> Self {
        let (commands, pending) = mpsc::unbounded_channel();
        let node_services = Arc::new(NodeServices {
            pool: Arc::new(WorkerPool::new(services.sandbox)),
            problems: Arc::new(ProblemStore::new()),
            sink: services.sink,
            process_timeout: config.process_timeout(),
        });
        Self {
            inner: Arc::new(StageInner {
                upstream,
                config,
                compiler: services.compiler,
                services: node_services,
                commands,
                state: Mutex::new(ProtectedState::new()),
            }),
            pending_commands: std::sync::Mutex::new(Some(pending)),
            driver: std::sync::Mutex::new(None),
        }
    }

    /// Replace the node set. The graph is rebuilt on the next state.
    pub async fn set_user_nodes(&self, nodes: UserNodes) {
        self.inner.set_user_nodes(nodes).await;
    }

    /// Apply downstream subscriptions immediately.
    pub async fn update_subscriptions(&self, subscriptions: Vec<SubscribePayload>) {
        self.inner.update_subscriptions(subscriptions).await;
    }

    /// Apply global variables immediately; affected outputs are recomputed.
    pub async fn update_global_variables(&self, global_variables: GlobalVariables) {
        self.inner.update_global_variables(global_variables).await;
    }

    /// Output topics of the active registrations.
    pub async fn output_topics(&self) -> Vec<Topic> {
        self.inner.output_topics().await
    }

    pub fn problems(&self) -> Vec<PlayerProblem> {
        self.inner.services.problems.snapshot()
    }

    /// Close the stage and wait for the driver to finish cleaning up.
    pub async fn shutdown(&self) {
        self.close();
        let driver = lock(&self.driver).take();
        match driver {
            Some(task) => {
                if let Err(err) = task.await {
                    tracing::warn!("Stage driver ended abnormally: {}", err);
                }
            }
            None => self.inner.teardown().await,
        }
    }
}

impl Player for UserNodePlayer {
    fn set_listener(&self, listener: PlayerListener) {
        let Some(commands) = lock(&self.pending_commands).take() else {
            tracing::warn!("Stage listener already set");
            return;
        };
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(err) => {
                tracing::error!("Stage needs a tokio runtime: {}", err);
                *lock(&self.pending_commands) = Some(commands);
                return;
            }
        };
        let (states_tx, states_rx) = mpsc::channel(self.inner.config.emit_capacity.max(1));
        self.inner.upstream.set_listener(states_tx);
        let task = runtime.spawn(drive(self.inner.clone(), commands, states_rx, listener));
        *lock(&self.driver) = Some(task);
    }

    fn set_subscriptions(&self, subscriptions: Vec<SubscribePayload>) {
        let _ = self
            .inner
            .commands
            .send(StageCommand::SetSubscriptions(subscriptions));
    }

    fn set_publishers(&self, publishers: Vec<AdvertiseOptions>) {
        self.inner.upstream.set_publishers(publishers);
    }

    fn publish(&self, payload: PublishPayload) {
        self.inner.upstream.publish(payload);
    }

    fn start_playback(&self) {
        self.inner.upstream.start_playback();
    }

    fn pause_playback(&self) {
        self.inner.upstream.pause_playback();
    }

    fn seek_playback(&self, time: Time) {
        self.inner.upstream.seek_playback(time);
    }

    fn set_playback_speed(&self, speed: f64) {
        self.inner.upstream.set_playback_speed(speed);
    }

    fn set_global_variables(&self, global_variables: GlobalVariables) {
        let _ = self
            .inner
            .commands
            .send(StageCommand::SetGlobalVariables(global_variables));
    }

    fn close(&self) {
        let _ = self.inner.commands.send(StageCommand::Close);
        self.inner.upstream.close();
    }
}

impl Drop for UserNodePlayer {
    fn drop(&mut self) {
        let _ = self.inner.commands.send(StageCommand::Close);
    }
}

impl std::fmt::Debug for UserNodePlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserNodePlayer")
            .field("pool", &self.inner.services.pool)
            .field("driving", &lock(&self.driver).is_some())
            .finish()
    }
}
