//! User node stage.
//!
//! Sits between an upstream [`Player`](crate::player::Player) and its
//! consumer, running user scripts over the message stream and publishing
//! their results on new topics.
//!
//! # Architecture
//!
//! ```text
//! upstream Player ──► UserNodePlayer ──► consumer
//!                        │
//!                        ├── compiler ──► RegistrationCache ──► DataflowGraph
//!                        ├── StreamProcessor ─┐
//!                        ├── BlockProcessor  ─┴─► NodeRegistration ──► WorkerPool ──► sandbox threads
//!                        └── DiagnosticsSink / ProblemStore
//! ```
//!
//! # Design
//!
//! - **One critical section**: node set, graph and subscriptions live behind a
//!   single async mutex; message processing runs outside it over `Arc`
//!   snapshots.
//! - **Typed RPC**: workers answer [`WorkerRequest`]s over oneshot replies
//!   matched by [`RequestId`].
//! - **Cancellation**: each registration owns a cancellation token; every
//!   worker call also races a timeout.
//! - **Output schema as data**: derived messages carry their schema name,
//!   never a Rust type.

pub mod blocks;
pub mod bridge;
pub mod compiler;
pub mod error;
pub mod executor;
pub mod graph;
pub mod id;
pub mod problems;
pub mod registration_cache;
pub mod rpc;
pub mod stage;
pub mod stream;
pub mod subscriptions;
pub mod worker_pool;

pub use blocks::{BlockProcessor, Blocks};
pub use bridge::{DiagnosticsBridge, DiagnosticsFeed, DiagnosticsSink, StageEvent, TracingSink};
pub use compiler::{CompileRequest, CompiledNode, NodeCompiler, OutputSchema, RhaiNodeCompiler};
pub use error::{PipelineError, PipelineResult};
pub use executor::{NodeRegistration, NodeServices, OutputTopic};
pub use graph::{Candidate, DataflowGraph, GraphPlan};
pub use id::{NodeId, RequestId, WorkerId};
pub use problems::{ProblemKey, ProblemStore};
pub use registration_cache::RegistrationCache;
pub use rpc::{
    ProcessReply, RegistrationReply, RpcChannel, RpcEnvelope, SandboxRuntime, WorkerMessage,
    WorkerRequest, WorkerResponse,
};
pub use stage::{StageServices, UserNodePlayer};
pub use stream::{merge_by_receive_time, sort_by_receive_time, Registrations, StreamProcessor};
pub use subscriptions::{translate, SubscriptionIndex, TranslatedSubscriptions};
pub use worker_pool::{PoolStats, WorkerHandle, WorkerPool};
