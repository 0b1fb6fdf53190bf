//! # ScriptFlow-RS: User-Script Dataflow Stage
//!
//! A stage that sits between a timestamped message source (a [`Player`]) and
//! its consumer, running user-authored Rhai scripts over the message stream
//! and publishing their results on new topics.
//!
//! ## Architecture
//!
//! - **Player**: Source of player states (messages, topics, datatypes,
//!   pre-loaded blocks). [`player::MemoryPlayer`] replays a JSON recording.
//! - **Pipeline**: [`pipeline::UserNodePlayer`] compiles user nodes, validates
//!   the dataflow graph, and runs nodes over streaming messages and blocks.
//! - **Scripting**: Rhai compiler and sandbox worker threads
//! - **Communication**: Tokio channels between the stage and its players,
//!   crossbeam channels to sandbox threads
//!
//! ## Configuration
//!
//! Projects (user nodes, global variables, stage tunables) are JSON files; the
//! default project lives in the platform data directory under
//! `dev.scriptflow.scriptflow-rs`.
//!
//! ## Example
//!
//! ```ignore
//! use scriptflow_rs::{
//!     config::ProjectFile,
//!     pipeline::{StageServices, TracingSink, UserNodePlayer},
//!     player::{MemoryPlayer, Player, Recording},
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> scriptflow_rs::Result<()> {
//!     let project = ProjectFile::load("project.json")?;
//!     let upstream = Arc::new(MemoryPlayer::new(Recording::load("rec.json".as_ref())?));
//!     let services = StageServices::with_rhai(&project.stage, Arc::new(TracingSink));
//!     let stage = UserNodePlayer::new(upstream.clone(), services, project.stage.clone());
//!
//!     let (tx, mut rx) = tokio::sync::mpsc::channel(16);
//!     stage.set_listener(tx);
//!     stage.set_user_nodes(project.user_nodes()).await;
//!     upstream.emit_current().await?;
//!     while let Some(state) = rx.recv().await {
//!         // consume derived messages
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod pipeline;
pub mod player;
pub mod scripting;
pub mod types;

// Re-export commonly used types
pub use config::{ProjectFile, StageConfig};
pub use error::{Result, ScriptFlowError};
pub use pipeline::{StageServices, UserNodePlayer};
pub use player::{Player, PlayerState};
pub use types::{MessageEvent, SubscribePayload, Time, Topic, UserNode};
