//! Player boundary
//!
//! A [`Player`] produces [`PlayerState`]s for a listener and accepts playback
//! and subscription commands. The user node stage both consumes one (the
//! upstream source) and is one (for the downstream consumer).
//!
//! Large collections inside a state are shared through `Arc`, so identity
//! comparisons (`Arc::ptr_eq`) tell whether a catalog or batch changed.

pub mod memory;

pub use memory::{MemoryPlayer, Recording};

use crate::pipeline::blocks::Blocks;
use crate::types::{
    AdvertiseOptions, Datatypes, GlobalVariables, MessageEvent, PlayerProblem, PublishPayload,
    SubscribePayload, Time, Topic,
};
use std::sync::Arc;

/// Where state updates are delivered.
pub type PlayerListener = tokio::sync::mpsc::Sender<PlayerState>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayerPresence {
    #[default]
    NotPresent,
    Initializing,
    Buffering,
    Present,
    Error,
}

/// Pre-loaded blocks for full-preload subscriptions.
#[derive(Debug, Clone)]
pub struct BlockCache {
    pub blocks: Blocks,
    pub start_time: Time,
}

#[derive(Debug, Clone, Default)]
pub struct Progress {
    pub message_cache: Option<BlockCache>,
}

/// Data of a source that is loaded and playing.
#[derive(Debug, Clone)]
pub struct ActiveData {
    /// Messages of the current frame.
    pub messages: Arc<Vec<MessageEvent>>,
    pub topics: Arc<Vec<Topic>>,
    pub datatypes: Arc<Datatypes>,
    pub start_time: Time,
    pub end_time: Time,
    pub current_time: Time,
    pub is_playing: bool,
    pub speed: f64,
    /// Changes every time playback seeks.
    pub last_seek_time: u64,
    pub total_bytes_received: u64,
}

#[derive(Debug, Clone, Default)]
pub struct PlayerState {
    pub presence: PlayerPresence,
    pub progress: Progress,
    pub name: Option<String>,
    pub player_id: String,
    pub active_data: Option<ActiveData>,
    pub problems: Vec<PlayerProblem>,
}

/// A source of player states.
pub trait Player: Send + Sync {
    /// Deliver every subsequent state to `listener`.
    fn set_listener(&self, listener: PlayerListener);
    fn set_subscriptions(&self, subscriptions: Vec<SubscribePayload>);
    fn set_publishers(&self, publishers: Vec<AdvertiseOptions>);
    fn publish(&self, payload: PublishPayload);
    fn start_playback(&self);
    fn pause_playback(&self);
    fn seek_playback(&self, time: Time);
    fn set_playback_speed(&self, speed: f64);
    fn set_global_variables(&self, global_variables: GlobalVariables);
    /// Stop producing states and drop the listener.
    fn close(&self);
}
