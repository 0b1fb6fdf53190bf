//! In-memory recording player
//!
//! Plays back a [`Recording`] held entirely in memory. Playback is driven
//! explicitly: [`MemoryPlayer::advance_to`] emits every subscribed message up
//! to a time, and [`MemoryPlayer::emit_current`] re-sends the current state
//! with an empty batch. Full-preload subscriptions get a block cache covering
//! the whole recording.

use super::{ActiveData, BlockCache, Player, PlayerListener, PlayerPresence, PlayerState, Progress};
use crate::error::{Result, ResultExt, ScriptFlowError};
use crate::pipeline::blocks::Blocks;
use crate::types::{
    AdvertiseOptions, Datatypes, GlobalVariables, MessageBlock, MessageEvent, PreloadType,
    PublishPayload, SubscribePayload, Time, Topic,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A complete recorded data source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Recording {
    pub topics: Vec<Topic>,
    #[serde(default)]
    pub datatypes: Datatypes,
    pub messages: Vec<MessageEvent>,
}

impl Recording {
    /// Build a recording, sorting messages by receive time.
    pub fn new(topics: Vec<Topic>, datatypes: Datatypes, mut messages: Vec<MessageEvent>) -> Self {
        messages.sort_by_key(|m| m.receive_time);
        Self {
            topics,
            datatypes,
            messages,
        }
    }

    /// Load a recording from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(ScriptFlowError::from)
            .with_context(|| format!("Failed to read recording {:?}", path))?;
        let mut recording: Recording = serde_json::from_str(&json)
            .map_err(ScriptFlowError::from)
            .with_context(|| format!("Failed to parse recording {:?}", path))?;
        for message in &mut recording.messages {
            message.fill_size();
            if !recording.topics.iter().any(|t| t.name == message.topic) {
                return Err(ScriptFlowError::Player(format!(
                    "message on undeclared topic {}",
                    message.topic
                )));
            }
        }
        Ok(Self::new(recording.topics, recording.datatypes, recording.messages))
    }

    /// Save the recording to a JSON file
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn start_time(&self) -> Time {
        self.messages.first().map(|m| m.receive_time).unwrap_or(Time::ZERO)
    }

    pub fn end_time(&self) -> Time {
        self.messages.last().map(|m| m.receive_time).unwrap_or(Time::ZERO)
    }
}

#[derive(Debug)]
struct PlaybackState {
    listener: Option<PlayerListener>,
    subscriptions: Vec<SubscribePayload>,
    publishers: Vec<AdvertiseOptions>,
    published: Vec<PublishPayload>,
    global_variables: GlobalVariables,
    /// Index of the next message to emit.
    cursor: usize,
    current_time: Time,
    is_playing: bool,
    speed: f64,
    last_seek_time: u64,
    total_bytes_received: u64,
    /// Full-preload topics the block cache was built for.
    block_cache: Option<(BTreeSet<String>, Blocks)>,
    closed: bool,
}

/// Player over an in-memory recording
#[derive(Debug)]
pub struct MemoryPlayer {
    player_id: String,
    name: String,
    topics: Arc<Vec<Topic>>,
    datatypes: Arc<Datatypes>,
    messages: Vec<MessageEvent>,
    start_time: Time,
    end_time: Time,
    block_duration: Duration,
    state: Mutex<PlaybackState>,
}

impl MemoryPlayer {
    pub fn new(recording: Recording) -> Self {
        let start_time = recording.start_time();
        let end_time = recording.end_time();
        Self {
            player_id: format!("memory-{}", chrono::Utc::now().timestamp_millis()),
            name: "memory".to_string(),
            topics: Arc::new(recording.topics),
            datatypes: Arc::new(recording.datatypes),
            messages: recording.messages,
            start_time,
            end_time,
            block_duration: Duration::from_secs(1),
            state: Mutex::new(PlaybackState {
                listener: None,
                subscriptions: Vec::new(),
                publishers: Vec::new(),
                published: Vec::new(),
                global_variables: GlobalVariables::new(),
                cursor: 0,
                current_time: start_time,
                is_playing: false,
                speed: 1.0,
                last_seek_time: 0,
                total_bytes_received: 0,
                block_cache: None,
                closed: false,
            }),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the span of each pre-loaded block.
    pub fn with_block_duration(mut self, block_duration: Duration) -> Self {
        if !block_duration.is_zero() {
            self.block_duration = block_duration;
        }
        self
    }

    fn lock(&self) -> MutexGuard<'_, PlaybackState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn start_time(&self) -> Time {
        self.start_time
    }

    pub fn end_time(&self) -> Time {
        self.end_time
    }

    pub fn current_time(&self) -> Time {
        self.lock().current_time
    }

    pub fn playback_speed(&self) -> f64 {
        self.lock().speed
    }

    pub fn is_playing(&self) -> bool {
        self.lock().is_playing
    }

    /// Whether playback has emitted every message.
    pub fn is_finished(&self) -> bool {
        self.lock().cursor >= self.messages.len()
    }

    pub fn subscriptions(&self) -> Vec<SubscribePayload> {
        self.lock().subscriptions.clone()
    }

    pub fn published(&self) -> Vec<PublishPayload> {
        self.lock().published.clone()
    }

    /// Emit every subscribed message with a receive time up to `time`.
    pub async fn advance_to(&self, time: Time) -> Result<()> {
        let emission = {
            let mut state = self.lock();
            let end = state.cursor
                + self.messages[state.cursor..].partition_point(|m| m.receive_time <= time);
            let batch: Vec<MessageEvent> = self.messages[state.cursor..end]
                .iter()
                .filter(|m| state.subscriptions.iter().any(|s| s.topic == m.topic))
                .cloned()
                .collect();
            state.cursor = end;
            if time > state.current_time {
                state.current_time = time.min(self.end_time).max(self.start_time);
            }
            state.total_bytes_received += batch.iter().map(|m| m.size_in_bytes as u64).sum::<u64>();
            self.build_state(&mut state, batch)
        };
        self.send(emission).await
    }

    /// Re-send the current state with no new messages.
    pub async fn emit_current(&self) -> Result<()> {
        let emission = {
            let mut state = self.lock();
            self.build_state(&mut state, Vec::new())
        };
        self.send(emission).await
    }

    async fn send(&self, emission: Option<(PlayerListener, PlayerState)>) -> Result<()> {
        let Some((listener, state)) = emission else {
            return Ok(());
        };
        listener
            .send(state)
            .await
            .map_err(|_| ScriptFlowError::Player("listener closed".to_string()))
    }

    fn build_state(
        &self,
        state: &mut PlaybackState,
        batch: Vec<MessageEvent>,
    ) -> Option<(PlayerListener, PlayerState)> {
        if state.closed {
            return None;
        }
        let listener = state.listener.clone()?;
        let message_cache = self.block_cache(state).map(|blocks| BlockCache {
            blocks,
            start_time: self.start_time,
        });
        let player_state = PlayerState {
            presence: PlayerPresence::Present,
            progress: Progress { message_cache },
            name: Some(self.name.clone()),
            player_id: self.player_id.clone(),
            active_data: Some(ActiveData {
                messages: Arc::new(batch),
                topics: self.topics.clone(),
                datatypes: self.datatypes.clone(),
                start_time: self.start_time,
                end_time: self.end_time,
                current_time: state.current_time,
                is_playing: state.is_playing,
                speed: state.speed,
                last_seek_time: state.last_seek_time,
                total_bytes_received: state.total_bytes_received,
            }),
            problems: Vec::new(),
        };
        Some((listener, player_state))
    }

    /// Blocks covering the recording for the current full-preload topics,
    /// rebuilt only when that topic set changes.
    fn block_cache(&self, state: &mut PlaybackState) -> Option<Blocks> {
        let topics: BTreeSet<String> = state
            .subscriptions
            .iter()
            .filter(|s| s.preload_type == PreloadType::Full)
            .map(|s| s.topic.clone())
            .collect();
        if topics.is_empty() {
            state.block_cache = None;
            return None;
        }
        if let Some((cached, blocks)) = &state.block_cache {
            if *cached == topics {
                return Some(blocks.clone());
            }
        }

        let span = self.end_time.duration_since(self.start_time);
        let block_nanos = self.block_duration.as_nanos().max(1);
        let count = (span.as_nanos() / block_nanos + 1) as usize;
        let mut grouped: Vec<HashMap<String, Vec<MessageEvent>>> = vec![HashMap::new(); count];
        for message in self.messages.iter().filter(|m| topics.contains(&m.topic)) {
            let offset = message.receive_time.duration_since(self.start_time).as_nanos();
            let index = ((offset / block_nanos) as usize).min(count - 1);
            grouped[index]
                .entry(message.topic.clone())
                .or_default()
                .push(message.clone());
        }
        let blocks: Blocks = Arc::new(
            grouped
                .into_iter()
                .map(|messages| Some(Arc::new(MessageBlock::from_messages(messages))))
                .collect(),
        );
        tracing::debug!("Built {} blocks for {} full-preload topics", count, topics.len());
        state.block_cache = Some((topics, blocks.clone()));
        Some(blocks)
    }
}

impl Player for MemoryPlayer {
    fn set_listener(&self, listener: PlayerListener) {
        self.lock().listener = Some(listener);
    }

    fn set_subscriptions(&self, subscriptions: Vec<SubscribePayload>) {
        tracing::debug!("Upstream subscriptions: {}", subscriptions.len());
        self.lock().subscriptions = subscriptions;
    }

    fn set_publishers(&self, publishers: Vec<AdvertiseOptions>) {
        self.lock().publishers = publishers;
    }

    fn publish(&self, payload: PublishPayload) {
        let mut state = self.lock();
        if state.publishers.iter().any(|p| p.topic == payload.topic) {
            state.published.push(payload);
        } else {
            tracing::warn!("Publish on unadvertised topic {}", payload.topic);
        }
    }

    fn start_playback(&self) {
        self.lock().is_playing = true;
    }

    fn pause_playback(&self) {
        self.lock().is_playing = false;
    }

    fn seek_playback(&self, time: Time) {
        let mut state = self.lock();
        let time = time.max(self.start_time).min(self.end_time);
        state.cursor = self.messages.partition_point(|m| m.receive_time < time);
        state.current_time = time;
        state.last_seek_time += 1;
    }

    fn set_playback_speed(&self, speed: f64) {
        self.lock().speed = speed.clamp(0.1, 10.0);
    }

    fn set_global_variables(&self, global_variables: GlobalVariables) {
        self.lock().global_variables = global_variables;
    }

    fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.listener = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn recording() -> Recording {
        let messages = (1..=4)
            .map(|i| MessageEvent::new("/a", Time::from_secs(i), json!({ "v": i }), "Num"))
            .chain(std::iter::once(MessageEvent::new(
                "/c",
                Time::from_secs(2),
                json!({ "v": 0 }),
                "Num",
            )))
            .collect();
        Recording::new(
            vec![Topic::new("/a", "Num"), Topic::new("/c", "Num")],
            Datatypes::new(),
            messages,
        )
    }

    fn values(state: &PlayerState) -> Vec<(String, u32)> {
        state
            .active_data
            .as_ref()
            .unwrap()
            .messages
            .iter()
            .map(|m| (m.topic.clone(), m.receive_time.sec))
            .collect()
    }

    #[tokio::test]
    async fn test_advance_emits_subscribed_messages() {
        let player = MemoryPlayer::new(recording());
        let (tx, mut rx) = mpsc::channel(8);
        player.set_listener(tx);
        player.set_subscriptions(vec![SubscribePayload::new("/a")]);

        player.advance_to(Time::from_secs(2)).await.unwrap();
        let state = rx.recv().await.unwrap();
        assert_eq!(values(&state), vec![("/a".into(), 1), ("/a".into(), 2)]);
        assert!(state.progress.message_cache.is_none());

        player.advance_to(Time::from_secs(10)).await.unwrap();
        let state = rx.recv().await.unwrap();
        assert_eq!(values(&state), vec![("/a".into(), 3), ("/a".into(), 4)]);
        assert!(player.is_finished());
    }

    #[tokio::test]
    async fn test_seek_bumps_seek_time_and_rewinds() {
        let player = MemoryPlayer::new(recording());
        let (tx, mut rx) = mpsc::channel(8);
        player.set_listener(tx);
        player.set_subscriptions(vec![SubscribePayload::new("/a")]);

        player.advance_to(Time::from_secs(4)).await.unwrap();
        let first = rx.recv().await.unwrap();
        player.seek_playback(Time::from_secs(3));
        player.advance_to(Time::from_secs(3)).await.unwrap();
        let second = rx.recv().await.unwrap();

        assert_eq!(values(&second), vec![("/a".into(), 3)]);
        let seek = |s: &PlayerState| s.active_data.as_ref().unwrap().last_seek_time;
        assert_ne!(seek(&first), seek(&second));
    }

    #[tokio::test]
    async fn test_full_preload_builds_stable_blocks() {
        let player = MemoryPlayer::new(recording()).with_block_duration(Duration::from_secs(2));
        let (tx, mut rx) = mpsc::channel(8);
        player.set_listener(tx);
        player.set_subscriptions(vec![SubscribePayload::full("/a")]);

        player.emit_current().await.unwrap();
        player.emit_current().await.unwrap();
        let first = rx.recv().await.unwrap().progress.message_cache.unwrap();
        let second = rx.recv().await.unwrap().progress.message_cache.unwrap();
        assert!(Arc::ptr_eq(&first.blocks, &second.blocks));
        // 1..=4 seconds in 2 second blocks
        assert_eq!(first.blocks.len(), 2);
        let total: usize = first
            .blocks
            .iter()
            .flatten()
            .map(|b| b.messages_by_topic.get("/a").map_or(0, Vec::len))
            .sum();
        assert_eq!(total, 4);
    }

    #[test]
    fn test_playback_speed_is_clamped() {
        let player = MemoryPlayer::new(recording());
        player.set_playback_speed(2.0);
        assert_eq!(player.playback_speed(), 2.0);
        player.set_playback_speed(100.0);
        assert_eq!(player.playback_speed(), 10.0);
        player.set_playback_speed(0.01);
        assert_eq!(player.playback_speed(), 0.1);
    }

    #[tokio::test]
    async fn test_close_stops_emitting() {
        let player = MemoryPlayer::new(recording());
        let (tx, mut rx) = mpsc::channel(8);
        player.set_listener(tx);
        player.close();
        player.emit_current().await.unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_recording_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.json");
        recording().save(&path).unwrap();
        let loaded = Recording::load(&path).unwrap();
        assert_eq!(loaded.messages.len(), 5);
        assert_eq!(loaded.start_time(), Time::from_secs(1));
    }

    #[test]
    fn test_hand_written_recording_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hand.json");
        std::fs::write(
            &path,
            r#"{
                "topics": [{ "name": "/a", "schema_name": "Num" }],
                "messages": [
                    { "topic": "/a", "receive_time": { "sec": 1, "nsec": 1500000000 },
                      "message": { "value": 2 }, "schema_name": "Num" },
                    { "topic": "/a", "receive_time": { "sec": 2, "nsec": 0 },
                      "message": { "value": 1 }, "schema_name": "Num" }
                ]
            }"#,
        )
        .unwrap();

        let loaded = Recording::load(&path).unwrap();
        let times: Vec<Time> = loaded.messages.iter().map(|m| m.receive_time).collect();
        assert_eq!(times, vec![Time::from_secs(2), Time::new(2, 500_000_000)]);
        assert!(loaded.messages.iter().all(|m| m.size_in_bytes > 0));
    }
}
