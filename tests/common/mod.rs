//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod fakes;

use scriptflow_rs::player::PlayerState;
use scriptflow_rs::types::MessageEvent;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;

/// How long a test waits for the stage before failing
pub fn test_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Receive the next state, failing the test if the stage stalls or closes
pub async fn next_state(rx: &mut Receiver<PlayerState>) -> PlayerState {
    tokio::time::timeout(test_timeout(), rx.recv())
        .await
        .expect("timed out waiting for a player state")
        .expect("stage closed its listener")
}

/// Receive states until one matches `predicate`
pub async fn state_where(
    rx: &mut Receiver<PlayerState>,
    predicate: impl Fn(&PlayerState) -> bool,
) -> PlayerState {
    loop {
        let state = next_state(rx).await;
        if predicate(&state) {
            return state;
        }
    }
}

/// Messages of a state, in emitted order
pub fn messages(state: &PlayerState) -> Vec<MessageEvent> {
    state
        .active_data
        .as_ref()
        .map(|active| active.messages.as_ref().clone())
        .unwrap_or_default()
}

/// Messages on one topic
pub fn on_topic(state: &PlayerState, topic: &str) -> Vec<MessageEvent> {
    messages(state)
        .into_iter()
        .filter(|m| m.topic == topic)
        .collect()
}

/// The `value` field of each message
pub fn values(messages: &[MessageEvent]) -> Vec<serde_json::Value> {
    messages.iter().map(|m| m.message["value"].clone()).collect()
}
