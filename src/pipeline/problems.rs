//! Standing problems surfaced in the emitted player state.

use crate::pipeline::id::NodeId;
use crate::types::PlayerProblem;
use indexmap::IndexMap;
use std::sync::Mutex;

/// Key of a standing problem.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProblemKey {
    /// Per-node runtime problem.
    Node(NodeId),
    /// Pipeline-level failure while handling an upstream state.
    StateUpdate,
}

impl ProblemKey {
    pub fn as_str(&self) -> &str {
        match self {
            ProblemKey::Node(id) => id.as_str(),
            ProblemKey::StateUpdate => "player-state-update",
        }
    }
}

/// Problems keyed by origin, in first-reported order.
#[derive(Debug, Default)]
pub struct ProblemStore {
    problems: Mutex<IndexMap<ProblemKey, PlayerProblem>>,
}

impl ProblemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: ProblemKey, problem: PlayerProblem) {
        if let Ok(mut problems) = self.problems.lock() {
            problems.insert(key, problem);
        }
    }

    pub fn clear(&self, key: &ProblemKey) {
        if let Ok(mut problems) = self.problems.lock() {
            problems.shift_remove(key);
        }
    }

    pub fn get(&self, key: &ProblemKey) -> Option<PlayerProblem> {
        self.problems.lock().ok()?.get(key).cloned()
    }

    pub fn snapshot(&self) -> Vec<PlayerProblem> {
        self.problems
            .lock()
            .map(|problems| problems.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear_all(&self) {
        if let Ok(mut problems) = self.problems.lock() {
            problems.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.problems.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;

    #[test]
    fn test_set_replaces_and_clear_removes() {
        let store = ProblemStore::new();
        let key = ProblemKey::Node(NodeId::from("n1"));
        store.set(key.clone(), PlayerProblem::new(Severity::Warn, "first"));
        store.set(key.clone(), PlayerProblem::new(Severity::Error, "second"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&key).unwrap().message, "second");

        store.clear(&key);
        assert!(store.is_empty());
        store.clear(&key);
    }

    #[test]
    fn test_snapshot_order() {
        let store = ProblemStore::new();
        store.set(ProblemKey::StateUpdate, PlayerProblem::new(Severity::Error, "a"));
        store.set(ProblemKey::Node(NodeId::from("n")), PlayerProblem::new(Severity::Warn, "b"));
        let messages: Vec<_> = store.snapshot().into_iter().map(|p| p.message).collect();
        assert_eq!(messages, vec!["a", "b"]);
        assert_eq!(ProblemKey::StateUpdate.as_str(), "player-state-update");
        store.clear_all();
        assert!(store.is_empty());
    }
}
