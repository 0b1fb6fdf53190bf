//! Boundary between the stage and whatever displays node diagnostics and logs.
//!
//! The stage only talks to [`DiagnosticsSink`]. [`DiagnosticsBridge`] hands
//! events to a [`DiagnosticsFeed`] drained by the host; [`TracingSink`] writes
//! to the log instead.
//!
//! Diagnostics are replaced wholesale, so pending sets are coalesced per node
//! and the latest set always reaches the host. Logs travel over a bounded
//! channel and are dropped when the host falls behind.

use crate::pipeline::id::NodeId;
use crate::types::{Diagnostic, UserNodeLog};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use indexmap::IndexMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Receives per-node diagnostics and logs.
pub trait DiagnosticsSink: Send + Sync {
    /// Replace the diagnostics of `node_id` wholesale.
    fn set_diagnostics(&self, node_id: &NodeId, diagnostics: Vec<Diagnostic>);

    fn add_logs(&self, node_id: &NodeId, logs: Vec<UserNodeLog>);
}

/// Events sent from the stage to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum StageEvent {
    Diagnostics {
        node_id: NodeId,
        diagnostics: Vec<Diagnostic>,
    },
    Logs {
        node_id: NodeId,
        logs: Vec<UserNodeLog>,
    },
}

/// Capacity of the log channel.
const LOG_CHANNEL_CAPACITY: usize = 4_096;

/// Latest undelivered diagnostics per node, oldest update first.
type PendingDiagnostics = Arc<Mutex<IndexMap<NodeId, Vec<Diagnostic>>>>;

fn lock(pending: &PendingDiagnostics) -> MutexGuard<'_, IndexMap<NodeId, Vec<Diagnostic>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Stage-side sender.
#[derive(Debug)]
pub struct DiagnosticsBridge {
    logs: Sender<StageEvent>,
    pending: PendingDiagnostics,
    dropped: AtomicU64,
}

/// Host-side receiver.
#[derive(Debug, Clone)]
pub struct DiagnosticsFeed {
    logs: Receiver<StageEvent>,
    pending: PendingDiagnostics,
}

impl DiagnosticsBridge {
    /// Create a new bridge pair: `(sink_for_stage, feed_for_host)`.
    pub fn new() -> (Self, DiagnosticsFeed) {
        Self::with_capacity(LOG_CHANNEL_CAPACITY)
    }

    /// `capacity` bounds undelivered log events only.
    pub fn with_capacity(capacity: usize) -> (Self, DiagnosticsFeed) {
        let (tx, rx) = bounded(capacity);
        let pending = PendingDiagnostics::default();
        (
            Self {
                logs: tx,
                pending: pending.clone(),
                dropped: AtomicU64::new(0),
            },
            DiagnosticsFeed { logs: rx, pending },
        )
    }

    /// Number of log events dropped because the host fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl DiagnosticsSink for DiagnosticsBridge {
    fn set_diagnostics(&self, node_id: &NodeId, diagnostics: Vec<Diagnostic>) {
        let mut pending = lock(&self.pending);
        pending.shift_remove(node_id);
        pending.insert(node_id.clone(), diagnostics);
    }

    fn add_logs(&self, node_id: &NodeId, logs: Vec<UserNodeLog>) {
        if logs.is_empty() {
            return;
        }
        let event = StageEvent::Logs {
            node_id: node_id.clone(),
            logs,
        };
        match self.logs.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl DiagnosticsFeed {
    /// Drain all pending events: queued logs, then the latest diagnostics of
    /// every node updated since the last drain.
    pub fn drain(&self) -> Vec<StageEvent> {
        let mut events: Vec<StageEvent> = self.logs.try_iter().collect();
        events.extend(
            lock(&self.pending)
                .drain(..)
                .map(|(node_id, diagnostics)| StageEvent::Diagnostics {
                    node_id,
                    diagnostics,
                }),
        );
        events
    }

    /// Try to receive a single event without blocking.
    pub fn try_recv(&self) -> Option<StageEvent> {
        if let Ok(event) = self.logs.try_recv() {
            return Some(event);
        }
        lock(&self.pending)
            .shift_remove_index(0)
            .map(|(node_id, diagnostics)| StageEvent::Diagnostics {
                node_id,
                diagnostics,
            })
    }
}

/// Writes diagnostics and logs to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn set_diagnostics(&self, node_id: &NodeId, diagnostics: Vec<Diagnostic>) {
        for diagnostic in diagnostics {
            if diagnostic.is_error() {
                tracing::warn!("[{}] {}", node_id, diagnostic);
            } else {
                tracing::info!("[{}] {}", node_id, diagnostic);
            }
        }
    }

    fn add_logs(&self, node_id: &NodeId, logs: Vec<UserNodeLog>) {
        for log in logs {
            tracing::info!("[{}] {}", node_id, log.value);
        }
    }
}
