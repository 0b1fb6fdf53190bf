//! Pool of reusable sandbox workers.
//!
//! Workers are spawned lazily on [`WorkerPool::acquire`] and returned to an idle
//! stack on [`WorkerPool::release`]. A worker that crashed, replied with
//! garbage or timed out is [`discard`](WorkerPool::discard)ed instead: dropping
//! its handle closes the request channel and the worker thread exits.

use crate::pipeline::error::PipelineResult;
use crate::pipeline::id::WorkerId;
use crate::pipeline::rpc::{
    ProcessReply, RegistrationReply, RpcChannel, SandboxRuntime, WorkerMessage,
};
use crate::types::GlobalVariables;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Exclusive handle to one live worker.
#[derive(Debug)]
pub struct WorkerHandle {
    channel: RpcChannel,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.channel.worker_id()
    }

    pub async fn process(
        &mut self,
        message: WorkerMessage,
        global_variables: GlobalVariables,
    ) -> PipelineResult<ProcessReply> {
        self.channel.process(message, global_variables).await
    }
}

/// Pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub spawned: usize,
    pub idle: usize,
    pub discarded: usize,
}

pub struct WorkerPool {
    sandbox: Arc<dyn SandboxRuntime>,
    idle: Mutex<Vec<WorkerHandle>>,
    next_worker: AtomicU32,
    spawned: AtomicUsize,
    discarded: AtomicUsize,
}

impl WorkerPool {
    pub fn new(sandbox: Arc<dyn SandboxRuntime>) -> Self {
        Self {
            sandbox,
            idle: Mutex::new(Vec::new()),
            next_worker: AtomicU32::new(1),
            spawned: AtomicUsize::new(0),
            discarded: AtomicUsize::new(0),
        }
    }

    /// Pop an idle worker or spawn a new one.
    pub fn acquire(&self) -> PipelineResult<WorkerHandle> {
        if let Some(handle) = self.idle.lock().ok().and_then(|mut idle| idle.pop()) {
            tracing::trace!("Reusing idle {}", handle.id());
            return Ok(handle);
        }

        let worker_id = WorkerId(self.next_worker.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = crossbeam_channel::unbounded();
        self.sandbox.spawn(worker_id, rx)?;
        self.spawned.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Spawned sandbox {}", worker_id);

        Ok(WorkerHandle {
            channel: RpcChannel::new(worker_id, tx),
        })
    }

    /// Handshake: load the generated library and node code into the worker.
    pub async fn register(
        &self,
        handle: &mut WorkerHandle,
        project_code: &str,
        node_code: &str,
    ) -> PipelineResult<RegistrationReply> {
        handle
            .channel
            .register(project_code.to_string(), node_code.to_string())
            .await
    }

    /// Return a healthy worker to the idle stack.
    pub fn release(&self, handle: WorkerHandle) {
        match self.idle.lock() {
            Ok(mut idle) => idle.push(handle),
            Err(_) => self.discard(handle),
        }
    }

    /// Drop a worker that can no longer be trusted.
    pub fn discard(&self, handle: WorkerHandle) {
        tracing::debug!("Discarding sandbox {}", handle.id());
        self.discarded.fetch_add(1, Ordering::Relaxed);
        drop(handle);
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            spawned: self.spawned.load(Ordering::Relaxed),
            idle: self.idle.lock().map(|idle| idle.len()).unwrap_or(0),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }

    /// Drop every idle worker.
    pub fn shutdown(&self) {
        if let Ok(mut idle) = self.idle.lock() {
            let count = idle.len();
            idle.clear();
            tracing::debug!("Worker pool shut down ({} idle workers dropped)", count);
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("stats", &self.stats())
            .finish()
    }
}
