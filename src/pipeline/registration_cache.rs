//! Cache of compiled registration descriptors.
//!
//! Entries are keyed by node id and the full [`UserNode`] value: a node whose
//! name or source changed misses even though its id is the same. Entries are
//! kept in insertion order and [`truncate_to`](RegistrationCache::truncate_to)
//! drops the oldest ones.

use crate::pipeline::compiler::{CompileRequest, CompiledNode, NodeCompiler};
use crate::pipeline::error::PipelineResult;
use crate::pipeline::id::NodeId;
use crate::types::{UserNode, UserNodes};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct CacheEntry {
    node_id: NodeId,
    user_node: UserNode,
    compiled: CompiledNode,
}

#[derive(Debug, Default)]
pub struct RegistrationCache {
    entries: Vec<CacheEntry>,
    hits: u64,
    misses: u64,
}

impl RegistrationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find a descriptor compiled for exactly this node.
    pub fn lookup(&mut self, node_id: &NodeId, user_node: &UserNode) -> Option<CompiledNode> {
        let found = self
            .entries
            .iter()
            .find(|e| &e.node_id == node_id && &e.user_node == user_node)
            .map(|e| e.compiled.clone());
        if found.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        found
    }

    pub fn insert(&mut self, node_id: NodeId, user_node: UserNode, compiled: CompiledNode) {
        self.entries.push(CacheEntry {
            node_id,
            user_node,
            compiled,
        });
    }

    /// Descriptors for every node, in order. Misses are compiled together on
    /// the blocking pool and inserted.
    pub async fn resolve(
        &mut self,
        nodes: &UserNodes,
        compiler: &Arc<dyn NodeCompiler>,
        request: impl Fn(&UserNode) -> CompileRequest,
    ) -> PipelineResult<Vec<(NodeId, CompiledNode)>> {
        let mut resolved = Vec::with_capacity(nodes.len());
        let mut misses = Vec::new();
        for (node_id, node) in nodes {
            match self.lookup(node_id, node) {
                Some(compiled) => {
                    tracing::trace!("Registration cache hit for {}", node_id);
                    resolved.push(Some(compiled));
                }
                None => {
                    misses.push((resolved.len(), node_id.clone(), node.clone(), request(node)));
                    resolved.push(None);
                }
            }
        }

        if !misses.is_empty() {
            tracing::debug!("Compiling {} user nodes", misses.len());
            let compiler = compiler.clone();
            let compiled = tokio::task::spawn_blocking(move || {
                misses
                    .into_iter()
                    .map(|(slot, node_id, node, request)| {
                        let compiled = compiler.compile(&request);
                        (slot, node_id, node, compiled)
                    })
                    .collect::<Vec<_>>()
            })
            .await?;
            for (slot, node_id, node, compiled) in compiled {
                self.insert(node_id, node, compiled.clone());
                resolved[slot] = Some(compiled);
            }
        }

        Ok(nodes.keys().cloned().zip(resolved.into_iter().flatten()).collect())
    }

    /// Keep only the `limit` most recently inserted entries.
    pub fn truncate_to(&mut self, limit: usize) {
        if self.entries.len() > limit {
            let excess = self.entries.len() - limit;
            self.entries.drain(..excess);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// (hits, misses)
    pub fn counters(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}
