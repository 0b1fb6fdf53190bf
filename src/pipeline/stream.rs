//! Streaming message processing.
//!
//! Each batch of current-frame messages is dispatched to every registration
//! that consumes the message's topic and whose output has a downstream
//! subscriber. Registrations run concurrently, one task each, processing
//! their messages in batch order. Derived messages are placed right after
//! their trigger in registration order and the combined batch is stable
//! sorted by receive time.

use crate::pipeline::error::PipelineResult;
use crate::pipeline::executor::NodeRegistration;
use crate::pipeline::subscriptions::SubscriptionIndex;
use crate::types::{GlobalVariables, MessageEvent};
use std::sync::Arc;

/// Active registrations in node-map order.
pub type Registrations = Arc<Vec<Arc<NodeRegistration>>>;

/// Stable sort by receive time.
pub fn sort_by_receive_time(messages: &mut [MessageEvent]) {
    messages.sort_by_key(|m| m.receive_time);
}

/// Merge two receive-time sorted sequences. On ties `left` comes first.
pub fn merge_by_receive_time(
    left: Vec<MessageEvent>,
    right: Vec<MessageEvent>,
) -> Vec<MessageEvent> {
    if right.is_empty() {
        return left;
    }
    if left.is_empty() {
        return right;
    }
    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();
    loop {
        let take_left = match (left.peek(), right.peek()) {
            (Some(l), Some(r)) => l.receive_time <= r.receive_time,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (None, None) => break,
        };
        let next = if take_left { left.next() } else { right.next() };
        merged.extend(next);
    }
    merged
}

struct StreamMemo {
    messages: Arc<Vec<MessageEvent>>,
    globals: Arc<GlobalVariables>,
    registrations: Registrations,
    index: Arc<SubscriptionIndex>,
    output: Arc<Vec<MessageEvent>>,
}

impl StreamMemo {
    fn matches(
        &self,
        messages: &Arc<Vec<MessageEvent>>,
        globals: &Arc<GlobalVariables>,
        registrations: &Registrations,
        index: &Arc<SubscriptionIndex>,
    ) -> bool {
        Arc::ptr_eq(&self.messages, messages)
            && Arc::ptr_eq(&self.globals, globals)
            && Arc::ptr_eq(&self.registrations, registrations)
            && Arc::ptr_eq(&self.index, index)
    }
}

#[derive(Default)]
pub struct StreamProcessor {
    memo: Option<StreamMemo>,
    computed: u64,
}

impl StreamProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process a batch, returning the original messages merged with derived ones.
    pub async fn process(
        &mut self,
        messages: &Arc<Vec<MessageEvent>>,
        globals: &Arc<GlobalVariables>,
        registrations: &Registrations,
        index: &Arc<SubscriptionIndex>,
    ) -> PipelineResult<Arc<Vec<MessageEvent>>> {
        if let Some(memo) = &self.memo {
            if memo.matches(messages, globals, registrations, index) {
                return Ok(memo.output.clone());
            }
        }

        let output = Arc::new(Self::compute(messages, globals, registrations, index).await?);
        self.computed += 1;
        self.memo = Some(StreamMemo {
            messages: messages.clone(),
            globals: globals.clone(),
            registrations: registrations.clone(),
            index: index.clone(),
            output: output.clone(),
        });
        Ok(output)
    }

    /// Number of batches actually computed (memo misses).
    pub fn computed(&self) -> u64 {
        self.computed
    }

    async fn compute(
        messages: &Arc<Vec<MessageEvent>>,
        globals: &Arc<GlobalVariables>,
        registrations: &Registrations,
        index: &SubscriptionIndex,
    ) -> PipelineResult<Vec<MessageEvent>> {
        let mut tasks = Vec::new();
        for registration in registrations.iter() {
            if !index.has_subscriber(&registration.output.name) {
                continue;
            }
            let triggers: Vec<usize> = messages
                .iter()
                .enumerate()
                .filter(|(_, m)| registration.consumes(&m.topic))
                .map(|(i, _)| i)
                .collect();
            if triggers.is_empty() {
                continue;
            }

            let registration = registration.clone();
            let messages = messages.clone();
            let globals = globals.clone();
            tasks.push(tokio::spawn(async move {
                let mut derived = Vec::new();
                for i in triggers {
                    if let Some(event) = registration.process(&messages[i], &globals).await {
                        derived.push((i, event));
                    }
                }
                derived
            }));
        }

        if tasks.is_empty() {
            return Ok(messages.as_ref().clone());
        }

        let mut derived_by_trigger: Vec<Vec<MessageEvent>> = vec![Vec::new(); messages.len()];
        for task in tasks {
            for (i, event) in task.await? {
                derived_by_trigger[i].push(event);
            }
        }

        let mut combined = Vec::with_capacity(messages.len() * 2);
        for (message, derived) in messages.iter().zip(derived_by_trigger) {
            combined.push(message.clone());
            combined.extend(derived);
        }
        sort_by_receive_time(&mut combined);
        tracing::trace!(
            "Stream batch: {} in, {} out",
            messages.len(),
            combined.len()
        );
        Ok(combined)
    }

    /// Feed the last known input messages back through registrations whose
    /// logic or inputs changed. Only the derived messages are returned.
    pub async fn recompute(
        requests: Vec<(Arc<NodeRegistration>, Vec<MessageEvent>)>,
        globals: &Arc<GlobalVariables>,
    ) -> PipelineResult<Vec<MessageEvent>> {
        let mut tasks = Vec::with_capacity(requests.len());
        for (registration, mut inputs) in requests {
            sort_by_receive_time(&mut inputs);
            let globals = globals.clone();
            tasks.push(tokio::spawn(async move {
                let mut derived = Vec::new();
                for input in &inputs {
                    if let Some(event) = registration.process(input, &globals).await {
                        derived.push(event);
                    }
                }
                derived
            }));
        }

        let mut derived = Vec::new();
        for task in tasks {
            derived.extend(task.await?);
        }
        sort_by_receive_time(&mut derived);
        Ok(derived)
    }
}
