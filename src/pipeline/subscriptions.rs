//! Translation of downstream subscriptions into upstream ones.
//!
//! A subscription to a user node output becomes one subscription per input
//! topic of that node, with the same preload type. Subscriptions to an output
//! with no inputs are dropped; anything else passes through.

use crate::types::{PreloadType, SubscribePayload};
use indexmap::{IndexMap, IndexSet};

/// Which topics currently have downstream subscribers, and of which kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionIndex {
    by_topic: IndexMap<String, Vec<SubscribePayload>>,
}

impl SubscriptionIndex {
    pub fn new(subscriptions: &[SubscribePayload]) -> Self {
        let mut by_topic: IndexMap<String, Vec<SubscribePayload>> = IndexMap::new();
        for subscription in subscriptions {
            by_topic
                .entry(subscription.topic.clone())
                .or_default()
                .push(subscription.clone());
        }
        Self { by_topic }
    }

    pub fn has_subscriber(&self, topic: &str) -> bool {
        self.by_topic.contains_key(topic)
    }

    pub fn has_full_preload_subscriber(&self, topic: &str) -> bool {
        self.by_topic
            .get(topic)
            .is_some_and(|subs| subs.iter().any(|s| s.preload_type == PreloadType::Full))
    }

    /// The original subscriptions requested for `topic`.
    pub fn requested(&self, topic: &str) -> &[SubscribePayload] {
        self.by_topic.get(topic).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Upstream subscriptions plus the reverse index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranslatedSubscriptions {
    pub upstream: Vec<SubscribePayload>,
    pub index: SubscriptionIndex,
}

pub fn translate(
    subscriptions: &[SubscribePayload],
    inputs_by_output_topic: &IndexMap<String, Vec<String>>,
) -> TranslatedSubscriptions {
    let mut upstream: IndexSet<SubscribePayload> = IndexSet::new();
    for subscription in subscriptions {
        match inputs_by_output_topic.get(&subscription.topic) {
            Some(inputs) => {
                for input in inputs {
                    upstream.insert(SubscribePayload {
                        topic: input.clone(),
                        preload_type: subscription.preload_type,
                    });
                }
            }
            None => {
                upstream.insert(subscription.clone());
            }
        }
    }
    TranslatedSubscriptions {
        upstream: upstream.into_iter().collect(),
        index: SubscriptionIndex::new(subscriptions),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outputs(entries: &[(&str, &[&str])]) -> IndexMap<String, Vec<String>> {
        entries
            .iter()
            .map(|(out, ins)| (out.to_string(), ins.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_output_expands_to_inputs() {
        let map = outputs(&[("/b", &["/a", "/c"])]);
        let translated = translate(&[SubscribePayload::full("/b")], &map);
        assert_eq!(
            translated.upstream,
            vec![SubscribePayload::full("/a"), SubscribePayload::full("/c")]
        );
        assert!(translated.index.has_full_preload_subscriber("/b"));
        assert!(!translated.index.has_subscriber("/a"));
    }

    #[test]
    fn test_output_without_inputs_is_dropped() {
        let map = outputs(&[("/b", &[])]);
        let translated = translate(&[SubscribePayload::new("/b")], &map);
        assert!(translated.upstream.is_empty());
        assert!(translated.index.has_subscriber("/b"));
    }

    #[test]
    fn test_passthrough_and_dedup() {
        let map = outputs(&[("/b", &["/a"])]);
        let translated = translate(
            &[
                SubscribePayload::new("/a"),
                SubscribePayload::new("/b"),
                SubscribePayload::new("/x"),
            ],
            &map,
        );
        assert_eq!(
            translated.upstream,
            vec![SubscribePayload::new("/a"), SubscribePayload::new("/x")]
        );
    }

    #[test]
    fn test_preload_types_are_kept_apart() {
        let map = outputs(&[("/b", &["/a"])]);
        let translated = translate(
            &[SubscribePayload::new("/b"), SubscribePayload::full("/b")],
            &map,
        );
        assert_eq!(translated.upstream.len(), 2);
        assert_eq!(translated.index.requested("/b").len(), 2);
        assert!(translated.index.has_full_preload_subscriber("/b"));
        assert!(!translated.index.has_full_preload_subscriber("/x"));
    }
}
