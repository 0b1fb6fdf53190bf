//! Dataflow graph builder.
//!
//! Validates compiled candidates in node-map order and decides which of them
//! become active registrations. The rules, applied in order:
//!
//! 1. A candidate without an output topic is rejected.
//! 2. A candidate whose output repeats an earlier candidate's output is
//!    rejected; the first one wins.
//! 3. A candidate whose output is a real upstream topic is rejected.
//! 4. A candidate with compile errors is rejected.
//! 5. An accepted candidate consuming another accepted candidate's output is
//!    a fatal [`PipelineError::ChainedNode`].
//!
//! Building is pure: instantiating and terminating registrations is the
//! stage's job.

use crate::pipeline::compiler::CompiledNode;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::id::NodeId;
use crate::types::{Diagnostic, DiagnosticCode, DiagnosticSource, Topic};
use indexmap::{IndexMap, IndexSet};

/// One user node resolved through the registration cache or the compiler.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub node_id: NodeId,
    pub node_name: String,
    pub compiled: CompiledNode,
}

/// Result of validating a set of candidates.
#[derive(Debug, Clone, Default)]
pub struct GraphPlan {
    /// Accepted candidates, in node-map order.
    pub accepted: Vec<Candidate>,
    pub inputs_by_output_topic: IndexMap<String, Vec<String>>,
    /// Full diagnostics for every candidate, accepted or not.
    pub diagnostics_by_node: IndexMap<NodeId, Vec<Diagnostic>>,
    pub rejected: Vec<NodeId>,
}

pub struct DataflowGraph;

impl DataflowGraph {
    pub fn build(
        candidates: Vec<Candidate>,
        upstream_topics: &[Topic],
    ) -> PipelineResult<GraphPlan> {
        let upstream: IndexSet<&str> = upstream_topics.iter().map(|t| t.name.as_str()).collect();
        let mut claimed: IndexSet<String> = IndexSet::new();
        let mut plan = GraphPlan::default();

        for candidate in candidates {
            let mut diagnostics = candidate.compiled.diagnostics.clone();
            let output = candidate.compiled.output_topic.as_str();

            let rejection = if output.is_empty() {
                if !diagnostics
                    .iter()
                    .any(|d| d.code == DiagnosticCode::MissingOutput)
                {
                    diagnostics.push(Diagnostic::error(
                        DiagnosticSource::OutputTopicChecker,
                        DiagnosticCode::MissingOutput,
                        "Node has no output topic",
                    ));
                }
                true
            } else if !claimed.insert(output.to_string()) {
                diagnostics.push(
                    Diagnostic::error(
                        DiagnosticSource::OutputTopicChecker,
                        DiagnosticCode::OutputNotUnique,
                        format!("Output topic \"{}\" is not unique", output),
                    )
                    .with_tip("Another user node already publishes on this topic"),
                );
                true
            } else if upstream.contains(output) {
                diagnostics.push(
                    Diagnostic::error(
                        DiagnosticSource::OutputTopicChecker,
                        DiagnosticCode::OutputCollidesWithTopic,
                        format!(
                            "Output topic \"{}\" is already a topic of the data source",
                            output
                        ),
                    )
                    .with_tip("Choose an output topic that does not exist in the data source"),
                );
                true
            } else {
                candidate.compiled.has_errors()
            };

            if rejection {
                tracing::warn!(
                    "Rejected user node {} ({}) with {} diagnostics",
                    candidate.node_name,
                    candidate.node_id,
                    diagnostics.len()
                );
                plan.rejected.push(candidate.node_id.clone());
            }
            plan.diagnostics_by_node
                .insert(candidate.node_id.clone(), diagnostics);
            if !rejection {
                plan.accepted.push(candidate);
            }
        }

        let outputs: IndexSet<&str> = plan
            .accepted
            .iter()
            .map(|c| c.compiled.output_topic.as_str())
            .collect();
        for candidate in &plan.accepted {
            if let Some(input) = candidate
                .compiled
                .inputs
                .iter()
                .find(|input| outputs.contains(input.as_str()))
            {
                return Err(PipelineError::ChainedNode {
                    node_id: candidate.node_id.clone(),
                    topic: input.clone(),
                });
            }
        }

        plan.inputs_by_output_topic = plan
            .accepted
            .iter()
            .map(|c| (c.compiled.output_topic.clone(), c.compiled.inputs.clone()))
            .collect();
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn candidate(id: &str, inputs: &[&str], output: &str) -> Candidate {
        Candidate {
            node_id: NodeId::from(id),
            node_name: id.to_string(),
            compiled: CompiledNode {
                inputs: inputs.iter().map(|s| s.to_string()).collect(),
                output_topic: output.to_string(),
                ..Default::default()
            },
        }
    }

    fn topics(names: &[&str]) -> Vec<Topic> {
        names.iter().map(|n| Topic::new(*n, "Num")).collect()
    }

    fn codes(plan: &GraphPlan, id: &str) -> Vec<DiagnosticCode> {
        plan.diagnostics_by_node[&NodeId::from(id)]
            .iter()
            .map(|d| d.code)
            .collect()
    }

    #[test]
    fn test_valid_nodes_are_accepted() {
        let plan = DataflowGraph::build(
            vec![candidate("n1", &["/a"], "/b"), candidate("n2", &["/a", "/c"], "/d")],
            &topics(&["/a", "/c"]),
        )
        .unwrap();
        assert_eq!(plan.accepted.len(), 2);
        assert_eq!(plan.inputs_by_output_topic["/d"], vec!["/a", "/c"]);
        assert!(plan.rejected.is_empty());
        assert!(codes(&plan, "n1").is_empty());
    }

    #[test]
    fn test_empty_output_rejected() {
        let plan =
            DataflowGraph::build(vec![candidate("n1", &["/a"], "")], &topics(&["/a"])).unwrap();
        assert!(plan.accepted.is_empty());
        assert_eq!(codes(&plan, "n1"), vec![DiagnosticCode::MissingOutput]);
    }

    #[test]
    fn test_first_output_wins() {
        let plan = DataflowGraph::build(
            vec![
                candidate("n1", &["/a"], "/b"),
                candidate("n2", &["/a"], "/b"),
                candidate("n3", &["/a"], "/b"),
            ],
            &topics(&["/a"]),
        )
        .unwrap();
        assert_eq!(plan.accepted.len(), 1);
        assert_eq!(plan.accepted[0].node_id, NodeId::from("n1"));
        assert_eq!(codes(&plan, "n2"), vec![DiagnosticCode::OutputNotUnique]);
        assert_eq!(codes(&plan, "n3"), vec![DiagnosticCode::OutputNotUnique]);
        assert_eq!(plan.rejected, vec![NodeId::from("n2"), NodeId::from("n3")]);
    }

    #[test]
    fn test_collision_with_upstream_topic() {
        let plan =
            DataflowGraph::build(vec![candidate("n1", &["/a"], "/a")], &topics(&["/a"])).unwrap();
        assert!(plan.accepted.is_empty());
        assert_eq!(codes(&plan, "n1"), vec![DiagnosticCode::OutputCollidesWithTopic]);
    }

    #[test]
    fn test_compile_errors_rejected() {
        let mut broken = candidate("n1", &["/a"], "/b");
        broken.compiled.diagnostics.push(Diagnostic::error(
            DiagnosticSource::Compile,
            DiagnosticCode::SyntaxError,
            "bad",
        ));
        let plan = DataflowGraph::build(vec![broken], &topics(&["/a"])).unwrap();
        assert!(plan.accepted.is_empty());
        assert_eq!(codes(&plan, "n1"), vec![DiagnosticCode::SyntaxError]);
    }

    #[test]
    fn test_chained_nodes_are_fatal() {
        let err = DataflowGraph::build(
            vec![candidate("n1", &["/a"], "/b"), candidate("n2", &["/b"], "/c")],
            &topics(&["/a"]),
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::ChainedNode { ref topic, .. } if topic == "/b"));
    }

    fn arb_candidates() -> impl Strategy<Value = Vec<Candidate>> {
        let topic = prop::sample::select(vec!["", "/a", "/b", "/c", "/d", "/e"]);
        prop::collection::vec(
            (prop::collection::vec(topic.clone(), 0..3), topic, any::<bool>()),
            0..8,
        )
        .prop_map(|specs| {
            specs
                .into_iter()
                .enumerate()
                .map(|(i, (inputs, output, broken))| {
                    let mut c = candidate(&format!("n{}", i), &inputs, output);
                    if broken {
                        c.compiled.diagnostics.push(Diagnostic::error(
                            DiagnosticSource::Compile,
                            DiagnosticCode::SyntaxError,
                            "bad",
                        ));
                    }
                    c
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn prop_accepted_outputs_are_unique_and_fresh(candidates in arb_candidates()) {
            let upstream = topics(&["/a", "/b"]);
            let total = candidates.len();
            match DataflowGraph::build(candidates, &upstream) {
                Ok(plan) => {
                    let outputs: Vec<&str> = plan
                        .accepted
                        .iter()
                        .map(|c| c.compiled.output_topic.as_str())
                        .collect();
                    let unique: IndexSet<&str> = outputs.iter().copied().collect();
                    prop_assert_eq!(unique.len(), outputs.len());
                    for output in &outputs {
                        prop_assert!(!output.is_empty());
                        prop_assert!(*output != "/a" && *output != "/b");
                    }
                    for c in &plan.accepted {
                        prop_assert!(!c.compiled.has_errors());
                        for input in &c.compiled.inputs {
                            prop_assert!(!unique.contains(input.as_str()));
                        }
                    }
                    prop_assert_eq!(plan.accepted.len() + plan.rejected.len(), total);
                    prop_assert_eq!(plan.diagnostics_by_node.len(), total);
                    prop_assert_eq!(plan.inputs_by_output_topic.len(), plan.accepted.len());
                }
                Err(err) => {
                    let is_chained = matches!(err, PipelineError::ChainedNode { .. });
                    prop_assert!(is_chained);
                }
            }
        }

        #[test]
        fn prop_build_is_deterministic(candidates in arb_candidates()) {
            let upstream = topics(&["/a"]);
            let first = DataflowGraph::build(candidates.clone(), &upstream);
            let second = DataflowGraph::build(candidates, &upstream);
            match (first, second) {
                (Ok(a), Ok(b)) => {
                    prop_assert_eq!(a.diagnostics_by_node, b.diagnostics_by_node);
                    prop_assert_eq!(a.accepted, b.accepted);
                }
                (Err(_), Err(_)) => {}
                _ => prop_assert!(false, "non-deterministic build"),
            }
        }
    }
}
