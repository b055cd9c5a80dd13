//! Event-flow graph and reachability analysis.
//!
//! Uses `petgraph` to model which step can hand an event to which other step.
//! An edge `a -> b` exists when `a` produces a (non-stop) type that `b`
//! accepts, restricted to `a`'s `target` when one is configured. Every step
//! must be reachable from a step that accepts the start event.

use std::collections::HashMap;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use stepwise_types::event::EventType;

use super::step::StepDescriptor;

/// Build the event-flow graph. Node weights are step names.
pub fn build_flow_graph(steps: &[StepDescriptor]) -> DiGraph<&str, EventType> {
    let mut graph = DiGraph::new();
    let nodes: HashMap<&str, NodeIndex> = steps
        .iter()
        .map(|s| (s.name(), graph.add_node(s.name())))
        .collect();

    for from in steps {
        let from_idx = nodes[from.name()];
        for produced in from.config().produced_events() {
            if produced.is_stop() {
                continue;
            }
            for to in steps {
                if let Some(target) = from.config().target() {
                    if to.name() != target {
                        continue;
                    }
                }
                if to.config().accepts_type(produced) {
                    graph.add_edge(from_idx, nodes[to.name()], produced.clone());
                }
            }
        }
    }

    graph
}

/// Names of steps no start step can reach, in registration order.
pub fn unreachable_steps(steps: &[StepDescriptor]) -> Vec<String> {
    let graph = build_flow_graph(steps);
    let mut reached = vec![false; graph.node_count()];

    for root in graph.node_indices() {
        let step = &steps[root.index()];
        if !step.config().accepts_type(&EventType::Start) || reached[root.index()] {
            continue;
        }
        let mut bfs = Bfs::new(&graph, root);
        while let Some(node) = bfs.next(&graph) {
            reached[node.index()] = true;
        }
    }

    steps
        .iter()
        .zip(reached)
        .filter(|(_, r)| !r)
        .map(|(s, _)| s.name().to_string())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use stepwise_types::workflow::StepConfig;

    fn step(config: StepConfig) -> StepDescriptor {
        StepDescriptor::from_fn(config, |_ctx, _ev| async { Ok(None) })
    }

    fn ty(name: &str) -> EventType {
        EventType::named(name)
    }

    #[test]
    fn test_linear_chain_fully_reachable() {
        let steps = vec![
            step(StepConfig::new("a").accepts(EventType::Start).produces(ty("x"))),
            step(StepConfig::new("b").accepts(ty("x")).produces(ty("y"))),
            step(StepConfig::new("c").accepts(ty("y")).produces(EventType::Stop)),
        ];
        let graph = build_flow_graph(&steps);
        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edge_count(), 2);
        assert!(unreachable_steps(&steps).is_empty());
    }

    #[test]
    fn test_fan_in_from_two_start_steps() {
        let steps = vec![
            step(StepConfig::new("step1").accepts(EventType::Start).produces(ty("one"))),
            step(StepConfig::new("step2").accepts(EventType::Start).produces(ty("another"))),
            step(
                StepConfig::new("step3")
                    .accepts(ty("one"))
                    .accepts(ty("another"))
                    .produces(EventType::Stop),
            ),
        ];
        assert_eq!(build_flow_graph(&steps).edge_count(), 2);
        assert!(unreachable_steps(&steps).is_empty());
    }

    #[test]
    fn test_isolated_cycle_is_unreachable() {
        let steps = vec![
            step(StepConfig::new("a").accepts(EventType::Start).produces(EventType::Stop)),
            step(StepConfig::new("b").accepts(ty("ping")).produces(ty("pong"))),
            step(StepConfig::new("c").accepts(ty("pong")).produces(ty("ping"))),
        ];
        assert_eq!(unreachable_steps(&steps), vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_target_restricts_edges() {
        let steps = vec![
            step(
                StepConfig::new("a")
                    .accepts(EventType::Start)
                    .produces(ty("x"))
                    .with_target("b"),
            ),
            step(StepConfig::new("b").accepts(ty("x")).produces(EventType::Stop)),
            step(StepConfig::new("c").accepts(ty("x")).produces(EventType::Stop)),
        ];
        assert_eq!(unreachable_steps(&steps), vec!["c".to_string()]);
    }

    #[test]
    fn test_loop_back_edge_is_fine() {
        let steps = vec![
            step(StepConfig::new("a").accepts(EventType::Start).produces(ty("again"))),
            step(
                StepConfig::new("b")
                    .accepts(ty("again"))
                    .produces(ty("again"))
                    .produces(EventType::Stop),
            ),
        ];
        assert!(unreachable_steps(&steps).is_empty());
    }
}
