/// Petgraph view of a pipeline
///
/// Used for structural checks (unknown edge endpoints, cycles) during pre-flight
/// validation. Execution itself walks edges directly and never needs a topological order.

use crate::pipeline::types::Pipeline;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

/// A pipeline as a petgraph DiGraph, with node id lookups
#[derive(Debug)]
pub struct PipelineGraph {
    graph: DiGraph<String, String>,
    node_id_to_index: HashMap<String, NodeIndex>,
    /// Edge ids whose source or target does not exist
    dangling_edges: Vec<String>,
}

impl PipelineGraph {
    pub fn build(pipeline: &Pipeline) -> Self {
        let mut graph = DiGraph::new();
        let mut node_id_to_index = HashMap::new();
        let mut dangling_edges = Vec::new();

        for node in &pipeline.nodes {
            let index = graph.add_node(node.id.clone());
            node_id_to_index.insert(node.id.clone(), index);
        }

        for edge in &pipeline.edges {
            match (node_id_to_index.get(&edge.source), node_id_to_index.get(&edge.target)) {
                (Some(from), Some(to)) => {
                    graph.add_edge(*from, *to, edge.id.clone());
                }
                _ => {
                    tracing::debug!("🔗 Edge '{}' references unknown node ({} → {})", edge.id, edge.source, edge.target);
                    dangling_edges.push(edge.id.clone());
                }
            }
        }

        Self {
            graph,
            node_id_to_index,
            dangling_edges,
        }
    }

    pub fn has_cycle(&self) -> bool {
        is_cyclic_directed(&self.graph)
    }

    pub fn dangling_edges(&self) -> &[String] {
        &self.dangling_edges
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.node_id_to_index.contains_key(node_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{Edge, EdgeCondition, Node};
    use serde_json::Value;

    fn node(id: &str) -> Node {
        Node {
            id: id.into(),
            node_type: "log".into(),
            config: Value::Null,
            field_mappings: vec![],
        }
    }

    fn edge(id: &str, source: &str, target: &str) -> Edge {
        Edge {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            condition: EdgeCondition::immediate(),
        }
    }

    fn pipeline(edges: Vec<Edge>) -> Pipeline {
        Pipeline {
            id: "p".into(),
            name: "p".into(),
            user_id: "u".into(),
            active: true,
            nodes: vec![node("a"), node("b"), node("c")],
            edges,
        }
    }

    #[test]
    fn detects_cycles() {
        let acyclic = PipelineGraph::build(&pipeline(vec![edge("1", "a", "b"), edge("2", "b", "c")]));
        assert!(!acyclic.has_cycle());

        let cyclic = PipelineGraph::build(&pipeline(vec![edge("1", "a", "b"), edge("2", "b", "a")]));
        assert!(cyclic.has_cycle());
    }

    #[test]
    fn records_dangling_edges() {
        let graph = PipelineGraph::build(&pipeline(vec![edge("1", "a", "ghost")]));
        assert_eq!(graph.dangling_edges(), ["1".to_string()]);
        assert!(graph.contains("a"));
        assert!(!graph.contains("ghost"));
    }
}
