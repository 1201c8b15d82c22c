/// Core pipeline type definitions
///
/// Pipelines are owned by the editor side of the system and are read-only to the
/// engine: they are stored as JSON and fetched fresh for every engine operation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A directed graph of automation steps
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    /// Unique pipeline identifier (e.g., "pl-mint-watch")
    pub id: String,
    /// Human-readable pipeline name
    pub name: String,
    /// Owner; copied onto every execution
    pub user_id: String,
    /// Deactivated pipelines are ignored by the scheduler
    #[serde(default = "default_active")]
    pub active: bool,
    /// Nodes in declaration order
    pub nodes: Vec<Node>,
    /// Edges in declaration order; outgoing edges are evaluated in this order
    #[serde(default)]
    pub edges: Vec<Edge>,
}

fn default_active() -> bool {
    true
}

/// A single step in the pipeline
///
/// The `node_type` selects the handler in the node executor registry. `config` is opaque
/// to the engine apart from template substitution on its string values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Unique node identifier within the pipeline (e.g., "fetch-price")
    pub id: String,
    /// Handler type, e.g. "manual-trigger", "data-transform"
    #[serde(rename = "type")]
    pub node_type: String,
    /// Handler-specific configuration
    #[serde(default)]
    pub config: Value,
    /// Inputs pulled from upstream node outputs before the handler runs
    #[serde(default)]
    pub field_mappings: Vec<FieldMapping>,
}

impl Node {
    /// Trigger-typed nodes are expected entry points (`manual-trigger`, `schedule-trigger`, ...)
    pub fn is_trigger_type(&self) -> bool {
        self.node_type == "trigger" || self.node_type.ends_with("-trigger")
    }
}

/// Copies one upstream output field into this node's inputs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMapping {
    pub source_node_id: String,
    /// Dot path ("price.usd", "items.0.id") or JSONPath when starting with `$`
    pub source_field: String,
    pub target_field: String,
    #[serde(default)]
    pub transform: Transform,
    /// Lua expression for `Transform::Custom`, evaluated with `value` bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

/// Value transform applied by a field mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Transform {
    #[default]
    None,
    Stringify,
    Parse,
    Uppercase,
    Lowercase,
    Custom,
}

/// Connection between two nodes, carrying the policy that governs the target's dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub condition: EdgeCondition,
}

/// When (and whether) the target of an edge runs after the source completes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EdgeCondition {
    #[serde(rename = "type", default)]
    pub kind: EdgeConditionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_config: Option<ApprovalConfig>,
}

impl EdgeCondition {
    pub fn immediate() -> Self {
        Self::default()
    }

    pub fn delay(delay_ms: u64) -> Self {
        Self {
            kind: EdgeConditionType::Delay,
            delay_ms: Some(delay_ms),
            approval_config: None,
        }
    }

    pub fn approval(config: ApprovalConfig) -> Self {
        Self {
            kind: EdgeConditionType::Approval,
            delay_ms: None,
            approval_config: Some(config),
        }
    }

    pub fn event() -> Self {
        Self {
            kind: EdgeConditionType::Event,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EdgeConditionType {
    #[default]
    Immediate,
    Delay,
    Event,
    Approval,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalConfig {
    #[serde(default = "default_min_approvals")]
    pub min_approvals: u32,
    #[serde(default)]
    pub approvers: Vec<String>,
}

fn default_min_approvals() -> u32 {
    1
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            min_approvals: default_min_approvals(),
            approvers: Vec::new(),
        }
    }
}

impl Pipeline {
    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|node| node.id == node_id)
    }

    /// Outgoing edges of a node, in declaration order
    pub fn outgoing_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |edge| edge.source == node_id)
    }

    pub fn incoming_edges<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |edge| edge.target == node_id)
    }

    /// Entry points: nodes with zero incoming edges
    pub fn trigger_nodes(&self) -> Vec<&Node> {
        self.nodes
            .iter()
            .filter(|node| self.incoming_edges(&node.id).next().is_none())
            .collect()
    }
}
