/// Pipeline definitions
///
/// Types for nodes, edges and edge conditions, a petgraph view for structural checks,
/// and the read-only store the engine fetches pipelines from.

pub mod graph;
pub mod storage;
pub mod types;

pub use graph::PipelineGraph;
pub use storage::{InMemoryPipelineStore, PipelineStore, SqlitePipelineStore};
pub use types::{
    ApprovalConfig, Edge, EdgeCondition, EdgeConditionType, FieldMapping, Node, Pipeline, Transform,
};
