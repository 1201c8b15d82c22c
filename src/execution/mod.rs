/// Execution records and their store
///
/// The Execution record is the only mutable state shared between workers.

pub mod store;
pub mod types;

pub use store::{ExecutionStore, InMemoryExecutionStore, SqliteExecutionStore};
pub use types::{
    Execution, ExecutionPatch, ExecutionStatus, NodeResult, NodeResultPatch, NodeStatus, Trigger,
};
