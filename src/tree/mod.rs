//! The replicated hierarchical namespace and its operation types.

pub mod operations;
pub mod state_machine;

pub use operations::{
    CommandOutcome, Condition, ReadOnlyOp, Status, TreeCommand, TreeError, TreeResult, WriteOp,
};
pub use state_machine::{ReadOnlyResult, TreeNode, TreeStateMachine};
