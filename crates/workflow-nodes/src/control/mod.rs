//! Control flow nodes
//!
//! Branch selection and iteration over nested sub-graphs.

mod if_else;
mod iteration;

pub use if_else::{Case, CompareOperator, Condition, IfElseNode, LogicalOperator};
pub use iteration::IterationNode;
