//! Workflow graph compilation and execution.
//!
//! A `WorkflowSchema` compiles into an `ExecutableGraph` of `CompiledNode`s
//! joined by plain edges and conditional `Route`s. Subgraph nodes hold their
//! own compiled graph and run it against a child state.

pub mod compiler;
pub mod edge;
pub mod executor;
pub mod node;

pub use compiler::SessionGraphBuilder;
pub use edge::{Predicate, Route};
pub use executor::ExecutableGraph;
pub use node::{CompiledNode, NodeVariant};
