pub mod context;
pub mod expr;
pub mod graph;
pub mod nodes;

pub use context::{GraphServices, RunContext};
pub use expr::{Expression, Manipulation};
pub use graph::{CompiledNode, ExecutableGraph, NodeVariant, Route, SessionGraphBuilder};
pub use nodes::code_agent::{AgentState, CallbackChain, PollTracker};
pub use nodes::decision::Routing;
