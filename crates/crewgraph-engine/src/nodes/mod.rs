//! Node execution strategies, one per node kind.

pub mod code_agent;
pub mod crew;
pub mod decision;
pub mod end;
pub mod script;
pub mod subgraph;
pub mod trigger;

pub use code_agent::CodeAgentNode;
pub use crew::CrewNode;
pub use decision::DecisionGraph;
pub use end::EndNode;
pub use script::{ScriptNode, WebhookTriggerNode};
pub use subgraph::SubGraphNode;
pub use trigger::TriggerFieldNode;
