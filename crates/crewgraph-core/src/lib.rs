pub mod config;
pub mod error;
pub mod event;
pub mod schema;
pub mod stop;
pub mod traits;
pub mod types;
pub mod variables;

pub use config::AppConfig;
pub use error::{CrewGraphError, Result};
pub use event::EventBus;
pub use schema::{NodeKind, RunRequest, WorkflowSchema};
pub use stop::StopEvent;
pub use types::*;
pub use variables::{ExecutionState, HistoryEntry, VariableStore};
