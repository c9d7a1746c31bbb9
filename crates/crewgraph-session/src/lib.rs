pub mod broker;
pub mod manager;
pub mod status;
pub mod telemetry;

pub use broker::LocalBroker;
pub use manager::{RunSnapshot, RunState, SessionManager};
pub use status::{BrokerStatusStore, InMemoryStatusStore};
pub use telemetry::{TelemetryBridge, TelemetryLogger};
