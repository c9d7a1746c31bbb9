pub mod agent;
pub mod retry;
pub mod script;

pub use agent::HttpCodeAgentClient;
pub use retry::with_retry;
pub use script::HttpScriptExecutor;
