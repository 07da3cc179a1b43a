pub mod abort;
pub mod backend;
mod driver;
pub mod error;
pub mod mock;
pub mod orchestrator;
pub mod permission;
pub mod registry;
pub mod runner;

pub use abort::{AbortConfig, AbortMode, AbortOutcome};
pub use backend::{AgentBackend, ProcessAgentBackend, ProcessLauncher, ShellLauncher};
pub use error::EngineError;
pub use orchestrator::{
    CommandParams, EngineConfig, OperationStatus, Orchestrator, QueryParams, RunnerLimits,
    SessionUpdate,
};
pub use permission::{PermissionConfig, PermissionDecision, ResolveOutcome};
pub use registry::ReaperConfig;
pub use runner::{EventRunner, Replay, Subscription};
