use tether_core::CoreError;
use tether_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid agent message: {0}")]
    Message(#[from] CoreError),

    #[error("operation already registered: {0}")]
    Conflict(String),

    #[error("session {0} already has a running operation")]
    SessionBusy(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("failed to spawn collaborator: {0}")]
    Spawn(String),

    #[error("collaborator failed: {0}")]
    Collaborator(String),

    #[error("interrupt failed: {0}")]
    Interrupt(String),

    #[error("operation aborted")]
    Aborted,

    #[error("{0}")]
    Internal(String),
}
