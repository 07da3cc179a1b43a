/// Errors raised while validating collaborator data at the crate boundary.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("agent message is not a JSON object")]
    NotAnObject,

    #[error("agent message has no string `type` field")]
    MissingType,

    #[error("unknown agent message type: {0}")]
    UnknownMessageType(String),

    #[error("unknown permission mode: {0}")]
    UnknownPermissionMode(String),
}
