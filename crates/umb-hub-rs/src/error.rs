use std::time::Duration;
use thiserror::Error;
use umb_core::CommandOutcome;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("No Unity plugins are currently connected")]
    NoSessions,
    #[error("Unity instance '{0}' is not connected to the hub")]
    UnknownInstance(String),
    #[error("Plugin session {0} not connected")]
    SessionNotFound(String),
    #[error("Duplicate command id generated: {0}")]
    DuplicateCommandId(String),
    #[error("failed to queue command for session {0}")]
    SendFailed(String),
    #[error("command '{name}' timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },
    #[error("session {0} disconnected before the command completed")]
    SessionDisconnected(String),
    #[error("cannot wait synchronously for the hub from inside an async runtime")]
    SameRuntime,
    #[error("hub runtime stopped before the call completed")]
    RuntimeGone,
    #[error("could not encode hub message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl HubError {
    pub fn outcome(&self) -> CommandOutcome {
        match self {
            HubError::Timeout { .. } | HubError::SessionDisconnected(_) | HubError::RuntimeGone => {
                CommandOutcome::Uncertain
            }
            HubError::NoSessions
            | HubError::UnknownInstance(_)
            | HubError::SessionNotFound(_)
            | HubError::DuplicateCommandId(_)
            | HubError::SendFailed(_)
            | HubError::SameRuntime
            | HubError::Encode(_) => CommandOutcome::NotExecuted,
        }
    }
}
