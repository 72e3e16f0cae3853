//! Error handling module

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GateError {
    /// Credentials or grant rejected. Terminal until the credentials change.
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("CAME API error: {0}")]
    Api(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Network failure seen by another caller of a shared operation
    #[error("Network error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl GateError {
    /// Whether the caller must re-enter credentials rather than retry
    pub fn is_auth(&self) -> bool {
        matches!(self, GateError::Auth(_))
    }

    /// Whether the next scheduled cycle may succeed without intervention
    pub fn is_transient(&self) -> bool {
        matches!(self, GateError::Network(_) | GateError::Transport(_))
    }

    /// Owned copy for callers that awaited the same failed operation
    pub fn replay(&self) -> GateError {
        match self {
            GateError::Auth(msg) => GateError::Auth(msg.clone()),
            GateError::Api(msg) => GateError::Api(msg.clone()),
            GateError::Network(e) => GateError::Transport(e.to_string()),
            GateError::Transport(msg) => GateError::Transport(msg.clone()),
            GateError::Config(msg) => GateError::Config(msg.clone()),
        }
    }
}

pub type GateResult<T> = Result<T, GateError>;
