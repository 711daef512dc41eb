use cadence_types::{ConversationState, ErrorKind};
use cadence_voice::{ConfigurationError, DecodeError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: ConversationState,
    },

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidState { .. } => ErrorKind::InvalidState,
            Self::Configuration(e) => e.kind(),
            Self::Decode(e) => e.kind(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session already exists: {0}")]
    DuplicateSession(String),

    #[error("session capacity exhausted ({0} live sessions)")]
    CapacityExhausted(usize),
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DuplicateSession(_) => ErrorKind::DuplicateSession,
            Self::CapacityExhausted(_) => ErrorKind::Capacity,
        }
    }
}
