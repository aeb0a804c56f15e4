use thiserror::Error;

use crate::orchestration::interrupt::InterruptLevel;

#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    /// The conditional claim update touched no row: another worker won.
    #[error("Job {0} was already claimed")]
    AlreadyClaimed(i64),

    /// A state transition that indicates a double-execution bug.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Interrupted ({0})")]
    Interrupted(InterruptLevel),

    #[error("Processor failed: {0}")]
    ExternalFailure(String),

    #[error("Dataset {0} already exists")]
    DuplicateDataset(String),

    #[error("Module registry error: {0}")]
    Registry(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestrationError {
    pub fn external(message: impl Into<String>) -> Self {
        Self::ExternalFailure(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_already_claimed(&self) -> bool {
        matches!(self, Self::AlreadyClaimed(_))
    }

    pub fn interrupt_level(&self) -> Option<InterruptLevel> {
        match self {
            Self::Interrupted(level) => Some(*level),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestrationError>;
