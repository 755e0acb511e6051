// src/error.rs
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MixingError {
    // Broadcast policy errors
    #[error("transaction sends funds to an address reserved for mixing")]
    SpendToReservedAddress,

    #[error("possible double spend: {0}")]
    PossibleDoubleSpend(String),

    // Coin selection errors
    #[error("check for minimum {required} mixing rounds failed")]
    MinRoundsNotMet { required: u32 },

    // Workflow errors
    #[error("invalid workflow argument: {0}")]
    InvalidWorkflowArgument(&'static str),

    #[error("workflow reservation conflict: {0}")]
    ReservationConflict(String),

    // Lifecycle errors
    #[error("operation refused in current state: {0}")]
    WrongState(String),

    #[error("mixing is not supported on this wallet")]
    Unsupported,

    // Collaborator errors
    #[error("store error: {0}")]
    Store(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("broadcast failed: {0}")]
    Broadcast(String),

    // Data errors
    #[error("parse error: {0}")]
    Parse(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl MixingError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MixingError::PossibleDoubleSpend(_)
                | MixingError::Network(_)
                | MixingError::Broadcast(_)
        )
    }

    /// Check if error is critical (should stop all operations)
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            MixingError::InvalidWorkflowArgument(_) | MixingError::Unsupported
        )
    }

    /// Get error category for logging/metrics
    pub fn category(&self) -> &'static str {
        match self {
            MixingError::SpendToReservedAddress | MixingError::PossibleDoubleSpend(_) => {
                "broadcast_policy"
            }

            MixingError::MinRoundsNotMet { .. } => "coin_selection",

            MixingError::InvalidWorkflowArgument(_) | MixingError::ReservationConflict(_) => {
                "workflow"
            }

            MixingError::WrongState(_) | MixingError::Unsupported => "lifecycle",

            MixingError::Store(_) => "store",

            MixingError::Network(_) | MixingError::Broadcast(_) => "network",

            MixingError::Parse(_) | MixingError::Serialization(_) => "data",
        }
    }
}

// Result type alias for convenience
pub type MixingResult<T> = Result<T, MixingError>;
