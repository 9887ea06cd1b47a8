use thiserror::Error;
use uuid::Uuid;

pub type NurtureResult<T> = Result<T, NurtureError>;

#[derive(Error, Debug)]
pub enum NurtureError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lead {lead_id} is already assigned to sequence {sequence_id}")]
    AlreadyAssigned { sequence_id: Uuid, lead_id: String },

    #[error("Sequence {0} not found")]
    SequenceNotFound(Uuid),

    #[error("Lead {0} not found")]
    LeadNotFound(String),

    #[error("Invalid sequence: {0}")]
    InvalidSequence(String),

    #[error("Invalid condition: {0}")]
    InvalidCondition(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Assignment {0} is leased by another worker")]
    LeaseBusy(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl NurtureError {
    /// Errors worth retrying with backoff. Everything else is fatal for the
    /// assignment that hit it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NurtureError::StoreUnavailable(_) | NurtureError::LeaseBusy(_)
        )
    }
}
