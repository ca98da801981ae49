use thiserror::Error;

use crate::models::ConflictKind;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FleetError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Reconnect attempts exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Sync conflict on item {item_id}: {kind:?}")]
    SyncConflict { item_id: u64, kind: ConflictKind },

    #[error("Storage quota exceeded: {size} bytes over budget of {budget} bytes")]
    StorageQuota { size: usize, budget: usize },

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type FleetResult<T> = std::result::Result<T, FleetError>;

impl FleetError {
    /// Transport failures may go away on a new connection; everything else is
    /// either handled locally or terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FleetError::Transport(_) | FleetError::Storage(_))
    }

    /// Fatal errors end the owning lifecycle and must reach the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FleetError::ReconnectExhausted { .. })
    }

    pub fn error_code(&self) -> u32 {
        match self {
            FleetError::Validation(_) => 2001,
            FleetError::Transport(_) => 2002,
            FleetError::ReconnectExhausted { .. } => 2003,
            FleetError::SyncConflict { .. } => 2004,
            FleetError::StorageQuota { .. } => 2005,
            FleetError::Storage(_) => 2006,
        }
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(err: serde_json::Error) -> Self {
        FleetError::Validation(err.to_string())
    }
}
