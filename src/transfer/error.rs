use thiserror::Error;

use crate::object_store::ObjectStoreError;

/// Why a submission was turned away before any job was created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("An upload is already in progress for this user")]
    AlreadyActive,
    #[error("File size {size} exceeds the {max} byte limit")]
    TooLarge { size: u64, max: u64 },
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Download failed: {0}")]
    Source(String),
    #[error("Storage error: {0}")]
    Store(ObjectStoreError),
    #[error("Received {received} bytes, expected {expected}")]
    SizeMismatch { expected: u64, received: u64 },
    #[error("File exceeds the {max} byte limit")]
    TooLarge { max: u64 },
    #[error("Transfer cancelled")]
    Cancelled,
}

impl TransferError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }
}

impl From<ObjectStoreError> for TransferError {
    fn from(e: ObjectStoreError) -> Self {
        match e {
            ObjectStoreError::Cancelled => TransferError::Cancelled,
            other => TransferError::Store(other),
        }
    }
}
