//! Storage error definitions

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for sqlsession_core::Error {
    fn from(err: StorageError) -> Self {
        // Anything the storage layer cannot read back is a corrupt payload
        sqlsession_core::Error::InvalidSessionState(err.to_string())
    }
}
