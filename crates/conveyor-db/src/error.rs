//! Store error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("comparison with existing config failed during save")]
    ConfigComparisonFailed,

    #[error("store error: {0}")]
    Internal(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for conveyor_core::Error {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::ConfigComparisonFailed => conveyor_core::Error::ConfigComparisonFailed,
            StoreError::NotFound(what) => conveyor_core::Error::NotFound(what),
            other => conveyor_core::Error::Store(other.to_string()),
        }
    }
}
