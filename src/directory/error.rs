use thiserror::Error;

use crate::network::NetworkError;

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Key not found: {0}")]
    NotFound(String),

    /// Too few replicas answered, or those that did disagreed. Retryable.
    #[error("Unresolved lookup for {key}: {agreeing} agreeing of {answered} answers, {needed} needed")]
    Unresolved {
        key: String,
        answered: usize,
        agreeing: usize,
        needed: usize,
    },

    #[error("Replica {0} unavailable")]
    ReplicaUnavailable(String),

    #[error("No directory replicas known")]
    NoReplicas,

    #[error("Unexpected value under {key}: expected {expected}")]
    UnexpectedValue { key: String, expected: &'static str },

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
}

impl DirectoryError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DirectoryError::Unresolved { .. }
                | DirectoryError::ReplicaUnavailable(_)
                | DirectoryError::Network(_)
        )
    }
}

pub type DirectoryResult<T> = Result<T, DirectoryError>;
