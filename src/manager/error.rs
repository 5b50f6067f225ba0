use thiserror::Error;

use crate::chunk::{ChunkError, FileId};
use crate::config::ConfigError;
use crate::directory::DirectoryError;
use crate::integrity::IntegrityError;
use crate::network::NetworkError;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Chunk {chunk_id} failed integrity verification")]
    ChunkIntegrity { chunk_id: String },

    #[error("Host {peer} unavailable: {reason}")]
    HostUnavailable { peer: String, reason: String },

    #[error("Chunk {chunk_id} has {live} live hosts, target is {target}")]
    UnderReplicated {
        chunk_id: String,
        live: usize,
        target: usize,
    },

    #[error("Directory unresolved: {0}")]
    DirectoryUnresolved(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage exceeded: need {needed} bytes, {available} available")]
    StorageExceeded { needed: u64, available: u64 },

    #[error("Operation cancelled")]
    OperationCancelled,

    /// Terminal retrieval failure: every known host of the chunk failed.
    #[error("Chunk {index} of file {file_id} unavailable: {reason}")]
    ChunkUnavailable {
        file_id: FileId,
        index: u32,
        reason: String,
    },

    #[error("No key available for encrypted file {0}")]
    MissingKey(FileId),

    #[error("Invalid file reference: {0}")]
    InvalidReference(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Chunk error: {0}")]
    Chunk(#[from] ChunkError),

    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("Directory error: {0}")]
    Directory(DirectoryError),

    #[error("Network error: {0}")]
    Network(NetworkError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DirectoryError> for ManagerError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::NotFound(key) => ManagerError::NotFound(key),
            e @ (DirectoryError::Unresolved { .. }
            | DirectoryError::ReplicaUnavailable(_)
            | DirectoryError::NoReplicas) => ManagerError::DirectoryUnresolved(e.to_string()),
            other => ManagerError::Directory(other),
        }
    }
}

impl From<NetworkError> for ManagerError {
    fn from(err: NetworkError) -> Self {
        match err.root() {
            NetworkError::StorageExceeded { needed, available } => ManagerError::StorageExceeded {
                needed: *needed,
                available: *available,
            },
            NetworkError::IntegrityMismatch { chunk_id } => ManagerError::ChunkIntegrity {
                chunk_id: chunk_id.clone(),
            },
            NetworkError::NotFound(what) => ManagerError::NotFound(what.clone()),
            _ => ManagerError::Network(err),
        }
    }
}

impl ManagerError {
    /// Worth retrying later: replicas or hosts may come back.
    pub fn is_transient(&self) -> bool {
        match self {
            ManagerError::DirectoryUnresolved(_)
            | ManagerError::HostUnavailable { .. }
            | ManagerError::ChunkUnavailable { .. } => true,
            ManagerError::Network(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub type ManagerResult<T> = Result<T, ManagerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_errors_are_classified() {
        let unresolved = DirectoryError::Unresolved {
            key: "chunk/x".into(),
            answered: 2,
            agreeing: 1,
            needed: 3,
        };
        assert!(matches!(
            ManagerError::from(unresolved),
            ManagerError::DirectoryUnresolved(_)
        ));
        assert!(matches!(
            ManagerError::from(DirectoryError::NotFound("file/y".into())),
            ManagerError::NotFound(_)
        ));
    }

    #[test]
    fn test_network_errors_unwrap_retries() {
        let err = NetworkError::MaxRetriesExceeded {
            attempts: 1,
            last: Box::new(NetworkError::StorageExceeded {
                needed: 10,
                available: 2,
            }),
        };
        assert!(matches!(
            ManagerError::from(err),
            ManagerError::StorageExceeded {
                needed: 10,
                available: 2
            }
        ));

        let timeout = ManagerError::from(NetworkError::Timeout(std::time::Duration::from_secs(1)));
        assert!(timeout.is_transient());
        assert!(!ManagerError::OperationCancelled.is_transient());
    }
}
