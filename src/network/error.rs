use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Peer {peer} unreachable: {reason}")]
    Unreachable { peer: String, reason: String },

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("No relay available: {0}")]
    RelayUnavailable(String),

    #[error("Integrity mismatch reported for chunk {chunk_id}")]
    IntegrityMismatch { chunk_id: String },

    #[error("Chunk {chunk_id} already held with different content")]
    ChunkConflict { chunk_id: String },

    #[error("Storage exceeded: chunk needs {needed} bytes, {available} available")]
    StorageExceeded { needed: u64, available: u64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("Max retries exceeded ({attempts} attempts): {last}")]
    MaxRetriesExceeded {
        attempts: u32,
        last: Box<NetworkError>,
    },

    #[error("Unsupported address: {0}")]
    UnsupportedAddress(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("QUIC error: {0}")]
    QuicError(String),

    #[error("Certificate error: {0}")]
    CertificateError(String),
}

impl NetworkError {
    /// Errors worth another attempt against the same peer.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NetworkError::Unreachable { .. }
                | NetworkError::Timeout(_)
                | NetworkError::RelayUnavailable(_)
                | NetworkError::IoError(_)
                | NetworkError::QuicError(_)
        )
    }

    /// The innermost error once retries are unwrapped.
    pub fn root(&self) -> &NetworkError {
        match self {
            NetworkError::MaxRetriesExceeded { last, .. } => last.root(),
            other => other,
        }
    }
}

impl From<quinn::ConnectionError> for NetworkError {
    fn from(err: quinn::ConnectionError) -> Self {
        NetworkError::QuicError(err.to_string())
    }
}

impl From<quinn::ConnectError> for NetworkError {
    fn from(err: quinn::ConnectError) -> Self {
        NetworkError::QuicError(err.to_string())
    }
}

impl From<quinn::WriteError> for NetworkError {
    fn from(err: quinn::WriteError) -> Self {
        NetworkError::QuicError(err.to_string())
    }
}

impl From<quinn::ReadExactError> for NetworkError {
    fn from(err: quinn::ReadExactError) -> Self {
        NetworkError::QuicError(err.to_string())
    }
}

impl From<quinn::ClosedStream> for NetworkError {
    fn from(err: quinn::ClosedStream) -> Self {
        NetworkError::QuicError(err.to_string())
    }
}

impl From<bincode::Error> for NetworkError {
    fn from(err: bincode::Error) -> Self {
        NetworkError::SerializationError(err.to_string())
    }
}

pub type NetworkResult<T> = Result<T, NetworkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(NetworkError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(NetworkError::RelayUnavailable("none".into()).is_transient());
        assert!(!NetworkError::IntegrityMismatch { chunk_id: "c".into() }.is_transient());
        assert!(!NetworkError::StorageExceeded { needed: 2, available: 1 }.is_transient());
        assert!(!NetworkError::ChunkConflict { chunk_id: "c".into() }.is_transient());
    }

    #[test]
    fn test_root_unwraps_retries() {
        let err = NetworkError::MaxRetriesExceeded {
            attempts: 3,
            last: Box::new(NetworkError::Timeout(Duration::from_millis(5))),
        };
        assert!(matches!(err.root(), NetworkError::Timeout(_)));
    }
}
