use thiserror::Error;

#[derive(Error, Debug)]
pub enum IntegrityError {
    #[error("Checksum mismatch for {subject}: expected {}, got {}", hex::encode(expected), hex::encode(actual))]
    ChecksumMismatch {
        subject: String,
        expected: [u8; 32],
        actual: [u8; 32],
    },

    #[error("Manifest {file_id} is inconsistent: {reason}")]
    InconsistentManifest { file_id: String, reason: String },
}

pub type IntegrityResult<T> = Result<T, IntegrityError>;
