use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(String),

    #[error("File too large: {chunks} chunks exceeds the u32 index space")]
    TooManyChunks { chunks: u64 },

    #[error("Encryption failed for chunk {index}")]
    Encryption { index: u32 },

    #[error("Decryption failed for chunk {index}: data corrupted or wrong key")]
    Decryption { index: u32 },

    #[error("Source length changed while reading: expected {expected} bytes")]
    SourceChanged { expected: u64 },

    #[error("Chunk worker failed: {0}")]
    Worker(String),

    #[error("Invalid file identifier: {0}")]
    InvalidFileId(String),
}

pub type Result<T> = std::result::Result<T, ChunkError>;
