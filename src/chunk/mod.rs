pub mod chunker;
pub mod cipher;
pub mod error;
pub mod types;

pub use chunker::{ChunkedFile, Chunker, FileDraft};
pub use cipher::{chunk_nonce, ChunkCipher, FileKey, NONCE_LEN, TAG_LEN};
pub use error::{ChunkError, Result};
pub use types::{Chunk, ChunkId, ContentHash, FileId, FileManifest};
