use std::path::Path;

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info};

use super::cipher::{chunk_nonce, ChunkCipher, FileKey};
use super::error::{ChunkError, Result};
use super::types::{Chunk, ChunkId, ContentHash, FileId, FileManifest};
use crate::integrity::IntegrityVerifier;

/// A file split into sealed chunks, ready to distribute.
#[derive(Debug, Clone)]
pub struct ChunkedFile {
    pub manifest: FileManifest,
    /// `None` when encryption is disabled.
    pub key: Option<FileKey>,
    pub chunks: Vec<Chunk>,
}

/// A file of known length about to be sealed chunk by chunk. The manifest
/// is only complete once every chunk hash is known.
#[derive(Debug, Clone)]
pub struct FileDraft {
    pub file_id: FileId,
    pub name: String,
    pub total_size: u64,
    pub total_chunks: u32,
    /// `None` when encryption is disabled.
    pub key: Option<FileKey>,
}

/// Splits files into fixed-size chunks, encrypting and hashing each one.
#[derive(Debug, Clone)]
pub struct Chunker {
    chunk_size: u64,
    encryption: bool,
    parallelism: usize,
}

impl Chunker {
    pub fn new(chunk_size: u64, encryption: bool) -> Result<Self> {
        if chunk_size == 0 {
            return Err(ChunkError::InvalidChunkSize(
                "chunk size must be greater than zero".to_string(),
            ));
        }
        if chunk_size > usize::MAX as u64 {
            return Err(ChunkError::InvalidChunkSize(format!(
                "chunk size {chunk_size} does not fit in memory on this platform"
            )));
        }

        Ok(Self {
            chunk_size,
            encryption,
            parallelism: num_cpus::get().max(1),
        })
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn encryption_enabled(&self) -> bool {
        self.encryption
    }

    /// Number of chunks a file of `size` bytes produces. A zero-byte file still yields one.
    pub fn chunk_count(&self, size: u64) -> u64 {
        size.div_ceil(self.chunk_size).max(1)
    }

    pub fn draft(&self, name: &str, total_size: u64) -> Result<FileDraft> {
        let count = self.chunk_count(total_size);
        if count > u32::MAX as u64 {
            return Err(ChunkError::TooManyChunks { chunks: count });
        }

        Ok(FileDraft {
            file_id: FileId::new(),
            name: name.to_string(),
            total_size,
            total_chunks: count as u32,
            key: self.encryption.then(FileKey::generate),
        })
    }

    /// Read `reader` one chunk at a time and seal each piece as it arrives.
    /// At most `parallelism` pieces are in flight, so memory stays bounded
    /// by the chunk size rather than the file size. The reader must yield
    /// exactly `draft.total_size` bytes.
    pub fn seal_stream<'a, R>(
        &self,
        draft: &FileDraft,
        reader: R,
    ) -> impl Stream<Item = Result<Chunk>> + Send + 'a
    where
        R: AsyncRead + Unpin + Send + 'a,
    {
        let chunk_size = self.chunk_size;
        let total_size = draft.total_size;
        let total_chunks = draft.total_chunks;
        let file_id = draft.file_id;
        let cipher = ChunkCipher::new(draft.key.as_ref());

        let pieces = stream::try_unfold((reader, 0u32), move |(mut reader, index)| async move {
            if index == total_chunks {
                let mut extra = [0u8; 1];
                if reader.read(&mut extra).await? > 0 {
                    return Err(ChunkError::SourceChanged { expected: total_size });
                }
                return Ok(None);
            }

            let want = total_size
                .saturating_sub(index as u64 * chunk_size)
                .min(chunk_size);
            let mut buf = Vec::with_capacity(want as usize);
            let n = (&mut reader).take(want).read_to_end(&mut buf).await?;
            if (n as u64) < want {
                return Err(ChunkError::SourceChanged { expected: total_size });
            }
            Ok(Some(((index, Bytes::from(buf)), (reader, index + 1))))
        });

        pieces
            .map_ok(move |(index, plaintext)| {
                let cipher = cipher.clone();
                async move {
                    tokio::task::spawn_blocking(move || {
                        seal_chunk(&cipher, file_id, index, total_chunks, &plaintext)
                    })
                    .await
                    .map_err(|e| ChunkError::Worker(e.to_string()))?
                }
            })
            .try_buffered(self.parallelism)
    }

    /// Manifest for `draft` once every chunk hash is known, in index order.
    pub fn manifest(&self, draft: &FileDraft, chunk_hashes: Vec<ContentHash>) -> FileManifest {
        FileManifest {
            file_id: draft.file_id,
            name: draft.name.clone(),
            total_size: draft.total_size,
            chunk_size: self.chunk_size,
            chunk_ids: (0..chunk_hashes.len() as u32)
                .map(|index| ChunkId::new(draft.file_id, index))
                .collect(),
            chunk_hashes,
            encrypted: draft.key.is_some(),
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    pub async fn split_bytes(&self, data: Bytes, name: &str) -> Result<ChunkedFile> {
        let total_size = data.len() as u64;
        let count = self.chunk_count(total_size);
        if count > u32::MAX as u64 {
            return Err(ChunkError::TooManyChunks { chunks: count });
        }

        let step = self.chunk_size as usize;
        let pieces = if data.is_empty() {
            vec![Bytes::new()]
        } else {
            (0..data.len())
                .step_by(step)
                .map(|start| data.slice(start..(start + step).min(data.len())))
                .collect()
        };

        self.seal(name, total_size, pieces).await
    }

    /// Reads `reader` to the end and splits it, holding every chunk in
    /// memory. For sources of known length prefer [`seal_stream`](Self::seal_stream).
    /// Any read error aborts the whole split.
    pub async fn split_reader<R>(&self, mut reader: R, name: &str) -> Result<ChunkedFile>
    where
        R: AsyncRead + Unpin,
    {
        let mut pieces = Vec::new();
        let mut total_size = 0u64;

        loop {
            let mut buf = Vec::new();
            let n = (&mut reader)
                .take(self.chunk_size)
                .read_to_end(&mut buf)
                .await?;
            if n == 0 {
                break;
            }
            total_size += n as u64;
            pieces.push(Bytes::from(buf));
            if pieces.len() as u64 > u32::MAX as u64 {
                return Err(ChunkError::TooManyChunks {
                    chunks: pieces.len() as u64,
                });
            }
        }

        if pieces.is_empty() {
            pieces.push(Bytes::new());
        }

        self.seal(name, total_size, pieces).await
    }

    /// Open `path` and draft it from its current length.
    pub async fn open_file(&self, path: &Path) -> Result<(FileDraft, tokio::io::BufReader<tokio::fs::File>)> {
        let file = tokio::fs::File::open(path).await?;
        let total_size = file.metadata().await?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());

        let draft = self.draft(&name, total_size)?;
        Ok((draft, tokio::io::BufReader::new(file)))
    }

    pub async fn split_file(&self, path: &Path) -> Result<ChunkedFile> {
        let (draft, reader) = self.open_file(path).await?;
        let chunks: Vec<Chunk> = self.seal_stream(&draft, reader).try_collect().await?;
        let manifest = self.manifest(&draft, chunks.iter().map(|c| c.hash).collect());

        info!(
            file_id = %manifest.file_id,
            name = %manifest.name,
            total_size = manifest.total_size,
            chunks = manifest.total_chunks(),
            "File chunked"
        );
        Ok(ChunkedFile {
            manifest,
            key: draft.key,
            chunks,
        })
    }

    async fn seal(&self, name: &str, total_size: u64, pieces: Vec<Bytes>) -> Result<ChunkedFile> {
        let file_id = FileId::new();
        let key = self.encryption.then(FileKey::generate);
        let cipher = ChunkCipher::new(key.as_ref());
        let total_chunks = pieces.len() as u32;

        let chunks: Vec<Chunk> = stream::iter(pieces.into_iter().enumerate())
            .map(|(index, plaintext)| {
                let cipher = cipher.clone();
                async move {
                    tokio::task::spawn_blocking(move || {
                        seal_chunk(&cipher, file_id, index as u32, total_chunks, &plaintext)
                    })
                    .await
                    .map_err(|e| ChunkError::Worker(e.to_string()))?
                }
            })
            .buffered(self.parallelism)
            .try_collect()
            .await?;

        let manifest = FileManifest {
            file_id,
            name: name.to_string(),
            total_size,
            chunk_size: self.chunk_size,
            chunk_ids: chunks.iter().map(|c| c.id).collect(),
            chunk_hashes: chunks.iter().map(|c| c.hash).collect(),
            encrypted: self.encryption,
            created_at: chrono::Utc::now().timestamp(),
        };

        info!(
            file_id = %file_id,
            name,
            total_size,
            chunks = total_chunks,
            encrypted = self.encryption,
            "File chunked"
        );

        Ok(ChunkedFile {
            manifest,
            key,
            chunks,
        })
    }
}

fn seal_chunk(
    cipher: &ChunkCipher,
    file_id: FileId,
    index: u32,
    total_chunks: u32,
    plaintext: &[u8],
) -> Result<Chunk> {
    let ciphertext = cipher.encrypt(index, plaintext)?;
    let hash = IntegrityVerifier::calculate_checksum(&ciphertext);
    debug!(file_id = %file_id, index, size = plaintext.len(), "Chunk sealed");

    Ok(Chunk {
        id: ChunkId::new(file_id, index),
        total_chunks,
        plaintext_size: plaintext.len() as u64,
        nonce: chunk_nonce(index),
        hash,
        ciphertext: Bytes::from(ciphertext),
    })
}
