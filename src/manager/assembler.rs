use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::chunk::{ChunkCipher, ChunkError, ChunkId, FileKey, FileManifest};
use crate::directory::{ChunkRecord, DirectoryError, DirectoryExt, PeerDirectory};
use crate::integrity::{IntegrityError, IntegrityVerifier};
use crate::manager::error::{ManagerError, ManagerResult};
use crate::manager::types::CancelToken;
use crate::metrics;
use crate::network::{RetryPolicy, Transport};
use crate::peer::{GeoLocation, PeerId, PeerNode, PeerTable};
use crate::selection::HostSelector;

/// Copies found bad during one retrieval; never asked for again.
type Blacklist = Mutex<HashSet<(ChunkId, PeerId)>>;

/// Fetches every chunk of a file from its hosts, verifies and decrypts
/// them, and writes the plaintext out in index order.
pub struct RetrievalAssembler {
    transport: Arc<dyn Transport>,
    directory: Arc<dyn PeerDirectory>,
    peers: Arc<PeerTable>,
    selector: HostSelector,
    retry: RetryPolicy,
    slots: Arc<Semaphore>,
    parallelism: usize,
    origin: Option<GeoLocation>,
}

impl RetrievalAssembler {
    pub fn new(
        transport: Arc<dyn Transport>,
        directory: Arc<dyn PeerDirectory>,
        peers: Arc<PeerTable>,
        selector: HostSelector,
        retry: RetryPolicy,
        slots: Arc<Semaphore>,
        parallelism: usize,
    ) -> Self {
        Self {
            transport,
            directory,
            peers,
            selector,
            retry,
            slots,
            parallelism: parallelism.max(1),
            origin: None,
        }
    }

    /// Prefer hosts near `origin` when ranking.
    pub fn with_origin(mut self, origin: Option<GeoLocation>) -> Self {
        self.origin = origin;
        self
    }

    /// Rebuild the file in memory. Fails fast: the first chunk with no good
    /// copy on any host aborts the whole retrieval.
    pub async fn assemble(
        &self,
        manifest: &FileManifest,
        key: Option<&FileKey>,
        cancel: &CancelToken,
    ) -> ManagerResult<Bytes> {
        let mut data = Vec::with_capacity(manifest.total_size.min(usize::MAX as u64) as usize);
        self.assemble_to(manifest, key, cancel, &mut data).await?;
        Ok(Bytes::from(data))
    }

    /// Rebuild the file into `sink`, chunk by chunk in index order. Only the
    /// fetch window of `parallelism` chunks is held in memory. On error the
    /// sink may already hold a prefix of the file.
    pub async fn assemble_to<W>(
        &self,
        manifest: &FileManifest,
        key: Option<&FileKey>,
        cancel: &CancelToken,
        sink: &mut W,
    ) -> ManagerResult<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        IntegrityVerifier::verify_manifest(manifest)?;

        let cipher = match (manifest.encrypted, key) {
            (true, None) => return Err(ManagerError::MissingKey(manifest.file_id)),
            (true, Some(key)) => ChunkCipher::new(Some(key)),
            (false, _) => ChunkCipher::new(None),
        };
        let cipher = Arc::new(cipher);
        let blacklist: Blacklist = Mutex::new(HashSet::new());

        let mut parts = std::pin::pin!(stream::iter(0..manifest.total_chunks())
            .map(|index| self.fetch_chunk(manifest, index, &cipher, &blacklist, cancel))
            .buffered(self.parallelism));

        let mut written = 0u64;
        while let Some(part) = parts.try_next().await? {
            sink.write_all(&part).await?;
            written += part.len() as u64;
        }
        sink.flush().await?;

        if written != manifest.total_size {
            return Err(IntegrityError::InconsistentManifest {
                file_id: manifest.file_id.to_string(),
                reason: format!(
                    "reassembled {} bytes, manifest says {}",
                    written, manifest.total_size
                ),
            }
            .into());
        }

        info!(
            file_id = %manifest.file_id,
            size = manifest.total_size,
            chunks = manifest.total_chunks(),
            "File reassembled"
        );
        Ok(written)
    }

    async fn fetch_chunk(
        &self,
        manifest: &FileManifest,
        index: u32,
        cipher: &Arc<ChunkCipher>,
        blacklist: &Blacklist,
        cancel: &CancelToken,
    ) -> ManagerResult<Bytes> {
        if cancel.is_cancelled() {
            return Err(ManagerError::OperationCancelled);
        }

        let chunk_id = manifest.chunk_ids[index as usize];
        let expected = manifest.chunk_hashes[index as usize];
        let unavailable = |reason: String| ManagerError::ChunkUnavailable {
            file_id: manifest.file_id,
            index,
            reason,
        };

        let record = match self.directory.lookup_chunk(&chunk_id, &self.retry).await {
            Ok(record) => record,
            Err(DirectoryError::NotFound(_)) => {
                return Err(unavailable("no hosts registered".to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let mut last_error = "no live hosts".to_string();
        for host in self.candidates(&record).await {
            if blacklist.lock().contains(&(chunk_id, host.id)) {
                continue;
            }

            let started = Instant::now();
            let fetched = tokio::select! {
                _ = cancel.cancelled() => return Err(ManagerError::OperationCancelled),
                fetched = async {
                    let _permit = self.slots.acquire().await;
                    self.transport.fetch(&chunk_id, &host).await
                } => fetched,
            };

            let transfer = match fetched {
                Ok(transfer) => transfer,
                Err(e) => {
                    warn!(chunk = %chunk_id, host = %host.id, error = %e, "Fetch failed, trying next host");
                    self.peers.record_outcome(&host.id, false, None);
                    metrics::record_host_failure("fetch");
                    last_error = e.to_string();
                    continue;
                }
            };

            if let Err(e) = IntegrityVerifier::verify_payload(chunk_id, &expected, &transfer.ciphertext) {
                warn!(chunk = %chunk_id, host = %host.id, "Corrupt copy, trying next host");
                self.reject_copy(blacklist, chunk_id, &host, "hash");
                last_error = e.to_string();
                continue;
            }

            let plaintext = match Self::open(cipher, index, transfer.ciphertext.clone()).await {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    warn!(chunk = %chunk_id, host = %host.id, error = %e, "Undecryptable copy, trying next host");
                    self.reject_copy(blacklist, chunk_id, &host, "decrypt");
                    last_error = e.to_string();
                    continue;
                }
            };

            let expected_size = manifest.expected_plaintext_size(index);
            if plaintext.len() as u64 != expected_size {
                self.reject_copy(blacklist, chunk_id, &host, "size");
                last_error = format!(
                    "chunk decrypted to {} bytes, expected {}",
                    plaintext.len(),
                    expected_size
                );
                continue;
            }

            let elapsed = started.elapsed();
            self.peers.record_outcome(&host.id, true, Some(elapsed));
            metrics::record_chunk_fetched(transfer.size());
            metrics::record_chunk_duration(elapsed);
            debug!(chunk = %chunk_id, host = %host.id, bytes = plaintext.len(), "Chunk fetched");
            return Ok(plaintext);
        }

        Err(unavailable(last_error))
    }

    fn reject_copy(&self, blacklist: &Blacklist, chunk_id: ChunkId, host: &PeerNode, stage: &'static str) {
        blacklist.lock().insert((chunk_id, host.id));
        self.peers.record_outcome(&host.id, false, None);
        metrics::record_integrity_failure(stage);
    }

    async fn open(cipher: &Arc<ChunkCipher>, index: u32, ciphertext: Bytes) -> ManagerResult<Bytes> {
        let cipher = cipher.clone();
        let plaintext = tokio::task::spawn_blocking(move || cipher.decrypt(index, &ciphertext))
            .await
            .map_err(|e| ChunkError::Worker(e.to_string()))??;
        Ok(Bytes::from(plaintext))
    }

    /// Hosts of `record` we can address, best first.
    async fn candidates(&self, record: &ChunkRecord) -> Vec<PeerNode> {
        let mut nodes = Vec::with_capacity(record.hosts.len());
        for id in &record.hosts {
            match self.peers.get(id) {
                Some(node) => nodes.push(node),
                None => match self.directory.lookup_peer(id).await {
                    Ok(node) => nodes.push(node),
                    Err(e) => debug!(host = %id, error = %e, "Host not resolvable"),
                },
            }
        }
        self.selector.rank(&nodes, self.origin.as_ref())
    }
}
