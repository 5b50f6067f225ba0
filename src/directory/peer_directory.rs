use std::time::Duration;

use async_trait::async_trait;

use super::error::{DirectoryError, DirectoryResult};
use super::types::{ChunkRecord, DirectoryKey, DirectoryValue, Versioned};
use crate::chunk::{ChunkId, FileId, FileManifest};
use crate::network::RetryPolicy;
use crate::peer::{PeerId, PeerNode};

/// Read-modify-write step: receives the current value, returns the new one
/// (`None` deletes).
pub type UpdateFn = Box<dyn FnOnce(Option<DirectoryValue>) -> Option<DirectoryValue> + Send>;

/// Eventually consistent registry of peers, files and chunk hosts.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// `NotFound` when the key is absent, `Unresolved` when replicas did not agree.
    async fn get(&self, key: &DirectoryKey) -> DirectoryResult<Versioned>;

    async fn update(
        &self,
        key: DirectoryKey,
        ttl: Option<Duration>,
        f: UpdateFn,
    ) -> DirectoryResult<Option<DirectoryValue>>;

    async fn put(
        &self,
        key: DirectoryKey,
        value: DirectoryValue,
        ttl: Option<Duration>,
    ) -> DirectoryResult<()> {
        self.update(key, ttl, Box::new(move |_| Some(value))).await?;
        Ok(())
    }

    async fn delete(&self, key: &DirectoryKey) -> DirectoryResult<()> {
        self.update(*key, None, Box::new(|_| None)).await?;
        Ok(())
    }

    /// A peer joined; it may now hold replicas.
    fn add_node(&self, _node: &PeerNode) {}

    fn remove_node(&self, _id: &PeerId) {}
}

/// Typed accessors over the three namespaces.
#[async_trait]
pub trait DirectoryExt: PeerDirectory {
    async fn get_with_retry(
        &self,
        key: &DirectoryKey,
        policy: &RetryPolicy,
    ) -> DirectoryResult<Versioned> {
        let (result, _) = policy
            .run(
                "directory_get",
                |_| async move {
                    match tokio::time::timeout(policy.attempt_timeout, self.get(key)).await {
                        Ok(result) => result,
                        Err(_) => Err(DirectoryError::Unresolved {
                            key: key.to_string(),
                            answered: 0,
                            agreeing: 0,
                            needed: 1,
                        }),
                    }
                },
                DirectoryError::is_retryable,
            )
            .await;
        result
    }

    async fn publish_peer(&self, node: &PeerNode, ttl: Option<Duration>) -> DirectoryResult<()> {
        self.put(DirectoryKey::Peer(node.id), DirectoryValue::Peer(node.clone()), ttl)
            .await
    }

    async fn lookup_peer(&self, id: &PeerId) -> DirectoryResult<PeerNode> {
        let key = DirectoryKey::Peer(*id);
        match self.get(&key).await?.value {
            DirectoryValue::Peer(node) => Ok(node),
            _ => Err(unexpected(&key, "peer")),
        }
    }

    async fn publish_manifest(&self, manifest: &FileManifest) -> DirectoryResult<()> {
        self.put(
            DirectoryKey::File(manifest.file_id),
            DirectoryValue::File(manifest.clone()),
            None,
        )
        .await
    }

    async fn lookup_manifest(
        &self,
        file_id: &FileId,
        policy: &RetryPolicy,
    ) -> DirectoryResult<FileManifest> {
        let key = DirectoryKey::File(*file_id);
        match self.get_with_retry(&key, policy).await?.value {
            DirectoryValue::File(manifest) => Ok(manifest),
            _ => Err(unexpected(&key, "file")),
        }
    }

    async fn lookup_chunk(
        &self,
        chunk_id: &ChunkId,
        policy: &RetryPolicy,
    ) -> DirectoryResult<ChunkRecord> {
        let key = DirectoryKey::Chunk(*chunk_id);
        match self.get_with_retry(&key, policy).await?.value {
            DirectoryValue::Chunk(record) => Ok(record),
            _ => Err(unexpected(&key, "chunk")),
        }
    }

    /// Merge `hosts` into the chunk's record, creating it from `template` if absent.
    async fn add_chunk_hosts(
        &self,
        template: ChunkRecord,
        hosts: Vec<PeerId>,
        policy: &RetryPolicy,
    ) -> DirectoryResult<ChunkRecord> {
        let key = DirectoryKey::Chunk(template.chunk_id);
        let (result, _) = policy
            .run(
                "directory_add_hosts",
                |_| {
                    let template = template.clone();
                    let hosts = hosts.clone();
                    async move {
                        self.update(
                            key,
                            None,
                            Box::new(move |current| {
                                let mut record = match current {
                                    Some(DirectoryValue::Chunk(record)) => record,
                                    _ => template,
                                };
                                record.hosts.extend(hosts);
                                Some(DirectoryValue::Chunk(record))
                            }),
                        )
                        .await
                    }
                },
                DirectoryError::is_retryable,
            )
            .await;

        match result? {
            Some(DirectoryValue::Chunk(record)) => Ok(record),
            _ => Err(unexpected(&key, "chunk")),
        }
    }

    /// Drop hosts from a chunk's record. Returns the record as stored afterwards.
    async fn remove_chunk_hosts(
        &self,
        chunk_id: ChunkId,
        gone: Vec<PeerId>,
        policy: &RetryPolicy,
    ) -> DirectoryResult<Option<ChunkRecord>> {
        let (result, _) = policy
            .run(
                "directory_remove_hosts",
                |_| {
                    let gone = gone.clone();
                    async move {
                        self.update(
                            DirectoryKey::Chunk(chunk_id),
                            None,
                            Box::new(move |current| match current {
                                Some(DirectoryValue::Chunk(mut record)) => {
                                    for peer in &gone {
                                        record.hosts.remove(peer);
                                    }
                                    Some(DirectoryValue::Chunk(record))
                                }
                                other => other,
                            }),
                        )
                        .await
                    }
                },
                DirectoryError::is_retryable,
            )
            .await;

        Ok(match result? {
            Some(DirectoryValue::Chunk(record)) => Some(record),
            _ => None,
        })
    }
}

impl<T: PeerDirectory + ?Sized> DirectoryExt for T {}

fn unexpected(key: &DirectoryKey, expected: &'static str) -> DirectoryError {
    DirectoryError::UnexpectedValue {
        key: key.to_string(),
        expected,
    }
}
