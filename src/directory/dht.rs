//! Replicated directory front-end
//!
//! Each key lives on the `replication_factor` replicas closest to it by XOR
//! distance. Reads are accepted once a majority of the queried replicas agree.
//! Writes are versioned read-modify-write operations acknowledged by a
//! majority.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, warn};

use super::error::{DirectoryError, DirectoryResult};
use super::peer_directory::{PeerDirectory, UpdateFn};
use super::replica::{DirectoryReplica, MemoryReplica, ReplicaFactory};
use super::types::{DirectoryKey, DirectoryMessage, DirectoryReply, DirectoryValue, Versioned};
use crate::peer::{PeerId, PeerNode};

/// What a quorum of replicas said about a key.
#[derive(Debug, Clone)]
enum ReadOutcome {
    Found(Versioned),
    Missing { version: u64 },
}

impl ReadOutcome {
    fn version(&self) -> u64 {
        match self {
            ReadOutcome::Found(v) => v.version,
            ReadOutcome::Missing { version } => *version,
        }
    }
}

type Agreement = (u64, Option<[u8; 32]>);

fn agreement_of(reply: &DirectoryReply) -> Option<(Agreement, ReadOutcome)> {
    match reply {
        DirectoryReply::Found(v) => Some(((v.version, Some(v.digest())), ReadOutcome::Found(v.clone()))),
        DirectoryReply::Missing { version } => {
            Some(((*version, None), ReadOutcome::Missing { version: *version }))
        }
        _ => None,
    }
}

pub struct ReplicatedDirectory {
    local: Arc<MemoryReplica>,
    replicas: DashMap<PeerId, Arc<dyn DirectoryReplica>>,
    factory: Option<Arc<dyn ReplicaFactory>>,
    replication_factor: usize,
    round_trip_timeout: Duration,
    key_locks: DashMap<DirectoryKey, Arc<tokio::sync::Mutex<()>>>,
}

impl ReplicatedDirectory {
    pub fn new(local: Arc<MemoryReplica>, replication_factor: usize, round_trip_timeout: Duration) -> Self {
        let replicas: DashMap<PeerId, Arc<dyn DirectoryReplica>> = DashMap::new();
        replicas.insert(local.node_id(), local.clone());
        Self {
            local,
            replicas,
            factory: None,
            replication_factor: replication_factor.max(1),
            round_trip_timeout,
            key_locks: DashMap::new(),
        }
    }

    /// Used by `add_node` to reach replicas on joining peers.
    pub fn with_factory(mut self, factory: Arc<dyn ReplicaFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn local(&self) -> &Arc<MemoryReplica> {
        &self.local
    }

    pub fn add_replica(&self, replica: Arc<dyn DirectoryReplica>) {
        let id = replica.node_id();
        if self.replicas.insert(id, replica).is_none() {
            debug!(replica = %id, "Directory replica added");
        }
    }

    pub fn remove_replica(&self, id: &PeerId) {
        if *id != self.local.node_id() && self.replicas.remove(id).is_some() {
            debug!(replica = %id, "Directory replica removed");
        }
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// The replicas responsible for `key`, closest first.
    fn responsible(&self, key: &DirectoryKey) -> Vec<Arc<dyn DirectoryReplica>> {
        let target = key.routing_id();
        let mut replicas: Vec<Arc<dyn DirectoryReplica>> =
            self.replicas.iter().map(|r| r.value().clone()).collect();
        replicas.sort_by_key(|r| r.node_id().distance(&target));
        replicas.truncate(self.replication_factor);
        replicas
    }

    fn quorum(queried: usize) -> usize {
        queried / 2 + 1
    }

    fn key_lock(&self, key: DirectoryKey) -> Arc<tokio::sync::Mutex<()>> {
        self.key_locks
            .entry(key)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn release_key_lock(&self, key: &DirectoryKey) {
        self.key_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn ask(
        replica: Arc<dyn DirectoryReplica>,
        message: DirectoryMessage,
        timeout: Duration,
    ) -> (PeerId, DirectoryResult<DirectoryReply>) {
        let id = replica.node_id();
        let result = match tokio::time::timeout(timeout, replica.handle(message)).await {
            Ok(result) => result,
            Err(_) => Err(DirectoryError::ReplicaUnavailable(format!("{id} timed out"))),
        };
        (id, result)
    }

    /// Quorum read. Returns as soon as a majority agrees; stragglers that
    /// already answered with older data are repaired in the background.
    async fn read(&self, key: &DirectoryKey) -> DirectoryResult<ReadOutcome> {
        let replicas = self.responsible(key);
        if replicas.is_empty() {
            return Err(DirectoryError::NoReplicas);
        }
        let needed = Self::quorum(replicas.len());

        let mut pending: FuturesUnordered<_> = replicas
            .iter()
            .cloned()
            .map(|r| Self::ask(r, DirectoryMessage::get(*key), self.round_trip_timeout))
            .collect();

        let mut tally: HashMap<Agreement, (usize, ReadOutcome)> = HashMap::new();
        let mut answers: Vec<(PeerId, u64)> = Vec::new();

        while let Some((id, result)) = pending.next().await {
            let reply = match result {
                Ok(reply) => reply,
                Err(e) => {
                    debug!(key = %key, replica = %id, error = %e, "Replica did not answer");
                    continue;
                }
            };
            let Some((agreement, outcome)) = agreement_of(&reply) else {
                continue;
            };
            answers.push((id, agreement.0));

            let entry = tally.entry(agreement).or_insert((0, outcome));
            entry.0 += 1;
            if entry.0 >= needed {
                let decided = entry.1.clone();
                self.repair_stale(key, &decided, &answers, &replicas);
                return Ok(decided);
            }
        }

        let agreeing = tally.values().map(|(count, _)| *count).max().unwrap_or(0);
        if answers.len() >= needed {
            // Enough answers but no majority: push the newest value and let the caller retry.
            if let Some(newest) = tally
                .into_iter()
                .max_by_key(|(agreement, _)| *agreement)
                .map(|(_, (_, outcome))| outcome)
            {
                warn!(key = %key, version = newest.version(), "Directory replicas diverged");
                self.repair_stale(key, &newest, &answers, &replicas);
            }
        }

        Err(DirectoryError::Unresolved {
            key: key.to_string(),
            answered: answers.len(),
            agreeing,
            needed,
        })
    }

    fn repair_stale(
        &self,
        key: &DirectoryKey,
        decided: &ReadOutcome,
        answers: &[(PeerId, u64)],
        replicas: &[Arc<dyn DirectoryReplica>],
    ) {
        let version = decided.version();
        let stale: Vec<Arc<dyn DirectoryReplica>> = replicas
            .iter()
            .filter(|r| {
                answers
                    .iter()
                    .any(|(id, seen)| *id == r.node_id() && *seen < version)
            })
            .cloned()
            .collect();
        if stale.is_empty() || version == 0 {
            return;
        }

        let message = match decided {
            ReadOutcome::Found(value) => DirectoryMessage::put(*key, value.clone(), None),
            ReadOutcome::Missing { version } => DirectoryMessage::delete(*key, *version),
        };
        let timeout = self.round_trip_timeout;
        let key = *key;
        tokio::spawn(async move {
            for replica in stale {
                let (id, result) = Self::ask(replica, message.clone(), timeout).await;
                if let Err(e) = result {
                    debug!(key = %key, replica = %id, error = %e, "Read repair failed");
                }
            }
        });
    }

    /// Send a write to every responsible replica and count acknowledgements of `version`.
    async fn write(&self, key: &DirectoryKey, message: DirectoryMessage, version: u64) -> DirectoryResult<()> {
        let replicas = self.responsible(key);
        if replicas.is_empty() {
            return Err(DirectoryError::NoReplicas);
        }
        let needed = Self::quorum(replicas.len());

        let results: Vec<_> = replicas
            .into_iter()
            .map(|r| Self::ask(r, message.clone(), self.round_trip_timeout))
            .collect::<FuturesUnordered<_>>()
            .collect()
            .await;

        let answered = results.iter().filter(|(_, r)| r.is_ok()).count();
        let acked = results
            .iter()
            .filter(|(_, r)| matches!(r, Ok(reply) if reply.version() == version))
            .count();

        if acked >= needed {
            Ok(())
        } else {
            warn!(key = %key, acked, needed, "Directory write not acknowledged by a majority");
            Err(DirectoryError::Unresolved {
                key: key.to_string(),
                answered,
                agreeing: acked,
                needed,
            })
        }
    }

    /// Hand keys this node holds to a replica that is now responsible for them.
    fn hand_off(&self, replica: Arc<dyn DirectoryReplica>) {
        let target = replica.node_id();
        let entries: Vec<_> = self
            .local
            .entries()
            .into_iter()
            .filter(|(key, _, _)| self.responsible(key).iter().any(|r| r.node_id() == target))
            .collect();
        if entries.is_empty() {
            return;
        }

        let timeout = self.round_trip_timeout;
        debug!(replica = %target, keys = entries.len(), "Handing off directory keys");
        tokio::spawn(async move {
            for (key, value, ttl) in entries {
                let ttl_ms = ttl.map(|t| t.as_millis() as u64);
                let _ = Self::ask(replica.clone(), DirectoryMessage::put(key, value, ttl_ms), timeout).await;
            }
        });
    }
}

#[async_trait]
impl PeerDirectory for ReplicatedDirectory {
    async fn get(&self, key: &DirectoryKey) -> DirectoryResult<Versioned> {
        match self.read(key).await? {
            ReadOutcome::Found(value) => Ok(value),
            ReadOutcome::Missing { .. } => Err(DirectoryError::NotFound(key.to_string())),
        }
    }

    async fn update(
        &self,
        key: DirectoryKey,
        ttl: Option<Duration>,
        f: UpdateFn,
    ) -> DirectoryResult<Option<DirectoryValue>> {
        let lock = self.key_lock(key);
        let result = {
            let _guard = lock.lock().await;

            match self.read(&key).await {
                Ok(current) => {
                    let base = current.version();
                    let current = match current {
                        ReadOutcome::Found(v) => Some(v.value),
                        ReadOutcome::Missing { .. } => None,
                    };
                    let existed = current.is_some();
                    let version = base + 1;

                    match f(current) {
                        Some(value) => {
                            let message = DirectoryMessage::put(
                                key,
                                Versioned {
                                    version,
                                    value: value.clone(),
                                },
                                ttl.map(|t| t.as_millis() as u64),
                            );
                            self.write(&key, message, version).await.map(|_| Some(value))
                        }
                        None if existed => self
                            .write(&key, DirectoryMessage::delete(key, version), version)
                            .await
                            .map(|_| None),
                        None => Ok(None),
                    }
                }
                Err(e) => Err(e),
            }
        };

        drop(lock);
        self.release_key_lock(&key);
        result
    }

    fn add_node(&self, node: &PeerNode) {
        if node.id == self.local.node_id() || self.replicas.contains_key(&node.id) {
            return;
        }
        if let Some(factory) = &self.factory {
            let replica = factory.replica_for(node);
            self.add_replica(replica.clone());
            self.hand_off(replica);
        }
    }

    fn remove_node(&self, id: &PeerId) {
        self.remove_replica(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkId, FileId};
    use crate::directory::peer_directory::DirectoryExt;
    use crate::directory::types::ChunkRecord;
    use crate::network::RetryPolicy;
    use std::collections::BTreeSet;

    struct Cluster {
        directory: ReplicatedDirectory,
        replicas: Vec<Arc<MemoryReplica>>,
    }

    fn cluster(size: usize, factor: usize) -> Cluster {
        let replicas: Vec<Arc<MemoryReplica>> = (0..size)
            .map(|i| Arc::new(MemoryReplica::new(PeerId::from_name(&format!("dir-{i}")))))
            .collect();
        let directory =
            ReplicatedDirectory::new(replicas[0].clone(), factor, Duration::from_millis(200));
        for replica in &replicas[1..] {
            directory.add_replica(replica.clone());
        }
        Cluster {
            directory,
            replicas,
        }
    }

    fn record(file_id: FileId, index: u32) -> ChunkRecord {
        ChunkRecord {
            chunk_id: ChunkId::new(file_id, index),
            hash: [9u8; 32],
            size: 100,
            hosts: BTreeSet::new(),
            replication_target: 2,
        }
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let c = cluster(5, 3);
        let key = DirectoryKey::Chunk(ChunkId::new(FileId::new(), 0));
        let value = DirectoryValue::Chunk(record(FileId::new(), 0));

        c.directory.put(key, value.clone(), None).await.unwrap();
        let found = c.directory.get(&key).await.unwrap();
        assert_eq!(found.value, value);
        assert_eq!(found.version, 1);

        let holders = c
            .replicas
            .iter()
            .filter(|r| matches!(r.apply(DirectoryMessage::get(key)), DirectoryReply::Found(_)))
            .count();
        assert_eq!(holders, 3);
    }

    #[tokio::test]
    async fn test_missing_key_is_not_found() {
        let c = cluster(5, 3);
        let key = DirectoryKey::File(FileId::new());
        assert!(matches!(
            c.directory.get(&key).await,
            Err(DirectoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_minority_offline_still_resolves() {
        let c = cluster(5, 5);
        let key = DirectoryKey::File(FileId::new());
        let value = DirectoryValue::Chunk(record(FileId::new(), 1));
        c.directory.put(key, value.clone(), None).await.unwrap();

        c.replicas[3].set_online(false);
        c.replicas[4].set_online(false);
        assert_eq!(c.directory.get(&key).await.unwrap().value, value);
    }

    #[tokio::test]
    async fn test_majority_offline_is_unresolved() {
        let c = cluster(5, 5);
        let key = DirectoryKey::File(FileId::new());
        c.directory
            .put(key, DirectoryValue::Chunk(record(FileId::new(), 1)), None)
            .await
            .unwrap();

        for replica in &c.replicas[1..4] {
            replica.set_online(false);
        }
        let result = c.directory.get(&key).await;
        match &result {
            Err(DirectoryError::Unresolved { answered, needed, .. }) => {
                assert_eq!(*answered, 2);
                assert_eq!(*needed, 3);
            }
            other => panic!("expected unresolved, got {:?}", other),
        }
        assert!(result.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_divergent_replicas_repaired() {
        let c = cluster(4, 4);
        let key = DirectoryKey::File(FileId::new());
        let old = DirectoryValue::Chunk(record(FileId::new(), 1));
        c.directory.put(key, old, None).await.unwrap();

        // Two replicas see a newer write the others missed.
        let newer = Versioned {
            version: 2,
            value: DirectoryValue::Chunk(record(FileId::new(), 2)),
        };
        c.replicas[0].apply(DirectoryMessage::put(key, newer.clone(), None));
        c.replicas[1].apply(DirectoryMessage::put(key, newer.clone(), None));

        assert!(matches!(
            c.directory.get(&key).await,
            Err(DirectoryError::Unresolved { .. })
        ));

        // Background repair converges the replicas on the newest version.
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        assert_eq!(c.directory.get(&key).await.unwrap(), newer);
    }

    #[tokio::test]
    async fn test_concurrent_updates_serialized() {
        let c = Arc::new(cluster(3, 3));
        let file_id = FileId::new();
        let template = record(file_id, 0);

        let mut tasks = Vec::new();
        for i in 0..10 {
            let c = c.clone();
            let template = template.clone();
            tasks.push(tokio::spawn(async move {
                c.directory
                    .add_chunk_hosts(
                        template,
                        vec![PeerId::from_name(&format!("host-{i}"))],
                        &RetryPolicy::default(),
                    )
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let stored = c
            .directory
            .lookup_chunk(&template.chunk_id, &RetryPolicy::no_retry())
            .await
            .unwrap();
        assert_eq!(stored.hosts.len(), 10);
        assert_eq!(c.directory.key_locks.len(), 0);
    }

    #[tokio::test]
    async fn test_delete() {
        let c = cluster(3, 3);
        let key = DirectoryKey::File(FileId::new());
        c.directory
            .put(key, DirectoryValue::Chunk(record(FileId::new(), 0)), None)
            .await
            .unwrap();
        c.directory.delete(&key).await.unwrap();
        assert!(matches!(
            c.directory.get(&key).await,
            Err(DirectoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_chunk_hosts() {
        let c = cluster(3, 3);
        let mut template = record(FileId::new(), 0);
        template.hosts.insert(PeerId::from_name("a"));
        let chunk_id = template.chunk_id;
        c.directory
            .add_chunk_hosts(template, vec![PeerId::from_name("b")], &RetryPolicy::no_retry())
            .await
            .unwrap();

        let after = c
            .directory
            .remove_chunk_hosts(chunk_id, vec![PeerId::from_name("a")], &RetryPolicy::no_retry())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.hosts.len(), 1);
        assert!(after.hosts.contains(&PeerId::from_name("b")));
    }

    #[tokio::test]
    async fn test_single_node_directory() {
        let c = cluster(1, 5);
        let key = DirectoryKey::File(FileId::new());
        c.directory
            .put(key, DirectoryValue::Chunk(record(FileId::new(), 0)), None)
            .await
            .unwrap();
        assert!(c.directory.get(&key).await.is_ok());
    }
}
