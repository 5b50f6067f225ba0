use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::trace;

use super::error::{DirectoryError, DirectoryResult};
use super::types::{DirectoryKey, DirectoryMessage, DirectoryOp, DirectoryReply, Versioned};
use crate::network::{Exchange, NetworkError, WireMessage, WireResponse};
use crate::peer::{PeerId, PeerNode};

/// One node holding a share of the directory.
#[async_trait]
pub trait DirectoryReplica: Send + Sync {
    fn node_id(&self) -> PeerId;

    async fn handle(&self, message: DirectoryMessage) -> DirectoryResult<DirectoryReply>;
}

/// Creates the replica handle for a peer that joined the overlay.
pub trait ReplicaFactory: Send + Sync {
    fn replica_for(&self, node: &PeerNode) -> Arc<dyn DirectoryReplica>;
}

#[derive(Debug, Clone)]
struct Slot {
    version: u64,
    /// `None` is a tombstone
    value: Option<Versioned>,
    digest: [u8; 32],
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.value.is_some() && self.expires_at.map_or(true, |at| now < at)
    }
}

/// The replica every node keeps in memory for its own share of the keyspace.
pub struct MemoryReplica {
    node_id: PeerId,
    slots: DashMap<DirectoryKey, Slot>,
    online: AtomicBool,
}

impl MemoryReplica {
    pub fn new(node_id: PeerId) -> Self {
        Self {
            node_id,
            slots: DashMap::new(),
            online: AtomicBool::new(true),
        }
    }

    /// Simulate the replica dropping off the network (or coming back).
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.slots.iter().filter(|s| s.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live entries, for handing keys over to a newly joined replica.
    pub fn entries(&self) -> Vec<(DirectoryKey, Versioned, Option<Duration>)> {
        let now = Instant::now();
        self.slots
            .iter()
            .filter(|s| s.is_live(now))
            .filter_map(|s| {
                let ttl = s.expires_at.map(|at| at.saturating_duration_since(now));
                s.value.clone().map(|v| (*s.key(), v, ttl))
            })
            .collect()
    }

    /// Drop expired values, keeping their version as a tombstone.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut purged = 0;
        for mut slot in self.slots.iter_mut() {
            if slot.value.is_some() && !slot.is_live(now) {
                slot.value = None;
                slot.expires_at = None;
                purged += 1;
            }
        }
        purged
    }

    /// Apply a message locally. Last writer wins by version, then by digest.
    pub fn apply(&self, message: DirectoryMessage) -> DirectoryReply {
        let now = Instant::now();
        match message.op {
            DirectoryOp::Get => match self.slots.get(&message.key) {
                Some(slot) if slot.is_live(now) => match &slot.value {
                    Some(value) => DirectoryReply::Found(value.clone()),
                    None => DirectoryReply::Missing {
                        version: slot.version,
                    },
                },
                Some(slot) => DirectoryReply::Missing {
                    version: slot.version,
                },
                None => DirectoryReply::Missing { version: 0 },
            },
            DirectoryOp::Put => {
                let Some(incoming) = message.value else {
                    return DirectoryReply::Missing { version: 0 };
                };
                let digest = incoming.digest();
                let expires_at = message.ttl_ms.map(|ms| now + Duration::from_millis(ms));

                let mut entry = self.slots.entry(message.key).or_insert_with(|| Slot {
                    version: 0,
                    value: None,
                    digest: [0u8; 32],
                    expires_at: None,
                });
                let newer = incoming.version > entry.version
                    || (incoming.version == entry.version && digest > entry.digest);
                if newer {
                    trace!(key = %message.key, version = incoming.version, "Replica stored value");
                    entry.version = incoming.version;
                    entry.digest = digest;
                    entry.value = Some(incoming);
                    entry.expires_at = expires_at;
                }
                DirectoryReply::Stored {
                    version: entry.version,
                }
            }
            DirectoryOp::Delete { version } => {
                let mut entry = self.slots.entry(message.key).or_insert_with(|| Slot {
                    version: 0,
                    value: None,
                    digest: [0u8; 32],
                    expires_at: None,
                });
                if version > entry.version {
                    entry.version = version;
                    entry.value = None;
                    entry.digest = [0u8; 32];
                    entry.expires_at = None;
                }
                DirectoryReply::Deleted {
                    version: entry.version,
                }
            }
        }
    }
}

#[async_trait]
impl DirectoryReplica for MemoryReplica {
    fn node_id(&self) -> PeerId {
        self.node_id
    }

    async fn handle(&self, message: DirectoryMessage) -> DirectoryResult<DirectoryReply> {
        if !self.is_online() {
            return Err(DirectoryError::ReplicaUnavailable(self.node_id.to_string()));
        }
        Ok(self.apply(message))
    }
}

/// A replica living on another peer, reached through any exchange.
pub struct RemoteReplica<E> {
    node: PeerNode,
    exchange: Arc<E>,
}

impl<E: Exchange> RemoteReplica<E> {
    pub fn new(node: PeerNode, exchange: Arc<E>) -> Self {
        Self { node, exchange }
    }
}

#[async_trait]
impl<E: Exchange> DirectoryReplica for RemoteReplica<E> {
    fn node_id(&self) -> PeerId {
        self.node.id
    }

    async fn handle(&self, message: DirectoryMessage) -> DirectoryResult<DirectoryReply> {
        match self
            .exchange
            .exchange(&self.node, WireMessage::Directory(message))
            .await?
        {
            WireResponse::Directory(reply) => Ok(reply),
            WireResponse::Error(e) => Err(DirectoryError::ReplicaUnavailable(format!(
                "{}: {e}",
                self.node.id
            ))),
            other => Err(NetworkError::UnexpectedResponse(format!("{other:?}")).into()),
        }
    }
}

pub struct RemoteReplicaFactory<E> {
    exchange: Arc<E>,
}

impl<E: Exchange> RemoteReplicaFactory<E> {
    pub fn new(exchange: Arc<E>) -> Self {
        Self { exchange }
    }
}

impl<E: Exchange> ReplicaFactory for RemoteReplicaFactory<E> {
    fn replica_for(&self, node: &PeerNode) -> Arc<dyn DirectoryReplica> {
        Arc::new(RemoteReplica::new(node.clone(), self.exchange.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::FileId;
    use crate::directory::types::DirectoryValue;
    use crate::peer::PeerAddress;

    fn peer_value(name: &str) -> DirectoryValue {
        DirectoryValue::Peer(PeerNode::new(PeerId::from_name(name), PeerAddress::Memory, 1))
    }

    fn key() -> DirectoryKey {
        DirectoryKey::File(FileId::new())
    }

    #[test]
    fn test_put_get() {
        let replica = MemoryReplica::new(PeerId::from_name("r"));
        let key = key();
        let value = Versioned {
            version: 1,
            value: peer_value("a"),
        };

        let reply = replica.apply(DirectoryMessage::put(key, value.clone(), None));
        assert_eq!(reply, DirectoryReply::Stored { version: 1 });
        assert_eq!(
            replica.apply(DirectoryMessage::get(key)),
            DirectoryReply::Found(value)
        );
    }

    #[test]
    fn test_older_version_ignored() {
        let replica = MemoryReplica::new(PeerId::from_name("r"));
        let key = key();
        replica.apply(DirectoryMessage::put(
            key,
            Versioned {
                version: 5,
                value: peer_value("new"),
            },
            None,
        ));

        let reply = replica.apply(DirectoryMessage::put(
            key,
            Versioned {
                version: 3,
                value: peer_value("old"),
            },
            None,
        ));
        assert_eq!(reply, DirectoryReply::Stored { version: 5 });
        match replica.apply(DirectoryMessage::get(key)) {
            DirectoryReply::Found(v) => assert_eq!(v.value, peer_value("new")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_delete_leaves_tombstone() {
        let replica = MemoryReplica::new(PeerId::from_name("r"));
        let key = key();
        replica.apply(DirectoryMessage::put(
            key,
            Versioned {
                version: 1,
                value: peer_value("a"),
            },
            None,
        ));
        assert_eq!(
            replica.apply(DirectoryMessage::delete(key, 2)),
            DirectoryReply::Deleted { version: 2 }
        );
        assert_eq!(
            replica.apply(DirectoryMessage::get(key)),
            DirectoryReply::Missing { version: 2 }
        );

        // A stale write cannot resurrect the key.
        replica.apply(DirectoryMessage::put(
            key,
            Versioned {
                version: 1,
                value: peer_value("a"),
            },
            None,
        ));
        assert!(replica.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let replica = MemoryReplica::new(PeerId::from_name("r"));
        let key = key();
        replica.apply(DirectoryMessage::put(
            key,
            Versioned {
                version: 1,
                value: peer_value("a"),
            },
            Some(1_000),
        ));
        assert_eq!(replica.len(), 1);

        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert_eq!(
            replica.apply(DirectoryMessage::get(key)),
            DirectoryReply::Missing { version: 1 }
        );
        assert_eq!(replica.purge_expired(), 1);
    }

    #[tokio::test]
    async fn test_offline_replica_errors() {
        let replica = MemoryReplica::new(PeerId::from_name("r"));
        replica.set_online(false);
        let result = replica.handle(DirectoryMessage::get(key())).await;
        assert!(matches!(result, Err(DirectoryError::ReplicaUnavailable(_))));
    }
}
