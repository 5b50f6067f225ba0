//! Distributed peer and chunk directory

pub mod dht;
pub mod error;
pub mod peer_directory;
pub mod replica;
pub mod types;

pub use dht::ReplicatedDirectory;
pub use error::{DirectoryError, DirectoryResult};
pub use peer_directory::{DirectoryExt, PeerDirectory, UpdateFn};
pub use replica::{
    DirectoryReplica, MemoryReplica, RemoteReplica, RemoteReplicaFactory, ReplicaFactory,
};
pub use types::{
    ChunkRecord, DirectoryKey, DirectoryMessage, DirectoryOp, DirectoryReply, DirectoryValue,
    Versioned,
};
