//! Boundaries the manager calls out through: where per-file keys come
//! from and who hears about a finished distribution.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tracing::info;

use crate::chunk::{FileId, FileKey};

/// Key exchange boundary. A node can only decrypt files whose key it holds.
pub trait KeyProvider: Send + Sync {
    fn store_key(&self, file_id: FileId, key: FileKey);

    fn key_for(&self, file_id: &FileId) -> Option<FileKey>;
}

/// In-memory key store.
#[derive(Default)]
pub struct KeyRing {
    keys: DashMap<FileId, FileKey>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forget(&self, file_id: &FileId) -> bool {
        self.keys.remove(file_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl KeyProvider for KeyRing {
    fn store_key(&self, file_id: FileId, key: FileKey) {
        self.keys.insert(file_id, key);
    }

    fn key_for(&self, file_id: &FileId) -> Option<FileKey> {
        self.keys.get(file_id).map(|k| k.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileAnnouncement {
    pub file_id: FileId,
    pub name: String,
    pub size: u64,
    pub total_chunks: u32,
    pub total_hosts: usize,
}

impl FileAnnouncement {
    /// What a user types to retrieve the file.
    pub fn reference(&self) -> String {
        self.file_id.to_string()
    }
}

/// Called after a file was distributed successfully.
#[async_trait]
pub trait Announcer: Send + Sync {
    async fn announce(&self, announcement: &FileAnnouncement);
}

/// Announces by logging.
#[derive(Debug, Default)]
pub struct LogAnnouncer;

#[async_trait]
impl Announcer for LogAnnouncer {
    async fn announce(&self, announcement: &FileAnnouncement) {
        info!(
            file_id = %announcement.file_id,
            name = %announcement.name,
            size = announcement.size,
            chunks = announcement.total_chunks,
            hosts = announcement.total_hosts,
            "File available"
        );
    }
}
