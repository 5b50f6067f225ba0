use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use futures::future::join_all;
use futures::stream::{self, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::chunk::{Chunk, ChunkId, Chunker, FileDraft, FileId, FileKey, FileManifest};
use crate::config::{Config, ConfigError};
use crate::directory::{ChunkRecord, DirectoryError, DirectoryExt, PeerDirectory};
use crate::integrity::IntegrityVerifier;
use crate::manager::assembler::RetrievalAssembler;
use crate::manager::error::{ManagerError, ManagerResult};
use crate::manager::hooks::{Announcer, FileAnnouncement, KeyProvider, KeyRing, LogAnnouncer};
use crate::manager::maintenance::{self, MaintenanceHandle};
use crate::manager::state_machine::HostingStateMachine;
use crate::manager::types::{
    CancelToken, ChunkDistribution, DistributionResult, HostOutcome, HostingState, HostingStatus,
    MaintenanceReport, NetworkStats,
};
use crate::metrics;
use crate::network::{transfer_rates, ChunkTransfer, NetworkError, PeerService, TransferStats, Transport};
use crate::peer::{GeoLocation, Heartbeat, PeerAddress, PeerId, PeerNode, PeerTable};
use crate::selection::{HostLoad, HostSelector, SelectionContext};

/// Upload/download rates as of the last maintenance cycle.
struct RateWindow {
    at: Instant,
    stats: TransferStats,
    upload: f64,
    download: f64,
}

/// Peers asked for their peer lists each maintenance cycle.
const PEER_EXCHANGE_FANOUT: usize = 3;

/// Hosts a chunk ended up on, and every attempt made to get it there.
type Placement = (Vec<HostOutcome>, Option<PeerId>);

/// Orchestrates distribution, retrieval and upkeep of files for one node.
pub struct NetworkManager {
    config: Config,
    local_id: PeerId,
    service: Arc<PeerService>,
    directory: Arc<dyn PeerDirectory>,
    transport: Arc<dyn Transport>,
    peers: Arc<PeerTable>,
    selector: HostSelector,
    chunker: Chunker,
    assembler: RetrievalAssembler,
    keys: Arc<dyn KeyProvider>,
    announcer: Arc<dyn Announcer>,
    slots: Arc<Semaphore>,
    distributed: DashMap<FileId, FileManifest>,
    chunk_locks: DashMap<ChunkId, Arc<tokio::sync::Mutex<()>>>,
    rates: Mutex<RateWindow>,
}

impl NetworkManager {
    pub fn builder(config: Config) -> NetworkManagerBuilder {
        NetworkManagerBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn descriptor(&self) -> PeerNode {
        self.service.descriptor()
    }

    pub fn service(&self) -> &Arc<PeerService> {
        &self.service
    }

    pub fn peer_table(&self) -> &Arc<PeerTable> {
        &self.peers
    }

    pub fn directory(&self) -> &Arc<dyn PeerDirectory> {
        &self.directory
    }

    pub fn key_provider(&self) -> &Arc<dyn KeyProvider> {
        &self.keys
    }

    fn origin(&self) -> Option<GeoLocation> {
        self.service.descriptor().location
    }

    fn chunk_lock(&self, chunk_id: ChunkId) -> Arc<tokio::sync::Mutex<()>> {
        self.chunk_locks.entry(chunk_id).or_default().clone()
    }

    /// Drop the lock entry once no task holds or waits on it.
    fn release_chunk_lock(&self, chunk_id: &ChunkId) {
        self.chunk_locks
            .remove_if(chunk_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    // ============== Peers ==============

    /// Ping every configured bootstrap address, introduce ourselves to
    /// whoever answers and learn the peers they know. Returns how many answered.
    pub async fn join_bootstrap(&self) -> ManagerResult<usize> {
        let mut joined = 0;
        let mut discovered = 0;
        for addr in &self.config.bootstrap_peers {
            let target = PeerNode::new(
                PeerId::from_name(&addr.to_string()),
                PeerAddress::Quic(*addr),
                0,
            );
            match self.transport.ping(&target).await {
                Ok(node) => {
                    self.add_peer(node.clone());
                    self.introduce(&node).await;
                    discovered += self.exchange_peers(&node).await.len();
                    joined += 1;
                }
                Err(e) => warn!(%addr, error = %e, "Bootstrap peer unreachable"),
            }
        }

        if let Err(e) = self
            .directory
            .publish_peer(&self.service.descriptor(), Some(self.config.peer_timeout))
            .await
        {
            warn!(error = %e, "Could not publish own peer record");
        }

        info!(
            joined,
            discovered,
            configured = self.config.bootstrap_peers.len(),
            "Bootstrap complete"
        );
        Ok(joined)
    }

    /// Send our heartbeat so `peer` registers us. Returns whether it answered.
    async fn introduce(&self, peer: &PeerNode) -> bool {
        match self.transport.heartbeat(peer, self.service.heartbeat()).await {
            Ok(reply) if reply.peer_id == peer.id => self.peers.apply_heartbeat(&reply),
            Ok(reply) => {
                warn!(peer = %peer.id, answered_as = %reply.peer_id, "Heartbeat from wrong peer");
                false
            }
            Err(e) => {
                debug!(peer = %peer.id, error = %e, "Heartbeat failed");
                false
            }
        }
    }

    /// Ask `peer` for the peers it knows and register the ones that answer
    /// a ping. Returns the newly learned ids.
    async fn exchange_peers(&self, peer: &PeerNode) -> Vec<PeerId> {
        let listed = match self.transport.list_peers(peer).await {
            Ok(listed) => listed,
            Err(e) => {
                debug!(peer = %peer.id, error = %e, "Peer list unavailable");
                return Vec::new();
            }
        };

        let unknown: Vec<PeerNode> = listed
            .into_iter()
            .filter(|node| node.id != self.local_id && !self.peers.contains(&node.id))
            .collect();

        stream::iter(unknown)
            .map(|node| async move {
                match self.transport.ping(&node).await {
                    Ok(live) if live.id == node.id => {
                        let id = live.id;
                        self.add_peer(live.clone());
                        self.introduce(&live).await;
                        Some(id)
                    }
                    Ok(_) | Err(_) => {
                        debug!(peer = %node.id, via = %peer.id, "Listed peer did not answer");
                        None
                    }
                }
            })
            .buffer_unordered(self.config.max_concurrent_transfers.max(1))
            .filter_map(|learned| async move { learned })
            .collect()
            .await
    }

    /// Register a peer. Returns true when it was not known before.
    pub fn add_peer(&self, node: PeerNode) -> bool {
        if node.id == self.local_id {
            return false;
        }

        let is_new = self.peers.upsert(node.clone());
        if is_new {
            self.directory.add_node(&node);
            info!(peer = %node.id, address = %node.address, "Peer joined");
        }
        metrics::set_peer_count(self.peers.len());
        is_new
    }

    /// Refresh a known peer. Returns false for unknown peers.
    pub fn record_heartbeat(&self, heartbeat: &Heartbeat) -> bool {
        self.peers.apply_heartbeat(heartbeat)
    }

    pub fn peers(&self) -> Vec<PeerNode> {
        self.peers.snapshot()
    }

    // ============== Distribution ==============

    pub async fn submit_file(&self, data: Bytes, name: &str) -> ManagerResult<DistributionResult> {
        self.distribute_with_cancel(data, name, &CancelToken::new())
            .await
    }

    /// Distribute a file from disk. Chunks are read, sealed and placed a
    /// window at a time, so the file is never held in memory whole.
    pub async fn distribute_file(&self, path: &Path) -> ManagerResult<DistributionResult> {
        let (draft, reader) = self.chunker.open_file(path).await?;
        self.distribute_stream(draft, reader, &CancelToken::new())
            .await
    }

    /// Distribute `data`. After `cancel` no new chunk transfer starts; chunks
    /// already acknowledged stay hosted and are reported.
    pub async fn distribute_with_cancel(
        &self,
        data: Bytes,
        name: &str,
        cancel: &CancelToken,
    ) -> ManagerResult<DistributionResult> {
        let draft = self.chunker.draft(name, data.len() as u64)?;
        self.distribute_stream(draft, std::io::Cursor::new(data), cancel)
            .await
    }

    /// Distribute exactly `size` bytes read from `reader`.
    pub async fn distribute_reader<R>(
        &self,
        reader: R,
        name: &str,
        size: u64,
        cancel: &CancelToken,
    ) -> ManagerResult<DistributionResult>
    where
        R: AsyncRead + Unpin + Send,
    {
        let draft = self.chunker.draft(name, size)?;
        self.distribute_stream(draft, reader, cancel).await
    }

    async fn distribute_stream<R>(
        &self,
        draft: FileDraft,
        reader: R,
        cancel: &CancelToken,
    ) -> ManagerResult<DistributionResult>
    where
        R: AsyncRead + Unpin + Send,
    {
        let op = metrics::OperationMetrics::start("distribute", draft.total_size);
        let target = self.config.effective_replication_target() as usize;
        let load = Mutex::new(HostLoad::default());
        let mut snapshot = self.peers.snapshot();
        let mut hashes = Vec::with_capacity(draft.total_chunks as usize);

        // Chunks are planned in index order as they come off the reader, then
        // placed concurrently. A chunk is only read once a placement slot frees.
        let placed: ManagerResult<Vec<ChunkDistribution>> = self
            .chunker
            .seal_stream(&draft, reader)
            .map_err(ManagerError::from)
            .take_until(cancel.cancelled())
            .map_ok(|chunk| {
                hashes.push(chunk.hash);
                let hosts = self.plan_chunk(&chunk, target, &mut snapshot, &load);
                self.place_chunk(chunk, hosts, &load, target, cancel)
            })
            .try_buffer_unordered(self.config.max_concurrent_transfers.max(1))
            .try_collect()
            .await;
        let mut placed = match placed {
            Ok(placed) => placed,
            Err(e) => {
                op.fail(match &e {
                    ManagerError::Chunk(_) => "chunking",
                    _ => "placement",
                });
                return Err(e);
            }
        };
        placed.sort_by_key(|c| c.index);

        let complete = hashes.len() as u32 == draft.total_chunks;
        for index in placed.len() as u32..draft.total_chunks {
            placed.push(ChunkDistribution {
                chunk_id: ChunkId::new(draft.file_id, index),
                index,
                size: 0,
                hosts: Vec::new(),
                attempts: Vec::new(),
                under_replicated: true,
                error: Some(ManagerError::OperationCancelled.to_string()),
            });
        }

        let hosted_chunks = placed.iter().filter(|c| c.is_hosted()).count() as u32;
        let total_hosts = placed.iter().map(|c| c.hosts.len()).sum();
        let distinct_hosts = placed
            .iter()
            .flat_map(|c| c.hosts.iter())
            .collect::<HashSet<_>>()
            .len();
        let under_replicated_chunks = placed
            .iter()
            .filter(|c| c.is_hosted() && c.under_replicated)
            .count() as u32;
        let success = hosted_chunks == draft.total_chunks;

        if complete {
            if let Some(key) = draft.key.clone() {
                self.keys.store_key(draft.file_id, key);
            }

            let manifest = self.chunker.manifest(&draft, hashes);
            let (published, _) = self
                .config
                .retry
                .run(
                    "publish_manifest",
                    |_| self.directory.publish_manifest(&manifest),
                    DirectoryError::is_retryable,
                )
                .await;
            if let Err(e) = published {
                op.fail("directory");
                return Err(e.into());
            }
            if hosted_chunks > 0 {
                self.distributed.insert(manifest.file_id, manifest);
            }
        } else {
            debug!(
                file_id = %draft.file_id,
                read = hashes.len(),
                total = draft.total_chunks,
                "Distribution stopped before the whole file was read; manifest not published"
            );
        }

        let result = DistributionResult {
            file_id: draft.file_id,
            name: draft.name.clone(),
            total_size: draft.total_size,
            success,
            total_chunks: draft.total_chunks,
            hosted_chunks,
            total_hosts,
            distinct_hosts,
            under_replicated_chunks,
            cancelled: cancel.is_cancelled(),
            chunks: placed,
        };

        if success {
            op.complete();
            info!(
                file_id = %result.file_id,
                chunks = result.total_chunks,
                hosts = result.total_hosts,
                under_replicated = result.under_replicated_chunks,
                "File distributed"
            );
            self.announcer
                .announce(&FileAnnouncement {
                    file_id: result.file_id,
                    name: result.name.clone(),
                    size: result.total_size,
                    total_chunks: result.total_chunks,
                    total_hosts: result.total_hosts,
                })
                .await;
        } else {
            op.fail(if result.cancelled { "cancelled" } else { "unhosted_chunks" });
            warn!(
                file_id = %result.file_id,
                hosted = result.hosted_chunks,
                total = result.total_chunks,
                cancelled = result.cancelled,
                "File only partially distributed"
            );
        }

        Ok(result)
    }

    /// Choose hosts for the next chunk. Chunks are planned in index order,
    /// so equal peer tables always give equal plans. Each pick counts
    /// against later chunks' redundancy debt and against the host's free space.
    fn plan_chunk(
        &self,
        chunk: &Chunk,
        target: usize,
        snapshot: &mut [PeerNode],
        load: &Mutex<HostLoad>,
    ) -> Vec<PeerNode> {
        let size = chunk.stored_size();
        let mut load = load.lock();
        let ctx = SelectionContext {
            exclude: HashSet::from([self.local_id]),
            load: load.clone(),
            origin: self.origin(),
        };

        let selection = self.selector.select(size, target, snapshot, &ctx);
        if selection.under_replicated {
            debug!(
                chunk = %chunk.id,
                chosen = selection.hosts.len(),
                target,
                "Fewer eligible peers than target"
            );
        }
        for host in &selection.hosts {
            load.record(host.id);
            if let Some(peer) = snapshot.iter_mut().find(|p| p.id == host.id) {
                peer.used_storage = peer.used_storage.saturating_add(size);
            }
        }
        selection.hosts
    }

    async fn place_chunk(
        &self,
        chunk: Chunk,
        planned: Vec<PeerNode>,
        load: &Mutex<HostLoad>,
        target: usize,
        cancel: &CancelToken,
    ) -> ManagerResult<ChunkDistribution> {
        let lock = self.chunk_lock(chunk.id);
        let result = {
            let _guard = lock.lock().await;
            self.place_locked(&chunk, planned, load, target, cancel).await
        };
        drop(lock);
        self.release_chunk_lock(&chunk.id);
        result
    }

    async fn place_locked(
        &self,
        chunk: &Chunk,
        planned: Vec<PeerNode>,
        load: &Mutex<HostLoad>,
        target: usize,
        cancel: &CancelToken,
    ) -> ManagerResult<ChunkDistribution> {
        let transfer = ChunkTransfer::from(chunk);
        let tried: Mutex<HashSet<PeerId>> = Mutex::new(planned.iter().map(|h| h.id).collect());
        let placements = join_all(
            planned
                .into_iter()
                .map(|host| self.place_on(&transfer, host, &tried, load, cancel)),
        )
        .await;

        let mut hosts = Vec::new();
        let mut attempts = Vec::new();
        for placement in placements {
            let (outcomes, verified) = placement?;
            attempts.extend(outcomes);
            hosts.extend(verified);
        }

        let mut error = None;
        if !hosts.is_empty() {
            let template = ChunkRecord {
                chunk_id: chunk.id,
                hash: chunk.hash,
                size: chunk.stored_size(),
                hosts: BTreeSet::new(),
                replication_target: target as u32,
            };
            if let Err(e) = self
                .directory
                .add_chunk_hosts(template, hosts.clone(), &self.config.retry)
                .await
            {
                warn!(chunk = %chunk.id, error = %e, "Chunk placed but not registered");
                error = Some(e.to_string());
                hosts.clear();
            }
        }
        hosts.sort();

        Ok(ChunkDistribution {
            chunk_id: chunk.id,
            index: chunk.index(),
            size: chunk.stored_size(),
            under_replicated: hosts.len() < target,
            hosts,
            attempts,
            error,
        })
    }

    /// Push to `host`, substituting other peers until one verifies the
    /// chunk or no eligible peer is left.
    async fn place_on(
        &self,
        transfer: &ChunkTransfer,
        host: PeerNode,
        tried: &Mutex<HashSet<PeerId>>,
        load: &Mutex<HostLoad>,
        cancel: &CancelToken,
    ) -> ManagerResult<Placement> {
        let mut machine = HostingStateMachine::new(transfer.chunk_id, host.id);
        let mut host = host;
        let mut outcomes = Vec::new();

        loop {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = self.slots.acquire() => permit.ok(),
            };
            let Some(_permit) = permit else {
                outcomes.push(machine.outcome(false, 0, Some(ManagerError::OperationCancelled.to_string())));
                return Ok((outcomes, None));
            };

            machine.transition(HostingState::Sent)?;
            let started = Instant::now();
            match self.transport.send(transfer, &host).await {
                Ok(delivery) => {
                    machine.transition(HostingState::Acknowledged)?;
                    machine.transition(HostingState::Verified)?;
                    self.peers.record_outcome(&host.id, true, Some(delivery.latency));
                    self.peers.reserve_storage(&host.id, transfer.size());
                    metrics::record_chunk_sent(transfer.size(), delivery.relayed);
                    metrics::record_chunk_duration(started.elapsed());
                    debug!(
                        chunk = %transfer.chunk_id,
                        host = %host.id,
                        relayed = delivery.relayed,
                        attempts = delivery.attempts,
                        "Chunk placed"
                    );
                    outcomes.push(machine.outcome(delivery.relayed, delivery.attempts, None));
                    return Ok((outcomes, Some(host.id)));
                }
                Err(e) => {
                    machine.transition(HostingState::Failed)?;
                    let attempts = match &e {
                        NetworkError::MaxRetriesExceeded { attempts, .. } => *attempts,
                        _ => 1,
                    };
                    warn!(chunk = %transfer.chunk_id, host = %host.id, error = %e, "Chunk send failed");
                    self.peers.record_outcome(&host.id, false, None);
                    metrics::record_host_failure("send");
                    outcomes.push(machine.outcome(false, attempts, Some(e.to_string())));
                    load.lock().release(&host.id);

                    match self.substitute(transfer.size(), tried, load) {
                        Some(next) => {
                            debug!(chunk = %transfer.chunk_id, from = %host.id, to = %next.id, "Replacing host");
                            machine.replace(next.id)?;
                            host = next;
                        }
                        None => return Ok((outcomes, None)),
                    }
                }
            }
        }
    }

    /// Best untried peer with room for `size` bytes.
    fn substitute(
        &self,
        size: u64,
        tried: &Mutex<HashSet<PeerId>>,
        load: &Mutex<HostLoad>,
    ) -> Option<PeerNode> {
        let snapshot = self.peers.snapshot();
        let mut tried = tried.lock();
        let mut exclude = tried.clone();
        exclude.insert(self.local_id);

        let ctx = SelectionContext {
            exclude,
            load: load.lock().clone(),
            origin: self.origin(),
        };
        let next = self
            .selector
            .select(size, 1, &snapshot, &ctx)
            .hosts
            .into_iter()
            .next()?;

        tried.insert(next.id);
        load.lock().record(next.id);
        Some(next)
    }

    // ============== Retrieval ==============

    pub async fn retrieve_file(&self, file_id: &FileId) -> ManagerResult<Bytes> {
        self.retrieve_with_cancel(file_id, &CancelToken::new()).await
    }

    /// Retrieve by the identifier a user typed, e.g. from an announcement.
    pub async fn retrieve_by_reference(&self, reference: &str) -> ManagerResult<Bytes> {
        let file_id: FileId = reference
            .parse()
            .map_err(|_| ManagerError::InvalidReference(reference.to_string()))?;
        self.retrieve_file(&file_id).await
    }

    pub async fn retrieve_with_cancel(
        &self,
        file_id: &FileId,
        cancel: &CancelToken,
    ) -> ManagerResult<Bytes> {
        let mut op = metrics::OperationMetrics::start("retrieve", 0);
        match self.retrieve_inner(file_id, cancel, &mut op).await {
            Ok(data) => {
                op.complete();
                Ok(data)
            }
            Err(e) => {
                warn!(%file_id, error = %e, "Retrieval failed");
                op.fail(match &e {
                    ManagerError::OperationCancelled => "cancelled",
                    ManagerError::NotFound(_) => "not_found",
                    ManagerError::MissingKey(_) => "missing_key",
                    _ => "chunk_unavailable",
                });
                Err(e)
            }
        }
    }

    async fn retrieve_inner(
        &self,
        file_id: &FileId,
        cancel: &CancelToken,
        op: &mut metrics::OperationMetrics,
    ) -> ManagerResult<Bytes> {
        let manifest = self.lookup_for_retrieval(file_id, op).await?;
        let key = self.file_key(&manifest);
        self.assembler.assemble(&manifest, key.as_ref(), cancel).await
    }

    /// Retrieve into `sink` chunk by chunk, without holding the whole file.
    /// Returns the number of bytes written.
    pub async fn retrieve_to<W>(
        &self,
        file_id: &FileId,
        sink: &mut W,
        cancel: &CancelToken,
    ) -> ManagerResult<u64>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let mut op = metrics::OperationMetrics::start("retrieve", 0);
        let result = match self.lookup_for_retrieval(file_id, &mut op).await {
            Ok(manifest) => {
                let key = self.file_key(&manifest);
                self.assembler
                    .assemble_to(&manifest, key.as_ref(), cancel, sink)
                    .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(written) => {
                op.complete();
                Ok(written)
            }
            Err(e) => {
                warn!(%file_id, error = %e, "Retrieval failed");
                op.fail(match &e {
                    ManagerError::OperationCancelled => "cancelled",
                    ManagerError::NotFound(_) => "not_found",
                    ManagerError::MissingKey(_) => "missing_key",
                    ManagerError::Io(_) => "sink",
                    _ => "chunk_unavailable",
                });
                Err(e)
            }
        }
    }

    /// Retrieve straight to a file at `path`, creating or truncating it.
    pub async fn retrieve_to_file(&self, file_id: &FileId, path: &Path) -> ManagerResult<u64> {
        let mut file = tokio::fs::File::create(path).await?;
        self.retrieve_to(file_id, &mut file, &CancelToken::new())
            .await
    }

    async fn lookup_for_retrieval(
        &self,
        file_id: &FileId,
        op: &mut metrics::OperationMetrics,
    ) -> ManagerResult<FileManifest> {
        let manifest = self
            .directory
            .lookup_manifest(file_id, &self.config.retry)
            .await?;
        op.set_bytes(manifest.total_size);
        Ok(manifest)
    }

    fn file_key(&self, manifest: &FileManifest) -> Option<FileKey> {
        if manifest.encrypted {
            self.keys.key_for(&manifest.file_id)
        } else {
            None
        }
    }

    // ============== Status ==============

    pub fn network_stats(&self) -> NetworkStats {
        let rates = self.rates.lock();
        let store = self.service.store();
        NetworkStats {
            peer_count: self.peers.len(),
            hosted_file_count: self.distributed.len(),
            used_storage: store.used(),
            storage_limit: self.config.storage_limit,
            upload_rate: rates.upload,
            download_rate: rates.download,
        }
    }

    /// Files this node distributed and how many of their chunks still have
    /// a live host.
    pub async fn hosting_status(&self) -> Vec<HostingStatus> {
        let mut manifests: Vec<FileManifest> =
            self.distributed.iter().map(|e| e.value().clone()).collect();
        manifests.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.name.cmp(&b.name)));

        let mut status = Vec::with_capacity(manifests.len());
        for manifest in manifests {
            let mut available_chunks = 0;
            let mut replication_target = self.config.effective_replication_target();
            for chunk_id in &manifest.chunk_ids {
                if let Ok(record) = self.directory.lookup_chunk(chunk_id, &self.config.retry).await {
                    replication_target = record.replication_target;
                    if record.hosts.iter().any(|h| self.peers.contains(h)) {
                        available_chunks += 1;
                    }
                }
            }
            status.push(HostingStatus {
                file_id: manifest.file_id,
                name: manifest.name.clone(),
                total_size: manifest.total_size,
                total_chunks: manifest.total_chunks(),
                available_chunks,
                replication_target,
            });
        }
        status
    }

    // ============== Maintenance ==============

    /// Spawn the periodic maintenance task at the configured interval.
    pub fn start_maintenance(self: &Arc<Self>) -> MaintenanceHandle {
        maintenance::spawn(self.clone(), self.config.maintenance_interval)
    }

    /// One maintenance cycle: heartbeat peers, evict the silent ones,
    /// restore chunks below their replication target, refresh statistics.
    pub async fn run_maintenance(&self) -> ManagerResult<MaintenanceReport> {
        let mut report = MaintenanceReport::default();
        let concurrency = self.config.max_concurrent_transfers.max(1);

        // Peers that introduced themselves to our service join the directory here.
        let known = self.peers.snapshot();
        for node in &known {
            self.directory.add_node(node);
        }

        let mut gossip = known;
        gossip.shuffle(&mut rand::thread_rng());
        gossip.truncate(PEER_EXCHANGE_FANOUT);
        for peer in &gossip {
            report.discovered.extend(self.exchange_peers(peer).await);
        }
        if !report.discovered.is_empty() {
            info!(discovered = report.discovered.len(), "Learned peers from neighbours");
        }

        let snapshot = self.peers.snapshot();
        report.peers_contacted = snapshot.len();
        let responses: Vec<bool> = stream::iter(snapshot)
            .map(|peer| async move { self.introduce(&peer).await })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        report.peers_responded = responses.iter().filter(|r| **r).count();

        for node in self.peers.evict_stale(self.config.peer_timeout) {
            warn!(peer = %node.id, "Peer evicted after missing heartbeats");
            self.directory.remove_node(&node.id);
            report.evicted.push(node.id);
        }
        metrics::record_evictions(report.evicted.len() as u64);

        if let Err(e) = self
            .directory
            .publish_peer(&self.service.descriptor(), Some(self.config.peer_timeout))
            .await
        {
            debug!(error = %e, "Could not refresh own peer record");
        }

        let manifests: Vec<FileManifest> =
            self.distributed.iter().map(|e| e.value().clone()).collect();
        for manifest in &manifests {
            self.heal_file(manifest, &mut report).await;
        }
        metrics::record_heals(report.healed as u64);

        self.refresh_rates();
        report.stats = self.network_stats();
        metrics::set_peer_count(report.stats.peer_count);
        metrics::set_storage_used(report.stats.used_storage);

        Ok(report)
    }

    async fn heal_file(&self, manifest: &FileManifest, report: &mut MaintenanceReport) {
        let mut records = Vec::with_capacity(manifest.chunk_ids.len());
        for chunk_id in &manifest.chunk_ids {
            match self.directory.lookup_chunk(chunk_id, &self.config.retry).await {
                Ok(record) => records.push(record),
                Err(e) => debug!(chunk = %chunk_id, error = %e, "Chunk record unavailable"),
            }
        }

        // Redundancy debt as it stands, counting live hosts only.
        let mut load = HostLoad::default();
        for record in &records {
            for host in record.hosts.iter().filter(|h| self.peers.contains(h)) {
                load.record(*host);
            }
        }

        for record in records {
            report.chunks_checked += 1;
            match self.heal_chunk(record.chunk_id, &mut load).await {
                Ok(HealOutcome::Healthy) => {}
                Ok(HealOutcome::Healed { added, remaining }) => {
                    report.under_replicated += 1;
                    report.healed += added;
                    if remaining > 0 {
                        report.unhealed += 1;
                    }
                }
                Err(e) => {
                    report.under_replicated += 1;
                    report.unhealed += 1;
                    warn!(chunk = %record.chunk_id, error = %e, "Chunk could not be healed");
                }
            }
        }
    }

    async fn heal_chunk(&self, chunk_id: ChunkId, load: &mut HostLoad) -> ManagerResult<HealOutcome> {
        let lock = self.chunk_lock(chunk_id);
        let result = {
            let _guard = lock.lock().await;
            self.heal_locked(chunk_id, load).await
        };
        drop(lock);
        self.release_chunk_lock(&chunk_id);
        result
    }

    async fn heal_locked(&self, chunk_id: ChunkId, load: &mut HostLoad) -> ManagerResult<HealOutcome> {
        // Re-read under the lock so a distribution that just finished is seen.
        let record = self
            .directory
            .lookup_chunk(&chunk_id, &self.config.retry)
            .await?;
        let target = (record.replication_target as usize).max(1);
        let (live, dead): (Vec<PeerId>, Vec<PeerId>) =
            record.hosts.iter().copied().partition(|h| self.peers.contains(h));

        if !dead.is_empty() {
            debug!(chunk = %chunk_id, dead = dead.len(), "Pruning departed hosts");
            self.directory
                .remove_chunk_hosts(chunk_id, dead, &self.config.retry)
                .await?;
        }
        if live.len() >= target {
            return Ok(HealOutcome::Healthy);
        }

        let copy = self.fetch_verified(&record, &live).await?;
        let needed = target - live.len();
        let mut exclude: HashSet<PeerId> = record.hosts.iter().copied().collect();
        exclude.insert(self.local_id);

        let mut added = Vec::new();
        while added.len() < needed {
            let ctx = SelectionContext {
                exclude: exclude.clone(),
                load: load.clone(),
                origin: self.origin(),
            };
            let selection =
                self.selector
                    .select(record.size, needed - added.len(), &self.peers.snapshot(), &ctx);
            if selection.hosts.is_empty() {
                break;
            }

            for host in selection.hosts {
                exclude.insert(host.id);
                let _permit = self
                    .slots
                    .acquire()
                    .await
                    .map_err(|_| ManagerError::OperationCancelled)?;
                match self.transport.send(&copy, &host).await {
                    Ok(delivery) => {
                        self.peers.record_outcome(&host.id, true, Some(delivery.latency));
                        self.peers.reserve_storage(&host.id, copy.size());
                        metrics::record_chunk_sent(copy.size(), delivery.relayed);
                        load.record(host.id);
                        added.push(host.id);
                    }
                    Err(e) => {
                        warn!(chunk = %chunk_id, host = %host.id, error = %e, "Heal send failed");
                        self.peers.record_outcome(&host.id, false, None);
                        metrics::record_host_failure("heal");
                    }
                }
            }
        }

        if !added.is_empty() {
            self.directory
                .add_chunk_hosts(record.clone(), added.clone(), &self.config.retry)
                .await?;
            info!(chunk = %chunk_id, added = added.len(), live = live.len(), target, "Chunk healed");
        }

        Ok(HealOutcome::Healed {
            added: added.len(),
            remaining: needed - added.len(),
        })
    }

    /// A copy of the chunk from one of `live`, checked against the recorded hash.
    async fn fetch_verified(&self, record: &ChunkRecord, live: &[PeerId]) -> ManagerResult<ChunkTransfer> {
        let nodes: Vec<PeerNode> = live.iter().filter_map(|id| self.peers.get(id)).collect();
        let mut last_error = "no live hosts".to_string();

        for host in self.selector.rank(&nodes, self.origin().as_ref()) {
            match self.transport.fetch(&record.chunk_id, &host).await {
                Ok(copy) => match IntegrityVerifier::verify_payload(record.chunk_id, &record.hash, &copy.ciphertext) {
                    Ok(()) => return Ok(copy),
                    Err(e) => {
                        warn!(chunk = %record.chunk_id, host = %host.id, "Corrupt copy while healing");
                        metrics::record_integrity_failure("hash");
                        last_error = e.to_string();
                    }
                },
                Err(e) => last_error = e.to_string(),
            }
        }

        Err(ManagerError::ChunkUnavailable {
            file_id: record.file_id(),
            index: record.index(),
            reason: last_error,
        })
    }

    fn refresh_rates(&self) {
        let now = Instant::now();
        let current = self.transport.stats();
        let mut rates = self.rates.lock();
        let (upload, download) = transfer_rates(&rates.stats, &current, now - rates.at);
        *rates = RateWindow {
            at: now,
            stats: current,
            upload,
            download,
        };
    }
}

enum HealOutcome {
    Healthy,
    Healed { added: usize, remaining: usize },
}

/// Wires a [`NetworkManager`]. The peer service, directory and transport
/// are required; the rest default to in-memory implementations.
pub struct NetworkManagerBuilder {
    config: Config,
    service: Option<Arc<PeerService>>,
    directory: Option<Arc<dyn PeerDirectory>>,
    transport: Option<Arc<dyn Transport>>,
    peers: Option<Arc<PeerTable>>,
    keys: Option<Arc<dyn KeyProvider>>,
    announcer: Option<Arc<dyn Announcer>>,
}

impl NetworkManagerBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            service: None,
            directory: None,
            transport: None,
            peers: None,
            keys: None,
            announcer: None,
        }
    }

    pub fn service(mut self, service: Arc<PeerService>) -> Self {
        self.service = Some(service);
        self
    }

    pub fn directory(mut self, directory: Arc<dyn PeerDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Share the table the peer service and relay client use.
    pub fn peers(mut self, peers: Arc<PeerTable>) -> Self {
        self.peers = Some(peers);
        self
    }

    pub fn key_provider(mut self, keys: Arc<dyn KeyProvider>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn announcer(mut self, announcer: Arc<dyn Announcer>) -> Self {
        self.announcer = Some(announcer);
        self
    }

    pub fn build(self) -> ManagerResult<NetworkManager> {
        self.config.validate()?;
        let missing =
            |what: &str| ManagerError::Config(ConfigError::Invalid(format!("{what} is required")));

        let service = self.service.ok_or_else(|| missing("peer service"))?;
        let directory = self.directory.ok_or_else(|| missing("directory"))?;
        let transport = self.transport.ok_or_else(|| missing("transport"))?;
        let peers = self.peers.unwrap_or_default();
        let keys = self
            .keys
            .unwrap_or_else(|| Arc::new(KeyRing::new()) as Arc<dyn KeyProvider>);
        let announcer = self
            .announcer
            .unwrap_or_else(|| Arc::new(LogAnnouncer) as Arc<dyn Announcer>);

        let config = self.config;
        let descriptor = service.descriptor();
        let chunker = Chunker::new(config.chunk_size, config.encryption_enabled)?;
        let selector = HostSelector::new(config.selection.clone());
        let slots = Arc::new(Semaphore::new(config.max_concurrent_transfers.max(1)));
        let assembler = RetrievalAssembler::new(
            transport.clone(),
            directory.clone(),
            peers.clone(),
            selector.clone(),
            config.retry.clone(),
            slots.clone(),
            config.max_concurrent_transfers,
        )
        .with_origin(descriptor.location);

        info!(
            node = %descriptor.id,
            chunk_size = config.chunk_size,
            replication_target = config.effective_replication_target(),
            encryption = config.encryption_enabled,
            "Network manager ready"
        );

        Ok(NetworkManager {
            local_id: descriptor.id,
            service,
            directory,
            rates: Mutex::new(RateWindow {
                at: Instant::now(),
                stats: transport.stats(),
                upload: 0.0,
                download: 0.0,
            }),
            transport,
            peers,
            selector,
            chunker,
            assembler,
            keys,
            announcer,
            slots,
            distributed: DashMap::new(),
            chunk_locks: DashMap::new(),
            config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{MemoryReplica, RemoteReplicaFactory, ReplicatedDirectory};
    use crate::network::{ChunkStore, ChunkTransport, RetryPolicy, SimNetwork};
    use std::time::Duration;

    fn sim_node(network: &Arc<SimNetwork>, name: &str) -> NetworkManager {
        let config = Config {
            node_name: name.to_string(),
            chunk_size: 1024,
            replication_target: 2,
            encryption_enabled: false,
            directory_timeout: Duration::from_millis(200),
            retry: RetryPolicy::no_retry(),
            ..Config::default()
        };
        let id = PeerId::from_name(name);
        let peers = Arc::new(PeerTable::new());
        let replica = Arc::new(MemoryReplica::new(id));
        let service = Arc::new(PeerService::new(
            PeerNode::new(id, PeerAddress::Memory, 1 << 20),
            Arc::new(ChunkStore::new(1 << 20)),
            replica.clone(),
            peers.clone(),
        ));
        let endpoint = Arc::new(network.endpoint(id));
        network.register(service.clone());
        let directory = ReplicatedDirectory::new(replica, 3, config.directory_timeout)
            .with_factory(Arc::new(RemoteReplicaFactory::new(endpoint.clone())));
        let transport = ChunkTransport::new(endpoint, config.retry.clone());

        NetworkManager::builder(config)
            .service(service)
            .directory(Arc::new(directory))
            .transport(Arc::new(transport))
            .peers(peers)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_chunk_locks_released_after_use() {
        let network = SimNetwork::new();
        let nodes: Vec<NetworkManager> = ["origin", "a", "b", "c"]
            .iter()
            .map(|name| sim_node(&network, name))
            .collect();
        for a in &nodes {
            for b in &nodes {
                a.add_peer(b.descriptor());
            }
        }
        let origin = &nodes[0];

        let result = origin
            .submit_file(Bytes::from(vec![9u8; 10 * 1024]), "locks.bin")
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.total_chunks, 10);
        assert!(origin.chunk_locks.is_empty());

        let report = origin.run_maintenance().await.unwrap();
        assert_eq!(report.chunks_checked, 10);
        assert!(origin.chunk_locks.is_empty());
    }

    #[test]
    fn test_release_keeps_lock_while_held() {
        let network = SimNetwork::new();
        let manager = sim_node(&network, "solo");
        let id = ChunkId::new(FileId::new(), 0);

        let held = manager.chunk_lock(id);
        manager.release_chunk_lock(&id);
        assert_eq!(manager.chunk_locks.len(), 1);

        drop(held);
        manager.release_chunk_lock(&id);
        assert!(manager.chunk_locks.is_empty());
    }

    fn service(name: &str) -> Arc<PeerService> {
        let id = PeerId::from_name(name);
        Arc::new(PeerService::new(
            PeerNode::new(id, PeerAddress::Memory, 1 << 20),
            Arc::new(ChunkStore::new(1 << 20)),
            Arc::new(MemoryReplica::new(id)),
            Arc::new(PeerTable::new()),
        ))
    }

    #[test]
    fn test_builder_requires_transport() {
        let directory = ReplicatedDirectory::new(
            Arc::new(MemoryReplica::new(PeerId::from_name("solo"))),
            3,
            Duration::from_millis(100),
        );
        let err = NetworkManager::builder(Config::default())
            .service(service("solo"))
            .directory(Arc::new(directory))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, ManagerError::Config(ConfigError::Invalid(msg)) if msg.contains("transport")));
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let config = Config {
            chunk_size: 0,
            ..Config::default()
        };
        let err = NetworkManager::builder(config)
            .service(service("solo"))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, ManagerError::Config(_)));
    }
}
