//! Chunk transport: direct delivery with retry, falling back to a relay

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::error::{NetworkError, NetworkResult};
use super::rate_limiter::TransferRateLimiter;
use super::retry::RetryPolicy;
use super::types::{ChunkTransfer, Delivery, RejectReason, TransferStats, WireMessage, WireResponse};
use crate::chunk::ChunkId;
use crate::peer::{Heartbeat, PeerNode};
use crate::relay::Relay;

/// One request/response round trip with a peer.
#[async_trait]
pub trait Exchange: Send + Sync + 'static {
    async fn exchange(&self, target: &PeerNode, message: WireMessage) -> NetworkResult<WireResponse>;
}

/// Point-to-point chunk operations.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Push a chunk. Succeeds only once the receiver has verified its hash.
    async fn send(&self, chunk: &ChunkTransfer, peer: &PeerNode) -> NetworkResult<Delivery>;

    /// Fetch a chunk's ciphertext. Verification is up to the caller.
    async fn fetch(&self, chunk_id: &ChunkId, peer: &PeerNode) -> NetworkResult<ChunkTransfer>;

    /// Ask a peer to describe itself.
    async fn ping(&self, peer: &PeerNode) -> NetworkResult<PeerNode>;

    async fn heartbeat(&self, peer: &PeerNode, own: Heartbeat) -> NetworkResult<Heartbeat>;

    /// Every peer `peer` currently knows.
    async fn list_peers(&self, peer: &PeerNode) -> NetworkResult<Vec<PeerNode>>;

    fn stats(&self) -> TransferStats;
}

#[derive(Default)]
struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    chunks_sent: AtomicU64,
    chunks_fetched: AtomicU64,
    relayed: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
    integrity_failures: AtomicU64,
}

/// `Transport` over any `Exchange`.
pub struct ChunkTransport<E> {
    exchange: Arc<E>,
    relay: Option<Arc<dyn Relay>>,
    retry: RetryPolicy,
    limiter: TransferRateLimiter,
    counters: Counters,
}

impl<E: Exchange> ChunkTransport<E> {
    pub fn new(exchange: Arc<E>, retry: RetryPolicy) -> Self {
        Self {
            exchange,
            relay: None,
            retry,
            limiter: TransferRateLimiter::unlimited(),
            counters: Counters::default(),
        }
    }

    pub fn with_relay(mut self, relay: Arc<dyn Relay>) -> Self {
        self.relay = Some(relay);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: TransferRateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn exchange(&self) -> &Arc<E> {
        &self.exchange
    }

    /// One attempt: direct, then through a relay if the peer is unreachable.
    async fn attempt(&self, peer: &PeerNode, message: WireMessage) -> NetworkResult<(WireResponse, bool)> {
        let timeout = self.retry.attempt_timeout;
        let direct = match tokio::time::timeout(timeout, self.exchange.exchange(peer, message.clone())).await {
            Ok(result) => result,
            Err(_) => Err(NetworkError::Timeout(timeout)),
        };

        match direct {
            Ok(response) => Ok((response, false)),
            Err(NetworkError::Unreachable { peer: who, reason }) => {
                let Some(relay) = &self.relay else {
                    return Err(NetworkError::Unreachable { peer: who, reason });
                };
                debug!(peer = %peer.id, %reason, "Direct path failed, trying relay");
                let relayed = match tokio::time::timeout(timeout, relay.forward(peer, message)).await {
                    Ok(result) => result,
                    Err(_) => Err(NetworkError::Timeout(timeout)),
                };
                relayed.map(|response| (response, true))
            }
            Err(e) => Err(e),
        }
    }

    /// Run `attempt` under the retry policy, mapping the answer with `accept`.
    async fn request<T>(
        &self,
        label: &str,
        peer: &PeerNode,
        message: WireMessage,
        accept: impl Fn(WireResponse, bool) -> NetworkResult<T> + Send + Sync,
    ) -> NetworkResult<(T, bool, u32)> {
        let (result, attempts) = self
            .retry
            .run(
                label,
                |_| {
                    let message = message.clone();
                    let accept = &accept;
                    async move {
                        let (response, relayed) = self.attempt(peer, message).await?;
                        accept(response, relayed).map(|value| (value, relayed))
                    }
                },
                NetworkError::is_transient,
            )
            .await;

        if attempts > 1 {
            self.counters
                .retries
                .fetch_add(u64::from(attempts - 1), Ordering::Relaxed);
        }

        match result {
            Ok((value, relayed)) => {
                if relayed {
                    self.counters.relayed.fetch_add(1, Ordering::Relaxed);
                }
                Ok((value, relayed, attempts))
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                if e.is_transient() && attempts > 1 {
                    warn!(peer = %peer.id, op = label, attempts, error = %e, "Retries exhausted");
                    Err(NetworkError::MaxRetriesExceeded {
                        attempts,
                        last: Box::new(e),
                    })
                } else {
                    Err(e)
                }
            }
        }
    }
}

fn unexpected(response: WireResponse, relayed: bool) -> NetworkError {
    match response {
        WireResponse::Error(e) if relayed => NetworkError::RelayUnavailable(e),
        WireResponse::Error(e) => NetworkError::Rejected(e),
        WireResponse::Rejected(reason) => NetworkError::Rejected(format!("{reason:?}")),
        other => NetworkError::UnexpectedResponse(format!("{other:?}")),
    }
}

#[async_trait]
impl<E: Exchange> Transport for ChunkTransport<E> {
    async fn send(&self, chunk: &ChunkTransfer, peer: &PeerNode) -> NetworkResult<Delivery> {
        self.limiter.wait_for_chunk().await;
        self.limiter.wait_for_bytes(chunk.ciphertext.len()).await;

        let started = Instant::now();
        let expected = chunk.hash;
        let chunk_id = chunk.chunk_id;

        let result = self
            .request(
                "send_chunk",
                peer,
                WireMessage::StoreChunk(chunk.clone()),
                move |response, relayed| match response {
                    WireResponse::Stored { chunk_id: id, hash } if id == chunk_id && hash == expected => Ok(()),
                    WireResponse::Stored { .. } => Err(NetworkError::IntegrityMismatch {
                        chunk_id: chunk_id.to_string(),
                    }),
                    WireResponse::Rejected(RejectReason::IntegrityMismatch { .. }) => {
                        Err(NetworkError::IntegrityMismatch {
                            chunk_id: chunk_id.to_string(),
                        })
                    }
                    WireResponse::Rejected(RejectReason::ChunkConflict { .. }) => {
                        Err(NetworkError::ChunkConflict {
                            chunk_id: chunk_id.to_string(),
                        })
                    }
                    WireResponse::Rejected(RejectReason::StorageExceeded { needed, available }) => {
                        Err(NetworkError::StorageExceeded { needed, available })
                    }
                    other => Err(unexpected(other, relayed)),
                },
            )
            .await;

        match result {
            Ok(((), relayed, attempts)) => {
                self.counters
                    .bytes_sent
                    .fetch_add(chunk.size(), Ordering::Relaxed);
                self.counters.chunks_sent.fetch_add(1, Ordering::Relaxed);
                let latency = started.elapsed();
                debug!(chunk = %chunk_id, peer = %peer.id, relayed, attempts, ?latency, "Chunk acknowledged");
                Ok(Delivery {
                    peer: peer.id,
                    relayed,
                    attempts,
                    latency,
                })
            }
            Err(e) => {
                if matches!(e.root(), NetworkError::IntegrityMismatch { .. }) {
                    self.counters
                        .integrity_failures
                        .fetch_add(1, Ordering::Relaxed);
                }
                Err(e)
            }
        }
    }

    async fn fetch(&self, chunk_id: &ChunkId, peer: &PeerNode) -> NetworkResult<ChunkTransfer> {
        let wanted = *chunk_id;
        let (transfer, _, _) = self
            .request(
                "fetch_chunk",
                peer,
                WireMessage::FetchChunk { chunk_id: wanted },
                move |response, relayed| match response {
                    WireResponse::Chunk(transfer) if transfer.chunk_id == wanted => Ok(transfer),
                    WireResponse::Chunk(transfer) => Err(NetworkError::UnexpectedResponse(format!(
                        "asked for {wanted}, got {}",
                        transfer.chunk_id
                    ))),
                    WireResponse::NotFound => Err(NetworkError::NotFound(wanted.to_string())),
                    other => Err(unexpected(other, relayed)),
                },
            )
            .await?;

        self.counters
            .bytes_received
            .fetch_add(transfer.size(), Ordering::Relaxed);
        self.counters.chunks_fetched.fetch_add(1, Ordering::Relaxed);
        Ok(transfer)
    }

    async fn ping(&self, peer: &PeerNode) -> NetworkResult<PeerNode> {
        let (node, _, _) = self
            .request("ping", peer, WireMessage::Ping, |response, relayed| match response {
                WireResponse::Pong(node) => Ok(node),
                other => Err(unexpected(other, relayed)),
            })
            .await?;
        Ok(node)
    }

    async fn heartbeat(&self, peer: &PeerNode, own: Heartbeat) -> NetworkResult<Heartbeat> {
        let (reply, _, _) = self
            .request(
                "heartbeat",
                peer,
                WireMessage::Heartbeat(own),
                |response, relayed| match response {
                    WireResponse::Heartbeat(reply) => Ok(reply),
                    other => Err(unexpected(other, relayed)),
                },
            )
            .await?;
        Ok(reply)
    }

    async fn list_peers(&self, peer: &PeerNode) -> NetworkResult<Vec<PeerNode>> {
        let (peers, _, _) = self
            .request("list_peers", peer, WireMessage::ListPeers, |response, relayed| match response {
                WireResponse::Peers(peers) => Ok(peers),
                other => Err(unexpected(other, relayed)),
            })
            .await?;
        Ok(peers)
    }

    fn stats(&self) -> TransferStats {
        TransferStats {
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            chunks_sent: self.counters.chunks_sent.load(Ordering::Relaxed),
            chunks_fetched: self.counters.chunks_fetched.load(Ordering::Relaxed),
            relayed: self.counters.relayed.load(Ordering::Relaxed),
            retries: self.counters.retries.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            integrity_failures: self.counters.integrity_failures.load(Ordering::Relaxed),
        }
    }
}

/// Transfer rates derived from two counter snapshots.
pub fn transfer_rates(previous: &TransferStats, current: &TransferStats, elapsed: Duration) -> (f64, f64) {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return (0.0, 0.0);
    }
    let up = current.bytes_sent.saturating_sub(previous.bytes_sent) as f64 / secs;
    let down = current.bytes_received.saturating_sub(previous.bytes_received) as f64 / secs;
    (up, down)
}
