//! Upload rate limiting using the governor crate

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Bytes are metered in 1 KiB cells.
const CELL_BYTES: usize = 1024;

/// Caps outbound chunk traffic. Cheap to clone; clones share the budget.
#[derive(Clone)]
pub struct TransferRateLimiter {
    bytes_limiter: Option<Arc<DirectLimiter>>,
    chunks_limiter: Option<Arc<DirectLimiter>>,
    /// Largest number of cells one `until_n_ready` call may ask for
    burst_cells: NonZeroU32,
}

impl TransferRateLimiter {
    /// Create a limiter. A zero limit disables that dimension.
    pub fn new(bytes_per_second: u32, chunks_per_second: u32) -> Self {
        let kb_per_second = NonZeroU32::new((bytes_per_second / CELL_BYTES as u32).max(1));
        let bytes_limiter = (bytes_per_second > 0)
            .then_some(kb_per_second)
            .flatten()
            .map(|rate| Arc::new(RateLimiter::direct(Quota::per_second(rate))));

        let chunks_limiter = NonZeroU32::new(chunks_per_second)
            .map(|rate| Arc::new(RateLimiter::direct(Quota::per_second(rate))));

        Self {
            bytes_limiter,
            chunks_limiter,
            burst_cells: kb_per_second.unwrap_or(NonZeroU32::MIN),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, 0)
    }

    /// Wait until `bytes` may be sent.
    pub async fn wait_for_bytes(&self, bytes: usize) {
        let Some(limiter) = &self.bytes_limiter else {
            return;
        };

        let mut cells = bytes.div_ceil(CELL_BYTES).max(1) as u64;
        while cells > 0 {
            let batch = cells.min(self.burst_cells.get() as u64) as u32;
            if let Some(n) = NonZeroU32::new(batch) {
                // Batch never exceeds the burst size, so this cannot fail.
                let _ = limiter.until_n_ready(n).await;
            }
            cells -= batch as u64;
        }
    }

    /// Wait until another chunk may be sent.
    pub async fn wait_for_chunk(&self) {
        if let Some(limiter) = &self.chunks_limiter {
            limiter.until_ready().await;
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.bytes_limiter.is_some() || self.chunks_limiter.is_some()
    }
}

impl Default for TransferRateLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}
