//! Metrics recorder for chunk distribution and retrieval
//!
//! Thin wrappers over the `metrics` facade so call sites stay one line.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize metric descriptions (call once at startup)
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    describe_counter!("megaswarm_chunks_sent_total", "Chunks acknowledged by a host");
    describe_counter!("megaswarm_chunks_fetched_total", "Chunks fetched and verified");
    describe_counter!(
        "megaswarm_chunks_relayed_total",
        "Chunk transfers that went through a relay"
    );
    describe_counter!("megaswarm_bytes_sent_total", "Ciphertext bytes pushed to hosts");
    describe_counter!("megaswarm_bytes_fetched_total", "Ciphertext bytes fetched from hosts");
    describe_counter!(
        "megaswarm_integrity_failures_total",
        "Hash or decryption failures on received chunks"
    );
    describe_counter!(
        "megaswarm_host_failures_total",
        "Send or fetch attempts that exhausted their retries"
    );
    describe_counter!("megaswarm_heals_total", "Chunk replicas restored by maintenance");
    describe_counter!("megaswarm_evictions_total", "Peers evicted after missing heartbeats");
    describe_counter!("megaswarm_files_distributed_total", "Files distributed");
    describe_counter!("megaswarm_files_retrieved_total", "Files retrieved");
    describe_counter!("megaswarm_operations_failed_total", "Distributions or retrievals that failed");

    describe_gauge!("megaswarm_peers", "Peers in the live peer table");
    describe_gauge!("megaswarm_storage_used_bytes", "Bytes of hosted chunks held locally");
    describe_gauge!("megaswarm_active_operations", "Distributions and retrievals in flight");

    describe_histogram!(
        "megaswarm_chunk_transfer_duration_seconds",
        "Time to push or fetch a single chunk"
    );
    describe_histogram!(
        "megaswarm_file_duration_seconds",
        "Time to distribute or retrieve a whole file"
    );
}

// ============== Chunk Operations ==============

pub fn record_chunk_sent(bytes: u64, relayed: bool) {
    counter!("megaswarm_chunks_sent_total").increment(1);
    counter!("megaswarm_bytes_sent_total").increment(bytes);
    if relayed {
        counter!("megaswarm_chunks_relayed_total", "direction" => "send").increment(1);
    }
}

pub fn record_chunk_fetched(bytes: u64) {
    counter!("megaswarm_chunks_fetched_total").increment(1);
    counter!("megaswarm_bytes_fetched_total").increment(bytes);
}

/// `stage` is where the bad copy was caught: "hash", "decrypt" or "size"
pub fn record_integrity_failure(stage: &'static str) {
    counter!("megaswarm_integrity_failures_total", "stage" => stage).increment(1);
}

pub fn record_host_failure(operation: &'static str) {
    counter!("megaswarm_host_failures_total", "operation" => operation).increment(1);
}

pub fn record_chunk_duration(duration: Duration) {
    histogram!("megaswarm_chunk_transfer_duration_seconds").record(duration.as_secs_f64());
}

// ============== Maintenance ==============

pub fn record_heals(count: u64) {
    counter!("megaswarm_heals_total").increment(count);
}

pub fn record_evictions(count: u64) {
    counter!("megaswarm_evictions_total").increment(count);
}

pub fn set_peer_count(peers: usize) {
    gauge!("megaswarm_peers").set(peers as f64);
}

pub fn set_storage_used(bytes: u64) {
    gauge!("megaswarm_storage_used_bytes").set(bytes as f64);
}

/// Times one whole-file operation and records the outcome.
pub struct OperationMetrics {
    operation: &'static str,
    start_time: Instant,
    bytes: u64,
}

impl OperationMetrics {
    /// `operation` is "distribute" or "retrieve"
    pub fn start(operation: &'static str, bytes: u64) -> Self {
        gauge!("megaswarm_active_operations").increment(1.0);
        Self {
            operation,
            start_time: Instant::now(),
            bytes,
        }
    }

    pub fn set_bytes(&mut self, bytes: u64) {
        self.bytes = bytes;
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn throughput(&self) -> f64 {
        let secs = self.start_time.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.bytes as f64 / secs
        } else {
            0.0
        }
    }

    pub fn complete(self) {
        gauge!("megaswarm_active_operations").decrement(1.0);
        let counter_name = match self.operation {
            "retrieve" => "megaswarm_files_retrieved_total",
            _ => "megaswarm_files_distributed_total",
        };
        counter!(counter_name).increment(1);
        histogram!("megaswarm_file_duration_seconds", "operation" => self.operation)
            .record(self.start_time.elapsed().as_secs_f64());
    }

    pub fn fail(self, reason: &'static str) {
        gauge!("megaswarm_active_operations").decrement(1.0);
        counter!(
            "megaswarm_operations_failed_total",
            "operation" => self.operation,
            "reason" => reason
        )
        .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        init_metrics();
        init_metrics();
    }

    #[test]
    fn test_operation_metrics() {
        let mut metrics = OperationMetrics::start("distribute", 0);
        metrics.set_bytes(1000);
        assert_eq!(metrics.bytes, 1000);
        assert!(metrics.elapsed() >= Duration::ZERO);
        metrics.complete();
    }

    #[test]
    fn test_throughput_calculation() {
        let metrics = OperationMetrics::start("retrieve", 1000);
        std::thread::sleep(Duration::from_millis(100));

        let throughput = metrics.throughput();
        assert!(throughput > 1000.0 && throughput < 10000.0);
        metrics.fail("test");
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_chunk_sent(10, true);
        record_chunk_fetched(10);
        record_integrity_failure("hash");
        record_heals(2);
        set_peer_count(3);
    }
}
