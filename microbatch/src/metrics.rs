//! Metrics for the dynamic batcher.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters for monitoring batcher behavior
#[derive(Debug, Default)]
pub struct BatcherMetrics {
    /// Total requests received by `enqueue`
    pub requests_received: AtomicU64,

    /// Requests currently waiting in the priority queue
    pub requests_queued: AtomicU64,

    /// Requests dispatched to the execution engine
    pub requests_dispatched: AtomicU64,

    /// Requests rejected because their queue deadline expired
    pub requests_timed_out: AtomicU64,

    /// Requests rejected because their priority level was full
    pub requests_rejected: AtomicU64,

    /// Responses served straight from the cache
    pub cache_hits: AtomicU64,

    /// Responses computed and inserted into the cache
    pub cache_misses: AtomicU64,

    /// Total queue wait time in microseconds (for averaging)
    pub total_queue_wait_us: AtomicU64,

    /// Total cache miss time (lookup + insert) in microseconds
    pub total_cache_miss_us: AtomicU64,

    /// Maximum queue depth observed
    pub max_queue_depth: AtomicU64,

    /// Payloads handed to the execution engine
    pub batches_dispatched: AtomicU64,

    /// Total batch slots across dispatched payloads (for batch size
    /// averaging)
    pub total_batch_slots: AtomicU64,
}

impl BatcherMetrics {
    /// Create new metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request arriving at `enqueue`
    pub fn record_received(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request entering the priority queue
    pub fn record_queued(&self) {
        let queued = self.requests_queued.fetch_add(1, Ordering::Relaxed) + 1;
        let mut current_max = self.max_queue_depth.load(Ordering::Relaxed);
        while queued > current_max {
            match self.max_queue_depth.compare_exchange_weak(
                current_max,
                queued,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => current_max = x,
            }
        }
    }

    /// Record a request leaving the queue for a payload
    pub fn record_dequeued(&self, wait_time: Duration) {
        self.requests_queued.fetch_sub(1, Ordering::Relaxed);
        self.requests_dispatched.fetch_add(1, Ordering::Relaxed);
        self.total_queue_wait_us
            .fetch_add(wait_time.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record a request rejected on queue timeout
    pub fn record_timeout(&self) {
        self.requests_queued.fetch_sub(1, Ordering::Relaxed);
        self.requests_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request refused at admission
    pub fn record_rejected(&self) {
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a response served from the cache
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a computed response inserted into the cache
    pub fn record_cache_miss(&self, miss_time: Duration) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        self.total_cache_miss_us
            .fetch_add(miss_time.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record a payload handed to the engine
    pub fn record_batch(&self, batch_slots: usize) {
        self.batches_dispatched.fetch_add(1, Ordering::Relaxed);
        self.total_batch_slots
            .fetch_add(batch_slots as u64, Ordering::Relaxed);
    }

    /// Current queue depth
    pub fn queue_depth(&self) -> u64 {
        self.requests_queued.load(Ordering::Relaxed)
    }

    /// Average queue wait in microseconds across dispatched requests
    pub fn avg_queue_wait_us(&self) -> f64 {
        let dispatched = self.requests_dispatched.load(Ordering::Relaxed);
        if dispatched == 0 {
            return 0.0;
        }
        self.total_queue_wait_us.load(Ordering::Relaxed) as f64 / dispatched as f64
    }

    /// Average batch slots per dispatched payload
    pub fn avg_batch_size(&self) -> f64 {
        let batches = self.batches_dispatched.load(Ordering::Relaxed);
        if batches == 0 {
            return 0.0;
        }
        self.total_batch_slots.load(Ordering::Relaxed) as f64 / batches as f64
    }

    /// Fraction of cache-checked requests served from the cache
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        if hits + misses == 0 {
            return 0.0;
        }
        hits as f64 / (hits + misses) as f64
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_received: self.requests_received.load(Ordering::Relaxed),
            requests_queued: self.requests_queued.load(Ordering::Relaxed),
            requests_dispatched: self.requests_dispatched.load(Ordering::Relaxed),
            requests_timed_out: self.requests_timed_out.load(Ordering::Relaxed),
            requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            max_queue_depth: self.max_queue_depth.load(Ordering::Relaxed),
            batches_dispatched: self.batches_dispatched.load(Ordering::Relaxed),
            avg_queue_wait_us: self.avg_queue_wait_us(),
            avg_batch_size: self.avg_batch_size(),
            cache_hit_rate: self.cache_hit_rate(),
        }
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.requests_received.store(0, Ordering::Relaxed);
        self.requests_queued.store(0, Ordering::Relaxed);
        self.requests_dispatched.store(0, Ordering::Relaxed);
        self.requests_timed_out.store(0, Ordering::Relaxed);
        self.requests_rejected.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.total_queue_wait_us.store(0, Ordering::Relaxed);
        self.total_cache_miss_us.store(0, Ordering::Relaxed);
        self.max_queue_depth.store(0, Ordering::Relaxed);
        self.batches_dispatched.store(0, Ordering::Relaxed);
        self.total_batch_slots.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of batcher metrics at a point in time
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSnapshot {
    pub requests_received: u64,
    pub requests_queued: u64,
    pub requests_dispatched: u64,
    pub requests_timed_out: u64,
    pub requests_rejected: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub max_queue_depth: u64,
    pub batches_dispatched: u64,
    pub avg_queue_wait_us: f64,
    pub avg_batch_size: f64,
    pub cache_hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = BatcherMetrics::new();

        metrics.record_received();
        metrics.record_queued();
        assert_eq!(metrics.queue_depth(), 1);

        metrics.record_dequeued(Duration::from_micros(150));
        assert_eq!(metrics.queue_depth(), 0);
        metrics.record_batch(4);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests_received, 1);
        assert_eq!(snapshot.requests_dispatched, 1);
        assert_eq!(snapshot.avg_queue_wait_us, 150.0);
        assert_eq!(snapshot.avg_batch_size, 4.0);
    }

    #[test]
    fn test_max_queue_depth() {
        let metrics = BatcherMetrics::new();

        for _ in 0..5 {
            metrics.record_queued();
        }
        for _ in 0..3 {
            metrics.record_dequeued(Duration::ZERO);
        }

        assert_eq!(metrics.max_queue_depth.load(Ordering::Relaxed), 5);
        assert_eq!(metrics.queue_depth(), 2);
    }

    #[test]
    fn test_cache_hit_rate() {
        let metrics = BatcherMetrics::new();
        assert_eq!(metrics.cache_hit_rate(), 0.0);

        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_miss(Duration::from_micros(10));

        assert_eq!(metrics.cache_hit_rate(), 0.75);
    }

    #[test]
    fn test_timeout_leaves_queue() {
        let metrics = BatcherMetrics::new();
        metrics.record_queued();
        metrics.record_timeout();

        assert_eq!(metrics.queue_depth(), 0);
        assert_eq!(metrics.snapshot().requests_timed_out, 1);
    }
}
