//! Per-cache statistics: atomic counters plus fixed-bucket latency histograms
//!
//! Every decorator chain owns one [`StatsRecorder`]; snapshots are derived on
//! demand and never persisted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Number of exponential latency buckets. Bucket `i` covers durations below
/// `2^i` microseconds, the last bucket is unbounded.
const BUCKETS: usize = 24;

/// Snapshot of a single cache's counters and latency quantiles.
#[derive(Debug, Clone)]
pub struct CacheStatistics {
    pub namespace: String,
    pub hit_count: u64,
    pub miss_count: u64,
    pub eviction_count: u64,
    pub put_count: u64,
    pub remove_count: u64,
    pub error_count: u64,
    pub current_size: u64,
    /// Hits over hits+misses, in `[0, 1]`. Zero when no reads happened.
    pub hit_rate: f64,
    pub get_latency_p50_ms: f64,
    pub get_latency_p95_ms: f64,
    pub get_latency_p99_ms: f64,
    pub avg_get_latency_ms: f64,
    pub avg_put_latency_ms: f64,
    /// Time since the recorder started observing.
    pub window: Duration,
}

/// Lock-free latency histogram with exponential microsecond buckets.
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: [AtomicU64; BUCKETS],
    count: AtomicU64,
    sum_micros: AtomicU64,
}

impl Default for LatencyHistogram {
    fn default() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
        }
    }
}

impl LatencyHistogram {
    /// Record one observation.
    pub fn record(&self, elapsed: Duration) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        let bucket = ((64 - micros.leading_zeros()) as usize).min(BUCKETS - 1);
        if let Some(slot) = self.buckets.get(bucket) {
            slot.fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }

    /// Approximate quantile in milliseconds. `q` in `[0, 1]`.
    #[must_use]
    pub fn quantile_ms(&self, q: f64) -> f64 {
        let total = self.count.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        let rank = ((total as f64) * q).ceil().max(1.0) as u64;
        let mut seen = 0u64;
        for (i, bucket) in self.buckets.iter().enumerate() {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= rank {
                // Upper bound of the bucket, reported as milliseconds.
                let upper_micros = if i >= BUCKETS - 1 {
                    1u64 << (BUCKETS - 1)
                } else {
                    1u64 << i
                };
                #[allow(clippy::cast_precision_loss)]
                return upper_micros as f64 / 1000.0;
            }
        }
        0.0
    }

    /// Mean latency in milliseconds.
    #[must_use]
    pub fn mean_ms(&self) -> f64 {
        let total = self.count.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        {
            self.sum_micros.load(Ordering::Relaxed) as f64 / total as f64 / 1000.0
        }
    }
}

/// Thread-safe counters backing [`CacheStatistics`] snapshots.
#[derive(Debug)]
pub struct StatsRecorder {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    puts: AtomicU64,
    removes: AtomicU64,
    errors: AtomicU64,
    get_latency: LatencyHistogram,
    put_latency: LatencyHistogram,
    started_at: Instant,
}

impl Default for StatsRecorder {
    fn default() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            removes: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            get_latency: LatencyHistogram::default(),
            put_latency: LatencyHistogram::default(),
            started_at: Instant::now(),
        }
    }
}

impl StatsRecorder {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remove(&self) {
        self.removes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_get_latency(&self, elapsed: Duration) {
        self.get_latency.record(elapsed);
    }

    pub fn record_put_latency(&self, elapsed: Duration) {
        self.put_latency.record(elapsed);
    }

    #[must_use]
    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Build a snapshot. `current_size` comes from the backend because the
    /// recorder has no view of entry lifetime.
    #[must_use]
    pub fn snapshot(&self, namespace: &str, current_size: u64) -> CacheStatistics {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let reads = hits + misses;
        #[allow(clippy::cast_precision_loss)]
        let hit_rate = if reads > 0 {
            hits as f64 / reads as f64
        } else {
            0.0
        };

        CacheStatistics {
            namespace: namespace.to_string(),
            hit_count: hits,
            miss_count: misses,
            eviction_count: self.evictions.load(Ordering::Relaxed),
            put_count: self.puts.load(Ordering::Relaxed),
            remove_count: self.removes.load(Ordering::Relaxed),
            error_count: self.errors.load(Ordering::Relaxed),
            current_size,
            hit_rate,
            get_latency_p50_ms: self.get_latency.quantile_ms(0.50),
            get_latency_p95_ms: self.get_latency.quantile_ms(0.95),
            get_latency_p99_ms: self.get_latency.quantile_ms(0.99),
            avg_get_latency_ms: self.get_latency.mean_ms(),
            avg_put_latency_ms: self.put_latency.mean_ms(),
            window: self.started_at.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_stays_in_bounds() {
        let recorder = StatsRecorder::default();
        let snapshot = recorder.snapshot("test", 0);
        assert!(snapshot.hit_rate >= 0.0 && snapshot.hit_rate <= 1.0);

        recorder.record_hit();
        recorder.record_hit();
        recorder.record_miss();
        let snapshot = recorder.snapshot("test", 0);
        assert!(snapshot.hit_rate >= 0.0 && snapshot.hit_rate <= 1.0);
        assert!((snapshot.hit_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn quantiles_are_monotonic() {
        let histogram = LatencyHistogram::default();
        for micros in [10u64, 50, 100, 500, 1_000, 5_000, 10_000, 50_000] {
            histogram.record(Duration::from_micros(micros));
        }
        let p50 = histogram.quantile_ms(0.50);
        let p95 = histogram.quantile_ms(0.95);
        let p99 = histogram.quantile_ms(0.99);
        assert!(p50 <= p95);
        assert!(p95 <= p99);
        assert!(p50 > 0.0);
    }

    #[test]
    fn empty_histogram_reports_zero() {
        let histogram = LatencyHistogram::default();
        assert_eq!(histogram.quantile_ms(0.99), 0.0);
        assert_eq!(histogram.mean_ms(), 0.0);
    }

    #[test]
    fn snapshot_carries_counters() {
        let recorder = StatsRecorder::default();
        recorder.record_put();
        recorder.record_put();
        recorder.record_remove();
        recorder.record_eviction();
        recorder.record_error();
        recorder.record_get_latency(Duration::from_micros(120));
        recorder.record_put_latency(Duration::from_micros(450));

        let snapshot = recorder.snapshot("orders", 7);
        assert_eq!(snapshot.namespace, "orders");
        assert_eq!(snapshot.put_count, 2);
        assert_eq!(snapshot.remove_count, 1);
        assert_eq!(snapshot.eviction_count, 1);
        assert_eq!(snapshot.error_count, 1);
        assert_eq!(snapshot.current_size, 7);
        assert!(snapshot.avg_get_latency_ms > 0.0);
        assert!(snapshot.avg_put_latency_ms > 0.0);
    }

    #[test]
    fn window_advances_with_time() {
        let recorder = StatsRecorder::default();
        std::thread::sleep(Duration::from_millis(5));
        let snapshot = recorder.snapshot("test", 0);
        assert!(snapshot.window >= Duration::from_millis(5));
    }
}
