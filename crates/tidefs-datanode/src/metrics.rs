//! Per-partition runtime latency accounting.

use std::sync::atomic::{AtomicU64, Ordering};

use tidefs_proto::DataPartitionMetricsResponse;

/// Write/read latency accumulators, recomputed on a fixed cadence into
/// the snapshot served by `GetDataPartitionMetrics`.
#[derive(Debug, Default)]
pub struct DataPartitionMetrics {
    write_latency_sum: AtomicU64,
    write_count: AtomicU64,
    read_latency_sum: AtomicU64,
    read_count: AtomicU64,
    snapshot_write_latency_us: AtomicU64,
    snapshot_read_latency_us: AtomicU64,
    snapshot_write_count: AtomicU64,
    snapshot_read_count: AtomicU64,
}

impl DataPartitionMetrics {
    /// Creates zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one write's latency in microseconds.
    pub fn add_write(&self, latency_us: u64) {
        self.write_latency_sum.fetch_add(latency_us, Ordering::Relaxed);
        self.write_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one read's latency in microseconds.
    pub fn add_read(&self, latency_us: u64) {
        self.read_latency_sum.fetch_add(latency_us, Ordering::Relaxed);
        self.read_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Folds the window's accumulators into the served snapshot and
    /// resets them.
    pub fn recompute(&self) {
        let w_sum = self.write_latency_sum.swap(0, Ordering::Relaxed);
        let w_cnt = self.write_count.swap(0, Ordering::Relaxed);
        let r_sum = self.read_latency_sum.swap(0, Ordering::Relaxed);
        let r_cnt = self.read_count.swap(0, Ordering::Relaxed);
        self.snapshot_write_latency_us
            .store(if w_cnt == 0 { 0 } else { w_sum / w_cnt }, Ordering::Relaxed);
        self.snapshot_read_latency_us
            .store(if r_cnt == 0 { 0 } else { r_sum / r_cnt }, Ordering::Relaxed);
        self.snapshot_write_count.store(w_cnt, Ordering::Relaxed);
        self.snapshot_read_count.store(r_cnt, Ordering::Relaxed);
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> DataPartitionMetricsResponse {
        DataPartitionMetricsResponse {
            write_latency_us: self.snapshot_write_latency_us.load(Ordering::Relaxed),
            read_latency_us: self.snapshot_read_latency_us.load(Ordering::Relaxed),
            write_count: self.snapshot_write_count.load(Ordering::Relaxed),
            read_count: self.snapshot_read_count.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recompute_averages_and_resets() {
        let metrics = DataPartitionMetrics::new();
        metrics.add_write(100);
        metrics.add_write(300);
        metrics.add_read(50);
        metrics.recompute();

        let snap = metrics.snapshot();
        assert_eq!(snap.write_latency_us, 200);
        assert_eq!(snap.write_count, 2);
        assert_eq!(snap.read_latency_us, 50);
        assert_eq!(snap.read_count, 1);

        // Next window starts empty.
        metrics.recompute();
        let snap = metrics.snapshot();
        assert_eq!(snap.write_count, 0);
        assert_eq!(snap.write_latency_us, 0);
    }
}
