use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lifecycle counters owned by one manager.
///
/// Each increment is also forwarded to the process-wide `metrics` recorder
/// so the Prometheus exporter sees totals across managers, while the local
/// counters stay private to their manager.
#[derive(Debug, Default)]
pub struct LifecycleMetrics {
    cycles_run: AtomicU64,
    lifecycle_errors: AtomicU64,
    records_archived: AtomicU64,
    records_deleted: AtomicU64,
    records_moved: AtomicU64,
}

/// Point-in-time copy of [`LifecycleMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub cycles_run: u64,
    pub lifecycle_errors: u64,
    pub records_archived: u64,
    pub records_deleted: u64,
    pub records_moved: u64,
}

impl LifecycleMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cycle(&self) {
        self.cycles_run.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("lifecycle.cycles.run").increment(1);
    }

    pub fn record_error(&self) {
        self.lifecycle_errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("lifecycle.errors").increment(1);
    }

    pub fn record_archived(&self, count: u64) {
        self.records_archived.fetch_add(count, Ordering::Relaxed);
        metrics::counter!("lifecycle.records.archived").increment(count);
    }

    pub fn record_deleted(&self, count: u64) {
        self.records_deleted.fetch_add(count, Ordering::Relaxed);
        metrics::counter!("lifecycle.records.deleted").increment(count);
    }

    pub fn record_moved(&self, count: u64) {
        self.records_moved.fetch_add(count, Ordering::Relaxed);
        metrics::counter!("lifecycle.records.moved").increment(count);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cycles_run: self.cycles_run.load(Ordering::Relaxed),
            lifecycle_errors: self.lifecycle_errors.load(Ordering::Relaxed),
            records_archived: self.records_archived.load(Ordering::Relaxed),
            records_deleted: self.records_deleted.load(Ordering::Relaxed),
            records_moved: self.records_moved.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counters_are_per_instance() {
        let a = LifecycleMetrics::new();
        let b = LifecycleMetrics::new();

        a.record_cycle();
        a.record_archived(10);
        a.record_deleted(3);
        b.record_error();

        assert_eq!(
            a.snapshot(),
            MetricsSnapshot {
                cycles_run: 1,
                records_archived: 10,
                records_deleted: 3,
                ..Default::default()
            }
        );
        assert_eq!(b.snapshot().lifecycle_errors, 1);
        assert_eq!(b.snapshot().cycles_run, 0);
    }

    #[tokio::test]
    async fn test_concurrent_increments() {
        let metrics = Arc::new(LifecycleMetrics::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let metrics = metrics.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    metrics.record_moved(1);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(metrics.snapshot().records_moved, 800);
    }
}
