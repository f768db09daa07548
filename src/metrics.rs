//! Lightweight in-memory dispatch metrics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use serde::Serialize;

#[derive(Default)]
struct DispatchMetrics {
    submitted: AtomicU64,
    queued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    timeouts: AtomicU64,
    duration_total_ms: AtomicU64,
    duration_max_ms: AtomicU64,
}

static DISPATCH_METRICS: OnceLock<DispatchMetrics> = OnceLock::new();

fn metrics() -> &'static DispatchMetrics {
    DISPATCH_METRICS.get_or_init(DispatchMetrics::default)
}

/// Counts a submission; `queued` when no slot was free.
pub fn record_submit(queued: bool) {
    let metrics = metrics();
    metrics.submitted.fetch_add(1, Ordering::Relaxed);
    if queued {
        metrics.queued.fetch_add(1, Ordering::Relaxed);
    }
}

/// Records a request that ran: time from admission to its terminal delivery.
pub fn record_request(duration_ms: f64, success: bool) {
    let duration_ms = duration_ms.max(0.0) as u64;
    let metrics = metrics();
    metrics.completed.fetch_add(1, Ordering::Relaxed);
    if !success {
        metrics.failed.fetch_add(1, Ordering::Relaxed);
    }
    metrics
        .duration_total_ms
        .fetch_add(duration_ms, Ordering::Relaxed);

    let mut current = metrics.duration_max_ms.load(Ordering::Relaxed);
    while duration_ms > current {
        match metrics.duration_max_ms.compare_exchange(
            current,
            duration_ms,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(next) => current = next,
        }
    }
}

pub fn record_cancel() {
    metrics().cancelled.fetch_add(1, Ordering::Relaxed);
}

pub fn record_timeout() {
    metrics().timeouts.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Serialize)]
pub struct DispatchMetricsSnapshot {
    pub submitted: u64,
    pub queued: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timeouts: u64,
    pub avg_ms: Option<f64>,
    pub max_ms: Option<u64>,
}

pub fn snapshot() -> DispatchMetricsSnapshot {
    let metrics = metrics();
    let completed = metrics.completed.load(Ordering::Relaxed);
    let duration_total = metrics.duration_total_ms.load(Ordering::Relaxed);
    let max_ms = metrics.duration_max_ms.load(Ordering::Relaxed);

    let avg_ms = if completed > 0 {
        Some(duration_total as f64 / completed as f64)
    } else {
        None
    };

    DispatchMetricsSnapshot {
        submitted: metrics.submitted.load(Ordering::Relaxed),
        queued: metrics.queued.load(Ordering::Relaxed),
        completed,
        failed: metrics.failed.load(Ordering::Relaxed),
        cancelled: metrics.cancelled.load(Ordering::Relaxed),
        timeouts: metrics.timeouts.load(Ordering::Relaxed),
        avg_ms,
        max_ms: if max_ms > 0 { Some(max_ms) } else { None },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_flow() {
        // Other tests record concurrently; assert on lower bounds only.
        let initial = snapshot();

        record_submit(false);
        record_submit(true);
        let s1 = snapshot();
        assert!(s1.submitted >= initial.submitted + 2);
        assert!(s1.queued >= initial.queued + 1);

        record_request(100.0, true);
        record_request(50.0, false);
        let s2 = snapshot();
        assert!(s2.completed >= s1.completed + 2);
        assert!(s2.failed >= s1.failed + 1);
        assert!(s2.avg_ms.is_some());

        record_cancel();
        record_timeout();
        let s3 = snapshot();
        assert!(s3.cancelled >= initial.cancelled + 1);
        assert!(s3.timeouts >= initial.timeouts + 1);

        record_request(99999.0, true);
        assert!(snapshot().max_ms.unwrap() >= 99999);
    }
}
