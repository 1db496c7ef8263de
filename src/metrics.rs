//! Prometheus metrics for lock waiting and page splits

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, Encoder, Histogram, IntCounter, TextEncoder,
};

/// Times a worker parked waiting for a page
pub static PAGE_LOCK_WAITS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "arbordb_page_lock_waits_total",
        "Total number of park episodes while waiting for a page"
    )
    .unwrap()
});

/// Park latency
pub static PAGE_LOCK_WAIT_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "arbordb_page_lock_wait_duration_seconds",
        "Time spent parked waiting for a page",
        vec![0.00001, 0.0001, 0.001, 0.01, 0.1, 1.0]
    )
    .unwrap()
});

pub static PAGE_SPLITS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("arbordb_page_splits_total", "Total number of page splits").unwrap()
});

pub static BROKEN_SPLITS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "arbordb_broken_splits_total",
        "Total number of splits marked broken during unwind"
    )
    .unwrap()
});

pub static INSERTS_ON_BEHALF: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "arbordb_inserts_on_behalf_total",
        "Tuple inserts a lock holder performed for queued waiters"
    )
    .unwrap()
});

/// Render all registered metrics in the Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buf = Vec::new();
    encoder.encode(&families, &mut buf).unwrap_or_default();
    String::from_utf8(buf).unwrap_or_default()
}

/// RAII timer around a park episode.
pub struct WaitTimer {
    start: std::time::Instant,
}

/// Record a park start; drop the returned timer at wakeup.
pub fn wait_start() -> WaitTimer {
    PAGE_LOCK_WAITS.inc();
    WaitTimer {
        start: std::time::Instant::now(),
    }
}

impl Drop for WaitTimer {
    fn drop(&mut self) {
        PAGE_LOCK_WAIT_DURATION.observe(self.start.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_timer_counts() {
        let before = PAGE_LOCK_WAITS.get();
        drop(wait_start());
        assert_eq!(PAGE_LOCK_WAITS.get(), before + 1);
    }

    #[test]
    fn test_encode_contains_families() {
        drop(wait_start());
        let text = encode_metrics();
        assert!(text.contains("arbordb_page_lock_waits_total"));
    }
}
