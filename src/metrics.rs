// Run metrics module
//
// Lightweight counters describing what a patch run did to the installation

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Counters for one application instance.
///
/// Uses atomic operations so the orchestrator and a front-end can share it
/// without locks. The summary is logged at the end of every patch run.
#[derive(Debug)]
pub struct Metrics {
    /// External tool processes launched (compiler + post-processor)
    pub tool_invocations: AtomicUsize,

    /// Tool processes that failed, timed out or overflowed their output buffer
    pub tool_failures: AtomicUsize,

    /// Total wall-clock time spent inside external tools, in milliseconds
    pub total_tool_time_ms: AtomicU64,

    /// `.original` backups created
    pub backups_created: AtomicUsize,

    /// Targets restored from their `.original` backup
    pub targets_restored: AtomicUsize,

    /// Chapter assets replaced with compiler output
    pub chapters_replaced: AtomicUsize,

    /// Override files copied into the installation
    pub overrides_applied: AtomicUsize,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            tool_invocations: AtomicUsize::new(0),
            tool_failures: AtomicUsize::new(0),
            total_tool_time_ms: AtomicU64::new(0),
            backups_created: AtomicUsize::new(0),
            targets_restored: AtomicUsize::new(0),
            chapters_replaced: AtomicUsize::new(0),
            overrides_applied: AtomicUsize::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a finished tool invocation and how long it took
    pub fn record_tool_run(&self, duration: Duration, succeeded: bool) {
        self.tool_invocations.fetch_add(1, Ordering::Relaxed);
        self.total_tool_time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        if !succeeded {
            self.tool_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_backup(&self) {
        self.backups_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_restored(&self, count: usize) {
        self.targets_restored.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_chapter_replaced(&self) {
        self.chapters_replaced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_override(&self) {
        self.overrides_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average tool run time in milliseconds
    pub fn avg_tool_time_ms(&self) -> f64 {
        let total = self.total_tool_time_ms.load(Ordering::Relaxed);
        let count = self.tool_invocations.load(Ordering::Relaxed);
        if count > 0 {
            total as f64 / count as f64
        } else {
            0.0
        }
    }

    /// Log metrics summary
    pub fn log_summary(&self) {
        tracing::info!("=== Patch Run Metrics ===");
        tracing::info!(
            "Tools: {} runs, {} failed, {:.2}s total (avg {:.0}ms)",
            self.tool_invocations.load(Ordering::Relaxed),
            self.tool_failures.load(Ordering::Relaxed),
            self.total_tool_time_ms.load(Ordering::Relaxed) as f64 / 1000.0,
            self.avg_tool_time_ms()
        );
        tracing::info!(
            "Files: {} backed up, {} restored, {} chapters replaced, {} overrides applied",
            self.backups_created.load(Ordering::Relaxed),
            self.targets_restored.load(Ordering::Relaxed),
            self.chapters_replaced.load(Ordering::Relaxed),
            self.overrides_applied.load(Ordering::Relaxed)
        );
        tracing::info!("Uptime: {:.2}s", self.uptime().as_secs_f64());
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        assert_eq!(metrics.tool_invocations.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.backups_created.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.avg_tool_time_ms(), 0.0);
    }

    #[test]
    fn test_record_tool_runs() {
        let metrics = Metrics::new();
        metrics.record_tool_run(Duration::from_millis(100), true);
        metrics.record_tool_run(Duration::from_millis(300), false);

        assert_eq!(metrics.tool_invocations.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.tool_failures.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.total_tool_time_ms.load(Ordering::Relaxed), 400);
        assert_eq!(metrics.avg_tool_time_ms(), 200.0);
    }

    #[test]
    fn test_concurrent_updates() {
        let metrics = Arc::new(Metrics::new());
        let mut handles = vec![];

        for _ in 0..8 {
            let metrics = Arc::clone(&metrics);
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    metrics.record_backup();
                    metrics.record_override();
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(metrics.backups_created.load(Ordering::Relaxed), 400);
        assert_eq!(metrics.overrides_applied.load(Ordering::Relaxed), 400);
    }
}
