use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, info};

/// Progress sink handed to every long-running component.
///
/// Implementations must be shareable across the worker pools of a stage.
pub trait Progress: Send + Sync {
    /// A stage with `total` units of work is starting.
    fn start(&self, stage: &str, total: usize);
    /// One unit of work named `item` finished.
    fn advance(&self, stage: &str, item: &str);
    fn finish(&self, stage: &str);
}

/// Reports progress through `tracing`, logging roughly every tenth of a stage.
#[derive(Debug, Default)]
pub struct LogProgress {
    total: AtomicUsize,
    done: AtomicUsize,
}

impl LogProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Progress for LogProgress {
    fn start(&self, stage: &str, total: usize) {
        self.total.store(total, Ordering::Relaxed);
        self.done.store(0, Ordering::Relaxed);
        info!(stage, total, "stage started");
    }

    fn advance(&self, stage: &str, item: &str) {
        let done = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        let total = self.total.load(Ordering::Relaxed);
        let step = (total / 10).max(1);
        if done % step == 0 || done == total {
            info!(stage, done, total, "progress");
        } else {
            debug!(stage, item, done, total, "progress");
        }
    }

    fn finish(&self, stage: &str) {
        info!(stage, done = self.done.load(Ordering::Relaxed), "stage finished");
    }
}

/// Swallows progress, for `--no-progress` and for tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn start(&self, _stage: &str, _total: usize) {}
    fn advance(&self, _stage: &str, _item: &str) {}
    fn finish(&self, _stage: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_progress_counts_and_resets_per_stage() {
        let progress = LogProgress::new();
        progress.start("first", 3);
        for item in ["a", "b", "c"] {
            progress.advance("first", item);
        }
        assert_eq!(progress.done.load(Ordering::Relaxed), 3);
        progress.finish("first");

        progress.start("second", 1);
        assert_eq!(progress.done.load(Ordering::Relaxed), 0);
        assert_eq!(progress.total.load(Ordering::Relaxed), 1);
    }
}
