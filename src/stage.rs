use anyhow::{anyhow, Context, Result};
use rayon::{prelude::*, ThreadPoolBuilder};
use tracing::{error, info};

use crate::{config::FailurePolicy, progress::Progress};

/// Outcome of one fan-out stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageReport {
    pub stage: String,
    pub succeeded: usize,
    /// `(item, error)` for every task that failed under `FailurePolicy::Isolate`.
    pub failures: Vec<(String, String)>,
}

impl StageReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Run `task` over `items` on a dedicated pool of `workers` threads.
///
/// With `FailFast` the first error is returned and the remaining tasks are abandoned;
/// with `Isolate` every task runs and failures are logged and collected.
pub fn run_stage<T, L, F>(
    stage: &str,
    items: &[T],
    workers: usize,
    policy: FailurePolicy,
    progress: &dyn Progress,
    label: L,
    task: F,
) -> Result<StageReport>
where
    T: Sync,
    L: Fn(&T) -> String + Sync,
    F: Fn(&T) -> Result<()> + Sync,
{
    let thread_prefix = stage.to_string();
    let pool = ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(move |i| format!("{thread_prefix}-{i}"))
        .build()
        .with_context(|| format!("building worker pool for {stage}"))?;

    progress.start(stage, items.len());
    let mut report = StageReport {
        stage: stage.to_string(),
        ..Default::default()
    };

    match policy {
        FailurePolicy::FailFast => {
            pool.install(|| {
                items.par_iter().try_for_each(|item| {
                    let name = label(item);
                    task(item).with_context(|| format!("{stage} failed for {name}"))?;
                    progress.advance(stage, &name);
                    Ok::<_, anyhow::Error>(())
                })
            })?;
            report.succeeded = items.len();
        }
        FailurePolicy::Isolate => {
            let results: Vec<(String, Result<()>)> = pool.install(|| {
                items
                    .par_iter()
                    .map(|item| {
                        let name = label(item);
                        let result = task(item);
                        progress.advance(stage, &name);
                        (name, result)
                    })
                    .collect()
            });
            for (name, result) in results {
                match result {
                    Ok(()) => report.succeeded += 1,
                    Err(e) => {
                        error!(stage, item = %name, error = %format!("{e:#}"), "task failed");
                        report.failures.push((name, format!("{e:#}")));
                    }
                }
            }
        }
    }

    progress.finish(stage);
    info!(
        stage,
        succeeded = report.succeeded,
        failed = report.failures.len(),
        "stage complete"
    );
    Ok(report)
}

/// Turn an isolated stage's failures into an error, for callers that need all tasks to pass.
pub fn require_clean(report: &StageReport) -> Result<()> {
    match report.failures.first() {
        None => Ok(()),
        Some((item, reason)) => Err(anyhow!(
            "{} of {} tasks failed in {}, first: {}: {}",
            report.failures.len(),
            report.failures.len() + report.succeeded,
            report.stage,
            item,
            reason
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn isolate_collects_every_failure() -> Result<()> {
        let items: Vec<u32> = (0..10).collect();
        let ran = AtomicUsize::new(0);
        let report = run_stage(
            "test",
            &items,
            3,
            FailurePolicy::Isolate,
            &NoProgress,
            |i| i.to_string(),
            |i| {
                ran.fetch_add(1, Ordering::Relaxed);
                if i % 4 == 0 {
                    Err(anyhow!("bad item {i}"))
                } else {
                    Ok(())
                }
            },
        )?;
        assert_eq!(ran.load(Ordering::Relaxed), 10);
        assert_eq!(report.succeeded, 7);
        let mut failed: Vec<&str> = report.failures.iter().map(|(n, _)| n.as_str()).collect();
        failed.sort();
        assert_eq!(failed, vec!["0", "4", "8"]);
        assert!(require_clean(&report).is_err());
        Ok(())
    }

    #[test]
    fn fail_fast_returns_the_error() {
        let items = vec!["a", "b", "c"];
        let err = run_stage(
            "test",
            &items,
            1,
            FailurePolicy::FailFast,
            &NoProgress,
            |s| s.to_string(),
            |s| {
                if *s == "b" {
                    Err(anyhow!("boom"))
                } else {
                    Ok(())
                }
            },
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("boom"));
    }
}
