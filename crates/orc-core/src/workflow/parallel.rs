//! Parallel stage executor (spec §4.5): fan out a wave's stages to a
//! bounded worker pool, enforce per-task timeout, and cancel siblings on
//! the first fatal failure.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Semaphore};
use tracing::{debug, warn};

use super::result::StageResult;

/// Per-stage task: takes the stage name, returns its eventual result. Boxed
/// because each stage's closure captures different engine state.
pub type StageTask =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = StageResult> + Send>> + Send + Sync>;

/// Bounded worker pool plus the default per-task timeout (spec §4.5:
/// "default 2x logicalCPU" parallelism, "default 5 minutes" timeout).
#[derive(Debug, Clone)]
pub struct ParallelConfig {
    pub max_parallelism: usize,
    pub default_timeout: Duration,
}

impl ParallelConfig {
    pub fn new(max_parallelism: usize, default_timeout: Duration) -> Self {
        let max_parallelism = if max_parallelism == 0 {
            2 * num_cpus()
        } else {
            max_parallelism
        };
        Self {
            max_parallelism,
            default_timeout,
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

/// Runs one wave of independent stages to completion (spec §4.5).
///
/// `timeout_for` supplies a per-stage timeout override (falling back to
/// `config.default_timeout`); `is_fatal` decides whether a given stage's
/// outcome should trigger cancellation of its not-yet-done siblings — a
/// timeout is always fatal (spec: "On timeout of any one task, all
/// siblings in the wave are cancelled"), everything else is left to the
/// caller's failure policy.
pub async fn execute_wave(
    config: &ParallelConfig,
    stage_names: &[String],
    timeout_for: impl Fn(&str) -> Duration,
    task: StageTask,
    is_fatal: impl Fn(&StageResult) -> bool + Send + Sync + 'static,
) -> HashMap<String, StageResult> {
    if stage_names.is_empty() {
        return HashMap::new();
    }

    // Single-stage wave fast path (spec §4.5): execute inline, no pool
    // handoff, timeout still enforced.
    if stage_names.len() == 1 {
        let name = stage_names[0].clone();
        let timeout = timeout_for(&name);
        let result = run_one(name.clone(), timeout, task).await;
        let mut out = HashMap::new();
        out.insert(name, result);
        return out;
    }

    let semaphore = Arc::new(Semaphore::new(config.max_parallelism));
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let is_fatal = Arc::new(is_fatal);

    let mut join_set = tokio::task::JoinSet::new();

    for name in stage_names {
        let name = name.clone();
        let timeout = timeout_for(&name);
        let semaphore = semaphore.clone();
        let task = task.clone();
        let mut cancel_rx = cancel_rx.clone();
        let cancel_tx = cancel_tx.clone();
        let is_fatal = is_fatal.clone();

        join_set.spawn(async move {
            // A sibling may have already failed fatally before this task
            // acquired a worker slot.
            if *cancel_rx.borrow() {
                return StageResult::cancelled(name);
            }

            let _permit = tokio::select! {
                biased;
                _ = cancel_rx.changed() => return StageResult::cancelled(name),
                permit = semaphore.acquire_owned() => permit.expect("semaphore not closed"),
            };

            let started = Instant::now();
            let result = tokio::select! {
                biased;
                _ = cancel_rx.changed() => StageResult::cancelled(name.clone()),
                res = tokio::time::timeout(timeout, task(name.clone())) => match res {
                    Ok(stage_result) => stage_result,
                    Err(_) => {
                        warn!(stage = %name, timeout_secs = timeout.as_secs(), "stage timed out");
                        StageResult::timed_out(name.clone(), started.elapsed().as_millis() as u64)
                    }
                },
            };

            if is_fatal(&result) {
                debug!(stage = %result.stage_name, "fatal stage failure, cancelling siblings");
                let _ = cancel_tx.send(true);
            }

            result
        });
    }

    let mut results = HashMap::with_capacity(stage_names.len());
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok(result) => {
                results.insert(result.stage_name.clone(), result);
            }
            Err(join_err) => {
                warn!(error = %join_err, "stage task panicked");
            }
        }
    }

    results
}

async fn run_one(name: String, timeout: Duration, task: StageTask) -> StageResult {
    let started = Instant::now();
    match tokio::time::timeout(timeout, task(name.clone())).await {
        Ok(result) => result,
        Err(_) => {
            warn!(stage = %name, timeout_secs = timeout.as_secs(), "stage timed out");
            StageResult::timed_out(name, started.elapsed().as_millis() as u64)
        }
    }
}
