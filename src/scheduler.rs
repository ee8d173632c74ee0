//! Concurrency scheduler.
//!
//! Every (scenario, repetition) pair is submitted up front as its own task.
//! A counting gate of `concurrency_level` permits decides how many of them
//! are actually in flight; the gate is independent of pool capacity.
//!
//! On a run timeout the gate is closed. Tasks still waiting for admission see
//! the closed gate and are counted as skipped. Admitted tasks run to their
//! natural outcome.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::engine::{QueryConnection, QueryExecutor};
use crate::expander::Expansion;
use crate::metrics::MetricsAggregator;
use crate::pool::Connector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Executed,
    Skipped,
}

/// What the scheduler observed while running an expansion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleOutcome {
    pub executed: u64,
    pub skipped: u64,
    /// Tasks that ended without producing a result.
    pub lost: u64,
    pub timed_out: bool,
    /// Highest number of simultaneously admitted executions.
    pub peak_in_flight: usize,
}

pub struct Scheduler<C: Connector> {
    executor: QueryExecutor<C>,
    concurrency_level: usize,
    run_timeout: Option<Duration>,
}

impl<C> Scheduler<C>
where
    C: Connector,
    C::Conn: QueryConnection,
{
    pub fn new(executor: QueryExecutor<C>, concurrency_level: usize) -> Self {
        Self {
            executor,
            concurrency_level: concurrency_level.max(1),
            run_timeout: None,
        }
    }

    pub fn run_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.run_timeout = timeout;
        self
    }

    pub fn concurrency_level(&self) -> usize {
        self.concurrency_level
    }

    /// Run every execution of `expansion`, recording into `metrics`.
    pub async fn run(&self, expansion: &Expansion, metrics: Arc<MetricsAggregator>) -> ScheduleOutcome {
        let gate = Arc::new(Semaphore::new(self.concurrency_level));
        let admitted = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut tasks = JoinSet::new();

        info!(
            "Scheduling {} execution(s) across {} scenario(s), concurrency {}",
            expansion.total_executions(),
            expansion.len(),
            self.concurrency_level
        );
        metrics.start();

        for scenario in &expansion.scenarios {
            for _ in 0..scenario.repeat_count {
                let gate = Arc::clone(&gate);
                let admitted = Arc::clone(&admitted);
                let peak = Arc::clone(&peak);
                let metrics = Arc::clone(&metrics);
                let executor = self.executor.clone();
                let scenario = Arc::clone(scenario);

                tasks.spawn(async move {
                    let Ok(permit) = gate.acquire_owned().await else {
                        return Unit::Skipped;
                    };
                    let now = admitted.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    metrics.enter();

                    let result = executor.execute(scenario).await;
                    metrics.record(&result);

                    metrics.exit();
                    admitted.fetch_sub(1, Ordering::SeqCst);
                    drop(permit);
                    Unit::Executed
                });
            }
        }

        let mut outcome = ScheduleOutcome::default();
        let deadline = self
            .run_timeout
            .map(|timeout| tokio::time::Instant::now() + timeout);

        loop {
            let joined = match deadline {
                Some(deadline) if !outcome.timed_out => {
                    tokio::select! {
                        joined = tasks.join_next() => joined,
                        _ = tokio::time::sleep_until(deadline) => {
                            outcome.timed_out = true;
                            gate.close();
                            warn!(
                                "Run timeout reached with {} execution(s) in flight; admission closed",
                                metrics.in_flight()
                            );
                            continue;
                        }
                    }
                }
                _ => tasks.join_next().await,
            };

            match joined {
                None => break,
                Some(Ok(Unit::Executed)) => outcome.executed += 1,
                Some(Ok(Unit::Skipped)) => outcome.skipped += 1,
                Some(Err(e)) => {
                    error!("Execution task ended abnormally: {}", e);
                    outcome.lost += 1;
                }
            }
        }

        metrics.record_skipped(outcome.skipped);
        metrics.finish();
        outcome.peak_in_flight = peak.load(Ordering::SeqCst);

        info!(
            "Run finished: {} executed, {} skipped{}",
            outcome.executed,
            outcome.skipped,
            if outcome.timed_out { " (timed out)" } else { "" }
        );
        outcome
    }
}
