//! Metrics aggregation.
//!
//! Results are folded into an accumulator that only counts and collects
//! durations, so the order in which results arrive never matters. Sorting
//! and percentile selection happen when a snapshot is taken.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::model::ExecutionResult;

/// Summary of one query's executions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuerySummary {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub success_rate: f64,
    pub latency_mean_ms: Option<f64>,
    pub latency_p50_ms: Option<f64>,
    pub latency_p90_ms: Option<f64>,
    pub latency_p95_ms: Option<f64>,
    pub latency_p99_ms: Option<f64>,
    pub latency_min_ms: Option<f64>,
    pub latency_max_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub errors_by_kind: BTreeMap<String, u64>,
}

/// Aggregate statistics for a run, or for the results gathered so far.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    /// Units never admitted because the run timed out. Not failures.
    pub skipped_executions: u64,
    pub success_rate: f64,
    pub throughput_per_second: f64,
    pub elapsed_seconds: f64,
    pub concurrency_level: Option<usize>,
    /// Latency fields are `None` when nothing succeeded.
    pub latency_mean_ms: Option<f64>,
    pub latency_p50_ms: Option<f64>,
    pub latency_p90_ms: Option<f64>,
    pub latency_p95_ms: Option<f64>,
    pub latency_p99_ms: Option<f64>,
    pub latency_min_ms: Option<f64>,
    pub latency_max_ms: Option<f64>,
    pub latency_stddev_ms: Option<f64>,
    /// Mean time spent waiting for a pooled connection.
    pub acquire_wait_mean_ms: Option<f64>,
    #[serde(default)]
    pub errors_by_kind: BTreeMap<String, u64>,
    #[serde(default)]
    pub per_query_breakdown: BTreeMap<String, QuerySummary>,
}

/// Nearest-rank percentile of an ascending slice.
///
/// `pct` is in whole percent. The rank is `ceil(pct * n / 100)`, clamped to
/// `[1, n]`, computed in integers so that e.g. p95 of 40 samples is exactly
/// rank 38.
pub fn nearest_rank(sorted: &[f64], pct: u32) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    let rank = (pct as usize * n).div_ceil(100).clamp(1, n);
    Some(sorted[rank - 1])
}

pub(crate) fn success_rate(successful: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        successful as f64 / total as f64
    }
}

/// Latency statistics over a set of successful durations, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatencyStats {
    pub mean: Option<f64>,
    pub p50: Option<f64>,
    pub p90: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub stddev: Option<f64>,
}

impl LatencyStats {
    pub fn from_durations(durations: &[f64]) -> Self {
        if durations.is_empty() {
            return Self::default();
        }
        let mut sorted = durations.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let n = sorted.len() as f64;
        let mean = sorted.iter().sum::<f64>() / n;
        let variance = sorted.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / n;

        Self {
            mean: Some(mean),
            p50: nearest_rank(&sorted, 50),
            p90: nearest_rank(&sorted, 90),
            p95: nearest_rank(&sorted, 95),
            p99: nearest_rank(&sorted, 99),
            min: sorted.first().copied(),
            max: sorted.last().copied(),
            stddev: Some(variance.sqrt()),
        }
    }
}

/// Running totals for one group of results.
#[derive(Debug, Clone, Default)]
struct Group {
    successful: u64,
    failed: u64,
    durations: Vec<f64>,
    errors: BTreeMap<ErrorKind, u64>,
    acquire_wait_total_ms: f64,
}

impl Group {
    fn add(&mut self, result: &ExecutionResult) {
        self.acquire_wait_total_ms += result.acquire_wait_ms;
        if result.success {
            self.successful += 1;
            self.durations.push(result.duration_ms);
        } else {
            self.failed += 1;
            *self
                .errors
                .entry(result.error_kind.unwrap_or(ErrorKind::Other))
                .or_default() += 1;
        }
    }

    fn merge(&mut self, other: &Group) {
        self.successful += other.successful;
        self.failed += other.failed;
        self.durations.extend_from_slice(&other.durations);
        self.acquire_wait_total_ms += other.acquire_wait_total_ms;
        for (kind, count) in &other.errors {
            *self.errors.entry(*kind).or_default() += count;
        }
    }

    fn total(&self) -> u64 {
        self.successful + self.failed
    }

    fn errors_by_name(&self) -> BTreeMap<String, u64> {
        self.errors
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    fn summary(&self) -> QuerySummary {
        let latency = LatencyStats::from_durations(&self.durations);
        QuerySummary {
            total_executions: self.total(),
            successful_executions: self.successful,
            failed_executions: self.failed,
            success_rate: success_rate(self.successful, self.total()),
            latency_mean_ms: latency.mean,
            latency_p50_ms: latency.p50,
            latency_p90_ms: latency.p90,
            latency_p95_ms: latency.p95,
            latency_p99_ms: latency.p99,
            latency_min_ms: latency.min,
            latency_max_ms: latency.max,
            errors_by_kind: self.errors_by_name(),
        }
    }
}

/// Order-independent fold of execution results.
#[derive(Debug, Clone, Default)]
pub struct Accumulator {
    overall: Group,
    per_query: BTreeMap<String, Group>,
    skipped: u64,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, result: &ExecutionResult) {
        self.overall.add(result);
        self.per_query
            .entry(result.query_identifier().to_string())
            .or_default()
            .add(result);
    }

    pub fn add_skipped(&mut self, count: u64) {
        self.skipped += count;
    }

    /// Combine two partial accumulators.
    pub fn merge(&mut self, other: &Accumulator) {
        self.overall.merge(&other.overall);
        for (id, group) in &other.per_query {
            self.per_query.entry(id.clone()).or_default().merge(group);
        }
        self.skipped += other.skipped;
    }

    pub fn completed(&self) -> u64 {
        self.overall.total()
    }

    /// Build a report for a run that has been going for `elapsed`.
    pub fn report(&self, elapsed: Duration, concurrency_level: Option<usize>) -> AggregateReport {
        let overall = &self.overall;
        let total = overall.total();
        let latency = LatencyStats::from_durations(&overall.durations);
        let secs = elapsed.as_secs_f64();

        AggregateReport {
            total_executions: total,
            successful_executions: overall.successful,
            failed_executions: overall.failed,
            skipped_executions: self.skipped,
            success_rate: success_rate(overall.successful, total),
            throughput_per_second: if secs > 0.0 { total as f64 / secs } else { 0.0 },
            elapsed_seconds: secs,
            concurrency_level,
            latency_mean_ms: latency.mean,
            latency_p50_ms: latency.p50,
            latency_p90_ms: latency.p90,
            latency_p95_ms: latency.p95,
            latency_p99_ms: latency.p99,
            latency_min_ms: latency.min,
            latency_max_ms: latency.max,
            latency_stddev_ms: latency.stddev,
            acquire_wait_mean_ms: (total > 0)
                .then(|| overall.acquire_wait_total_ms / total as f64),
            errors_by_kind: overall.errors_by_name(),
            per_query_breakdown: self
                .per_query
                .iter()
                .map(|(id, group)| (id.clone(), group.summary()))
                .collect(),
        }
    }
}

/// Shared aggregator for a run in flight.
///
/// Completion callbacks from concurrent executions call
/// [`MetricsAggregator::record`]; any observer may take a snapshot at any time.
#[derive(Debug)]
pub struct MetricsAggregator {
    acc: Mutex<Accumulator>,
    /// Set when scheduling begins; connection setup is not timed.
    started: Mutex<Option<Instant>>,
    finished: Mutex<Option<Duration>>,
    in_flight: AtomicU64,
    concurrency_level: Option<usize>,
}

impl MetricsAggregator {
    pub fn new(concurrency_level: Option<usize>) -> Self {
        Self {
            acc: Mutex::new(Accumulator::new()),
            started: Mutex::new(None),
            finished: Mutex::new(None),
            in_flight: AtomicU64::new(0),
            concurrency_level,
        }
    }

    pub fn record(&self, result: &ExecutionResult) {
        self.acc.lock().add(result);
    }

    pub fn record_skipped(&self, count: u64) {
        self.acc.lock().add_skipped(count);
    }

    /// Mark one execution as admitted. Paired with [`Self::exit`].
    pub fn enter(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.acc.lock().completed()
    }

    /// Start the wall clock used for throughput. Later calls are ignored.
    pub fn start(&self) {
        self.started.lock().get_or_insert_with(Instant::now);
    }

    fn elapsed(&self) -> Duration {
        self.started
            .lock()
            .map(|started| started.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    /// Freeze the elapsed time used for throughput.
    pub fn finish(&self) {
        let mut finished = self.finished.lock();
        if finished.is_none() {
            *finished = Some(self.elapsed());
        }
    }

    /// Report over everything recorded so far.
    pub fn snapshot(&self) -> AggregateReport {
        let elapsed = self.finished.lock().unwrap_or_else(|| self.elapsed());
        // Sorting happens on a copy so recorders are not held up.
        let acc = self.acc.lock().clone();
        acc.report(elapsed, self.concurrency_level)
    }
}
