//! Scheduler, pool and run integration tests.
//!
//! Driven by a scripted connector so no database is needed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lakebench::prelude::*;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mode {
    Succeed,
    FailWith(ErrorKind),
    RefuseConnect,
}

#[derive(Default)]
struct Observed {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    executed: AtomicUsize,
    params: Mutex<Vec<Vec<ParameterValue>>>,
}

#[derive(Clone)]
struct ScriptedConnector {
    mode: Mode,
    delay: Duration,
    connect_delay: Duration,
    observed: Arc<Observed>,
}

impl ScriptedConnector {
    fn new(mode: Mode, delay: Duration) -> Self {
        Self {
            mode,
            delay,
            connect_delay: Duration::ZERO,
            observed: Arc::new(Observed::default()),
        }
    }

    fn connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }
}

struct ScriptedConn {
    mode: Mode,
    delay: Duration,
    observed: Arc<Observed>,
}

#[async_trait]
impl Connector for ScriptedConnector {
    type Conn = ScriptedConn;

    async fn connect(&self) -> BenchResult<ScriptedConn> {
        tokio::time::sleep(self.connect_delay).await;
        if self.mode == Mode::RefuseConnect {
            return Err(BenchError::Connection("connection refused".into()));
        }
        Ok(ScriptedConn {
            mode: self.mode,
            delay: self.delay,
            observed: Arc::clone(&self.observed),
        })
    }

    async fn ping(&self, _conn: &mut ScriptedConn) -> bool {
        true
    }
}

#[async_trait]
impl QueryConnection for ScriptedConn {
    async fn execute(
        &mut self,
        _template: &Template,
        params: &[ParameterValue],
    ) -> Result<u64, QueryFailure> {
        let now = self.observed.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.observed.peak.fetch_max(now, Ordering::SeqCst);
        self.observed.params.lock().push(params.to_vec());

        tokio::time::sleep(self.delay).await;

        self.observed.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.observed.executed.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            Mode::FailWith(kind) => Err(QueryFailure::new(kind, "scripted failure")),
            _ => Ok(1),
        }
    }
}

fn catalog(defs: Vec<QueryDefinition>) -> QueryCatalog {
    let (catalog, rejected) = QueryCatalog::from_definitions(defs);
    assert!(rejected.is_empty(), "unexpected rejections: {rejected:?}");
    catalog
}

fn settings(concurrency: usize) -> RunSettings {
    let mut settings = RunSettings::new(concurrency);
    settings.pool = settings.pool.acquire_timeout(Duration::from_secs(5));
    settings
}

#[tokio::test]
async fn scenario_single_set_repeated_under_concurrency_bound() {
    let def = QueryDefinition::new("orders", "SELECT * FROM orders WHERE id = %s AND code = %s AND qty = %s")
        .parameter_set([
            ParameterValue::Integer(1),
            ParameterValue::from("A"),
            ParameterValue::Integer(100),
        ])
        .repeat(40);
    let connector = ScriptedConnector::new(Mode::Succeed, Duration::from_millis(5));
    let observed = Arc::clone(&connector.observed);

    let run = BenchmarkRun::new(&catalog(vec![def]), settings(10));
    let outcome = run.execute(connector).await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.report.total_executions, 40);
    assert_eq!(outcome.report.successful_executions, 40);
    assert_eq!(outcome.report.success_rate, 1.0);
    assert!(observed.peak.load(Ordering::SeqCst) <= 10);
    assert!(outcome.pool_stats.unwrap().peak_active <= 10);

    let params = observed.params.lock();
    assert_eq!(params.len(), 40);
    assert!(params.iter().all(|p| p.len() == 3 && p[1] == ParameterValue::from("A")));
}

#[tokio::test]
async fn scenario_no_parameters() {
    let def = QueryDefinition::new("ping", "SELECT 1").repeat(5);
    let connector = ScriptedConnector::new(Mode::Succeed, Duration::from_millis(1));
    let observed = Arc::clone(&connector.observed);

    let outcome = BenchmarkRun::new(&catalog(vec![def]), settings(4))
        .execute(connector)
        .await;

    assert_eq!(outcome.report.total_executions, 5);
    let params = observed.params.lock();
    assert_eq!(params.len(), 5);
    assert!(params.iter().all(|p| p.is_empty()));
}

#[tokio::test]
async fn scenario_all_connection_errors() {
    let def = QueryDefinition::new("broken", "SELECT 1").repeat(10);
    let connector = ScriptedConnector::new(
        Mode::FailWith(ErrorKind::ConnectionError),
        Duration::from_millis(1),
    );

    let outcome = BenchmarkRun::new(&catalog(vec![def]), settings(5))
        .execute(connector)
        .await;

    let report = &outcome.report;
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(report.failed_executions, 10);
    assert_eq!(report.success_rate, 0.0);
    assert_eq!(report.latency_mean_ms, None);
    assert_eq!(report.latency_p95_ms, None);
    assert_eq!(report.errors_by_kind.get("ConnectionError"), Some(&10));
    // Connections that failed this way are never reused.
    assert_eq!(outcome.pool_stats.unwrap().total_discarded, 10);
}

#[tokio::test]
async fn scenario_run_timeout_skips_unadmitted() {
    let def = QueryDefinition::new("slow", "SELECT pg_sleep(0.3)").repeat(10);
    let connector = ScriptedConnector::new(Mode::Succeed, Duration::from_millis(300));
    let observed = Arc::clone(&connector.observed);

    let mut settings = settings(3);
    settings.run_timeout = Some(Duration::from_millis(100));
    let run = BenchmarkRun::new(&catalog(vec![def]), settings);
    let progress = run.progress();
    let outcome = run.execute(connector).await;

    assert_eq!(outcome.status, RunStatus::TimedOut);
    assert_eq!(outcome.report.total_executions, 3);
    assert_eq!(outcome.report.successful_executions, 3);
    assert_eq!(outcome.report.failed_executions, 0);
    assert_eq!(outcome.report.skipped_executions, 7);
    assert_eq!(observed.executed.load(Ordering::SeqCst), 3);
    assert_eq!(progress.total(), 10);
    assert_eq!(progress.in_flight(), 0);
}

#[tokio::test]
async fn every_scenario_runs_repeat_times() {
    let a = QueryDefinition::new("a", "SELECT %s")
        .parameter_set([1])
        .parameter_set([2])
        .parameter_set([3])
        .repeat(4);
    let b = QueryDefinition::new("b", "SELECT 2").repeat(2);
    let catalog = catalog(vec![a, b]);

    let expansion = Expansion::from_catalog(&catalog);
    assert_eq!(expansion.len(), 4);
    assert_eq!(expansion.total_executions(), 14);

    let connector = ScriptedConnector::new(Mode::Succeed, Duration::ZERO);
    let outcome = BenchmarkRun::new(&catalog, settings(8)).execute(connector).await;

    let report = &outcome.report;
    assert_eq!(report.total_executions, 14);
    assert_eq!(report.per_query_breakdown["a"].total_executions, 12);
    assert_eq!(report.per_query_breakdown["b"].total_executions, 2);
}

#[tokio::test]
async fn pool_never_exceeds_capacity() {
    let def = QueryDefinition::new("q", "SELECT 1").repeat(40);
    let connector = ScriptedConnector::new(Mode::Succeed, Duration::from_millis(5));
    let observed = Arc::clone(&connector.observed);

    let config = PoolConfig::for_concurrency(20)
        .base_size(1)
        .max_overflow(3)
        .acquire_timeout(Duration::from_secs(5));
    let pool = Pool::connect(connector, config).await.unwrap();
    let scheduler = Scheduler::new(QueryExecutor::new(pool.clone()), 20);
    let metrics = Arc::new(MetricsAggregator::new(Some(20)));

    let expansion = Expansion::from_catalog(&catalog(vec![def]));
    let outcome = scheduler.run(&expansion, Arc::clone(&metrics)).await;

    assert_eq!(outcome.executed, 40);
    assert!(outcome.peak_in_flight <= 20);
    assert!(observed.peak.load(Ordering::SeqCst) <= 4);
    assert!(pool.stats().peak_active <= 4);
    assert_eq!(metrics.snapshot().successful_executions, 40);
}

#[tokio::test]
async fn pool_exhaustion_is_a_failed_execution() {
    let def = QueryDefinition::new("q", "SELECT 1").repeat(4);
    let connector = ScriptedConnector::new(Mode::Succeed, Duration::from_millis(200));

    let mut settings = RunSettings::new(4);
    settings.pool = PoolConfig::for_concurrency(4)
        .base_size(1)
        .max_overflow(0)
        .acquire_timeout(Duration::from_millis(20));
    let outcome = BenchmarkRun::new(&catalog(vec![def]), settings)
        .execute(connector)
        .await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.report.total_executions, 4);
    assert_eq!(outcome.report.successful_executions, 1);
    assert_eq!(outcome.report.errors_by_kind.get("PoolExhausted"), Some(&3));
}

#[tokio::test]
async fn statement_timeout_discards_connection() {
    let def = QueryDefinition::new("q", "SELECT 1").repeat(3);
    let connector = ScriptedConnector::new(Mode::Succeed, Duration::from_millis(200));

    let mut settings = settings(3);
    settings.statement_timeout = Some(Duration::from_millis(20));
    let outcome = BenchmarkRun::new(&catalog(vec![def]), settings)
        .execute(connector)
        .await;

    assert_eq!(outcome.report.errors_by_kind.get("Timeout"), Some(&3));
    assert_eq!(outcome.pool_stats.unwrap().total_discarded, 3);
}

#[tokio::test]
async fn unreachable_target_fails_the_run() {
    let def = QueryDefinition::new("q", "SELECT 1").repeat(3);
    let connector = ScriptedConnector::new(Mode::RefuseConnect, Duration::ZERO);

    let outcome = BenchmarkRun::new(&catalog(vec![def]), settings(2))
        .execute(connector)
        .await;

    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(outcome.error.unwrap().contains("connection refused"));
    assert_eq!(outcome.report.total_executions, 0);
    assert!(outcome.pool_stats.is_none());
}

#[tokio::test]
async fn rejected_sources_are_reported() {
    let good = QueryDefinition::new("good", "SELECT 1");
    let bad = QueryDefinition::new("bad", "SELECT %s");
    let (catalog, rejected) = QueryCatalog::from_definitions(vec![good, bad]);
    assert_eq!(catalog.len(), 1);
    assert_eq!(rejected.len(), 1);

    let connector = ScriptedConnector::new(Mode::Succeed, Duration::ZERO);
    let outcome = BenchmarkRun::new(&catalog, settings(1))
        .with_rejected(&rejected)
        .execute(connector)
        .await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.report.total_executions, 1);
    assert_eq!(outcome.rejected_sources.len(), 1);
    assert!(outcome.rejected_sources[0].contains("'bad'"));
}

#[tokio::test]
async fn null_and_text_parameters_reach_the_connection() {
    let def = lakebench::parse(
        "mixed",
        "-- PARAMETERS: [[null, \"2024-01-05\", 3]]\nSELECT * FROM t WHERE id = %s AND d = %s AND n = %s",
    )
    .unwrap();
    let connector = ScriptedConnector::new(Mode::Succeed, Duration::ZERO);
    let observed = Arc::clone(&connector.observed);

    let outcome = BenchmarkRun::new(&catalog(vec![def]), settings(1))
        .execute(connector)
        .await;

    assert_eq!(outcome.report.successful_executions, 1);
    let params = observed.params.lock();
    assert_eq!(
        params[0],
        vec![
            ParameterValue::Null,
            ParameterValue::from("2024-01-05"),
            ParameterValue::Integer(3),
        ]
    );
}

#[tokio::test]
async fn stalled_connect_fails_within_acquire_timeout() {
    let def = QueryDefinition::new("q", "SELECT 1").repeat(3);
    let connector = ScriptedConnector::new(Mode::Succeed, Duration::ZERO)
        .connect_delay(Duration::from_secs(2));

    let config = PoolConfig::for_concurrency(3).acquire_timeout(Duration::from_millis(50));
    let pool = Pool::new(connector, config);
    let scheduler = Scheduler::new(QueryExecutor::new(pool), 3);
    let metrics = Arc::new(MetricsAggregator::new(Some(3)));
    let expansion = Expansion::from_catalog(&catalog(vec![def]));

    let started = Instant::now();
    let outcome = scheduler.run(&expansion, Arc::clone(&metrics)).await;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(outcome.executed, 3);
    let report = metrics.snapshot();
    assert_eq!(report.failed_executions, 3);
    assert_eq!(report.errors_by_kind.get("ConnectionError"), Some(&3));
}

#[tokio::test]
async fn stalled_first_connect_fails_the_run() {
    let def = QueryDefinition::new("q", "SELECT 1");
    let connector = ScriptedConnector::new(Mode::Succeed, Duration::ZERO)
        .connect_delay(Duration::from_secs(2));

    let mut settings = RunSettings::new(1);
    settings.pool = settings.pool.acquire_timeout(Duration::from_millis(50));
    let started = Instant::now();
    let outcome = BenchmarkRun::new(&catalog(vec![def]), settings)
        .execute(connector)
        .await;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.report.total_executions, 0);
}

#[tokio::test]
async fn throughput_excludes_connection_setup() {
    let def = QueryDefinition::new("q", "SELECT 1").repeat(5);
    let connector = ScriptedConnector::new(Mode::Succeed, Duration::ZERO)
        .connect_delay(Duration::from_millis(300));

    let outcome = BenchmarkRun::new(&catalog(vec![def]), settings(1))
        .execute(connector)
        .await;

    assert_eq!(outcome.report.successful_executions, 5);
    assert!(outcome.report.elapsed_seconds < 0.25);
}
