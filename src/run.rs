//! Run context.
//!
//! A [`BenchmarkRun`] owns everything one benchmark needs: the expanded
//! scenarios, its own connection pool and its metrics. Nothing is shared
//! between runs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::catalog::QueryCatalog;
use crate::config::RunConfig;
use crate::engine::{PgConnector, QueryConnection, QueryExecutor};
use crate::error::{BenchError, BenchResult};
use crate::expander::Expansion;
use crate::metrics::{AggregateReport, MetricsAggregator};
use crate::pgbench::{self, ToolOutput};
use crate::pool::{Connector, Pool, PoolConfig, PoolStats};
use crate::report::{recommendations, ReportSource};
use crate::scheduler::Scheduler;

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    TimedOut,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

/// Final response of a run. Failed and timed out runs still carry whatever
/// was gathered before they ended.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub report: AggregateReport,
    pub error: Option<String>,
    /// Query sources rejected before the run.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rejected_sources: Vec<String>,
    pub recommendations: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_stats: Option<PoolStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_output: Option<ToolOutput>,
}

/// Pull-based view of a run in flight.
#[derive(Debug, Clone)]
pub struct ProgressHandle {
    metrics: Arc<MetricsAggregator>,
    total: u64,
}

impl ProgressHandle {
    /// Report over the results recorded so far.
    pub fn snapshot(&self) -> AggregateReport {
        self.metrics.snapshot()
    }

    pub fn completed(&self) -> u64 {
        self.metrics.completed()
    }

    pub fn in_flight(&self) -> u64 {
        self.metrics.in_flight()
    }

    /// Executions planned for the whole run.
    pub fn total(&self) -> u64 {
        self.total
    }
}

/// Knobs of an in-process run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub concurrency_level: usize,
    pub pool: PoolConfig,
    pub run_timeout: Option<Duration>,
    pub statement_timeout: Option<Duration>,
}

impl RunSettings {
    pub fn new(concurrency_level: usize) -> Self {
        let concurrency_level = concurrency_level.max(1);
        Self {
            concurrency_level,
            pool: PoolConfig::for_concurrency(concurrency_level),
            run_timeout: None,
            statement_timeout: None,
        }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            concurrency_level: config.concurrency_level.max(1),
            pool: config.pool_config(),
            run_timeout: config.run_timeout(),
            statement_timeout: config.statement_timeout(),
        }
    }
}

/// One in-process benchmark run.
pub struct BenchmarkRun {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    expansion: Expansion,
    metrics: Arc<MetricsAggregator>,
    settings: RunSettings,
    rejected: Vec<String>,
}

impl BenchmarkRun {
    pub fn new(catalog: &QueryCatalog, settings: RunSettings) -> Self {
        let expansion = Expansion::from_catalog(catalog);
        let metrics = Arc::new(MetricsAggregator::new(Some(settings.concurrency_level)));
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            expansion,
            metrics,
            settings,
            rejected: Vec::new(),
        }
    }

    /// Attach the validation errors of sources that were left out.
    pub fn with_rejected(mut self, errors: &[BenchError]) -> Self {
        self.rejected = errors.iter().map(|e| e.to_string()).collect();
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn expansion(&self) -> &Expansion {
        &self.expansion
    }

    pub fn progress(&self) -> ProgressHandle {
        ProgressHandle {
            metrics: Arc::clone(&self.metrics),
            total: self.expansion.total_executions(),
        }
    }

    fn outcome(
        &self,
        status: RunStatus,
        error: Option<String>,
        pool_stats: Option<PoolStats>,
    ) -> RunOutcome {
        let report = self.metrics.snapshot();
        let recommendations = match status {
            RunStatus::Failed => Vec::new(),
            _ => recommendations(&report, ReportSource::InProcess),
        };
        RunOutcome {
            run_id: self.run_id,
            status,
            started_at: self.started_at,
            report,
            error,
            rejected_sources: self.rejected.clone(),
            recommendations,
            pool_stats,
            tool_output: None,
        }
    }

    /// Open the pool and run every scenario.
    ///
    /// Failing to open the first connection ends the run as failed. Every
    /// other failure is recorded on its execution.
    pub async fn execute<C>(self, connector: C) -> RunOutcome
    where
        C: Connector,
        C::Conn: QueryConnection,
    {
        if self.expansion.is_empty() {
            self.metrics.finish();
            return self.outcome(
                RunStatus::Failed,
                Some("no valid query definitions to run".to_string()),
                None,
            );
        }

        info!(
            "Run {}: {} scenario(s), {} execution(s)",
            self.run_id,
            self.expansion.len(),
            self.expansion.total_executions()
        );

        let pool = match Pool::connect(connector, self.settings.pool.clone()).await {
            Ok(pool) => pool,
            Err(e) => {
                error!("Run {}: cannot connect: {}", self.run_id, e);
                self.metrics.finish();
                return self.outcome(RunStatus::Failed, Some(e.to_string()), None);
            }
        };

        let executor = QueryExecutor::new(pool.clone())
            .statement_timeout(self.settings.statement_timeout);
        let scheduler = Scheduler::new(executor, self.settings.concurrency_level)
            .run_timeout(self.settings.run_timeout);
        let scheduled = scheduler
            .run(&self.expansion, Arc::clone(&self.metrics))
            .await;

        let stats = pool.stats();
        pool.close();

        if scheduled.lost > 0 {
            warn!("Run {}: {} execution(s) lost", self.run_id, scheduled.lost);
        }

        if scheduled.timed_out {
            self.outcome(
                RunStatus::TimedOut,
                Some(format!(
                    "run timeout exceeded; {} execution(s) skipped",
                    scheduled.skipped
                )),
                Some(stats),
            )
        } else {
            self.outcome(RunStatus::Completed, None, Some(stats))
        }
    }
}

/// Build an in-process run against the configured PostgreSQL target without
/// starting it, so the caller can take a [`ProgressHandle`] first.
///
/// Errors are configuration problems found before the run starts.
pub fn prepare_in_process(
    config: &RunConfig,
    catalog: &QueryCatalog,
    rejected: &[BenchError],
) -> BenchResult<(BenchmarkRun, PgConnector)> {
    config.validate()?;
    let password = config.target.password()?;
    let connector = PgConnector::new(&config.target, password.as_deref());
    let run = BenchmarkRun::new(catalog, RunSettings::from_config(config)).with_rejected(rejected);
    Ok((run, connector))
}

/// Run the catalog in-process against the configured PostgreSQL target.
pub async fn run_in_process(
    config: &RunConfig,
    catalog: &QueryCatalog,
    rejected: &[BenchError],
) -> BenchResult<(RunOutcome, ProgressHandle)> {
    let (run, connector) = prepare_in_process(config, catalog, rejected)?;
    let progress = run.progress();
    Ok((run.execute(connector).await, progress))
}

/// Run the catalog through pgbench.
///
/// Launch failures and unreadable output end the run as failed; raw tool
/// output is kept on the outcome.
pub async fn run_pgbench(
    config: &RunConfig,
    catalog: &QueryCatalog,
    rejected: &[BenchError],
) -> BenchResult<RunOutcome> {
    config.pgbench.validate()?;
    let password = config.target.password()?;
    let started_at = Utc::now();
    let run_id = Uuid::new_v4();
    let rejected_sources: Vec<String> = rejected.iter().map(|e| e.to_string()).collect();

    let failed = |error: String, tool_output: Option<ToolOutput>| RunOutcome {
        run_id,
        status: RunStatus::Failed,
        started_at,
        report: AggregateReport::default(),
        error: Some(error),
        rejected_sources: rejected_sources.clone(),
        recommendations: Vec::new(),
        pool_stats: None,
        tool_output,
    };

    info!("Run {}: pgbench with {} query(ies)", run_id, catalog.len());
    let result = pgbench::run(
        catalog.queries(),
        &config.pgbench,
        &config.target,
        password.as_deref(),
    )
    .await;

    Ok(match result {
        Ok(run) => RunOutcome {
            run_id,
            status: RunStatus::Completed,
            started_at,
            recommendations: recommendations(&run.report, ReportSource::Pgbench),
            report: run.report,
            error: None,
            rejected_sources: rejected_sources.clone(),
            pool_stats: None,
            tool_output: Some(run.output),
        },
        Err(BenchError::ReportParse {
            message,
            stdout,
            stderr,
            exit_code,
        }) => {
            error!("Run {}: {}", run_id, message);
            failed(
                message,
                Some(ToolOutput {
                    stdout,
                    stderr,
                    exit_code,
                }),
            )
        }
        Err(e) => {
            error!("Run {}: {}", run_id, e);
            failed(e.to_string(), None)
        }
    })
}
