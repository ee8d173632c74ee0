//! # lakebench: concurrent query benchmarking for PostgreSQL
//!
//! > **Upload your queries. Pick a concurrency. Read the percentiles.**
//!
//! lakebench takes a catalog of parameterized SQL templates, expands them
//! into concrete executions, runs them against a target database under a
//! bounded concurrency level over a bounded connection pool, and reports
//! latency percentiles, throughput, success rate and a per-query breakdown.
//! The same catalog can instead be handed to `pgbench`.
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use lakebench::prelude::*;
//!
//! let def = QueryDefinition::new("orders_by_id", "SELECT * FROM orders WHERE id = %s")
//!     .parameter_set([1])
//!     .parameter_set([2])
//!     .repeat(20);
//! let (catalog, rejected) = QueryCatalog::from_definitions(vec![def]);
//!
//! let config = RunConfig::load(None)?;
//! let (outcome, _progress) = lakebench::run_in_process(&config, &catalog, &rejected).await?;
//! println!("p95 = {:?}", outcome.report.latency_p95_ms);
//! ```
//!
//! ## Upload annotations
//!
//! | Line                              | Meaning                           |
//! |-----------------------------------|-----------------------------------|
//! | `-- PARAMETERS: [[1, "A"], ...]`  | Parameter sets, one per scenario  |
//! | `-- EXEC_COUNT: 40`               | Repetitions per scenario          |
//! | `-- WEIGHT: 3`                    | pgbench script weight (1..=100)   |
//! | `%s`                              | Positional placeholder            |
//! | `%%`                              | Literal percent sign              |

pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod expander;
pub mod metrics;
pub mod model;
pub mod parser;
pub mod pgbench;
pub mod pool;
pub mod report;
pub mod run;
pub mod scheduler;
pub mod transpiler;

pub use run::{prepare_in_process, run_in_process, run_pgbench};

pub mod prelude {
    pub use crate::catalog::QueryCatalog;
    pub use crate::config::{RunConfig, TargetConfig};
    pub use crate::engine::{PgConnector, QueryConnection, QueryExecutor, QueryFailure};
    pub use crate::error::*;
    pub use crate::expander::Expansion;
    pub use crate::metrics::{AggregateReport, MetricsAggregator, QuerySummary};
    pub use crate::model::{
        ExecutionResult, ExecutionScenario, ParameterSet, ParameterValue, QueryDefinition,
    };
    pub use crate::parser::{parse_annotated, parse_upload, UploadPolicy};
    pub use crate::pgbench::{PgbenchSettings, Protocol};
    pub use crate::pool::{Connector, Pool, PoolConfig, PoolStats, SslMode};
    pub use crate::report::{recommendations, to_markdown, ReportSource};
    pub use crate::run::{BenchmarkRun, ProgressHandle, RunOutcome, RunSettings, RunStatus};
    pub use crate::scheduler::Scheduler;
    pub use crate::transpiler::Template;
}

/// Parse one annotated SQL upload into a validated query definition.
///
/// # Example
///
/// ```
/// let def = lakebench::parse(
///     "orders",
///     "-- PARAMETERS: [[1], [2]]\n-- EXEC_COUNT: 3\nSELECT * FROM orders WHERE id = %s",
/// )
/// .unwrap();
/// assert_eq!(def.parameter_sets.len(), 2);
/// assert_eq!(def.total_executions(), 6);
/// ```
pub fn parse(identifier: &str, text: &str) -> Result<model::QueryDefinition, error::BenchError> {
    parser::parse_annotated(identifier, text)
}
