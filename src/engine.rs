//! Query execution engine.
//!
//! Executes one (template, parameter tuple) pair on one pooled connection,
//! times the round trip and classifies failures. The PostgreSQL side is
//! implemented with sqlx.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::{ConnectOptions, Connection};
use tracing::debug;

use crate::config::TargetConfig;
use crate::error::{BenchError, BenchResult, ErrorKind};
use crate::model::{ExecutionResult, ExecutionScenario, ParameterValue};
use crate::pool::{Connector, Pool, SslMode};
use crate::transpiler::Template;

/// A failed round trip, already classified.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl QueryFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A connection that can run a bound statement.
#[async_trait]
pub trait QueryConnection: Send {
    /// Run `template` with `params` bound to its placeholders and return the
    /// row count.
    async fn execute(
        &mut self,
        template: &Template,
        params: &[ParameterValue],
    ) -> Result<u64, QueryFailure>;
}

/// Runs single executions against a pool.
pub struct QueryExecutor<C: Connector> {
    pool: Pool<C>,
    statement_timeout: Option<Duration>,
}

impl<C: Connector> Clone for QueryExecutor<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            statement_timeout: self.statement_timeout,
        }
    }
}

impl<C> QueryExecutor<C>
where
    C: Connector,
    C::Conn: QueryConnection,
{
    pub fn new(pool: Pool<C>) -> Self {
        Self {
            pool,
            statement_timeout: None,
        }
    }

    /// Abandon a statement that runs longer than `timeout`.
    ///
    /// The connection it ran on is discarded, not returned to the pool.
    pub fn statement_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.statement_timeout = timeout;
        self
    }

    pub fn pool(&self) -> &Pool<C> {
        &self.pool
    }

    /// Execute one repetition of `scenario`. Never fails: every outcome is
    /// an [`ExecutionResult`].
    pub async fn execute(&self, scenario: Arc<ExecutionScenario>) -> ExecutionResult {
        let template = Template::parse(&scenario.query.sql_template);

        let acquire_start = Instant::now();
        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                let waited = elapsed_ms(acquire_start);
                debug!("{}: acquire failed: {}", scenario.scenario_label, e);
                return ExecutionResult::failure(scenario, 0.0, e.kind(), e.to_string(), waited);
            }
        };
        let acquire_wait_ms = elapsed_ms(acquire_start);

        let start = Instant::now();
        let outcome = match self.statement_timeout {
            Some(limit) => {
                let timed =
                    tokio::time::timeout(limit, conn.execute(&template, &scenario.parameter_set))
                        .await;
                match timed {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        let duration_ms = elapsed_ms(start);
                        conn.discard();
                        return ExecutionResult::failure(
                            scenario,
                            duration_ms,
                            ErrorKind::Timeout,
                            format!("statement exceeded {:?}", limit),
                            acquire_wait_ms,
                        );
                    }
                }
            }
            None => conn.execute(&template, &scenario.parameter_set).await,
        };
        let duration_ms = elapsed_ms(start);

        match outcome {
            Ok(rows) => ExecutionResult::success(scenario, duration_ms, rows, acquire_wait_ms),
            Err(failure) => {
                if matches!(failure.kind, ErrorKind::ConnectionError | ErrorKind::Timeout) {
                    conn.discard();
                }
                ExecutionResult::failure(
                    scenario,
                    duration_ms,
                    failure.kind,
                    failure.message,
                    acquire_wait_ms,
                )
            }
        }
    }
}

fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}

/// Opens sqlx PostgreSQL connections for the pool.
pub struct PgConnector {
    options: PgConnectOptions,
}

impl PgConnector {
    pub fn new(target: &TargetConfig, password: Option<&str>) -> Self {
        let mut options = PgConnectOptions::new()
            .host(&target.host)
            .port(target.port)
            .database(&target.database)
            .username(&target.user)
            .ssl_mode(pg_ssl_mode(target.ssl_mode))
            .application_name("lakebench")
            .disable_statement_logging();
        if let Some(password) = password {
            options = options.password(password);
        }
        Self { options }
    }
}

fn pg_ssl_mode(mode: SslMode) -> PgSslMode {
    match mode {
        SslMode::Disable => PgSslMode::Disable,
        SslMode::Prefer => PgSslMode::Prefer,
        SslMode::Require => PgSslMode::Require,
        SslMode::VerifyCa => PgSslMode::VerifyCa,
        SslMode::VerifyFull => PgSslMode::VerifyFull,
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Conn = PgConnection;

    async fn connect(&self) -> BenchResult<PgConnection> {
        PgConnection::connect_with(&self.options)
            .await
            .map_err(|e| BenchError::Connection(e.to_string()))
    }

    async fn ping(&self, conn: &mut PgConnection) -> bool {
        conn.ping().await.is_ok()
    }
}

#[async_trait]
impl QueryConnection for PgConnection {
    async fn execute(
        &mut self,
        template: &Template,
        params: &[ParameterValue],
    ) -> Result<u64, QueryFailure> {
        let (sql, bound) = template.to_bound(params);
        let mut query = sqlx::query(&sql);
        for param in bound {
            query = match param {
                ParameterValue::Null => query.bind(None::<String>),
                ParameterValue::Bool(v) => query.bind(*v),
                ParameterValue::Integer(v) => query.bind(*v),
                ParameterValue::Float(v) => query.bind(*v),
                ParameterValue::Text(v) => query.bind(v.clone()),
                ParameterValue::Timestamp(v) => query.bind(*v),
            };
        }

        query
            .execute(&mut *self)
            .await
            .map(|result| result.rows_affected())
            .map_err(|e| QueryFailure::new(classify_sqlx_error(&e), e.to_string()))
    }
}

/// Map a sqlx error to an execution outcome class.
pub fn classify_sqlx_error(err: &sqlx::Error) -> ErrorKind {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| classify_sqlstate(&code))
            .unwrap_or(ErrorKind::Other),
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ErrorKind::ConnectionError,
        sqlx::Error::PoolTimedOut => ErrorKind::PoolExhausted,
        _ => ErrorKind::Other,
    }
}

/// Classify a PostgreSQL SQLSTATE code.
pub fn classify_sqlstate(code: &str) -> ErrorKind {
    match code {
        // query_canceled, raised by statement_timeout
        "57014" => ErrorKind::Timeout,
        "53300" | "57P01" | "57P02" | "57P03" => ErrorKind::ConnectionError,
        c if c.starts_with("08") => ErrorKind::ConnectionError,
        c if c.starts_with("42") || c.starts_with("28") => ErrorKind::SyntaxOrPermissionError,
        _ => ErrorKind::Other,
    }
}
