//! pgbench adapter.
//!
//! Writes one pgbench script per query definition, runs pgbench as a
//! subprocess and folds its textual summary into an [`AggregateReport`].
//!
//! Integer parameters become `\set pN random(min, max)` directives over the
//! range declared by the parameter sets. Other values are inlined as SQL
//! literals taken from the first set.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::sync::Arc;

use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{space0, space1, u64 as dec_u64},
    combinator::{map, opt, rest},
    number::complete::double,
    sequence::{preceded, terminated, tuple},
    IResult,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::TargetConfig;
use crate::error::{BenchError, BenchResult, ErrorKind};
use crate::metrics::{success_rate, AggregateReport, LatencyStats, QuerySummary};
use crate::model::QueryDefinition;
use crate::transpiler::Template;

/// z-scores used to estimate percentiles from mean and standard deviation.
const Z_P90: f64 = 1.2816;
const Z_P95: f64 = 1.645;
const Z_P99: f64 = 2.326;

/// pgbench query protocol (`-M`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Prepared,
    Extended,
    Simple,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prepared => "prepared",
            Self::Extended => "extended",
            Self::Simple => "simple",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "prepared" => Ok(Self::Prepared),
            "extended" => Ok(Self::Extended),
            "simple" => Ok(Self::Simple),
            other => Err(format!(
                "unknown protocol '{}', expected prepared, extended or simple",
                other
            )),
        }
    }
}

/// The `[pgbench]` section of the run configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PgbenchSettings {
    /// Executable to launch.
    pub binary: String,
    pub clients: u32,
    /// Worker threads. Defaults to `min(clients, 8)`.
    pub jobs: Option<u32>,
    pub duration_secs: Option<u64>,
    pub transactions_per_client: Option<u64>,
    pub progress_interval_secs: Option<u64>,
    pub protocol: Protocol,
    /// Throttle to this many transactions per second (`-R`).
    pub target_tps: Option<u64>,
    pub per_statement_latency: bool,
    /// Write per-transaction logs (`-l`) and derive percentiles from them.
    pub transaction_log: bool,
    pub connect_per_transaction: bool,
}

impl Default for PgbenchSettings {
    fn default() -> Self {
        Self {
            binary: "pgbench".to_string(),
            clients: 8,
            jobs: None,
            duration_secs: None,
            transactions_per_client: None,
            progress_interval_secs: None,
            protocol: Protocol::Prepared,
            target_tps: None,
            per_statement_latency: true,
            transaction_log: true,
            connect_per_transaction: false,
        }
    }
}

impl PgbenchSettings {
    /// Duration used when neither a duration nor a transaction count is set.
    pub const DEFAULT_DURATION_SECS: u64 = 30;

    pub fn jobs(&self) -> u32 {
        self.jobs.unwrap_or_else(|| self.clients.min(8))
    }

    pub fn validate(&self) -> BenchResult<()> {
        if self.binary.trim().is_empty() {
            return Err(BenchError::Config("pgbench.binary must not be empty".into()));
        }
        if self.clients == 0 {
            return Err(BenchError::Config("pgbench.clients must be at least 1".into()));
        }
        let jobs = self.jobs();
        if jobs == 0 || jobs > self.clients {
            return Err(BenchError::Config(format!(
                "pgbench.jobs ({}) must be between 1 and clients ({})",
                jobs, self.clients
            )));
        }
        if self.duration_secs.is_some() && self.transactions_per_client.is_some() {
            return Err(BenchError::Config(
                "set either pgbench.duration_secs or pgbench.transactions_per_client, not both"
                    .into(),
            ));
        }
        if self.duration_secs == Some(0) || self.transactions_per_client == Some(0) {
            return Err(BenchError::Config(
                "pgbench duration and transaction count must be positive".into(),
            ));
        }
        if self.progress_interval_secs == Some(0) || self.target_tps == Some(0) {
            return Err(BenchError::Config(
                "pgbench progress interval and target rate must be positive".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Scripts
// ============================================================================

/// A pgbench script written for one query definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptFile {
    pub query_identifier: String,
    pub path: PathBuf,
    pub weight: u32,
}

/// Render a definition as pgbench script text.
pub fn render_script(def: &QueryDefinition) -> String {
    let template = Template::parse(&def.sql_template);
    let mut directives = Vec::new();
    let mut args = Vec::new();

    for position in 0..template.placeholder_count() {
        let column: Vec<_> = def
            .parameter_sets
            .iter()
            .filter_map(|set| set.get(position))
            .collect();
        let ints: Vec<i64> = column.iter().filter_map(|v| v.as_integer()).collect();

        if !ints.is_empty() && ints.len() == def.parameter_sets.len() {
            let name = format!("p{}", position + 1);
            let min = ints.iter().min().copied().unwrap_or_default();
            let max = ints.iter().max().copied().unwrap_or_default();
            directives.push(format!("\\set {} random({}, {})", name, min, max));
            args.push(format!(":{}", name));
        } else {
            args.push(
                column
                    .first()
                    .map(|v| v.to_sql_literal())
                    .unwrap_or_else(|| "NULL".to_string()),
            );
        }
    }

    let sql = template.to_pgbench(&args);
    let statement = format!("{};", sql.trim().trim_end_matches(';').trim_end());

    let mut body = String::new();
    for directive in &directives {
        body.push_str(directive);
        body.push('\n');
    }
    body.push_str(&statement);
    body.push('\n');
    body
}

fn script_file_name(index: usize, identifier: &str) -> String {
    let safe: String = identifier
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("query_{}_{}.sql", index, safe)
}

/// Write one script per definition into `dir`.
pub fn write_scripts(queries: &[Arc<QueryDefinition>], dir: &Path) -> BenchResult<Vec<ScriptFile>> {
    if queries.is_empty() {
        return Err(BenchError::validation("pgbench", "no queries to run"));
    }

    let mut scripts = Vec::with_capacity(queries.len());
    for (index, def) in queries.iter().enumerate() {
        let body = render_script(def);
        let path = dir.join(script_file_name(index, &def.identifier));
        std::fs::write(&path, body)?;
        let weight = def.weight.unwrap_or(1);
        debug!("Wrote pgbench script {} (weight {})", path.display(), weight);
        scripts.push(ScriptFile {
            query_identifier: def.identifier.clone(),
            path,
            weight,
        });
    }
    Ok(scripts)
}

// ============================================================================
// Command
// ============================================================================

/// A fully resolved pgbench invocation.
#[derive(Debug, Clone)]
pub struct PgbenchCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub workdir: PathBuf,
}

impl PgbenchCommand {
    pub fn build(
        settings: &PgbenchSettings,
        scripts: &[ScriptFile],
        target: &TargetConfig,
        password: Option<&str>,
        workdir: &Path,
    ) -> Self {
        let mut args = vec![
            "-n".to_string(),
            "-c".to_string(),
            settings.clients.to_string(),
            "-j".to_string(),
            settings.jobs().to_string(),
        ];

        match (settings.duration_secs, settings.transactions_per_client) {
            (Some(secs), _) => args.extend(["-T".to_string(), secs.to_string()]),
            (None, Some(count)) => args.extend(["-t".to_string(), count.to_string()]),
            (None, None) => args.extend([
                "-T".to_string(),
                PgbenchSettings::DEFAULT_DURATION_SECS.to_string(),
            ]),
        }
        if let Some(interval) = settings.progress_interval_secs {
            args.extend(["-P".to_string(), interval.to_string()]);
        }
        args.extend(["-M".to_string(), settings.protocol.to_string()]);
        if let Some(rate) = settings.target_tps {
            args.extend(["-R".to_string(), rate.to_string()]);
        }
        if settings.per_statement_latency {
            args.push("-r".to_string());
        }
        if settings.transaction_log {
            args.push("-l".to_string());
        }
        if settings.connect_per_transaction {
            args.push("-C".to_string());
        }
        for script in scripts {
            args.push("-f".to_string());
            args.push(format!("{}@{}", script.path.display(), script.weight));
        }

        let mut env = vec![
            ("PGHOST".to_string(), target.host.clone()),
            ("PGPORT".to_string(), target.port.to_string()),
            ("PGDATABASE".to_string(), target.database.clone()),
            ("PGUSER".to_string(), target.user.clone()),
            ("PGSSLMODE".to_string(), target.ssl_mode.as_str().to_string()),
            ("PGAPPNAME".to_string(), "lakebench".to_string()),
        ];
        if let Some(password) = password {
            env.push(("PGPASSWORD".to_string(), password.to_string()));
        }

        Self {
            program: settings.binary.clone(),
            args,
            env,
            workdir: workdir.to_path_buf(),
        }
    }

    /// Command line for logs. Environment (and so the password) is omitted.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured output of the external tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Launch pgbench and wait for it to exit.
///
/// Fails only if the process cannot be started. A non-zero exit is returned
/// as output so the caller can still inspect it.
pub async fn execute(command: &PgbenchCommand) -> BenchResult<ToolOutput> {
    info!("Launching: {}", command.command_line());
    let output = tokio::process::Command::new(&command.program)
        .args(&command.args)
        .envs(command.env.iter().cloned())
        .current_dir(&command.workdir)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| BenchError::ToolLaunch {
            program: command.program.clone(),
            message: e.to_string(),
        })?;

    let result = ToolOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code(),
    };
    debug!(
        "pgbench exited with {:?} ({} bytes stdout, {} bytes stderr)",
        result.exit_code,
        result.stdout.len(),
        result.stderr.len()
    );
    Ok(result)
}

// ============================================================================
// Output parsing
// ============================================================================

/// One line of the per-statement latency section.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatementLatency {
    pub latency_ms: f64,
    pub failures: Option<u64>,
    pub statement: String,
}

/// Per-script block printed when more than one script runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScriptSummary {
    /// 1-based script number.
    pub index: usize,
    pub name: String,
    pub weight: Option<u64>,
    pub transactions: Option<u64>,
    pub failed_transactions: Option<u64>,
    pub tps: Option<f64>,
    pub latency_average_ms: Option<f64>,
    pub latency_stddev_ms: Option<f64>,
    pub statements: Vec<StatementLatency>,
}

/// A `progress:` line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSample {
    pub elapsed_secs: f64,
    pub tps: f64,
    pub latency_ms: Option<f64>,
    pub stddev_ms: Option<f64>,
}

/// Everything read from pgbench's final summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PgbenchSummary {
    pub tps: f64,
    pub clients: Option<u64>,
    pub duration_secs: Option<f64>,
    pub transactions_processed: Option<u64>,
    pub failed_transactions: Option<u64>,
    pub latency_average_ms: Option<f64>,
    pub latency_stddev_ms: Option<f64>,
    pub statements: Vec<StatementLatency>,
    pub scripts: Vec<ScriptSummary>,
    pub progress: Vec<ProgressSample>,
}

fn assignment<'a>(key: &'static str, input: &'a str) -> IResult<&'a str, f64> {
    preceded(
        tuple((tag(key), space0, alt((tag("="), tag(":"))), space0)),
        double,
    )(input)
}

fn count<'a>(key: &'static str, input: &'a str) -> IResult<&'a str, u64> {
    preceded(tuple((tag(key), tag(":"), space0)), dec_u64)(input)
}

fn script_header(input: &str) -> IResult<&str, (u64, &str)> {
    tuple((
        preceded(tag("SQL script "), dec_u64),
        preceded(tuple((tag(":"), space0)), rest),
    ))(input)
}

/// `523 transactions (50.1% of total, tps = 52.3)`
fn script_transactions(input: &str) -> IResult<&str, u64> {
    terminated(dec_u64, tuple((space1, tag("transactions"))))(input)
}

fn statement_line(input: &str, with_failures: bool) -> Option<StatementLatency> {
    let parsed: IResult<&str, (f64, Option<u64>)> = if with_failures {
        tuple((terminated(double, space1), opt(terminated(dec_u64, space1))))(input)
    } else {
        map(terminated(double, space1), |latency| (latency, None))(input)
    };
    let (text, (latency_ms, failures)) = parsed.ok()?;
    let statement = text.trim();
    if statement.is_empty() {
        return None;
    }
    Some(StatementLatency {
        latency_ms,
        failures,
        statement: statement.to_string(),
    })
}

/// `progress: 5.0 s, 1234.5 tps, lat 0.123 ms stddev 0.456, 0 failed`
pub fn parse_progress_line(line: &str) -> Option<ProgressSample> {
    fn inner(input: &str) -> IResult<&str, ProgressSample> {
        let (input, _) = tuple((tag("progress:"), space0))(input)?;
        let (input, elapsed_secs) = terminated(double, tuple((space0, tag("s,"), space0)))(input)?;
        let (input, tps) = terminated(double, tuple((space0, tag("tps"))))(input)?;
        let (input, latency_ms) =
            opt(preceded(tuple((tag(","), space0, tag("lat"), space1)), double))(input)?;
        let (input, stddev_ms) =
            opt(preceded(tuple((space0, tag("ms"), space0, tag("stddev"), space1)), double))(input)?;
        Ok((
            input,
            ProgressSample {
                elapsed_secs,
                tps,
                latency_ms,
                stddev_ms,
            },
        ))
    }
    inner(line.trim()).ok().map(|(_, sample)| sample)
}

/// Parse pgbench's summary.
///
/// Progress lines are read from both streams since pgbench writes them to
/// stderr. A summary without a `tps` line is a parse error carrying the raw
/// output.
pub fn parse_output(stdout: &str, stderr: &str) -> BenchResult<PgbenchSummary> {
    let mut summary = PgbenchSummary::default();
    let mut tps: Option<f64> = None;
    let mut current_script: Option<usize> = None;
    let mut in_statements: Option<bool> = None;

    for raw in stdout.lines() {
        let line = raw.trim();
        if line.is_empty() {
            in_statements = None;
            continue;
        }

        if let Some(with_failures) = in_statements {
            if let Some(stmt) = statement_line(line, with_failures) {
                match current_script.and_then(|i| summary.scripts.get_mut(i)) {
                    Some(script) => script.statements.push(stmt),
                    None => summary.statements.push(stmt),
                }
                continue;
            }
            in_statements = None;
        }

        if let Some(sample) = parse_progress_line(line) {
            summary.progress.push(sample);
            continue;
        }

        if let Ok((_, (index, name))) = script_header(line) {
            summary.scripts.push(ScriptSummary {
                index: index as usize,
                name: name.trim().to_string(),
                ..Default::default()
            });
            current_script = Some(summary.scripts.len() - 1);
            continue;
        }

        let (scoped, body) = match line.strip_prefix("- ") {
            Some(body) => (true, body),
            None => (false, line),
        };

        if body.contains("statement latencies in milliseconds") {
            if !scoped {
                current_script = None;
            }
            in_statements = Some(body.contains("failures"));
            continue;
        }

        if scoped && let Some(script) = current_script.and_then(|i| summary.scripts.get_mut(i)) {
            if let Ok((tail, n)) = script_transactions(body) {
                script.transactions = Some(n);
                script.tps = tail
                    .find("tps")
                    .and_then(|at| assignment("tps", &tail[at..]).ok())
                    .map(|(_, v)| v);
            } else if let Ok((_, n)) = count("number of failed transactions", body) {
                script.failed_transactions = Some(n);
            } else if let Ok((_, v)) = assignment("latency average", body) {
                script.latency_average_ms = Some(v);
            } else if let Ok((_, v)) = assignment("latency stddev", body) {
                script.latency_stddev_ms = Some(v);
            } else if let Ok((_, n)) = count("weight", body) {
                script.weight = Some(n);
            }
            continue;
        }

        current_script = None;
        if let Ok((_, v)) = assignment("tps", body) {
            // Older releases print the rate twice; prefer the one that
            // excludes connection setup.
            if tps.is_none() || body.contains("excluding") {
                tps = Some(v);
            }
        } else if let Ok((_, n)) = count("number of transactions actually processed", body) {
            summary.transactions_processed = Some(n);
        } else if let Ok((_, n)) = count("number of failed transactions", body) {
            summary.failed_transactions = Some(n);
        } else if let Ok((_, v)) = assignment("latency average", body) {
            summary.latency_average_ms = Some(v);
        } else if let Ok((_, v)) = assignment("latency stddev", body) {
            summary.latency_stddev_ms = Some(v);
        } else if let Ok((_, n)) = count("number of clients", body) {
            summary.clients = Some(n);
        } else if let Ok((_, v)) = assignment("duration", body) {
            summary.duration_secs = Some(v);
        }
    }

    summary
        .progress
        .extend(stderr.lines().filter_map(parse_progress_line));

    match tps {
        Some(tps) => {
            summary.tps = tps;
            Ok(summary)
        }
        None => Err(BenchError::report_parse(
            "no 'tps = ' line in pgbench output",
            stdout,
            stderr,
        )),
    }
}

/// One transaction from a `-l` log file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogSample {
    /// 0-based script number.
    pub script: usize,
    pub latency_ms: f64,
}

/// Parse a pgbench transaction log.
///
/// Lines are `client_id transaction_no time script_no time_epoch time_us`,
/// with `time` in microseconds. Skipped and failed transactions are ignored.
pub fn parse_transaction_log(content: &str) -> Vec<LogSample> {
    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            let micros: f64 = fields[2].parse().ok()?;
            let script: usize = fields[3].parse().ok()?;
            Some(LogSample {
                script,
                latency_ms: micros / 1000.0,
            })
        })
        .collect()
}

/// Read every `pgbench_log.*` file in `dir`.
pub fn collect_transaction_logs(dir: &Path) -> BenchResult<Vec<LogSample>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("pgbench_log"))
        })
        .collect();
    files.sort();

    let mut samples = Vec::new();
    for file in &files {
        let content = std::fs::read_to_string(file)?;
        let parsed = parse_transaction_log(&content);
        debug!("Read {} transaction(s) from {}", parsed.len(), file.display());
        samples.extend(parsed);
    }
    Ok(samples)
}

// ============================================================================
// Report
// ============================================================================

/// Latency statistics from log samples when available, otherwise estimated
/// from the printed mean and standard deviation.
fn latency_stats(average: Option<f64>, stddev: Option<f64>, samples: &[f64]) -> LatencyStats {
    if !samples.is_empty() {
        return LatencyStats::from_durations(samples);
    }
    let estimate = |z: f64| average.zip(stddev).map(|(mean, sd)| mean + z * sd);
    LatencyStats {
        mean: average,
        stddev,
        p90: estimate(Z_P90),
        p95: estimate(Z_P95),
        p99: estimate(Z_P99),
        ..Default::default()
    }
}

fn errors_for(failed: u64) -> BTreeMap<String, u64> {
    let mut errors = BTreeMap::new();
    if failed > 0 {
        errors.insert(ErrorKind::Other.to_string(), failed);
    }
    errors
}

fn query_summary(successful: u64, failed: u64, latency: LatencyStats) -> QuerySummary {
    let total = successful + failed;
    QuerySummary {
        total_executions: total,
        successful_executions: successful,
        failed_executions: failed,
        success_rate: success_rate(successful, total),
        latency_mean_ms: latency.mean,
        latency_p50_ms: latency.p50,
        latency_p90_ms: latency.p90,
        latency_p95_ms: latency.p95,
        latency_p99_ms: latency.p99,
        latency_min_ms: latency.min,
        latency_max_ms: latency.max,
        errors_by_kind: errors_for(failed),
    }
}

fn per_query_breakdown(
    summary: &PgbenchSummary,
    scripts: &[ScriptFile],
    samples: &[LogSample],
    overall: &QuerySummary,
) -> BTreeMap<String, QuerySummary> {
    let mut breakdown = BTreeMap::new();

    if !summary.scripts.is_empty() {
        for block in &summary.scripts {
            let position = scripts
                .iter()
                .position(|s| s.path.to_string_lossy() == block.name)
                .or_else(|| block.index.checked_sub(1).filter(|i| *i < scripts.len()));
            let Some(position) = position else {
                warn!("pgbench reported unknown script '{}'", block.name);
                continue;
            };
            let own: Vec<f64> = samples
                .iter()
                .filter(|s| s.script == position)
                .map(|s| s.latency_ms)
                .collect();
            let failed = block.failed_transactions.unwrap_or(0);
            let successful = block.transactions.unwrap_or(own.len() as u64);
            let latency = latency_stats(block.latency_average_ms, block.latency_stddev_ms, &own);
            breakdown.insert(
                scripts[position].query_identifier.clone(),
                query_summary(successful, failed, latency),
            );
        }
    } else if let [only] = scripts {
        breakdown.insert(only.query_identifier.clone(), overall.clone());
    } else {
        // pgbench prints per-script sections whenever it runs more than one
        // script, so there is nothing to attribute here.
        warn!("pgbench output has no per-script sections for {} scripts", scripts.len());
    }
    breakdown
}

/// Fold a parsed summary into the shared report shape.
pub fn to_report(
    summary: &PgbenchSummary,
    scripts: &[ScriptFile],
    samples: &[LogSample],
    clients: u32,
) -> AggregateReport {
    let all: Vec<f64> = samples.iter().map(|s| s.latency_ms).collect();
    let successful = summary
        .transactions_processed
        .unwrap_or(all.len() as u64);
    let failed = summary.failed_transactions.unwrap_or(0);
    let total = successful + failed;
    let latency = latency_stats(summary.latency_average_ms, summary.latency_stddev_ms, &all);

    let elapsed_seconds = summary
        .duration_secs
        .or_else(|| summary.progress.last().map(|p| p.elapsed_secs))
        .unwrap_or(if summary.tps > 0.0 {
            total as f64 / summary.tps
        } else {
            0.0
        });

    let overall = query_summary(successful, failed, latency.clone());
    let per_query_breakdown = per_query_breakdown(summary, scripts, samples, &overall);

    AggregateReport {
        total_executions: total,
        successful_executions: successful,
        failed_executions: failed,
        skipped_executions: 0,
        success_rate: overall.success_rate,
        throughput_per_second: summary.tps,
        elapsed_seconds,
        concurrency_level: Some(clients as usize),
        latency_mean_ms: latency.mean,
        latency_p50_ms: latency.p50,
        latency_p90_ms: latency.p90,
        latency_p95_ms: latency.p95,
        latency_p99_ms: latency.p99,
        latency_min_ms: latency.min,
        latency_max_ms: latency.max,
        latency_stddev_ms: latency.stddev,
        acquire_wait_mean_ms: None,
        errors_by_kind: overall.errors_by_kind,
        per_query_breakdown,
    }
}

// ============================================================================
// Run
// ============================================================================

/// A completed pgbench run.
#[derive(Debug, Clone)]
pub struct PgbenchRun {
    pub report: AggregateReport,
    pub summary: PgbenchSummary,
    pub output: ToolOutput,
    pub command_line: String,
}

/// Write scripts, run pgbench and build a report.
pub async fn run(
    queries: &[Arc<QueryDefinition>],
    settings: &PgbenchSettings,
    target: &TargetConfig,
    password: Option<&str>,
) -> BenchResult<PgbenchRun> {
    settings.validate()?;

    let workdir = tempfile::Builder::new().prefix("lakebench-pgbench-").tempdir()?;
    let scripts = write_scripts(queries, workdir.path())?;
    let command = PgbenchCommand::build(settings, &scripts, target, password, workdir.path());
    let output = execute(&command).await?;

    let summary = match parse_output(&output.stdout, &output.stderr) {
        Ok(summary) => summary,
        Err(BenchError::ReportParse {
            message,
            stdout,
            stderr,
            ..
        }) => {
            let message = if output.success() {
                message
            } else {
                format!("pgbench exited with status {:?}: {}", output.exit_code, message)
            };
            return Err(BenchError::ReportParse {
                message,
                stdout,
                stderr,
                exit_code: output.exit_code,
            });
        }
        Err(e) => return Err(e),
    };
    if !output.success() {
        warn!(
            "pgbench exited with status {:?} but printed a summary",
            output.exit_code
        );
    }

    let samples = if settings.transaction_log {
        collect_transaction_logs(workdir.path()).unwrap_or_else(|e| {
            warn!("Could not read pgbench transaction logs: {}", e);
            Vec::new()
        })
    } else {
        Vec::new()
    };

    let report = to_report(&summary, &scripts, &samples, settings.clients);
    info!(
        "pgbench finished: {:.1} tps, {} transaction(s), {} failed",
        report.throughput_per_second, report.successful_executions, report.failed_executions
    );

    Ok(PgbenchRun {
        report,
        summary,
        output,
        command_line: command.command_line(),
    })
}
