//! lakebench: the benchmarking CLI
//!
//! # Usage
//!
//! ```bash
//! # Run every upload in a directory at concurrency 40
//! lakebench run queries/ -c 40 --host db.example.com --user bench
//!
//! # Same catalog through pgbench
//! lakebench pgbench queries/ --clients 16 --jobs 4 --duration 60
//!
//! # Check uploads without touching a database
//! lakebench validate queries/
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use colored::*;
use lakebench::expander::Expansion;
use lakebench::pgbench::render_script;
use lakebench::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "lakebench")]
#[command(author = "lakebench Contributors")]
#[command(version)]
#[command(about = "Concurrent query benchmarking for PostgreSQL", long_about = None)]
#[command(after_help = "EXAMPLES:
    lakebench run queries/ -c 40
    lakebench run orders.sql --timeout 300 --format json
    lakebench pgbench queries/ --clients 16 --jobs 4 --duration 60 --protocol extended
    lakebench explain orders.sql")]
struct Cli {
    /// Configuration file (default: ./lakebench.toml)
    #[arg(long, global = true, env = "LAKEBENCH_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table", global = true)]
    format: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
    Markdown,
}

#[derive(Args)]
struct TargetArgs {
    /// Database host
    #[arg(long, env = "LAKEBENCH_HOST")]
    host: Option<String>,

    #[arg(long, env = "LAKEBENCH_PORT")]
    port: Option<u16>,

    #[arg(long, env = "LAKEBENCH_DATABASE")]
    database: Option<String>,

    #[arg(long, env = "LAKEBENCH_USER")]
    user: Option<String>,

    /// Environment variable holding the password or token
    #[arg(long)]
    password_env: Option<String>,

    /// disable, prefer, require, verify-ca or verify-full
    #[arg(long)]
    ssl_mode: Option<SslMode>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run queries in-process over a connection pool
    Run {
        /// Upload files or directories (default: [queries] paths)
        paths: Vec<PathBuf>,

        #[command(flatten)]
        target: TargetArgs,

        /// Maximum simultaneously running executions
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Run timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Per-statement timeout in seconds
        #[arg(long)]
        statement_timeout: Option<u64>,

        /// Seconds between progress lines (0 disables)
        #[arg(long, default_value_t = 2)]
        progress: u64,
    },
    /// Run queries through pgbench
    Pgbench {
        paths: Vec<PathBuf>,

        #[command(flatten)]
        target: TargetArgs,

        #[arg(long)]
        clients: Option<u32>,

        #[arg(long)]
        jobs: Option<u32>,

        /// Duration in seconds
        #[arg(long, conflicts_with = "transactions")]
        duration: Option<u64>,

        /// Transactions per client
        #[arg(long)]
        transactions: Option<u64>,

        /// prepared, extended or simple
        #[arg(long)]
        protocol: Option<Protocol>,

        /// Target transactions per second
        #[arg(long)]
        rate: Option<u64>,

        /// pgbench progress interval in seconds
        #[arg(long)]
        progress: Option<u64>,
    },
    /// Show how uploads are parsed, expanded and rendered
    Explain {
        paths: Vec<PathBuf>,
    },
    /// Validate uploads without connecting
    Validate {
        paths: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = dispatch(&cli).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default = if verbose { "lakebench=debug" } else { "lakebench=info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn dispatch(cli: &Cli) -> anyhow::Result<()> {
    let mut config = RunConfig::load(cli.config.as_deref())?;

    match &cli.command {
        Commands::Run {
            paths,
            target,
            concurrency,
            timeout,
            statement_timeout,
            progress,
        } => {
            apply_target(&mut config.target, target);
            if let Some(c) = concurrency {
                config.concurrency_level = *c;
            }
            if timeout.is_some() {
                config.run_timeout_secs = *timeout;
            }
            if statement_timeout.is_some() {
                config.statement_timeout_secs = *statement_timeout;
            }
            let (catalog, rejected) = load_catalog(&config, paths)?;
            print_rejected(&rejected);
            run_in_process(&config, &catalog, &rejected, *progress, cli.format).await
        }
        Commands::Pgbench {
            paths,
            target,
            clients,
            jobs,
            duration,
            transactions,
            protocol,
            rate,
            progress,
        } => {
            apply_target(&mut config.target, target);
            let settings = &mut config.pgbench;
            if let Some(c) = clients {
                settings.clients = *c;
            }
            if jobs.is_some() {
                settings.jobs = *jobs;
            }
            if duration.is_some() {
                settings.duration_secs = *duration;
                settings.transactions_per_client = None;
            }
            if transactions.is_some() {
                settings.transactions_per_client = *transactions;
                settings.duration_secs = None;
            }
            if let Some(p) = protocol {
                settings.protocol = *p;
            }
            if rate.is_some() {
                settings.target_tps = *rate;
            }
            if progress.is_some() {
                settings.progress_interval_secs = *progress;
            }
            let (catalog, rejected) = load_catalog(&config, paths)?;
            print_rejected(&rejected);
            if catalog.is_empty() {
                bail!("no valid query definitions to run");
            }
            let outcome = lakebench::run_pgbench(&config, &catalog, &rejected).await?;
            print_outcome(&outcome, cli.format, "pgbench benchmark")
        }
        Commands::Explain { paths } => {
            let (catalog, rejected) = load_catalog(&config, paths)?;
            print_rejected(&rejected);
            explain(&catalog);
            Ok(())
        }
        Commands::Validate { paths } => {
            let (catalog, rejected) = load_catalog(&config, paths)?;
            for def in catalog.queries() {
                println!(
                    "{} {} ({} execution(s))",
                    "✓".green(),
                    def.identifier.white(),
                    def.total_executions()
                );
            }
            print_rejected(&rejected);
            if !rejected.is_empty() {
                bail!("{} query source(s) rejected", rejected.len());
            }
            Ok(())
        }
    }
}

fn apply_target(target: &mut TargetConfig, args: &TargetArgs) {
    if let Some(host) = &args.host {
        target.host = host.clone();
    }
    if let Some(port) = args.port {
        target.port = port;
    }
    if let Some(database) = &args.database {
        target.database = database.clone();
    }
    if let Some(user) = &args.user {
        target.user = user.clone();
    }
    if args.password_env.is_some() {
        target.password_env = args.password_env.clone();
    }
    if let Some(mode) = args.ssl_mode {
        target.ssl_mode = mode;
    }
}

fn load_catalog(
    config: &RunConfig,
    paths: &[PathBuf],
) -> anyhow::Result<(QueryCatalog, Vec<BenchError>)> {
    let paths: Vec<&Path> = if paths.is_empty() {
        config.queries.paths.iter().map(PathBuf::as_path).collect()
    } else {
        paths.iter().map(PathBuf::as_path).collect()
    };
    if paths.is_empty() {
        bail!("no query sources given; pass paths or set [queries] paths in lakebench.toml");
    }

    let policy = config.queries.upload_policy();
    let mut catalog = QueryCatalog::new();
    let mut rejected = Vec::new();
    for path in paths {
        let errors = catalog
            .load_path(path, &policy)
            .with_context(|| format!("reading {}", path.display()))?;
        rejected.extend(errors);
    }
    Ok((catalog, rejected))
}

fn print_rejected(rejected: &[BenchError]) {
    for e in rejected {
        eprintln!("{} {}", "✗".red(), e);
    }
}

async fn run_in_process(
    config: &RunConfig,
    catalog: &QueryCatalog,
    rejected: &[BenchError],
    progress_secs: u64,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let (run, connector) = lakebench::prepare_in_process(config, catalog, rejected)?;
    let progress = run.progress();

    let execution = run.execute(connector);
    tokio::pin!(execution);

    let outcome = if progress_secs == 0 {
        execution.await
    } else {
        let mut ticker = tokio::time::interval(Duration::from_secs(progress_secs));
        ticker.tick().await;
        loop {
            tokio::select! {
                outcome = &mut execution => break outcome,
                _ = ticker.tick() => print_progress(&progress),
            }
        }
    };

    print_outcome(&outcome, format, "In-process benchmark")
}

fn print_progress(progress: &ProgressHandle) {
    let snapshot = progress.snapshot();
    eprintln!(
        "{} {}/{} done, {} in flight, {:.1}/s, p95 {}",
        "…".dimmed(),
        progress.completed().to_string().cyan(),
        progress.total(),
        progress.in_flight(),
        snapshot.throughput_per_second,
        fmt_ms(snapshot.latency_p95_ms)
    );
}

fn fmt_ms(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.2}ms", v))
        .unwrap_or_else(|| "n/a".to_string())
}

fn print_outcome(outcome: &RunOutcome, format: OutputFormat, title: &str) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(outcome)?),
        OutputFormat::Markdown => println!(
            "{}",
            to_markdown(title, &outcome.report, &outcome.recommendations)
        ),
        OutputFormat::Table => print_table(outcome, title),
    }

    if outcome.status == RunStatus::Failed {
        bail!(
            "run failed: {}",
            outcome.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn print_table(outcome: &RunOutcome, title: &str) {
    let report = &outcome.report;
    let status = match outcome.status {
        RunStatus::Completed => outcome.status.as_str().green(),
        RunStatus::TimedOut => outcome.status.as_str().yellow(),
        RunStatus::Failed => outcome.status.as_str().red(),
    };

    println!("{}", title.cyan().bold());
    println!("  {} {}  {} {}", "Run:".dimmed(), outcome.run_id, "Status:".dimmed(), status.bold());
    if let Some(error) = &outcome.error {
        println!("  {} {}", "Reason:".dimmed(), error.yellow());
    }
    println!();

    println!(
        "  {} {}  {} {}  {} {}  {} {}",
        "Total:".dimmed(),
        report.total_executions.to_string().white(),
        "OK:".dimmed(),
        report.successful_executions.to_string().green(),
        "Failed:".dimmed(),
        report.failed_executions.to_string().red(),
        "Skipped:".dimmed(),
        report.skipped_executions.to_string().yellow()
    );
    println!(
        "  {} {:.2}%  {} {:.2}/s  {} {:.2}s",
        "Success:".dimmed(),
        report.success_rate * 100.0,
        "Throughput:".dimmed(),
        report.throughput_per_second,
        "Elapsed:".dimmed(),
        report.elapsed_seconds
    );
    println!(
        "  {} mean {}  p50 {}  p90 {}  p95 {}  p99 {}  max {}",
        "Latency:".dimmed(),
        fmt_ms(report.latency_mean_ms).white(),
        fmt_ms(report.latency_p50_ms),
        fmt_ms(report.latency_p90_ms),
        fmt_ms(report.latency_p95_ms).white(),
        fmt_ms(report.latency_p99_ms).white(),
        fmt_ms(report.latency_max_ms)
    );
    if let Some(stats) = &outcome.pool_stats {
        println!(
            "  {} peak {}/{}  created {}  recycled {}  discarded {}",
            "Pool:".dimmed(),
            stats.peak_active,
            stats.capacity,
            stats.total_created,
            stats.total_recycled,
            stats.total_discarded
        );
    }

    if !report.per_query_breakdown.is_empty() {
        println!();
        print_query_table(report);
    }

    if !report.errors_by_kind.is_empty() {
        println!();
        println!("{}", "Errors:".red().bold());
        for (kind, count) in &report.errors_by_kind {
            println!("  {} {}", kind.yellow(), count);
        }
    }

    if !outcome.recommendations.is_empty() {
        println!();
        println!("{}", "Recommendations:".green().bold());
        for rec in &outcome.recommendations {
            println!("  • {}", rec);
        }
    }

    if outcome.status == RunStatus::Failed
        && let Some(output) = &outcome.tool_output
    {
        println!();
        println!("{}", "Tool output:".dimmed());
        for line in output.stdout.lines().chain(output.stderr.lines()) {
            println!("  {}", line.dimmed());
        }
    }
}

fn print_query_table(report: &AggregateReport) {
    let columns = ["query", "total", "failed", "success", "mean", "p90", "p95", "p99"];
    let rows: Vec<[String; 8]> = report
        .per_query_breakdown
        .iter()
        .map(|(id, q)| {
            [
                id.clone(),
                q.total_executions.to_string(),
                q.failed_executions.to_string(),
                format!("{:.1}%", q.success_rate * 100.0),
                fmt_ms(q.latency_mean_ms),
                fmt_ms(q.latency_p90_ms),
                fmt_ms(q.latency_p95_ms),
                fmt_ms(q.latency_p99_ms),
            ]
        })
        .collect();

    let mut widths: HashMap<usize, usize> = columns.iter().enumerate().map(|(i, c)| (i, c.len())).collect();
    for row in &rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(w) = widths.get_mut(&i) {
                *w = (*w).max(cell.len());
            }
        }
    }

    let header: Vec<String> = columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{:width$}", c, width = widths[&i]))
        .collect();
    println!("{}", header.join(" │ ").white().bold());

    let sep: Vec<String> = (0..columns.len()).map(|i| "─".repeat(widths[&i])).collect();
    println!("{}", sep.join("─┼─").dimmed());

    for row in &rows {
        let cells: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, cell)| format!("{:width$}", cell, width = widths[&i]))
            .collect();
        println!("{}", cells.join(" │ "));
    }
}

fn explain(catalog: &QueryCatalog) {
    let expansion = Expansion::from_catalog(catalog);

    for def in catalog.queries() {
        let template = Template::parse(&def.sql_template);
        println!("{} {}", "Query:".cyan().bold(), def.identifier.white().bold());
        println!("  {} {}", "Template:".dimmed(), def.sql_template.yellow());
        println!(
            "  {} {}  {} {}",
            "Repeat:".dimmed(),
            def.repeat_count,
            "Weight:".dimmed(),
            def.weight.unwrap_or(1)
        );

        println!("  {}", "Scenarios:".dimmed());
        for scenario in expansion
            .scenarios
            .iter()
            .filter(|s| s.query_identifier() == def.identifier)
        {
            let params: Vec<String> = scenario.parameter_set.iter().map(|v| v.to_string()).collect();
            println!(
                "    {} ({}) × {}",
                scenario.scenario_label.cyan(),
                params.join(", "),
                scenario.repeat_count
            );
            let (sql, _) = template.to_bound(&scenario.parameter_set);
            println!("      {}", sql.white());
        }

        let script = render_script(def);
        println!("  {}", "pgbench script:".dimmed());
        for line in script.lines() {
            println!("    {}", line.white());
        }
        println!();
    }

    println!(
        "{} {} scenario(s), {} execution(s)",
        "Total:".green().bold(),
        expansion.len(),
        expansion.total_executions()
    );
}
