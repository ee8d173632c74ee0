//! Report presentation: recommendations and Markdown rendering.

use crate::metrics::AggregateReport;

/// Which engine produced a report. Thresholds differ between the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportSource {
    InProcess,
    Pgbench,
}

const LOOKS_GOOD: &str = "Performance looks good! Consider running longer tests for more accurate metrics.";

/// Tuning advice derived from a finished report.
pub fn recommendations(report: &AggregateReport, source: ReportSource) -> Vec<String> {
    let mut out = Vec::new();
    match source {
        ReportSource::InProcess => in_process(report, &mut out),
        ReportSource::Pgbench => pgbench(report, &mut out),
    }
    if out.is_empty() {
        out.push(LOOKS_GOOD.to_string());
    }
    out
}

fn in_process(report: &AggregateReport, out: &mut Vec<String>) {
    if report.total_executions == 0 {
        out.push("No executions completed. Check the query sources and run timeout.".to_string());
        return;
    }

    if report.success_rate < 0.95 {
        out.push(
            "Success rate is below 95%. Check for connection issues, query errors, or resource constraints."
                .to_string(),
        );
    }
    if report.success_rate < 0.99
        && let Some((kind, _)) = report.errors_by_kind.iter().max_by_key(|(_, n)| **n)
    {
        out.push(format!(
            "Most common error is '{}'. Investigate and fix this issue.",
            kind
        ));
    }

    let mean = report.latency_mean_ms.unwrap_or(0.0);
    if mean > 10_000.0 {
        out.push("Average execution time is very high (>10s). This may indicate serious performance issues.".to_string());
    } else if mean > 5_000.0 {
        out.push("Average execution time is high (>5s). Consider optimizing queries, adding indexes, or increasing the pool size.".to_string());
    }

    if report.throughput_per_second < 10.0 {
        out.push("Throughput is low (<10 qps). Consider increasing the concurrency level or optimizing queries.".to_string());
    }

    if report.concurrency_level.is_some_and(|c| c > 50) && report.success_rate < 0.99 {
        out.push("High concurrency with low success rate. Consider reducing the concurrency level.".to_string());
    }

    if report.skipped_executions > 0 {
        out.push(format!(
            "{} execution(s) were skipped by the run timeout. Raise the timeout or reduce the workload.",
            report.skipped_executions
        ));
    }
}

fn pgbench(report: &AggregateReport, out: &mut Vec<String>) {
    let tps = report.throughput_per_second;
    if tps > 0.0 && tps < 100.0 {
        out.push("Low TPS detected. Consider optimizing queries or increasing client connections.".to_string());
    }

    if report.latency_mean_ms.is_some_and(|avg| avg > 100.0) {
        out.push("High average latency. Check for inefficient queries or resource constraints.".to_string());
    }

    if let Some(clients) = report.concurrency_level
        && clients > 50
        && tps > 0.0
        && tps / (clients as f64) < 2.0
    {
        out.push("High client count with low per-client TPS. Consider reducing client connections.".to_string());
    }

    if let (Some(p50), Some(p95)) = (report.latency_p50_ms, report.latency_p95_ms)
        && p95 > p50 * 5.0
    {
        out.push("High latency variance detected. Check for inconsistent query performance.".to_string());
    }
}

fn ms(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.2} ms", v))
        .unwrap_or_else(|| "n/a".to_string())
}

/// Render a report as a Markdown document.
pub fn to_markdown(title: &str, report: &AggregateReport, recommendations: &[String]) -> String {
    let mut md = String::new();
    md.push_str(&format!("# {}\n\n", title));

    md.push_str("## Summary\n\n| Metric | Value |\n|---|---|\n");
    let rows = [
        ("Total executions", report.total_executions.to_string()),
        ("Successful", report.successful_executions.to_string()),
        ("Failed", report.failed_executions.to_string()),
        ("Skipped", report.skipped_executions.to_string()),
        ("Success rate", format!("{:.2}%", report.success_rate * 100.0)),
        ("Throughput", format!("{:.2} /s", report.throughput_per_second)),
        ("Elapsed", format!("{:.2} s", report.elapsed_seconds)),
        (
            "Concurrency",
            report
                .concurrency_level
                .map(|c| c.to_string())
                .unwrap_or_else(|| "n/a".to_string()),
        ),
    ];
    for (name, value) in rows {
        md.push_str(&format!("| {} | {} |\n", name, value));
    }

    md.push_str("\n## Latency\n\n| Statistic | Value |\n|---|---|\n");
    let latency = [
        ("Mean", report.latency_mean_ms),
        ("p50", report.latency_p50_ms),
        ("p90", report.latency_p90_ms),
        ("p95", report.latency_p95_ms),
        ("p99", report.latency_p99_ms),
        ("Min", report.latency_min_ms),
        ("Max", report.latency_max_ms),
        ("Stddev", report.latency_stddev_ms),
        ("Acquire wait (mean)", report.acquire_wait_mean_ms),
    ];
    for (name, value) in latency {
        md.push_str(&format!("| {} | {} |\n", name, ms(value)));
    }

    if !report.per_query_breakdown.is_empty() {
        md.push_str("\n## Per query\n\n");
        md.push_str("| Query | Total | Failed | Success rate | Mean | p90 | p95 | p99 |\n");
        md.push_str("|---|---|---|---|---|---|---|---|\n");
        for (id, q) in &report.per_query_breakdown {
            md.push_str(&format!(
                "| {} | {} | {} | {:.2}% | {} | {} | {} | {} |\n",
                id,
                q.total_executions,
                q.failed_executions,
                q.success_rate * 100.0,
                ms(q.latency_mean_ms),
                ms(q.latency_p90_ms),
                ms(q.latency_p95_ms),
                ms(q.latency_p99_ms),
            ));
        }
    }

    if !report.errors_by_kind.is_empty() {
        md.push_str("\n## Errors\n\n");
        for (kind, count) in &report.errors_by_kind {
            md.push_str(&format!("- {}: {}\n", kind, count));
        }
    }

    if !recommendations.is_empty() {
        md.push_str("\n## Recommendations\n\n");
        for rec in recommendations {
            md.push_str(&format!("- {}\n", rec));
        }
    }
    md
}
