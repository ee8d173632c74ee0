//! Live PostgreSQL tests for lakebench
//!
//! Connection comes from `LAKEBENCH_HOST`, `LAKEBENCH_PORT`, `LAKEBENCH_DATABASE`,
//! `LAKEBENCH_USER` and the password in `PGPASSWORD`.
//! Run: `cargo test --test live_postgres -- --nocapture --ignored`

use std::time::Duration;

use lakebench::prelude::*;

fn target() -> TargetConfig {
    let env = |key: &str, default: &str| std::env::var(key).unwrap_or_else(|_| default.to_string());
    TargetConfig {
        host: env("LAKEBENCH_HOST", "localhost"),
        port: env("LAKEBENCH_PORT", "5432").parse().unwrap(),
        database: env("LAKEBENCH_DATABASE", "postgres"),
        user: env("LAKEBENCH_USER", "postgres"),
        password_env: Some("PGPASSWORD".to_string()),
        ssl_mode: env("LAKEBENCH_SSL_MODE", "prefer").parse().unwrap(),
    }
}

fn connector() -> PgConnector {
    let target = target();
    let password = target.password().ok().flatten();
    PgConnector::new(&target, password.as_deref())
}

/// Parameterized query through the full in-process path
#[tokio::test]
#[ignore = "Requires a PostgreSQL server - run with --ignored"]
async fn test_live_run() {
    let def = lakebench::parse(
        "series",
        "-- PARAMETERS: [[10], [100]]\n-- EXEC_COUNT: 5\nSELECT count(*) FROM generate_series(1, %s)",
    )
    .unwrap();
    let (catalog, _) = QueryCatalog::from_definitions(vec![def]);

    let mut settings = RunSettings::new(4);
    settings.statement_timeout = Some(Duration::from_secs(10));
    let outcome = BenchmarkRun::new(&catalog, settings).execute(connector()).await;

    println!("{}", serde_json::to_string_pretty(&outcome).unwrap());
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.report.total_executions, 10);
    assert_eq!(outcome.report.successful_executions, 10);
}

/// Syntax errors are classified, not fatal
#[tokio::test]
#[ignore = "Requires a PostgreSQL server - run with --ignored"]
async fn test_live_syntax_error() {
    let (catalog, _) =
        QueryCatalog::from_definitions(vec![QueryDefinition::new("typo", "SELEC 1").repeat(2)]);

    let outcome = BenchmarkRun::new(&catalog, RunSettings::new(1))
        .execute(connector())
        .await;

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(
        outcome.report.errors_by_kind.get("SyntaxOrPermissionError"),
        Some(&2)
    );
}

/// A statement that outlives its timeout is recorded as a Timeout
#[tokio::test]
#[ignore = "Requires a PostgreSQL server - run with --ignored"]
async fn test_live_statement_timeout() {
    let slow = QueryDefinition::new("slow", "SELECT pg_sleep(2)");
    let (catalog, _) = QueryCatalog::from_definitions(vec![slow]);

    let mut settings = RunSettings::new(1);
    settings.statement_timeout = Some(Duration::from_millis(500));
    let outcome = BenchmarkRun::new(&catalog, settings).execute(connector()).await;

    let slow = &outcome.report.per_query_breakdown["slow"];
    assert_eq!(slow.failed_executions, 1);
    assert!(slow.errors_by_kind.contains_key("Timeout"));
}

/// Text and NULL parameters take the type of the column they meet
#[tokio::test]
#[ignore = "Requires a PostgreSQL server - run with --ignored"]
async fn test_live_untyped_parameters() {
    let rows = "SELECT * FROM (VALUES (1, DATE '2024-01-05', \
                '6f1c1a2e-0d4b-4c3f-9a57-2b1e8c0f4d11'::uuid, 'x'::text)) AS t(id, d, u, name)";
    let uploads = [
        ("null_int", format!("-- PARAMETERS: [[null]]\n{rows} WHERE id = %s")),
        ("date_text", format!("-- PARAMETERS: [[\"2024-01-05\"]]\n{rows} WHERE d = %s")),
        (
            "uuid_text",
            format!("-- PARAMETERS: [[\"6f1c1a2e-0d4b-4c3f-9a57-2b1e8c0f4d11\"]]\n{rows} WHERE u = %s"),
        ),
        ("timestamp_text", format!("-- PARAMETERS: [[\"2024-01-05 10:00:00\"]]\n{rows} WHERE name <> %s")),
        ("int_param", format!("-- PARAMETERS: [[1]]\n{rows} WHERE id = %s")),
    ];
    let defs: Vec<_> = uploads
        .iter()
        .map(|(id, text)| lakebench::parse(id, text).unwrap())
        .collect();
    let (catalog, rejected) = QueryCatalog::from_definitions(defs);
    assert!(rejected.is_empty());

    let outcome = BenchmarkRun::new(&catalog, RunSettings::new(2))
        .execute(connector())
        .await;

    assert_eq!(outcome.status, RunStatus::Completed);
    for (id, _) in &uploads {
        let summary = &outcome.report.per_query_breakdown[*id];
        assert_eq!(summary.successful_executions, 1, "{id}: {:?}", summary.errors_by_kind);
    }
}
