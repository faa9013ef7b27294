use std::time::Duration;

use fundflow_core::approvals::ApproverDirectory;
use fundflow_core::config::{AppConfig, LoadOptions};
use fundflow_db::repositories::SqlDirectoryRepository;
use fundflow_db::{connect_from_config, migrations::MIGRATOR, probe, DbPool};
use serde::Serialize;

use crate::commands::CommandResult;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

impl DoctorCheck {
    fn pass(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Pass, details: details.into() }
    }

    fn fail(name: &'static str, details: impl Into<String>) -> Self {
        Self { name, status: CheckStatus::Fail, details: details.into() }
    }

    fn skipped(name: &'static str, reason: &str) -> Self {
        Self { name, status: CheckStatus::Skipped, details: format!("skipped because {reason}") }
    }
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

const DATABASE_CHECKS: [&str; 3] = ["database_connectivity", "schema_migrations", "directory_users"];

pub fn run(json_output: bool) -> CommandResult {
    let report = build_report();
    let exit_code = if report.overall_status == CheckStatus::Pass { 0 } else { 1 };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        })
    } else {
        render_human(&report)
    };

    CommandResult { exit_code, output }
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck::pass("config_validation", "configuration loaded and validated"));
            checks.extend(check_database(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck::fail("config_validation", error.to_string()));
            checks.extend(
                DATABASE_CHECKS
                    .into_iter()
                    .map(|name| DoctorCheck::skipped(name, "configuration did not load")),
            );
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    DoctorReport { overall_status, summary, checks }
}

fn check_database(config: &AppConfig) -> Vec<DoctorCheck> {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return vec![
                DoctorCheck::fail(
                    "database_connectivity",
                    format!("failed to initialize async runtime: {error}"),
                ),
                DoctorCheck::skipped("schema_migrations", "the async runtime did not start"),
                DoctorCheck::skipped("directory_users", "the async runtime did not start"),
            ];
        }
    };

    runtime.block_on(async {
        let pool = match connect_from_config(&config.database).await {
            Ok(pool) => pool,
            Err(error) => {
                return vec![
                    DoctorCheck::fail(
                        "database_connectivity",
                        format!("failed to connect to database: {error}"),
                    ),
                    DoctorCheck::skipped("schema_migrations", "the database is unreachable"),
                    DoctorCheck::skipped("directory_users", "the database is unreachable"),
                ];
            }
        };

        let checks = match probe(&pool, PROBE_TIMEOUT).await {
            Ok(()) => {
                let connectivity = DoctorCheck::pass(
                    "database_connectivity",
                    format!("connected using `{}`", config.database.url),
                );
                let schema = check_schema(&pool).await;
                let directory = if schema.status == CheckStatus::Pass {
                    check_directory(&pool).await
                } else {
                    DoctorCheck::skipped("directory_users", "the schema is not migrated")
                };
                vec![connectivity, schema, directory]
            }
            Err(error) => vec![
                DoctorCheck::fail("database_connectivity", error.to_string()),
                DoctorCheck::skipped("schema_migrations", "the database probe failed"),
                DoctorCheck::skipped("directory_users", "the database probe failed"),
            ],
        };

        pool.close().await;
        checks
    })
}

async fn check_schema(pool: &DbPool) -> DoctorCheck {
    let expected =
        MIGRATOR.iter().filter(|migration| migration.migration_type.is_up_migration()).count();
    let applied: Result<i64, sqlx::Error> =
        sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations WHERE success = 1")
            .fetch_one(pool)
            .await;

    match applied {
        Ok(applied) if applied as usize >= expected => DoctorCheck::pass(
            "schema_migrations",
            format!("{applied} of {expected} migrations applied"),
        ),
        Ok(applied) => DoctorCheck::fail(
            "schema_migrations",
            format!("{applied} of {expected} migrations applied; run `fundflow migrate`"),
        ),
        Err(_) => DoctorCheck::fail(
            "schema_migrations",
            "no migration history found; run `fundflow migrate`".to_string(),
        ),
    }
}

async fn check_directory(pool: &DbPool) -> DoctorCheck {
    match SqlDirectoryRepository::new(pool.clone()).count_active_users().await {
        Ok(0) => DoctorCheck::fail(
            "directory_users",
            "no active directory users; approvers cannot be resolved (try `fundflow seed`)",
        ),
        Ok(count) => DoctorCheck::pass("directory_users", format!("{count} active users")),
        Err(error) => DoctorCheck::fail("directory_users", error.to_string()),
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
