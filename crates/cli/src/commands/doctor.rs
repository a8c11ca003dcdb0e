use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tenantflow_core::config::{AppConfig, LoadOptions};
use tenantflow_core::errors::ClassifiedError;
use tenantflow_core::Tenant;
use tenantflow_db::{ping, ConnectionRouter, SqlTenantRegistry, TenantRegistry};

use crate::commands::{build_runtime, connect_registry, CommandResult, EXIT_CONFIG, EXIT_CONNECTIVITY};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    elapsed_ms: u64,
    details: String,
}

impl DoctorCheck {
    fn new(name: impl Into<String>, status: CheckStatus, started: Instant, details: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            elapsed_ms: started.elapsed().as_millis() as u64,
            details: details.into(),
        }
    }

    fn skipped(name: impl Into<String>, details: impl Into<String>) -> Self {
        Self { name: name.into(), status: CheckStatus::Skipped, elapsed_ms: 0, details: details.into() }
    }
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    command: &'static str,
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

/// Resolves every active tenant through the router and pings its pool.
/// Inactive and suspended tenants are listed as skipped, not failed.
pub fn run(options: LoadOptions, json_output: bool) -> CommandResult {
    let (report, exit_code) = build_report(options);

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

fn build_report(options: LoadOptions) -> (DoctorReport, u8) {
    let mut checks = Vec::new();
    let started = Instant::now();

    let config = match AppConfig::load(options) {
        Ok(config) => {
            checks.push(DoctorCheck::new(
                "config_validation",
                CheckStatus::Pass,
                started,
                "configuration loaded and validated",
            ));
            Some(config)
        }
        Err(error) => {
            checks.push(DoctorCheck::new("config_validation", CheckStatus::Fail, started, error.to_string()));
            checks.push(DoctorCheck::skipped(
                "registry_connectivity",
                "skipped because configuration did not load",
            ));
            None
        }
    };

    let exit_code = match config {
        None => EXIT_CONFIG,
        Some(config) => {
            check_tenants(&config, &mut checks);
            if checks.iter().any(|check| check.status == CheckStatus::Fail) {
                EXIT_CONNECTIVITY
            } else {
                0
            }
        }
    };

    let overall_status = if exit_code == 0 { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if exit_code == 0 {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    (DoctorReport { command: "doctor", overall_status, summary, checks }, exit_code)
}

fn check_tenants(config: &AppConfig, checks: &mut Vec<DoctorCheck>) {
    let runtime = match build_runtime("doctor") {
        Ok(runtime) => runtime,
        Err(failure) => {
            checks.push(DoctorCheck::new(
                "registry_connectivity",
                CheckStatus::Fail,
                Instant::now(),
                failure.output,
            ));
            return;
        }
    };

    runtime.block_on(async {
        let started = Instant::now();
        let pool = match connect_registry(config).await {
            Ok(pool) => pool,
            Err(failure) => {
                checks.push(DoctorCheck::new(
                    "registry_connectivity",
                    CheckStatus::Fail,
                    started,
                    failure.message(),
                ));
                return;
            }
        };

        let registry = Arc::new(SqlTenantRegistry::new(pool.clone()));
        let tenants = match registry.list().await {
            Ok(tenants) => {
                checks.push(DoctorCheck::new(
                    "registry_connectivity",
                    CheckStatus::Pass,
                    started,
                    format!("{} tenant(s) registered", tenants.len()),
                ));
                tenants
            }
            Err(error) => {
                checks.push(DoctorCheck::new(
                    "registry_connectivity",
                    CheckStatus::Fail,
                    started,
                    format!("could not list tenants (is the registry migrated?): {error}"),
                ));
                pool.close().await;
                return;
            }
        };

        let router = ConnectionRouter::with_sqlite(registry, config.router.clone());
        for tenant in &tenants {
            checks.push(check_tenant(&router, tenant).await);
        }
        pool.close().await;
    });
}

async fn check_tenant(router: &ConnectionRouter, tenant: &Tenant) -> DoctorCheck {
    let name = format!("tenant:{}", tenant.id);
    if !tenant.is_active() {
        return DoctorCheck::skipped(name, format!("tenant is {}", tenant.status.as_str()));
    }

    let started = Instant::now();
    let handle = match router.resolve(&tenant.id).await {
        Ok(handle) => handle,
        Err(error) => {
            return DoctorCheck::new(
                name,
                CheckStatus::Fail,
                started,
                format!("{}: {error}", error.kind().as_str()),
            );
        }
    };

    match ping(handle.pool()).await {
        Ok(()) => {
            router.report_success(&tenant.id).await;
            DoctorCheck::new(
                name,
                CheckStatus::Pass,
                started,
                format!("resolved and pinged (fingerprint {})", handle.fingerprint()),
            )
        }
        Err(error) => {
            router.report_failure(&tenant.id, &error).await;
            DoctorCheck::new(name, CheckStatus::Fail, started, format!("ping failed: {error}"))
        }
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
        lines.push(format!("- [{marker}] {} ({}ms): {}", check.name, check.elapsed_ms, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
