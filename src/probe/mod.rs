//! Read-only diagnostics against the hosted backend.
//!
//! Checks include:
//! - REST endpoint reachability
//! - Row counts per table with the service key
//! - Row-level security visibility (anon vs service)
//! - Availability of the exec-SQL function
//! - Storage bucket listing

use serde::Serialize;
use tracing::{error, info, warn};

use crate::backend::{Backend, BackendError, Privilege};

/// Tables checked when none are given
pub const DEFAULT_TABLES: &[&str] = &[
    "customers",
    "customer_payments",
    "devices",
    "lats_sales",
    "lats_products",
    "lats_product_variants",
    "lats_spare_parts",
    "lats_purchase_orders",
    "finance_accounts",
    "customer_communications",
];

/// Result of a single check
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    /// A failed critical check makes the other results meaningless
    pub critical: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl CheckResult {
    pub fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            critical: false,
            message: message.into(),
            details: None,
        }
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>, critical: bool) -> Self {
        Self {
            name: name.into(),
            passed: false,
            critical,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub checks: Vec<CheckResult>,
    pub all_critical_passed: bool,
    pub all_passed: bool,
    pub summary: String,
}

impl ProbeReport {
    pub fn new(checks: Vec<CheckResult>) -> Self {
        let all_critical_passed = checks.iter().filter(|c| c.critical).all(|c| c.passed);
        let all_passed = checks.iter().all(|c| c.passed);

        let failed_critical = checks.iter().filter(|c| c.critical && !c.passed).count();
        let failed_non_critical = checks.iter().filter(|c| !c.critical && !c.passed).count();
        let total = checks.len();
        let passed = checks.iter().filter(|c| c.passed).count();

        let summary = if all_passed {
            format!("All {} checks passed", total)
        } else if all_critical_passed {
            format!(
                "{}/{} checks passed ({} warnings)",
                passed, total, failed_non_critical
            )
        } else {
            format!(
                "{}/{} checks passed ({} critical failures)",
                passed, total, failed_critical
            )
        };

        Self {
            checks,
            all_critical_passed,
            all_passed,
            summary,
        }
    }
}

/// Run every check. Table checks are skipped when the backend is unreachable.
pub async fn run_probe(backend: &dyn Backend, tables: &[String]) -> ProbeReport {
    info!(tables = tables.len(), "Probing backend...");

    let mut checks = Vec::new();

    let connectivity = check_connectivity(backend).await;
    let reachable = connectivity.passed;
    checks.push(connectivity);

    if reachable {
        for table in tables {
            checks.push(check_table(backend, table).await);
        }
        checks.push(check_exec_sql(backend).await);
        checks.push(check_storage(backend).await);
    }

    let report = ProbeReport::new(checks);

    for check in &report.checks {
        if check.passed {
            info!(check = %check.name, message = %check.message, "Check PASSED");
        } else if check.critical {
            error!(
                check = %check.name,
                message = %check.message,
                details = ?check.details,
                "Check FAILED (CRITICAL)"
            );
        } else {
            warn!(
                check = %check.name,
                message = %check.message,
                details = ?check.details,
                "Check FAILED (warning)"
            );
        }
    }

    info!(
        summary = %report.summary,
        all_passed = report.all_passed,
        all_critical_passed = report.all_critical_passed,
        "Probe completed"
    );

    report
}

async fn check_connectivity(backend: &dyn Backend) -> CheckResult {
    match backend.ping().await {
        Ok(()) => CheckResult::pass("connectivity", "Backend REST endpoint reachable"),
        Err(e) => CheckResult::fail("connectivity", "Backend REST endpoint unreachable", true)
            .with_details(e.to_string()),
    }
}

/// Row count with the service key, then the same count with the anon key
async fn check_table(backend: &dyn Backend, table: &str) -> CheckResult {
    let name = format!("table:{}", table);

    let service = match backend.count(table, &[], Privilege::Service).await {
        Ok(n) => n,
        Err(e) if e.status() == Some(404) => {
            return CheckResult::fail(name, "Table not found", false).with_details(e.to_string())
        }
        Err(e) => {
            return CheckResult::fail(name, "Failed to count rows", false)
                .with_details(e.to_string())
        }
    };

    match backend.count(table, &[], Privilege::Anon).await {
        Ok(anon) if anon == 0 && service > 0 => CheckResult::fail(
            name,
            format!("RLS hides rows from anon ({} rows visible to service)", service),
            false,
        )
        .with_details("Add a SELECT policy for the anon/authenticated role if the app reads this table"),
        Ok(anon) => CheckResult::pass(name, format!("{} rows", service))
            .with_details(format!("anon sees {} rows", anon)),
        Err(e) if e.is_auth() => {
            CheckResult::fail(name, format!("Anon key denied ({} rows exist)", service), false)
                .with_details(e.to_string())
        }
        Err(e) => CheckResult::fail(name, "Failed to count rows with anon key", false)
            .with_details(e.to_string()),
    }
}

async fn check_exec_sql(backend: &dyn Backend) -> CheckResult {
    match backend.exec_sql("select 1").await {
        Ok(()) => CheckResult::pass("exec_sql", "Raw SQL function available"),
        Err(e @ BackendError::Http { status: 404, .. }) => CheckResult::fail(
            "exec_sql",
            "Raw SQL function not installed; migrations cannot run",
            false,
        )
        .with_details(e.to_string()),
        Err(e) => CheckResult::fail("exec_sql", "Raw SQL function failed", false)
            .with_details(e.to_string()),
    }
}

async fn check_storage(backend: &dyn Backend) -> CheckResult {
    match backend.list_buckets().await {
        Ok(buckets) if buckets.is_empty() => CheckResult::pass("storage", "No storage buckets"),
        Ok(buckets) => {
            let names: Vec<&str> = buckets.iter().map(|b| b.name.as_str()).collect();
            CheckResult::pass("storage", format!("{} storage buckets", buckets.len()))
                .with_details(names.join(", "))
        }
        Err(e) => CheckResult::fail("storage", "Failed to list storage buckets", false)
            .with_details(e.to_string()),
    }
}
