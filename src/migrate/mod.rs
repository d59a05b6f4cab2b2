//! Migration runner for the hosted backend.
//!
//! SQL files are split into statements and sent through the exec-SQL RPC.
//! Outcomes are written to the local ledger so re-runs skip files that were
//! already applied and notice files that were edited afterwards.

mod plan;

pub use plan::{collect_files, plan, FileState, MigrationPlan, PlannedFile};

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backend::{Backend, BackendError, RetryPolicy};
use crate::config::OnError;
use crate::db::{DbPool, MigrationRecord};
use crate::sql::{preview, split_statements, statement_kind, SqlError};

const PREVIEW_CHARS: usize = 80;

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("migration path not found: {0}")]
    NotFound(PathBuf),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {filename}: {source}")]
    Parse {
        filename: String,
        #[source]
        source: SqlError,
    },

    #[error(transparent)]
    Sql(#[from] SqlError),

    #[error("ledger error: {0}")]
    Ledger(#[from] sqlx::Error),

    #[error("edited after being applied: {} (use --force to re-apply)", .0.join(", "))]
    Drift(Vec<String>),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptions {
    pub on_error: OnError,
    /// Send each file as one call so it applies all-or-nothing
    pub atomic: bool,
    pub dry_run: bool,
    /// Re-apply files whose checksum changed since they were applied
    pub force: bool,
}

/// Counters for one batch of statements
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatementOutcome {
    pub total: usize,
    pub ok: usize,
    pub failed: usize,
    /// Statements never sent because the run halted first
    pub not_run: usize,
    pub last_error: Option<String>,
}

impl StatementOutcome {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.not_run == 0
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileOutcome {
    Skipped,
    DryRun,
    Applied,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub filename: String,
    pub outcome: FileOutcome,
    #[serde(flatten)]
    pub statements: StatementOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub run_id: String,
    pub files: Vec<FileReport>,
    /// A failing statement stopped the run early
    pub halted: bool,
}

impl MigrationReport {
    pub fn is_success(&self) -> bool {
        !self.halted
            && self
                .files
                .iter()
                .all(|f| !matches!(f.outcome, FileOutcome::Partial | FileOutcome::Failed))
    }

    pub fn count(&self, outcome: FileOutcome) -> usize {
        self.files.iter().filter(|f| f.outcome == outcome).count()
    }
}

/// One row of `migrate status`
#[derive(Debug, Clone, Serialize)]
pub struct StatusEntry {
    pub filename: String,
    /// `None` when the ledger knows a file that is no longer on disk
    pub state: Option<FileState>,
    pub statements: usize,
    pub record: Option<MigrationRecord>,
}

pub struct Migrator {
    backend: Arc<dyn Backend>,
    pool: DbPool,
    retry: RetryPolicy,
}

impl Migrator {
    pub fn new(backend: Arc<dyn Backend>, pool: DbPool, retry: RetryPolicy) -> Self {
        Self {
            backend,
            pool,
            retry,
        }
    }

    pub async fn plan(&self, path: &std::path::Path) -> Result<MigrationPlan, MigrateError> {
        plan(&self.pool, path).await
    }

    /// Apply every file of the plan that is not already applied
    pub async fn apply(
        &self,
        plan: &MigrationPlan,
        options: &ApplyOptions,
    ) -> Result<MigrationReport, MigrateError> {
        let drifted = plan.drifted();
        if !drifted.is_empty() && !options.force {
            return Err(MigrateError::Drift(
                drifted.into_iter().map(String::from).collect(),
            ));
        }

        let run_id = Uuid::new_v4().to_string();
        info!(
            run_id = %run_id,
            files = plan.files.len(),
            pending = plan.pending_count(),
            atomic = options.atomic,
            on_error = ?options.on_error,
            dry_run = options.dry_run,
            "Starting migration run"
        );

        let mut report = MigrationReport {
            run_id: run_id.clone(),
            files: Vec::new(),
            halted: false,
        };

        for file in &plan.files {
            if file.state == FileState::Applied {
                info!(run_id = %run_id, file = %file.filename, "Already applied, skipping");
                report.files.push(FileReport {
                    filename: file.filename.clone(),
                    outcome: FileOutcome::Skipped,
                    statements: StatementOutcome {
                        total: file.statements.len(),
                        ..Default::default()
                    },
                });
                continue;
            }
            if file.state == FileState::Drifted {
                warn!(run_id = %run_id, file = %file.filename, "Re-applying edited migration");
            }
            if file.state == FileState::Partial {
                warn!(run_id = %run_id, file = %file.filename, "Previous run was partial, re-applying whole file");
            }

            if options.dry_run {
                for (index, statement) in file.statements.iter().enumerate() {
                    info!(
                        file = %file.filename,
                        statement = index + 1,
                        kind = %statement_kind(statement),
                        "[dry-run] {}",
                        preview(statement, PREVIEW_CHARS)
                    );
                }
                report.files.push(FileReport {
                    filename: file.filename.clone(),
                    outcome: FileOutcome::DryRun,
                    statements: StatementOutcome {
                        total: file.statements.len(),
                        not_run: file.statements.len(),
                        ..Default::default()
                    },
                });
                continue;
            }

            let outcome = if options.atomic {
                self.exec_atomic(&file.filename, &file.statements).await
            } else {
                self.exec_statements(&file.filename, &file.statements, options.on_error)
                    .await
            };

            MigrationRecord::new(
                &file.filename,
                &file.checksum,
                outcome.total,
                outcome.ok,
                outcome.failed,
                outcome.last_error.clone(),
            )
            .upsert(&self.pool)
            .await?;

            let file_outcome = match (outcome.ok, outcome.failed) {
                (_, 0) => FileOutcome::Applied,
                (0, _) => FileOutcome::Failed,
                _ => FileOutcome::Partial,
            };
            info!(
                run_id = %run_id,
                file = %file.filename,
                ok = outcome.ok,
                failed = outcome.failed,
                not_run = outcome.not_run,
                "Migration file finished"
            );

            let halt = outcome.failed > 0 && options.on_error == OnError::Halt;
            report.files.push(FileReport {
                filename: file.filename.clone(),
                outcome: file_outcome,
                statements: outcome,
            });
            if halt {
                error!(run_id = %run_id, file = %file.filename, "Halting migration run");
                report.halted = true;
                break;
            }
        }

        Ok(report)
    }

    /// Send statements one by one, retrying transient failures
    pub async fn exec_statements(
        &self,
        label: &str,
        statements: &[String],
        on_error: OnError,
    ) -> StatementOutcome {
        let mut outcome = StatementOutcome {
            total: statements.len(),
            ..Default::default()
        };

        for (index, statement) in statements.iter().enumerate() {
            let kind = statement_kind(statement);
            let result = self
                .retry
                .run("exec_sql", || self.backend.exec_sql(statement))
                .await;

            match result {
                Ok(()) => {
                    outcome.ok += 1;
                    info!(
                        source = label,
                        statement = index + 1,
                        total = statements.len(),
                        kind = %kind,
                        "Statement applied"
                    );
                }
                Err(err) => {
                    outcome.failed += 1;
                    error!(
                        source = label,
                        statement = index + 1,
                        total = statements.len(),
                        kind = %kind,
                        error_kind = err.kind(),
                        sql = %preview(statement, PREVIEW_CHARS),
                        "Statement failed: {}",
                        err
                    );
                    outcome.last_error = Some(describe(index, &err));
                    if on_error == OnError::Halt {
                        outcome.not_run = statements.len() - index - 1;
                        break;
                    }
                }
            }
        }
        outcome
    }

    /// Send all statements in a single call
    async fn exec_atomic(&self, label: &str, statements: &[String]) -> StatementOutcome {
        let mut outcome = StatementOutcome {
            total: statements.len(),
            ..Default::default()
        };
        if statements.is_empty() {
            return outcome;
        }

        let body = statements.join(";\n") + ";";
        match self
            .retry
            .run("exec_sql", || self.backend.exec_sql(&body))
            .await
        {
            Ok(()) => {
                outcome.ok = statements.len();
                info!(source = label, statements = statements.len(), "File applied atomically");
            }
            Err(err) => {
                outcome.failed = statements.len();
                error!(
                    source = label,
                    statements = statements.len(),
                    error_kind = err.kind(),
                    "Atomic apply failed, nothing was applied: {}",
                    err
                );
                outcome.last_error = Some(err.to_string());
            }
        }
        outcome
    }

    /// Split and apply ad-hoc SQL without touching the ledger
    pub async fn exec(
        &self,
        sql: &str,
        options: &ApplyOptions,
    ) -> Result<StatementOutcome, MigrateError> {
        let statements = split_statements(sql)?;
        if options.dry_run {
            for statement in &statements {
                info!(kind = %statement_kind(statement), "[dry-run] {}", preview(statement, PREVIEW_CHARS));
            }
            return Ok(StatementOutcome {
                total: statements.len(),
                not_run: statements.len(),
                ..Default::default()
            });
        }
        if options.atomic {
            return Ok(self.exec_atomic("inline", &statements).await);
        }
        Ok(self
            .exec_statements("inline", &statements, options.on_error)
            .await)
    }

    /// Ledger records joined with the files currently on disk
    pub async fn status(&self, path: &std::path::Path) -> Result<Vec<StatusEntry>, MigrateError> {
        let plan = self.plan(path).await?;
        let mut records = MigrationRecord::list(&self.pool).await?;

        let mut entries: Vec<StatusEntry> = plan
            .files
            .into_iter()
            .map(|file| {
                let record = records
                    .iter()
                    .position(|r| r.filename == file.filename)
                    .map(|i| records.remove(i));
                StatusEntry {
                    filename: file.filename,
                    state: Some(file.state),
                    statements: file.statements.len(),
                    record,
                }
            })
            .collect();

        entries.extend(records.into_iter().map(|record| StatusEntry {
            filename: record.filename.clone(),
            state: None,
            statements: record.statements_total as usize,
            record: Some(record),
        }));
        entries.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(entries)
    }
}

fn describe(index: usize, err: &BackendError) -> String {
    format!("statement {}: {}", index + 1, err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::FakeBackend;
    use crate::db::MigrationStatus;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        migrations: PathBuf,
        backend: Arc<FakeBackend>,
        migrator: Migrator,
        pool: DbPool,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let pool = crate::db::init(&dir.path().join("data")).await.unwrap();
        let migrations = dir.path().join("migrations");
        std::fs::create_dir_all(&migrations).unwrap();

        let backend = Arc::new(FakeBackend::new());
        let retry = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(1));
        let migrator = Migrator::new(backend.clone(), pool.clone(), retry);
        Fixture {
            _dir: dir,
            migrations,
            backend,
            migrator,
            pool,
        }
    }

    fn write(dir: &Path, name: &str, sql: &str) {
        std::fs::write(dir.join(name), sql).unwrap();
    }

    #[tokio::test]
    async fn test_apply_then_rerun_skips_applied_files() {
        let f = fixture().await;
        write(
            &f.migrations,
            "001_customers.sql",
            "CREATE TABLE IF NOT EXISTS customers (id uuid);\nALTER TABLE customers ADD COLUMN IF NOT EXISTS phone text;",
        );
        write(&f.migrations, "002_notes.sql", "COMMENT ON TABLE customers IS 'shop; customers';");

        let plan = f.migrator.plan(&f.migrations).await.unwrap();
        assert_eq!(plan.pending_count(), 2);
        let report = f.migrator.apply(&plan, &ApplyOptions::default()).await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.count(FileOutcome::Applied), 2);
        assert_eq!(f.backend.executed().len(), 3);
        assert_eq!(
            f.backend.executed()[2],
            "COMMENT ON TABLE customers IS 'shop; customers'"
        );

        let again = f.migrator.plan(&f.migrations).await.unwrap();
        assert_eq!(again.pending_count(), 0);
        let report = f.migrator.apply(&again, &ApplyOptions::default()).await.unwrap();
        assert_eq!(report.count(FileOutcome::Skipped), 2);
        assert_eq!(f.backend.executed().len(), 3);
    }

    #[tokio::test]
    async fn test_halt_stops_at_first_failure() {
        let f = fixture().await;
        write(
            &f.migrations,
            "001_mixed.sql",
            "SELECT 1; CREATE TABL broken (); SELECT 3;",
        );
        write(&f.migrations, "002_later.sql", "SELECT 4;");
        f.backend.reject_sql_containing("TABL broken");

        let plan = f.migrator.plan(&f.migrations).await.unwrap();
        let report = f.migrator.apply(&plan, &ApplyOptions::default()).await.unwrap();

        assert!(report.halted);
        assert!(!report.is_success());
        assert_eq!(report.files.len(), 1);
        let file = &report.files[0];
        assert_eq!(file.outcome, FileOutcome::Partial);
        assert_eq!((file.statements.ok, file.statements.failed, file.statements.not_run), (1, 1, 1));
        assert_eq!(f.backend.executed(), vec!["SELECT 1"]);

        let record = MigrationRecord::find(&f.pool, "001_mixed.sql").await.unwrap().unwrap();
        assert_eq!(record.get_status(), MigrationStatus::Partial);
        assert!(record.last_error.unwrap().starts_with("statement 2:"));
        assert!(MigrationRecord::find(&f.pool, "002_later.sql").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_continue_mode_records_failures_and_proceeds() {
        let f = fixture().await;
        write(&f.migrations, "001_mixed.sql", "SELECT 1; CREATE TABL broken (); SELECT 3;");
        write(&f.migrations, "002_later.sql", "SELECT 4;");
        f.backend.reject_sql_containing("TABL broken");

        let plan = f.migrator.plan(&f.migrations).await.unwrap();
        let options = ApplyOptions {
            on_error: OnError::Continue,
            ..Default::default()
        };
        let report = f.migrator.apply(&plan, &options).await.unwrap();

        assert!(!report.halted);
        assert_eq!(report.files[0].outcome, FileOutcome::Partial);
        assert_eq!(report.files[1].outcome, FileOutcome::Applied);
        assert_eq!(f.backend.executed(), vec!["SELECT 1", "SELECT 3", "SELECT 4"]);

        // The partial file is offered again on the next plan
        let again = f.migrator.plan(&f.migrations).await.unwrap();
        assert_eq!(again.files[0].state, FileState::Partial);
        assert_eq!(again.files[1].state, FileState::Applied);
    }

    #[tokio::test]
    async fn test_atomic_mode_sends_one_call() {
        let f = fixture().await;
        write(&f.migrations, "001_fn.sql", "CREATE FUNCTION f() RETURNS int AS $$ SELECT 1; $$ LANGUAGE sql;\nSELECT f();");

        let plan = f.migrator.plan(&f.migrations).await.unwrap();
        let options = ApplyOptions {
            atomic: true,
            ..Default::default()
        };
        let report = f.migrator.apply(&plan, &options).await.unwrap();

        assert!(report.is_success());
        let executed = f.backend.executed();
        assert_eq!(executed.len(), 1);
        assert!(executed[0].contains("$$ SELECT 1; $$"));
        assert!(executed[0].ends_with("SELECT f();"));
    }

    #[tokio::test]
    async fn test_atomic_failure_marks_whole_file_failed() {
        let f = fixture().await;
        write(&f.migrations, "001.sql", "SELECT 1; SELECT broken;");
        f.backend.reject_sql_containing("broken");

        let plan = f.migrator.plan(&f.migrations).await.unwrap();
        let options = ApplyOptions {
            atomic: true,
            ..Default::default()
        };
        let report = f.migrator.apply(&plan, &options).await.unwrap();

        assert_eq!(report.files[0].outcome, FileOutcome::Failed);
        assert_eq!(report.files[0].statements.failed, 2);
        assert!(f.backend.executed().is_empty());
        let record = MigrationRecord::find(&f.pool, "001.sql").await.unwrap().unwrap();
        assert_eq!(record.get_status(), MigrationStatus::Failed);
    }

    #[tokio::test]
    async fn test_drift_blocks_unless_forced() {
        let f = fixture().await;
        write(&f.migrations, "001.sql", "SELECT 1;");
        let plan = f.migrator.plan(&f.migrations).await.unwrap();
        f.migrator.apply(&plan, &ApplyOptions::default()).await.unwrap();

        write(&f.migrations, "001.sql", "-- edited\nSELECT 2;");
        let drifted = f.migrator.plan(&f.migrations).await.unwrap();
        assert_eq!(drifted.drifted(), vec!["001.sql"]);

        let err = f
            .migrator
            .apply(&drifted, &ApplyOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Drift(ref files) if files == &vec!["001.sql".to_string()]));
        assert_eq!(f.backend.executed(), vec!["SELECT 1"]);

        let forced = ApplyOptions {
            force: true,
            ..Default::default()
        };
        let report = f.migrator.apply(&drifted, &forced).await.unwrap();
        assert_eq!(report.count(FileOutcome::Applied), 1);
        assert_eq!(f.backend.executed(), vec!["SELECT 1", "SELECT 2"]);
    }

    #[tokio::test]
    async fn test_comment_only_edit_is_not_drift() {
        let f = fixture().await;
        write(&f.migrations, "001.sql", "SELECT 1;");
        let plan = f.migrator.plan(&f.migrations).await.unwrap();
        f.migrator.apply(&plan, &ApplyOptions::default()).await.unwrap();

        write(&f.migrations, "001.sql", "-- explain the query\nSELECT 1;");
        let plan = f.migrator.plan(&f.migrations).await.unwrap();
        assert_eq!(plan.files[0].state, FileState::Applied);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let f = fixture().await;
        write(&f.migrations, "001.sql", "SELECT 1;");
        f.backend.fail_transiently("exec_sql", 2);

        let plan = f.migrator.plan(&f.migrations).await.unwrap();
        let report = f.migrator.apply(&plan, &ApplyOptions::default()).await.unwrap();
        assert!(report.is_success());
        assert_eq!(f.backend.executed(), vec!["SELECT 1"]);
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let f = fixture().await;
        write(&f.migrations, "001.sql", "SELECT 1; SELECT 2;");

        let plan = f.migrator.plan(&f.migrations).await.unwrap();
        let options = ApplyOptions {
            dry_run: true,
            ..Default::default()
        };
        let report = f.migrator.apply(&plan, &options).await.unwrap();

        assert_eq!(report.files[0].outcome, FileOutcome::DryRun);
        assert_eq!(report.files[0].statements.not_run, 2);
        assert!(f.backend.executed().is_empty());
        assert!(MigrationRecord::list(&f.pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exec_inline_sql() {
        let f = fixture().await;
        let outcome = f
            .migrator
            .exec("UPDATE customers SET city = 'Arusha; TZ' WHERE id = 1; SELECT 2", &ApplyOptions::default())
            .await
            .unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.ok, 2);
        assert!(MigrationRecord::list(&f.pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_status_includes_orphaned_records() {
        let f = fixture().await;
        write(&f.migrations, "001.sql", "SELECT 1;");
        write(&f.migrations, "002.sql", "SELECT 2;");
        MigrationRecord::new("000_removed.sql", "zzz", 1, 1, 0, None)
            .upsert(&f.pool)
            .await
            .unwrap();
        let plan = f.migrator.plan(&f.migrations).await.unwrap();
        f.migrator
            .apply(
                &MigrationPlan {
                    files: vec![plan.files[0].clone()],
                },
                &ApplyOptions::default(),
            )
            .await
            .unwrap();

        let status = f.migrator.status(&f.migrations).await.unwrap();
        assert_eq!(status.len(), 3);
        assert_eq!(status[0].filename, "000_removed.sql");
        assert_eq!(status[0].state, None);
        assert_eq!(status[1].state, Some(FileState::Applied));
        assert_eq!(status[2].state, Some(FileState::Pending));
        assert!(status[2].record.is_none());
    }
}
