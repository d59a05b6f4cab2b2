//! Command-line interface for shopkeep.
//!
//! Subcommands:
//! - `config check` - Validate configuration and credentials
//! - `migrate plan|apply|status|exec` - Run SQL against the backend with a local ledger
//! - `sql split|chunk` - Inspect and split SQL files offline
//! - `rls enable|disable` - Patch row-level security on tables
//! - `import contacts|status|reset` - Resumable contact import
//! - `analyze messages` - Offline customer segmentation of a messages export
//! - `probe` - Read-only backend diagnostics
//! - `storage list|ensure` - Storage buckets
//! - `backup export` - JSON export of tables

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::analysis;
use crate::backend::{Backend, RestBackend};
use crate::backup;
use crate::config::{redact, Config, OnError};
use crate::contacts::{format_duration, Importer, Sources};
use crate::db::{self, DbPool, ImportProgress};
use crate::migrate::{ApplyOptions, FileOutcome, MigrationReport, Migrator, StatementOutcome};
use crate::probe;
use crate::rls::{self, RlsPatch};
use crate::sql;
use crate::storage::{self, EnsureOutcome};

/// CLI arguments structure
#[derive(Parser, Debug)]
#[command(name = "shopkeep")]
#[command(author, version, about = "Maintenance tool for the shop's hosted database", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "shopkeep.toml")]
    pub config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Backend base URL
    #[arg(long, env = "SHOPKEEP_BACKEND_URL")]
    pub backend_url: Option<String>,

    /// Anonymous API key
    #[arg(long, env = "SHOPKEEP_ANON_KEY", hide_env_values = true)]
    pub anon_key: Option<String>,

    /// Service-role API key
    #[arg(long, env = "SHOPKEEP_SERVICE_KEY", hide_env_values = true)]
    pub service_key: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Configuration commands
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Apply SQL migrations to the backend
    #[command(subcommand)]
    Migrate(MigrateCommands),

    /// Offline SQL file utilities
    #[command(subcommand)]
    Sql(SqlCommands),

    /// Row-level security patches
    #[command(subcommand)]
    Rls(RlsCommands),

    /// Contact import
    #[command(subcommand)]
    Import(ImportCommands),

    /// Offline analysis
    #[command(subcommand)]
    Analyze(AnalyzeCommands),

    /// Check connectivity, table visibility and backend features
    Probe {
        /// Tables to check (comma separated); defaults to the shop's core tables
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,
    },

    /// Storage buckets
    #[command(subcommand)]
    Storage(StorageCommands),

    /// Table backups
    #[command(subcommand)]
    Backup(BackupCommands),
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Validate configuration and show the effective settings
    Check,
}

#[derive(Subcommand, Debug)]
pub enum MigrateCommands {
    /// Show which files would be applied
    Plan {
        /// Migration file or directory (defaults to migrate.dir)
        path: Option<PathBuf>,
    },
    /// Apply pending files
    Apply {
        path: Option<PathBuf>,
        /// Keep going after a failing statement
        #[arg(long)]
        continue_on_error: bool,
        /// Send each file as a single call
        #[arg(long)]
        atomic: bool,
        /// Print the statements without executing them
        #[arg(long)]
        dry_run: bool,
        /// Re-apply files edited since they were applied
        #[arg(long)]
        force: bool,
    },
    /// Show ledger state for each file
    Status { path: Option<PathBuf> },
    /// Execute SQL without recording it in the ledger
    Exec {
        /// SQL file to execute
        #[arg(long, conflicts_with = "sql", required_unless_present = "sql")]
        file: Option<PathBuf>,
        /// Inline SQL
        #[arg(long)]
        sql: Option<String>,
        #[arg(long)]
        continue_on_error: bool,
        #[arg(long)]
        atomic: bool,
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum SqlCommands {
    /// List the statements of a SQL file
    Split { file: PathBuf },
    /// Split a large multi-row INSERT into smaller files
    Chunk {
        file: PathBuf,
        /// Rows per output file
        #[arg(long, default_value = "500")]
        size: usize,
        /// Output directory
        #[arg(long)]
        out: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
pub enum RlsCommands {
    /// Enable RLS with a permissive policy
    Enable {
        #[arg(required = true)]
        tables: Vec<String>,
        /// Roles the policy applies to (repeatable)
        #[arg(long)]
        role: Vec<String>,
        /// Policy name
        #[arg(long)]
        policy: Option<String>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Disable RLS
    Disable {
        #[arg(required = true)]
        tables: Vec<String>,
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum ImportCommands {
    /// Merge contact sources and import them as customers
    Contacts {
        /// SMS backup XML
        #[arg(long)]
        sms: Option<PathBuf>,
        /// Contacts CSV export
        #[arg(long)]
        csv: Option<PathBuf>,
        /// Call log CSV export
        #[arg(long)]
        call_log: Option<PathBuf>,
        /// Job name used to resume an interrupted import
        #[arg(long, default_value = "contacts")]
        job: String,
        #[arg(long)]
        dry_run: bool,
        /// Also import SMS and call history
        #[arg(long)]
        with_history: bool,
    },
    /// Show recorded progress for a job
    Status {
        #[arg(long, default_value = "contacts")]
        job: String,
    },
    /// Forget recorded progress so the job starts over
    Reset {
        #[arg(long, default_value = "contacts")]
        job: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum AnalyzeCommands {
    /// Segment customers from a messages CSV export
    Messages {
        file: PathBuf,
        /// Report path (default: customer-analysis-<date>.json)
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
pub enum StorageCommands {
    /// List buckets
    List,
    /// Create a bucket if it does not exist
    Ensure {
        name: String,
        #[arg(long)]
        public: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum BackupCommands {
    /// Export tables to a JSON file
    Export {
        #[arg(long, value_delimiter = ',', required = true)]
        tables: Vec<String>,
        /// Output directory
        #[arg(long, default_value = "./backups")]
        out: PathBuf,
        #[arg(long, default_value_t = backup::DEFAULT_PAGE_SIZE)]
        page_size: usize,
        /// Unique column the pages are ordered by
        #[arg(long, default_value = backup::DEFAULT_ORDER_KEY)]
        order_by: String,
    },
}

/// Load the config file and apply `.env`, environment and flag overrides
pub fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load_with_env(&cli.config)?;
    if let Some(url) = &cli.backend_url {
        config.backend.url = url.clone();
    }
    if let Some(key) = &cli.anon_key {
        config.backend.anon_key = Some(key.clone());
    }
    if let Some(key) = &cli.service_key {
        config.backend.service_key = Some(key.clone());
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    Ok(config)
}

/// Resources shared by the command handlers
struct Session<'a> {
    cli: &'a Cli,
    config: Config,
}

impl Session<'_> {
    fn backend(&self) -> Result<Arc<dyn Backend>> {
        let backend = RestBackend::new(&self.config.backend)
            .context("Backend is not configured. Set backend.url or SHOPKEEP_BACKEND_URL")?;
        Ok(Arc::new(backend))
    }

    async fn ledger(&self) -> Result<DbPool> {
        db::init(&self.config.ledger.data_dir).await
    }

    async fn migrator(&self) -> Result<Migrator> {
        Ok(Migrator::new(
            self.backend()?,
            self.ledger().await?,
            self.config.retry.policy(),
        ))
    }

    fn migrations_path(&self, path: &Option<PathBuf>) -> PathBuf {
        path.clone().unwrap_or_else(|| self.config.migrate.dir.clone())
    }

    fn on_error(&self, continue_on_error: bool) -> OnError {
        if continue_on_error {
            OnError::Continue
        } else {
            self.config.migrate.on_error
        }
    }

    fn json(&self) -> bool {
        self.cli.json
    }
}

/// Run a CLI command
pub async fn run_command(cli: &Cli, config: Config) -> Result<()> {
    let session = Session { cli, config };
    match &cli.command {
        Commands::Config(ConfigCommands::Check) => cmd_config_check(&session),
        Commands::Migrate(cmd) => cmd_migrate(&session, cmd).await,
        Commands::Sql(cmd) => cmd_sql(&session, cmd),
        Commands::Rls(cmd) => cmd_rls(&session, cmd).await,
        Commands::Import(cmd) => cmd_import(&session, cmd).await,
        Commands::Analyze(AnalyzeCommands::Messages { file, out }) => {
            cmd_analyze(&session, file, out.as_deref())
        }
        Commands::Probe { tables } => cmd_probe(&session, tables).await,
        Commands::Storage(cmd) => cmd_storage(&session, cmd).await,
        Commands::Backup(BackupCommands::Export {
            tables,
            out,
            page_size,
            order_by,
        }) => cmd_backup(&session, tables, out, order_by, *page_size).await,
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn marker(ok: bool) -> &'static str {
    if ok {
        "[OK]"
    } else {
        "[!!]"
    }
}

// ============================================================================
// config
// ============================================================================

fn cmd_config_check(session: &Session) -> Result<()> {
    let config = &session.config;
    let check = config.validate();

    if session.json() {
        print_json(&serde_json::json!({
            "ok": check.is_ok(),
            "errors": check.errors,
            "warnings": check.warnings,
        }))?;
    } else {
        println!("Checking configuration: {}", session.cli.config.display());
        println!();
        println!("{} Configuration is {}", marker(check.is_ok()), if check.is_ok() { "valid" } else { "invalid" });
        println!();
        println!("Backend:");
        println!("  URL:          {}", if config.backend.url.is_empty() { "-" } else { config.backend.url.as_str() });
        println!("  Anon Key:     {}", config.backend.anon_key.as_deref().map(redact).unwrap_or_else(|| "-".to_string()));
        println!("  Service Key:  {}", config.backend.service_key.as_deref().map(redact).unwrap_or_else(|| "-".to_string()));
        println!("  SQL Function: {}({})", config.backend.exec_sql_function, config.backend.exec_sql_arg);
        println!("  Schema:       {}", config.backend.schema);
        println!();
        println!("Import:");
        println!("  Batch Size:   {}", config.import.batch_size);
        println!("  Batch Delay:  {}ms", config.import.batch_delay_ms);
        println!("  Country Code: +{}", config.import.country_code);
        println!("  Upsert On:    {}", config.import.conflict_column.as_deref().unwrap_or("-"));
        println!();
        println!("Ledger:         {}", config.ledger_path().display());
        println!("Migrations:     {}", config.migrate.dir.display());
        println!();

        for error in &check.errors {
            println!("  [!!] {}", error);
        }
        for warning in &check.warnings {
            println!("  [!] {}", warning);
        }
        if !check.errors.is_empty() || !check.warnings.is_empty() {
            println!();
        }
    }

    if !check.is_ok() {
        anyhow::bail!("Invalid configuration");
    }
    Ok(())
}

// ============================================================================
// migrate
// ============================================================================

async fn cmd_migrate(session: &Session<'_>, cmd: &MigrateCommands) -> Result<()> {
    match cmd {
        MigrateCommands::Plan { path } => {
            let path = session.migrations_path(path);
            let pool = session.ledger().await?;
            let plan = crate::migrate::plan(&pool, &path).await?;

            if session.json() {
                return print_json(&plan);
            }
            if plan.files.is_empty() {
                println!("No migration files found in {}", path.display());
                return Ok(());
            }
            println!();
            println!("{:<50}  {:<10}  {:>10}", "FILE", "STATE", "STATEMENTS");
            println!("{}", "-".repeat(74));
            for file in &plan.files {
                println!(
                    "{:<50}  {:<10}  {:>10}",
                    truncate(&file.filename, 50),
                    file.state.to_string(),
                    file.statements.len()
                );
            }
            println!();
            println!("{} of {} files to apply", plan.pending_count(), plan.files.len());
            let drifted = plan.drifted();
            if !drifted.is_empty() {
                println!("[!] Edited since applied: {} (apply with --force)", drifted.join(", "));
            }
            println!();
            Ok(())
        }
        MigrateCommands::Apply {
            path,
            continue_on_error,
            atomic,
            dry_run,
            force,
        } => {
            let path = session.migrations_path(path);
            let migrator = session.migrator().await?;
            let plan = migrator.plan(&path).await?;
            let options = ApplyOptions {
                on_error: session.on_error(*continue_on_error),
                atomic: *atomic || session.config.migrate.atomic,
                dry_run: *dry_run,
                force: *force,
            };
            let report = migrator.apply(&plan, &options).await?;

            if session.json() {
                print_json(&report)?;
            } else {
                print_migration_report(&report);
            }
            if !report.is_success() {
                anyhow::bail!("Migration failed");
            }
            Ok(())
        }
        MigrateCommands::Status { path } => {
            let path = session.migrations_path(path);
            let migrator = session.migrator().await?;
            let entries = migrator.status(&path).await?;

            if session.json() {
                return print_json(&entries);
            }
            println!();
            println!(
                "{:<50}  {:<10}  {:>9}  {:<25}",
                "FILE", "STATE", "OK/TOTAL", "APPLIED AT"
            );
            println!("{}", "-".repeat(100));
            for entry in &entries {
                let state = entry
                    .state
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "missing".to_string());
                let (counts, applied_at) = match &entry.record {
                    Some(r) => (
                        format!("{}/{}", r.statements_ok, r.statements_total),
                        r.applied_at.clone(),
                    ),
                    None => (format!("0/{}", entry.statements), "-".to_string()),
                };
                println!(
                    "{:<50}  {:<10}  {:>9}  {:<25}",
                    truncate(&entry.filename, 50),
                    state,
                    counts,
                    applied_at
                );
            }
            println!();
            Ok(())
        }
        MigrateCommands::Exec {
            file,
            sql,
            continue_on_error,
            atomic,
            dry_run,
        } => {
            let text = match (file, sql) {
                (Some(path), _) => std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read SQL file: {}", path.display()))?,
                (None, Some(sql)) => sql.clone(),
                (None, None) => anyhow::bail!("Provide --file or --sql"),
            };
            let migrator = session.migrator().await?;
            let options = ApplyOptions {
                on_error: session.on_error(*continue_on_error),
                atomic: *atomic,
                dry_run: *dry_run,
                force: false,
            };
            let outcome = migrator.exec(&text, &options).await?;
            report_statements(session, "SQL", &outcome, *dry_run)
        }
    }
}

fn print_migration_report(report: &MigrationReport) {
    println!();
    for file in &report.files {
        let icon = match file.outcome {
            FileOutcome::Applied | FileOutcome::Skipped | FileOutcome::DryRun => "[OK]",
            FileOutcome::Partial | FileOutcome::Failed => "[!!]",
        };
        let outcome = match file.outcome {
            FileOutcome::Skipped => "already applied".to_string(),
            FileOutcome::DryRun => format!("{} statements (dry run)", file.statements.total),
            _ => format!("{}/{} statements", file.statements.ok, file.statements.total),
        };
        println!("  {} {:50} {}", icon, truncate(&file.filename, 50), outcome);
        if let Some(error) = &file.statements.last_error {
            println!("       {}", error);
        }
    }
    println!();
    println!(
        "Applied: {}  Skipped: {}  Partial: {}  Failed: {}",
        report.count(FileOutcome::Applied),
        report.count(FileOutcome::Skipped),
        report.count(FileOutcome::Partial),
        report.count(FileOutcome::Failed)
    );
    if report.halted {
        println!("[!!] Run halted at the first failing statement");
    }
    println!("Run ID: {}", report.run_id);
    println!();
}

fn report_statements(
    session: &Session,
    what: &str,
    outcome: &StatementOutcome,
    dry_run: bool,
) -> Result<()> {
    if session.json() {
        print_json(outcome)?;
    } else if dry_run {
        println!("[OK] {} statements not executed (dry run)", outcome.total);
    } else {
        println!(
            "{} {}: {}/{} statements succeeded",
            marker(outcome.is_success()),
            what,
            outcome.ok,
            outcome.total
        );
        if outcome.not_run > 0 {
            println!("     {} statements not run", outcome.not_run);
        }
        if let Some(error) = &outcome.last_error {
            println!("     {}", error);
        }
    }
    if !dry_run && !outcome.is_success() {
        anyhow::bail!("{} failed", what);
    }
    Ok(())
}

// ============================================================================
// sql
// ============================================================================

fn cmd_sql(session: &Session, cmd: &SqlCommands) -> Result<()> {
    match cmd {
        SqlCommands::Split { file } => {
            let text = std::fs::read_to_string(file)
                .with_context(|| format!("Failed to read SQL file: {}", file.display()))?;
            let statements = sql::split_statements(&text)?;

            if session.json() {
                return print_json(&serde_json::json!({
                    "file": file,
                    "checksum": sql::checksum(&statements),
                    "statements": statements,
                }));
            }
            println!();
            for (i, statement) in statements.iter().enumerate() {
                println!(
                    "{:>4}  {:<16}  {}",
                    i + 1,
                    sql::statement_kind(statement),
                    sql::preview(statement, 80)
                );
            }
            println!();
            println!("{} statements, checksum {}", statements.len(), sql::checksum(&statements));
            Ok(())
        }
        SqlCommands::Chunk { file, size, out } => {
            let paths = sql::write_chunk_files(file, out, *size)?;
            if session.json() {
                return print_json(&paths);
            }
            for path in &paths {
                println!("  {}", path.display());
            }
            println!("[OK] Wrote {} files to {}", paths.len(), out.display());
            Ok(())
        }
    }
}

// ============================================================================
// rls
// ============================================================================

async fn cmd_rls(session: &Session<'_>, cmd: &RlsCommands) -> Result<()> {
    let schema = session.config.backend.schema.clone();
    let (statements, dry_run) = match cmd {
        RlsCommands::Enable {
            tables,
            role,
            policy,
            dry_run,
        } => {
            let patches: Vec<RlsPatch> = tables
                .iter()
                .map(|table| {
                    let mut patch = RlsPatch::permissive(table.as_str()).with_roles(role.clone());
                    patch.schema = schema.clone();
                    match policy {
                        Some(name) => patch.with_policy_name(name.as_str()),
                        None => patch,
                    }
                })
                .collect();
            (rls::build(&patches)?, *dry_run)
        }
        RlsCommands::Disable { tables, dry_run } => {
            let statements = tables
                .iter()
                .map(|table| rls::disable_sql(&schema, table))
                .collect::<Result<Vec<_>, _>>()?;
            (statements, *dry_run)
        }
    };

    if dry_run {
        if session.json() {
            return print_json(&statements);
        }
        for statement in &statements {
            println!("{};", statement);
        }
        return Ok(());
    }

    let migrator = session.migrator().await?;
    let outcome = rls::apply(&migrator, &statements).await;
    report_statements(session, "RLS", &outcome, false)
}

// ============================================================================
// import
// ============================================================================

async fn cmd_import(session: &Session<'_>, cmd: &ImportCommands) -> Result<()> {
    match cmd {
        ImportCommands::Contacts {
            sms,
            csv,
            call_log,
            job,
            dry_run,
            with_history,
        } => {
            let config = &session.config;
            let sources = Sources::load(
                sms.as_deref(),
                csv.as_deref(),
                call_log.as_deref(),
                &config.import,
            )?;
            let merged = sources.merge();

            let importer = Importer::new(
                session.backend()?,
                session.ledger().await?,
                config.import.clone(),
                config.retry.policy(),
            );
            let stats = importer.run(&merged.contacts, job, *dry_run).await?;
            let history = if *with_history && !*dry_run {
                Some(importer.import_history(&sources.history(), job).await?)
            } else {
                None
            };

            if session.json() {
                print_json(&serde_json::json!({
                    "job": job,
                    "merge": merged.stats,
                    "customers": stats,
                    "history": history,
                }))?;
            } else {
                let m = &merged.stats;
                println!();
                println!("=== Import: {} ===", job);
                println!();
                println!("Sources:");
                println!("  SMS only:      {}", m.sms_only);
                println!("  CSV only:      {}", m.csv_only);
                println!("  Call log only: {}", m.call_log_only);
                println!("  Merged:        {}", m.merged);
                println!("  Total:         {}", m.total);
                if let Some(calls) = &sources.calls {
                    println!(
                        "  Call time:     {} over {} calls",
                        format_duration(calls.stats.total_duration_secs),
                        calls.stats.local
                    );
                }
                println!();
                println!("Customers:");
                println!("  Imported:      {}", stats.imported);
                println!("  Skipped:       {}", stats.skipped);
                println!("  Errors:        {}", stats.errors);
                println!(
                    "  Chunks:        {} done, {} resumed, {} failed",
                    stats.chunks_done, stats.chunks_resumed, stats.chunks_failed
                );
                if let Some(h) = &history {
                    println!();
                    println!("History:");
                    println!("  Imported:      {}", h.imported);
                    println!("  Skipped:       {}", h.skipped);
                    println!("  No customer:   {}", h.unknown_customer);
                    println!("  Errors:        {}", h.errors);
                }
                println!();
                if *dry_run {
                    println!("[OK] Dry run: {} customers would be imported", stats.planned);
                } else {
                    let ok = stats.chunks_failed == 0
                        && history.as_ref().map(|h| h.chunks_failed == 0).unwrap_or(true);
                    println!("{} Import {}", marker(ok), if ok { "complete" } else { "finished with failed chunks; re-run to retry them" });
                }
                println!();
            }

            let failed = stats.chunks_failed + history.map(|h| h.chunks_failed).unwrap_or(0);
            if failed > 0 {
                anyhow::bail!("{} chunks failed", failed);
            }
            Ok(())
        }
        ImportCommands::Status { job } => {
            let pool = session.ledger().await?;
            let summary = ImportProgress::summary(&pool, job).await?;
            let chunks = ImportProgress::list(&pool, job).await?;

            if session.json() {
                return print_json(&serde_json::json!({
                    "job": job,
                    "summary": summary,
                    "chunks": chunks,
                }));
            }
            if chunks.is_empty() {
                println!("No progress recorded for job '{}'", job);
                return Ok(());
            }
            println!();
            println!(
                "{:>8}  {:>6}  {:<8}  {:>8}  {:>8}  {:>6}  {:<25}",
                "OFFSET", "SIZE", "STATUS", "IMPORTED", "SKIPPED", "ERRORS", "UPDATED"
            );
            println!("{}", "-".repeat(83));
            for chunk in &chunks {
                println!(
                    "{:>8}  {:>6}  {:<8}  {:>8}  {:>8}  {:>6}  {:<25}",
                    chunk.chunk_offset,
                    chunk.chunk_size,
                    chunk.status,
                    chunk.imported,
                    chunk.skipped,
                    chunk.errors,
                    chunk.updated_at
                );
                if let Some(error) = &chunk.last_error {
                    println!("          {}", truncate(error, 70));
                }
            }
            println!();
            println!(
                "{} done, {} failed; {} imported, {} skipped, {} errors",
                summary.chunks_done,
                summary.chunks_failed,
                summary.imported,
                summary.skipped,
                summary.errors
            );
            println!();
            Ok(())
        }
        ImportCommands::Reset { job } => {
            let pool = session.ledger().await?;
            let removed = ImportProgress::reset(&pool, job).await?;
            if session.json() {
                return print_json(&serde_json::json!({ "job": job, "removed": removed }));
            }
            println!("[OK] Cleared {} progress records for job '{}'", removed, job);
            Ok(())
        }
    }
}

// ============================================================================
// analyze
// ============================================================================

fn cmd_analyze(session: &Session, file: &Path, out: Option<&Path>) -> Result<()> {
    let now = Utc::now();
    let report = analysis::analyze_file(file, now)?;
    let path = out
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(analysis::default_report_name(now)));
    report.write(&path)?;

    if session.json() {
        return print_json(&report.summary);
    }
    println!();
    println!("=== Customer Analysis ===");
    println!();
    println!("Customers:  {}", report.summary.customers);
    println!(
        "Messages:   {} of {} from customers",
        report.summary.messages_considered, report.summary.messages_total
    );
    println!();
    println!("{:<16}  {:>6}  {}", "SEGMENT", "COUNT", "STRATEGY");
    println!("{}", "-".repeat(90));
    for segment in &report.segments {
        println!(
            "{:<16}  {:>6}  {}",
            format!("{:?}", segment.kind),
            segment.count,
            truncate(segment.strategy, 64)
        );
    }
    println!();
    println!("[OK] Report written to {}", path.display());
    Ok(())
}

// ============================================================================
// probe, storage, backup
// ============================================================================

async fn cmd_probe(session: &Session<'_>, tables: &[String]) -> Result<()> {
    let tables: Vec<String> = if tables.is_empty() {
        probe::DEFAULT_TABLES.iter().map(|t| t.to_string()).collect()
    } else {
        tables.to_vec()
    };
    let backend = session.backend()?;
    let report = probe::run_probe(backend.as_ref(), &tables).await;

    if session.json() {
        print_json(&report)?;
    } else {
        println!();
        println!("=== Backend Probe: {} ===", session.config.backend.url);
        println!();
        for check in &report.checks {
            println!("  {} {:32} {}", marker(check.passed), truncate(&check.name, 32), check.message);
            if let Some(details) = &check.details {
                if !check.passed {
                    println!("       {}", details);
                }
            }
        }
        println!();
        println!("{}", report.summary);
        println!();
    }

    if !report.all_critical_passed {
        anyhow::bail!("Backend unreachable");
    }
    Ok(())
}

async fn cmd_storage(session: &Session<'_>, cmd: &StorageCommands) -> Result<()> {
    let backend = session.backend()?;
    match cmd {
        StorageCommands::List => {
            let buckets = storage::list(backend.as_ref()).await?;
            if session.json() {
                return print_json(&buckets);
            }
            if buckets.is_empty() {
                println!("No buckets found.");
                return Ok(());
            }
            println!();
            println!("{:<30}  {:<8}  {:<25}", "NAME", "PUBLIC", "CREATED");
            println!("{}", "-".repeat(67));
            for bucket in &buckets {
                println!(
                    "{:<30}  {:<8}  {:<25}",
                    truncate(&bucket.name, 30),
                    if bucket.public { "yes" } else { "no" },
                    bucket.created_at.as_deref().unwrap_or("-")
                );
            }
            println!();
            Ok(())
        }
        StorageCommands::Ensure { name, public } => {
            let outcome = storage::ensure_bucket(backend.as_ref(), name, *public).await?;
            if session.json() {
                return print_json(&serde_json::json!({ "bucket": name, "outcome": outcome }));
            }
            match outcome {
                EnsureOutcome::Created => println!("[OK] Created bucket '{}'", name),
                EnsureOutcome::AlreadyExists => println!("[OK] Bucket '{}' already exists", name),
            }
            Ok(())
        }
    }
}

async fn cmd_backup(
    session: &Session<'_>,
    tables: &[String],
    out: &Path,
    order_by: &str,
    page_size: usize,
) -> Result<()> {
    let backend = session.backend()?;
    let retry = session.config.retry.policy();
    let summary =
        backup::export_tables(backend.as_ref(), &retry, tables, order_by, page_size, out).await?;

    if session.json() {
        return print_json(&summary);
    }
    println!();
    for table in &summary.tables {
        println!("  {:<32} {:>8} rows", truncate(&table.table, 32), table.rows);
    }
    println!();
    println!(
        "[OK] Exported {} rows from {} tables to {}",
        summary.total_rows(),
        summary.tables.len(),
        summary.path.display()
    );
    Ok(())
}

/// Truncate a string to max characters with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
