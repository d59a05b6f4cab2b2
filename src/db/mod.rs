mod models;

pub use models::*;

use anyhow::{Context, Result};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

use crate::sql::split_statements;

pub type DbPool = SqlitePool;

pub const LEDGER_FILE: &str = "shopkeep.db";

/// Execute a SQL migration file statement by statement
async fn execute_sql(pool: &SqlitePool, sql: &str) -> Result<()> {
    for statement in split_statements(sql)? {
        sqlx::query(&statement).execute(pool).await?;
    }
    Ok(())
}

/// Open (creating if needed) the ledger database in `data_dir`
pub async fn init(data_dir: &Path) -> Result<DbPool> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

    let db_path = data_dir.join(LEDGER_FILE);
    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

    info!("Opening ledger at {}", db_path.display());

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await
        .with_context(|| format!("Failed to open ledger: {}", db_path.display()))?;

    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&pool)
        .await?;

    run_migrations(&pool).await?;
    Ok(pool)
}

async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    execute_sql(pool, include_str!("../../migrations/001_ledger.sql"))
        .await
        .context("Failed to apply ledger schema")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_init_creates_schema_and_is_repeatable() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("state");

        let pool = init(&nested).await.unwrap();
        assert!(nested.join(LEDGER_FILE).exists());

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert!(names.contains(&"import_progress"));
        assert!(names.contains(&"migration_records"));
        pool.close().await;

        // Reopening applies the schema again without error
        let again = init(&nested).await.unwrap();
        again.close().await;
    }
}
