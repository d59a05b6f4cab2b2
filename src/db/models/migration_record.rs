//! Applied-migration records.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::db::DbPool;

/// Outcome of applying a migration file
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    /// Every statement succeeded
    Applied,
    /// Some statements succeeded, at least one failed
    Partial,
    /// No statement succeeded
    Failed,
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationStatus::Applied => write!(f, "applied"),
            MigrationStatus::Partial => write!(f, "partial"),
            MigrationStatus::Failed => write!(f, "failed"),
        }
    }
}

impl MigrationStatus {
    pub fn from_counts(ok: usize, failed: usize) -> Self {
        match (ok, failed) {
            (_, 0) => MigrationStatus::Applied,
            (0, _) => MigrationStatus::Failed,
            _ => MigrationStatus::Partial,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MigrationRecord {
    pub filename: String,
    pub checksum: String,
    pub status: String,
    pub statements_total: i64,
    pub statements_ok: i64,
    pub statements_failed: i64,
    pub last_error: Option<String>,
    pub applied_at: String,
}

impl MigrationRecord {
    pub fn new(
        filename: &str,
        checksum: &str,
        statements_total: usize,
        statements_ok: usize,
        statements_failed: usize,
        last_error: Option<String>,
    ) -> Self {
        Self {
            filename: filename.to_string(),
            checksum: checksum.to_string(),
            status: MigrationStatus::from_counts(statements_ok, statements_failed).to_string(),
            statements_total: statements_total as i64,
            statements_ok: statements_ok as i64,
            statements_failed: statements_failed as i64,
            last_error,
            applied_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn get_status(&self) -> MigrationStatus {
        match self.status.as_str() {
            "applied" => MigrationStatus::Applied,
            "partial" => MigrationStatus::Partial,
            _ => MigrationStatus::Failed,
        }
    }

    pub async fn find(pool: &DbPool, filename: &str) -> sqlx::Result<Option<Self>> {
        sqlx::query_as::<_, MigrationRecord>(
            "SELECT * FROM migration_records WHERE filename = ?",
        )
        .bind(filename)
        .fetch_optional(pool)
        .await
    }

    pub async fn list(pool: &DbPool) -> sqlx::Result<Vec<Self>> {
        sqlx::query_as::<_, MigrationRecord>(
            "SELECT * FROM migration_records ORDER BY filename",
        )
        .fetch_all(pool)
        .await
    }

    pub async fn upsert(&self, pool: &DbPool) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO migration_records
                (filename, checksum, status, statements_total, statements_ok,
                 statements_failed, last_error, applied_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(filename) DO UPDATE SET
                checksum = excluded.checksum,
                status = excluded.status,
                statements_total = excluded.statements_total,
                statements_ok = excluded.statements_ok,
                statements_failed = excluded.statements_failed,
                last_error = excluded.last_error,
                applied_at = excluded.applied_at
            "#,
        )
        .bind(&self.filename)
        .bind(&self.checksum)
        .bind(&self.status)
        .bind(self.statements_total)
        .bind(self.statements_ok)
        .bind(self.statements_failed)
        .bind(&self.last_error)
        .bind(&self.applied_at)
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_status_from_counts() {
        assert_eq!(MigrationStatus::from_counts(5, 0), MigrationStatus::Applied);
        assert_eq!(MigrationStatus::from_counts(0, 0), MigrationStatus::Applied);
        assert_eq!(MigrationStatus::from_counts(3, 1), MigrationStatus::Partial);
        assert_eq!(MigrationStatus::from_counts(0, 2), MigrationStatus::Failed);
    }

    #[tokio::test]
    async fn test_upsert_replaces_previous_outcome() {
        let dir = TempDir::new().unwrap();
        let pool = crate::db::init(dir.path()).await.unwrap();

        let first = MigrationRecord::new("001_init.sql", "aaa", 4, 2, 2, Some("boom".into()));
        first.upsert(&pool).await.unwrap();
        assert_eq!(
            MigrationRecord::find(&pool, "001_init.sql").await.unwrap().unwrap().get_status(),
            MigrationStatus::Partial
        );

        let second = MigrationRecord::new("001_init.sql", "bbb", 4, 4, 0, None);
        second.upsert(&pool).await.unwrap();

        let records = MigrationRecord::list(&pool).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].checksum, "bbb");
        assert_eq!(records[0].get_status(), MigrationStatus::Applied);
        assert!(records[0].last_error.is_none());
        assert!(MigrationRecord::find(&pool, "002.sql").await.unwrap().is_none());
    }
}
