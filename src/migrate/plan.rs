use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::MigrateError;
use crate::db::{DbPool, MigrationRecord, MigrationStatus};
use crate::sql::{checksum, split_statements};

/// Where a migration file stands relative to the ledger
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    /// Never applied, or the last attempt failed completely
    Pending,
    /// Applied with the same checksum
    Applied,
    /// Applied, but the file has been edited since
    Drifted,
    /// Last attempt applied only some statements
    Partial,
}

impl std::fmt::Display for FileState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileState::Pending => write!(f, "pending"),
            FileState::Applied => write!(f, "applied"),
            FileState::Drifted => write!(f, "drifted"),
            FileState::Partial => write!(f, "partial"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedFile {
    pub filename: String,
    pub path: PathBuf,
    pub checksum: String,
    pub statements: Vec<String>,
    pub state: FileState,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationPlan {
    pub files: Vec<PlannedFile>,
}

impl MigrationPlan {
    pub fn drifted(&self) -> Vec<&str> {
        self.files
            .iter()
            .filter(|f| f.state == FileState::Drifted)
            .map(|f| f.filename.as_str())
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.files
            .iter()
            .filter(|f| f.state != FileState::Applied)
            .count()
    }
}

/// `.sql` files under `path` sorted by filename, or `path` itself when it is a file
pub fn collect_files(path: &Path) -> Result<Vec<PathBuf>, MigrateError> {
    if !path.exists() {
        return Err(MigrateError::NotFound(path.to_path_buf()));
    }
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let entries = std::fs::read_dir(path).map_err(|source| MigrateError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| MigrateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file = entry.path();
        if file.is_file() && file.extension().map(|e| e == "sql").unwrap_or(false) {
            files.push(file);
        }
    }
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

fn state_for(checksum: &str, record: Option<&MigrationRecord>) -> FileState {
    match record {
        None => FileState::Pending,
        Some(r) => match r.get_status() {
            MigrationStatus::Applied if r.checksum == checksum => FileState::Applied,
            MigrationStatus::Applied => FileState::Drifted,
            MigrationStatus::Partial => FileState::Partial,
            MigrationStatus::Failed => FileState::Pending,
        },
    }
}

/// Load, split and checksum each file, then compare with the ledger
pub async fn plan(pool: &DbPool, path: &Path) -> Result<MigrationPlan, MigrateError> {
    let records: HashMap<String, MigrationRecord> = MigrationRecord::list(pool)
        .await?
        .into_iter()
        .map(|r| (r.filename.clone(), r))
        .collect();

    let mut files = Vec::new();
    for file in collect_files(path)? {
        let filename = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let text = std::fs::read_to_string(&file).map_err(|source| MigrateError::Io {
            path: file.clone(),
            source,
        })?;
        let statements = split_statements(&text).map_err(|source| MigrateError::Parse {
            filename: filename.clone(),
            source,
        })?;
        let checksum = checksum(&statements);
        let state = state_for(&checksum, records.get(&filename));

        files.push(PlannedFile {
            filename,
            path: file,
            checksum,
            statements,
            state,
        });
    }

    Ok(MigrationPlan { files })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_collect_files_sorted_and_filtered() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("010_b.sql"), "SELECT 1;").unwrap();
        std::fs::write(dir.path().join("002_a.sql"), "SELECT 1;").unwrap();
        std::fs::write(dir.path().join("notes.md"), "# notes").unwrap();

        let files = collect_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|f| f.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["002_a.sql", "010_b.sql"]);
    }

    #[test]
    fn test_collect_missing_path() {
        let result = collect_files(Path::new("/definitely/not/here"));
        assert!(matches!(result, Err(MigrateError::NotFound(_))));
    }

    #[test]
    fn test_state_for_records() {
        let applied = MigrationRecord::new("a.sql", "abc", 2, 2, 0, None);
        let partial = MigrationRecord::new("a.sql", "abc", 2, 1, 1, None);
        let failed = MigrationRecord::new("a.sql", "abc", 2, 0, 1, None);

        assert_eq!(state_for("abc", None), FileState::Pending);
        assert_eq!(state_for("abc", Some(&applied)), FileState::Applied);
        assert_eq!(state_for("xyz", Some(&applied)), FileState::Drifted);
        assert_eq!(state_for("abc", Some(&partial)), FileState::Partial);
        assert_eq!(state_for("abc", Some(&failed)), FileState::Pending);
    }

    #[tokio::test]
    async fn test_plan_reports_parse_errors_with_filename() {
        let dir = TempDir::new().unwrap();
        let pool = crate::db::init(&dir.path().join("data")).await.unwrap();
        let migrations = dir.path().join("migrations");
        std::fs::create_dir_all(&migrations).unwrap();
        std::fs::write(migrations.join("001_bad.sql"), "SELECT 'unterminated").unwrap();

        match plan(&pool, &migrations).await {
            Err(MigrateError::Parse { filename, .. }) => assert_eq!(filename, "001_bad.sql"),
            other => panic!("unexpected result: {:?}", other.map(|p| p.files.len())),
        }
    }
}
