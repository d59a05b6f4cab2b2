//! JSON export of backend tables.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::backend::{Backend, Privilege, Query, RetryPolicy};

pub const DEFAULT_PAGE_SIZE: usize = 1000;
pub const DEFAULT_ORDER_KEY: &str = "id";

#[derive(Debug, Clone, Serialize)]
pub struct TableCount {
    pub table: String,
    pub rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupSummary {
    pub path: PathBuf,
    pub tables: Vec<TableCount>,
}

impl BackupSummary {
    pub fn total_rows(&self) -> usize {
        self.tables.iter().map(|t| t.rows).sum()
    }
}

/// Read every row of `table` ordered by `order_key`, asking for `page_size` rows at a time.
///
/// The server may return fewer rows than asked for (PostgREST `max-rows`), so
/// the offset advances by what came back and only an empty page ends the scan.
pub async fn fetch_all(
    backend: &dyn Backend,
    retry: &RetryPolicy,
    table: &str,
    order_key: &str,
    page_size: usize,
) -> Result<Vec<Value>> {
    let page_size = page_size.max(1);
    let mut rows = Vec::new();
    loop {
        let query = Query::new()
            .order_by(order_key, true)
            .limit(page_size)
            .offset(rows.len());
        let page = retry
            .run("select", || backend.select(table, &query, Privilege::Service))
            .await
            .with_context(|| format!("Failed to read table {} at offset {}", table, rows.len()))?;
        if page.is_empty() {
            break;
        }
        if page.len() < page_size {
            debug!(table = %table, asked = page_size, got = page.len(), "Short page");
        }
        rows.extend(page);
    }
    Ok(rows)
}

/// Create `<stem>.json` in `dir`, or `<stem>-1.json`, `<stem>-2.json`, .. if taken
fn create_unique(dir: &Path, stem: &str) -> Result<(PathBuf, File)> {
    for attempt in 0u32.. {
        let name = match attempt {
            0 => format!("{}.json", stem),
            n => format!("{}-{}.json", stem, n),
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to create backup: {}", path.display()))
            }
        }
    }
    bail!("No free backup file name for {} in {}", stem, dir.display())
}

/// Export `tables` to a new `<out_dir>/backup-<timestamp>.json`, never replacing an existing file
pub async fn export_tables(
    backend: &dyn Backend,
    retry: &RetryPolicy,
    tables: &[String],
    order_key: &str,
    page_size: usize,
    out_dir: &Path,
) -> Result<BackupSummary> {
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create backup directory: {}", out_dir.display()))?;

    let created_at = Utc::now();
    let mut exported = Map::new();
    let mut counts = Vec::new();

    for table in tables {
        let rows = fetch_all(backend, retry, table, order_key, page_size).await?;
        info!(table = %table, rows = rows.len(), "Table exported");
        counts.push(TableCount {
            table: table.clone(),
            rows: rows.len(),
        });
        exported.insert(table.clone(), json!({ "count": rows.len(), "rows": rows }));
    }

    let document = json!({
        "created_at": created_at.to_rfc3339(),
        "order_key": order_key,
        "tables": exported,
    });
    let stem = format!("backup-{}", created_at.format("%Y%m%d-%H%M%S-%3f"));
    let (path, mut file) = create_unique(out_dir, &stem)?;
    file.write_all(serde_json::to_string_pretty(&document)?.as_bytes())
        .with_context(|| format!("Failed to write backup: {}", path.display()))?;

    info!(path = %path.display(), tables = counts.len(), "Backup written");
    Ok(BackupSummary {
        path,
        tables: counts,
    })
}
