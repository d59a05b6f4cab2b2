//! In-memory [`Backend`] used by unit tests of the higher layers.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use super::{
    Backend, BackendError, Bucket, Filter, InsertOptions, IsValue, NewBucket, Privilege, Query,
};

#[derive(Default)]
struct State {
    tables: HashMap<String, Vec<Value>>,
    buckets: Vec<Bucket>,
    executed: Vec<String>,
    rejected_sql: Vec<String>,
    transient_failures: HashMap<String, u32>,
    failing_tables: HashSet<String>,
    hidden_from_anon: HashSet<String>,
    denied_to_anon: HashSet<String>,
    offline: bool,
    max_rows: Option<usize>,
    next_id: u64,
}

#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<State>,
}

fn unavailable() -> BackendError {
    BackendError::Http {
        status: 503,
        code: None,
        message: "service unavailable".to_string(),
        details: None,
        hint: None,
    }
}

fn rls_denied(table: &str) -> BackendError {
    BackendError::Http {
        status: 403,
        code: Some("42501".to_string()),
        message: format!("permission denied for table {}", table),
        details: None,
        hint: None,
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn compare(row: &Value, column: &str, wanted: &str) -> Option<std::cmp::Ordering> {
    let actual = as_text(row.get(column)?)?;
    match (actual.parse::<f64>(), wanted.parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b),
        _ => Some(actual.as_str().cmp(wanted)),
    }
}

fn matches(row: &Value, filter: &Filter) -> bool {
    use std::cmp::Ordering::*;
    match filter {
        Filter::Eq(c, v) => compare(row, c, v) == Some(Equal),
        Filter::Neq(c, v) => compare(row, c, v) != Some(Equal),
        Filter::Gt(c, v) => compare(row, c, v) == Some(Greater),
        Filter::Gte(c, v) => matches!(compare(row, c, v), Some(Greater | Equal)),
        Filter::Lt(c, v) => compare(row, c, v) == Some(Less),
        Filter::Lte(c, v) => matches!(compare(row, c, v), Some(Less | Equal)),
        Filter::Like(c, v) | Filter::ILike(c, v) => {
            let needle = v.trim_matches(|ch| ch == '%' || ch == '*').to_lowercase();
            row.get(c)
                .and_then(as_text)
                .map(|s| s.to_lowercase().contains(&needle))
                .unwrap_or(false)
        }
        Filter::Is(c, IsValue::Null) => row.get(c).map(Value::is_null).unwrap_or(true),
        Filter::Is(c, IsValue::True) => row.get(c) == Some(&Value::Bool(true)),
        Filter::Is(c, IsValue::False) => row.get(c) == Some(&Value::Bool(false)),
        Filter::In(c, values) => row
            .get(c)
            .and_then(as_text)
            .map(|s| values.contains(&s))
            .unwrap_or(false),
    }
}

/// Numeric-aware ordering on `column`, nulls last
fn order_rows(rows: &mut [Value], column: &str, ascending: bool) {
    use std::cmp::Ordering;
    rows.sort_by(|a, b| {
        let ordering = match (a.get(column).and_then(as_text), b.get(column).and_then(as_text)) {
            (Some(x), Some(y)) => match (x.parse::<f64>(), y.parse::<f64>()) {
                (Ok(p), Ok(q)) => p.partial_cmp(&q).unwrap_or(Ordering::Equal),
                _ => x.cmp(&y),
            },
            (Some(_), None) => return Ordering::Less,
            (None, Some(_)) => return Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        if ascending {
            ordering
        } else {
            ordering.reverse()
        }
    });
}

fn project(row: &Value, columns: Option<&str>) -> Value {
    let columns = match columns {
        Some(c) if c.trim() != "*" => c,
        _ => return row.clone(),
    };
    let mut out = serde_json::Map::new();
    for column in columns.split(',').map(str::trim) {
        if let Some(value) = row.get(column) {
            out.insert(column.to_string(), value.clone());
        }
    }
    Value::Object(out)
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(self, table: &str, rows: Vec<Value>) -> Self {
        self.lock().tables.insert(table.to_string(), rows);
        self
    }

    /// Any exec_sql call whose text contains `needle` is rejected
    pub fn reject_sql_containing(&self, needle: &str) {
        self.lock().rejected_sql.push(needle.to_string());
    }

    /// The next `times` calls of `operation` (e.g. "exec_sql", "insert") fail with a 503
    pub fn fail_transiently(&self, operation: &str, times: u32) {
        self.lock()
            .transient_failures
            .insert(operation.to_string(), times);
    }

    /// Inserts into `table` fail with a permanent error
    pub fn fail_inserts_into(&self, table: &str) {
        self.lock().failing_tables.insert(table.to_string());
    }

    /// The anon key sees no rows of `table`
    pub fn hide_from_anon(&self, table: &str) {
        self.lock().hidden_from_anon.insert(table.to_string());
    }

    /// The anon key is refused with 42501 on `table`
    pub fn deny_anon(&self, table: &str) {
        self.lock().denied_to_anon.insert(table.to_string());
    }

    /// Selects return at most `max` rows whatever limit was asked for
    pub fn cap_rows(&self, max: usize) {
        self.lock().max_rows = Some(max);
    }

    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn executed(&self) -> Vec<String> {
        self.lock().executed.clone()
    }

    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    pub fn bucket_names(&self) -> Vec<String> {
        self.lock().buckets.iter().map(|b| b.name.clone()).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn gate(&self, operation: &str) -> Result<(), BackendError> {
        let mut state = self.lock();
        if state.offline {
            return Err(unavailable());
        }
        if let Some(remaining) = state.transient_failures.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(unavailable());
            }
        }
        Ok(())
    }

    fn visible_rows(
        &self,
        table: &str,
        filters: &[Filter],
        privilege: Privilege,
    ) -> Result<Vec<Value>, BackendError> {
        let state = self.lock();
        if privilege == Privilege::Anon {
            if state.denied_to_anon.contains(table) {
                return Err(rls_denied(table));
            }
            if state.hidden_from_anon.contains(table) {
                return Ok(Vec::new());
            }
        }
        Ok(state
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| filters.iter().all(|f| matches(row, f)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn select(
        &self,
        table: &str,
        query: &Query,
        privilege: Privilege,
    ) -> Result<Vec<Value>, BackendError> {
        self.gate("select")?;
        let mut rows = self.visible_rows(table, &query.filters, privilege)?;
        if let Some((column, ascending)) = &query.order {
            order_rows(&mut rows, column, *ascending);
        }
        let offset = query.offset.unwrap_or(0);
        let mut limit = query.limit.unwrap_or(usize::MAX);
        if let Some(max) = self.lock().max_rows {
            limit = limit.min(max);
        }
        Ok(rows
            .iter()
            .skip(offset)
            .take(limit)
            .map(|row| project(row, query.columns.as_deref()))
            .collect())
    }

    async fn count(
        &self,
        table: &str,
        filters: &[Filter],
        privilege: Privilege,
    ) -> Result<u64, BackendError> {
        self.gate("count")?;
        Ok(self.visible_rows(table, filters, privilege)?.len() as u64)
    }

    async fn insert(
        &self,
        table: &str,
        rows: &[Value],
        options: &InsertOptions,
    ) -> Result<Vec<Value>, BackendError> {
        self.gate("insert")?;
        let mut state = self.lock();
        if state.failing_tables.contains(table) {
            return Err(BackendError::Http {
                status: 400,
                code: Some("23502".to_string()),
                message: format!("null value violates not-null constraint on {}", table),
                details: None,
                hint: None,
            });
        }

        let mut inserted = Vec::new();
        for row in rows {
            let existing = state.tables.get(table).and_then(|existing| {
                let column = options.on_conflict.as_deref()?;
                let key = row.get(column)?;
                existing.iter().position(|r| r.get(column) == Some(key))
            });
            if existing.is_some() && !options.merge_duplicates {
                continue;
            }

            state.next_id += 1;
            let mut row = row.clone();
            if let Some(object) = row.as_object_mut() {
                object
                    .entry("id")
                    .or_insert_with(|| json!(format!("id-{}", state.next_id)));
            }

            let table_rows = state.tables.entry(table.to_string()).or_default();
            match existing {
                Some(index) => table_rows[index] = row.clone(),
                None => table_rows.push(row.clone()),
            }
            inserted.push(row);
        }
        Ok(inserted)
    }

    async fn update(
        &self,
        table: &str,
        filters: &[Filter],
        patch: &Value,
    ) -> Result<Vec<Value>, BackendError> {
        self.gate("update")?;
        if filters.is_empty() {
            return Err(BackendError::InvalidRequest("update without filters".into()));
        }
        let mut state = self.lock();
        let mut updated = Vec::new();
        if let Some(rows) = state.tables.get_mut(table) {
            for row in rows.iter_mut().filter(|r| filters.iter().all(|f| matches(r, f))) {
                if let (Some(target), Some(changes)) = (row.as_object_mut(), patch.as_object()) {
                    for (k, v) in changes {
                        target.insert(k.clone(), v.clone());
                    }
                }
                updated.push(row.clone());
            }
        }
        Ok(updated)
    }

    async fn delete(&self, table: &str, filters: &[Filter]) -> Result<u64, BackendError> {
        self.gate("delete")?;
        if filters.is_empty() {
            return Err(BackendError::InvalidRequest("delete without filters".into()));
        }
        let mut state = self.lock();
        let rows = state.tables.entry(table.to_string()).or_default();
        let before = rows.len();
        rows.retain(|r| !filters.iter().all(|f| matches(r, f)));
        Ok((before - rows.len()) as u64)
    }

    async fn rpc(
        &self,
        function: &str,
        _args: &Value,
        _privilege: Privilege,
    ) -> Result<Value, BackendError> {
        self.gate("rpc")?;
        Err(BackendError::Http {
            status: 404,
            code: Some("PGRST202".to_string()),
            message: format!("Could not find the function public.{}", function),
            details: None,
            hint: None,
        })
    }

    async fn exec_sql(&self, sql: &str) -> Result<(), BackendError> {
        self.gate("exec_sql")?;
        let mut state = self.lock();
        if let Some(needle) = state.rejected_sql.iter().find(|n| sql.contains(n.as_str())) {
            return Err(BackendError::SqlRejected(format!(
                "statement rejected near \"{}\"",
                needle
            )));
        }
        state.executed.push(sql.to_string());
        Ok(())
    }

    async fn list_buckets(&self) -> Result<Vec<Bucket>, BackendError> {
        self.gate("list_buckets")?;
        Ok(self.lock().buckets.clone())
    }

    async fn create_bucket(&self, bucket: &NewBucket) -> Result<(), BackendError> {
        self.gate("create_bucket")?;
        let mut state = self.lock();
        if state.buckets.iter().any(|b| b.name == bucket.name) {
            return Err(BackendError::Http {
                status: 400,
                code: Some("Duplicate".to_string()),
                message: "The resource already exists".to_string(),
                details: None,
                hint: None,
            });
        }
        state.buckets.push(Bucket {
            id: bucket.id.clone(),
            name: bucket.name.clone(),
            public: bucket.public,
            created_at: None,
        });
        Ok(())
    }

    async fn ping(&self) -> Result<(), BackendError> {
        self.gate("ping")
    }
}
