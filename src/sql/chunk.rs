use std::path::{Path, PathBuf};
use tracing::info;

use super::{lex, split_statements, Lexeme, SqlError};

/// A multi-row `INSERT .. VALUES` statement broken into its parts
#[derive(Debug, Clone, PartialEq)]
pub struct InsertStatement {
    /// Everything up to and including `VALUES`
    pub head: String,
    /// Each value tuple, parentheses included
    pub rows: Vec<String>,
    /// Trailing clauses such as `ON CONFLICT .. DO NOTHING`
    pub tail: String,
}

impl InsertStatement {
    /// Rebuild the statement as several smaller ones of at most `size` rows
    pub fn chunks(&self, size: usize) -> Result<Vec<String>, SqlError> {
        if size == 0 {
            return Err(SqlError::InvalidChunkSize);
        }
        Ok(self
            .rows
            .chunks(size)
            .map(|rows| {
                let mut sql = format!("{}\n{}", self.head, rows.join(",\n"));
                if !self.tail.is_empty() {
                    sql.push('\n');
                    sql.push_str(&self.tail);
                }
                sql.push_str(";\n");
                sql
            })
            .collect())
    }
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Byte offset of the top-level `VALUES` keyword
fn find_values_keyword(sql: &str) -> Result<Option<usize>, SqlError> {
    let bytes = sql.as_bytes();
    let mut depth = 0i32;

    for (at, c, class) in lex(sql)? {
        if class != Lexeme::Code {
            continue;
        }
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            'v' | 'V' if depth == 0 && at + 6 <= bytes.len() => {
                let before_ok = at == 0 || !is_word_byte(bytes[at - 1]);
                let after_ok = bytes.get(at + 6).map(|b| !is_word_byte(*b)).unwrap_or(true);
                if before_ok && after_ok && bytes[at..at + 6].eq_ignore_ascii_case(b"values") {
                    return Ok(Some(at));
                }
            }
            _ => {}
        }
    }
    Ok(None)
}

/// Split `(..), (..) tail` into tuples and the trailing text
fn split_tuples(body: &str) -> Result<(Vec<String>, String), SqlError> {
    let mut rows = Vec::new();
    let mut depth = 0i32;
    let mut start: Option<usize> = None;
    let mut rest_from = 0;

    for (at, c, class) in lex(body)? {
        if class != Lexeme::Code {
            if depth == 0 {
                return Ok((rows, body[at..].trim().to_string()));
            }
            continue;
        }
        match c {
            '(' => {
                if depth == 0 {
                    start = Some(at);
                }
                depth += 1;
            }
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(SqlError::NotInsert("unbalanced parentheses".to_string()));
                }
                if depth == 0 {
                    if let Some(s) = start.take() {
                        rows.push(body[s..=at].to_string());
                    }
                    rest_from = at + 1;
                }
            }
            ',' if depth == 0 => rest_from = at + 1,
            c if depth == 0 && !c.is_whitespace() => {
                // First token after the tuple list starts the tail
                return Ok((rows, body[at..].trim().to_string()));
            }
            _ => {}
        }
    }

    if depth != 0 {
        return Err(SqlError::NotInsert("unterminated value tuple".to_string()));
    }
    Ok((rows, body[rest_from..].trim().to_string()))
}

pub fn parse_insert(sql: &str) -> Result<InsertStatement, SqlError> {
    let statements = split_statements(sql)?;
    let statement = match statements.as_slice() {
        [single] => single,
        [] => return Err(SqlError::NotInsert("input is empty".to_string())),
        many => {
            return Err(SqlError::NotInsert(format!(
                "found {} statements",
                many.len()
            )))
        }
    };

    if !statement
        .split_whitespace()
        .next()
        .map(|w| w.eq_ignore_ascii_case("insert"))
        .unwrap_or(false)
    {
        return Err(SqlError::NotInsert(super::preview(statement, 60)));
    }

    let values_at = find_values_keyword(statement)?
        .ok_or_else(|| SqlError::NotInsert("no VALUES clause".to_string()))?;
    let head = statement[..values_at + 6].trim().to_string();
    let (rows, tail) = split_tuples(&statement[values_at + 6..])?;
    if rows.is_empty() {
        return Err(SqlError::NotInsert("VALUES has no rows".to_string()));
    }

    Ok(InsertStatement { head, rows, tail })
}

/// Write `<stem>_part_001.sql`, `<stem>_part_002.sql`, .. into `out_dir`
/// and return the paths in execution order.
pub fn write_chunk_files(
    input: &Path,
    out_dir: &Path,
    size: usize,
) -> Result<Vec<PathBuf>, SqlError> {
    if size == 0 {
        return Err(SqlError::InvalidChunkSize);
    }

    let sql = std::fs::read_to_string(input).map_err(|source| SqlError::Io {
        path: input.to_path_buf(),
        source,
    })?;
    let insert = parse_insert(&sql)?;
    let chunks = insert.chunks(size)?;

    std::fs::create_dir_all(out_dir).map_err(|source| SqlError::Io {
        path: out_dir.to_path_buf(),
        source,
    })?;

    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("chunk");

    let mut paths = Vec::with_capacity(chunks.len());
    for (index, chunk) in chunks.iter().enumerate() {
        let path = out_dir.join(format!("{}_part_{:03}.sql", stem, index + 1));
        std::fs::write(&path, chunk).map_err(|source| SqlError::Io {
            path: path.clone(),
            source,
        })?;
        paths.push(path);
    }

    info!(
        input = %input.display(),
        rows = insert.rows.len(),
        chunks = paths.len(),
        size,
        "Wrote chunk files"
    );
    Ok(paths)
}
