//! SQL text handling for the migration runner and the chunking tool.
//!
//! Statements are split on top-level semicolons only. The scanner understands
//! the Postgres lexical forms that can hide a `;`:
//! - single-quoted strings (`''` escapes) and `E'..'` strings (backslash escapes)
//! - double-quoted identifiers
//! - dollar-quoted bodies (`$$ .. $$`, `$fn$ .. $fn$`)
//! - `--` line comments and nested `/* */` block comments

mod chunk;

pub use chunk::{parse_insert, write_chunk_files, InsertStatement};

use sha2::{Digest, Sha256};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("unterminated {kind} starting on line {line}")]
    Unterminated { kind: &'static str, line: usize },

    #[error("expected a single INSERT .. VALUES statement: {0}")]
    NotInsert(String),

    #[error("chunk size must be at least 1")]
    InvalidChunkSize,

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Normal,
    InSingle { backslash_escapes: bool },
    InDouble,
    InDollar(String),
    InLineComment,
    InBlockComment(usize),
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// Tag of a dollar quote opening at `chars[start]` (including both `$`), if any
fn dollar_tag(chars: &[char], start: usize) -> Option<String> {
    let mut end = start + 1;
    while end < chars.len() && chars[end] != '$' {
        let c = chars[end];
        let valid = if end == start + 1 {
            c.is_alphabetic() || c == '_'
        } else {
            c.is_alphanumeric() || c == '_'
        };
        if !valid {
            return None;
        }
        end += 1;
    }
    if end < chars.len() {
        Some(chars[start..=end].iter().collect())
    } else {
        None
    }
}

fn starts_with_at(chars: &[char], at: usize, needle: &str) -> bool {
    let mut i = at;
    for n in needle.chars() {
        if i >= chars.len() || chars[i] != n {
            return false;
        }
        i += 1;
    }
    true
}

fn push_statement(statements: &mut Vec<String>, buf: &mut String) {
    let trimmed = buf.trim();
    if !trimmed.is_empty() {
        statements.push(trimmed.to_string());
    }
    buf.clear();
}

/// What the scanner saw a character as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lexeme {
    Code,
    /// Inside a string, quoted identifier or dollar-quoted body, delimiters included
    Literal,
    Comment,
}

fn keep(
    out: &mut Vec<(usize, char, Lexeme)>,
    prev: &mut [Option<char>; 2],
    at: usize,
    c: char,
    class: Lexeme,
) {
    out.push((at, c, class));
    *prev = [Some(c), prev[0]];
}

/// Classify every character of `sql`, as `(byte offset, char, class)` in input order
pub(crate) fn lex(sql: &str) -> Result<Vec<(usize, char, Lexeme)>, SqlError> {
    let indexed: Vec<(usize, char)> = sql.char_indices().collect();
    let chars: Vec<char> = indexed.iter().map(|(_, c)| *c).collect();
    let mut out = Vec::with_capacity(chars.len());
    // Last two non-comment characters, most recent first
    let mut prev: [Option<char>; 2] = [None, None];
    let mut state = State::Normal;
    let mut line = 1;
    let mut opened_on = 1;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let at = indexed[i].0;
        let next = chars.get(i + 1).copied();
        if c == '\n' {
            line += 1;
        }

        match &mut state {
            State::Normal => match c {
                '\'' => {
                    let escaped = matches!(prev[0], Some('E') | Some('e'))
                        && !prev[1].map(is_ident_char).unwrap_or(false);
                    state = State::InSingle {
                        backslash_escapes: escaped,
                    };
                    opened_on = line;
                    keep(&mut out, &mut prev, at, c, Lexeme::Literal);
                }
                '"' => {
                    state = State::InDouble;
                    opened_on = line;
                    keep(&mut out, &mut prev, at, c, Lexeme::Literal);
                }
                '$' if !prev[0].map(is_ident_char).unwrap_or(false) => {
                    match dollar_tag(&chars, i) {
                        Some(tag) => {
                            let len = tag.chars().count();
                            for k in i..i + len {
                                keep(&mut out, &mut prev, indexed[k].0, chars[k], Lexeme::Literal);
                            }
                            i += len;
                            state = State::InDollar(tag);
                            opened_on = line;
                            continue;
                        }
                        None => keep(&mut out, &mut prev, at, c, Lexeme::Code),
                    }
                }
                '-' if next == Some('-') => {
                    out.push((at, c, Lexeme::Comment));
                    out.push((indexed[i + 1].0, '-', Lexeme::Comment));
                    state = State::InLineComment;
                    i += 2;
                    continue;
                }
                '/' if next == Some('*') => {
                    out.push((at, c, Lexeme::Comment));
                    out.push((indexed[i + 1].0, '*', Lexeme::Comment));
                    state = State::InBlockComment(1);
                    opened_on = line;
                    i += 2;
                    continue;
                }
                _ => keep(&mut out, &mut prev, at, c, Lexeme::Code),
            },
            State::InSingle { backslash_escapes } => {
                keep(&mut out, &mut prev, at, c, Lexeme::Literal);
                if *backslash_escapes && c == '\\' {
                    if let Some(n) = next {
                        if n == '\n' {
                            line += 1;
                        }
                        keep(&mut out, &mut prev, indexed[i + 1].0, n, Lexeme::Literal);
                        i += 2;
                        continue;
                    }
                } else if c == '\'' {
                    if next == Some('\'') {
                        keep(&mut out, &mut prev, indexed[i + 1].0, '\'', Lexeme::Literal);
                        i += 2;
                        continue;
                    }
                    state = State::Normal;
                }
            }
            State::InDouble => {
                keep(&mut out, &mut prev, at, c, Lexeme::Literal);
                if c == '"' {
                    if next == Some('"') {
                        keep(&mut out, &mut prev, indexed[i + 1].0, '"', Lexeme::Literal);
                        i += 2;
                        continue;
                    }
                    state = State::Normal;
                }
            }
            State::InDollar(tag) => {
                if c == '$' && starts_with_at(&chars, i, tag) {
                    let len = tag.chars().count();
                    for k in i..i + len {
                        keep(&mut out, &mut prev, indexed[k].0, chars[k], Lexeme::Literal);
                    }
                    i += len;
                    state = State::Normal;
                    continue;
                }
                keep(&mut out, &mut prev, at, c, Lexeme::Literal);
            }
            State::InLineComment => {
                if c == '\n' {
                    state = State::Normal;
                    keep(&mut out, &mut prev, at, c, Lexeme::Code);
                } else {
                    out.push((at, c, Lexeme::Comment));
                }
            }
            State::InBlockComment(depth) => {
                if c == '/' && next == Some('*') {
                    *depth += 1;
                    out.push((at, c, Lexeme::Comment));
                    out.push((indexed[i + 1].0, '*', Lexeme::Comment));
                    i += 2;
                    continue;
                }
                if c == '*' && next == Some('/') {
                    *depth -= 1;
                    out.push((at, c, Lexeme::Comment));
                    out.push((indexed[i + 1].0, '/', Lexeme::Comment));
                    i += 2;
                    if *depth == 0 {
                        state = State::Normal;
                        prev = [Some(' '), prev[0]];
                    }
                    continue;
                }
                out.push((at, c, Lexeme::Comment));
            }
        }
        i += 1;
    }

    let kind = match state {
        State::Normal | State::InLineComment => None,
        State::InSingle { .. } => Some("string literal"),
        State::InDouble => Some("quoted identifier"),
        State::InDollar(_) => Some("dollar-quoted string"),
        State::InBlockComment(_) => Some("block comment"),
    };
    if let Some(kind) = kind {
        return Err(SqlError::Unterminated {
            kind,
            line: opened_on,
        });
    }
    Ok(out)
}

/// Split SQL text into trimmed statements without their terminating `;`.
///
/// Comments are removed. A final statement without `;` is kept.
pub fn split_statements(sql: &str) -> Result<Vec<String>, SqlError> {
    let mut statements = Vec::new();
    let mut buf = String::new();
    let mut in_comment = false;

    for (_, c, class) in lex(sql)? {
        match class {
            Lexeme::Comment => {
                if !in_comment && !buf.ends_with(char::is_whitespace) {
                    buf.push(' ');
                }
                in_comment = true;
                continue;
            }
            Lexeme::Code if c == ';' => push_statement(&mut statements, &mut buf),
            _ => buf.push(c),
        }
        in_comment = false;
    }

    push_statement(&mut statements, &mut buf);
    Ok(statements)
}

const MODIFIERS: &[&str] = &[
    "OR",
    "REPLACE",
    "UNIQUE",
    "TEMP",
    "TEMPORARY",
    "UNLOGGED",
    "MATERIALIZED",
    "IF",
    "NOT",
    "EXISTS",
    "CONSTRAINT",
];

/// Leading keyword(s) of a statement, e.g. `CREATE TABLE`, `INSERT`
pub fn statement_kind(statement: &str) -> String {
    let mut words = statement
        .split(|c: char| c.is_whitespace() || c == '(' || c == ';')
        .filter(|w| !w.is_empty())
        .map(|w| w.to_uppercase());

    let first = match words.next() {
        Some(w) => w,
        None => return "EMPTY".to_string(),
    };

    match first.as_str() {
        "CREATE" | "ALTER" | "DROP" => {
            match words.find(|w| !MODIFIERS.contains(&w.as_str())) {
                Some(object) => format!("{} {}", first, object),
                None => first,
            }
        }
        _ => first,
    }
}

/// Single-line abbreviation of a statement for log output
pub fn preview(statement: &str, max_chars: usize) -> String {
    let flat = statement.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        flat
    } else {
        let cut: String = flat.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}

/// Hex SHA-256 over the split statements, so comment-only edits do not change it
pub fn checksum(statements: &[String]) -> String {
    let mut hasher = Sha256::new();
    for statement in statements {
        hasher.update(statement.as_bytes());
        hasher.update(b"\n;\n");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splits_simple_statements() {
        let stmts = split_statements("CREATE TABLE a (id int);\nINSERT INTO a VALUES (1);").unwrap();
        assert_eq!(stmts, vec!["CREATE TABLE a (id int)", "INSERT INTO a VALUES (1)"]);
    }

    #[test]
    fn test_keeps_trailing_statement_and_skips_empty() {
        let stmts = split_statements(";;\n SELECT 1 ;  ; SELECT 2 ").unwrap();
        assert_eq!(stmts, vec!["SELECT 1", "SELECT 2"]);
    }

    #[test]
    fn test_semicolons_inside_strings_and_identifiers() {
        let sql = r#"INSERT INTO notes (body) VALUES ('a; b ''quoted; too''');
ALTER TABLE "weird;name" ADD COLUMN x int;"#;
        let stmts = split_statements(sql).unwrap();
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].ends_with("'a; b ''quoted; too''')"));
        assert_eq!(stmts[1], r#"ALTER TABLE "weird;name" ADD COLUMN x int"#);
    }

    #[test]
    fn test_escape_strings() {
        let sql = r"SELECT E'it\'s; fine'; SELECT 'plain\'; SELECT 3";
        let stmts = split_statements(sql).unwrap();
        assert_eq!(stmts, vec![r"SELECT E'it\'s; fine'", r"SELECT 'plain\'", "SELECT 3"]);
    }

    #[test]
    fn test_dollar_quoted_function_body() {
        let sql = r#"
CREATE OR REPLACE FUNCTION touch_updated_at() RETURNS trigger AS $$
BEGIN
  NEW.updated_at = now();
  RETURN NEW;
END;
$$ LANGUAGE plpgsql;

DO $body$ BEGIN PERFORM 1; END $body$;
"#;
        let stmts = split_statements(sql).unwrap();
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].contains("RETURN NEW;"));
        assert!(stmts[0].ends_with("$$ LANGUAGE plpgsql"));
        assert_eq!(stmts[1], "DO $body$ BEGIN PERFORM 1; END $body$");
    }

    #[test]
    fn test_positional_parameters_are_not_dollar_quotes() {
        let stmts = split_statements("SELECT $1, $2; SELECT 2").unwrap();
        assert_eq!(stmts, vec!["SELECT $1, $2", "SELECT 2"]);
    }

    #[test]
    fn test_comments_are_dropped() {
        let sql = "-- header; with semicolon\nSELECT 1; /* outer /* nested; */ still comment; */ SELECT 2;";
        let stmts = split_statements(sql).unwrap();
        assert_eq!(stmts, vec!["SELECT 1", "SELECT 2"]);
    }

    #[test]
    fn test_comment_markers_inside_strings_are_data() {
        let stmts = split_statements("SELECT '-- not a comment; /* nor this */'").unwrap();
        assert_eq!(stmts, vec!["SELECT '-- not a comment; /* nor this */'"]);
    }

    #[test]
    fn test_unterminated_constructs_report_line() {
        match split_statements("SELECT 1;\nSELECT 'oops;\n") {
            Err(SqlError::Unterminated { kind, line }) => {
                assert_eq!(kind, "string literal");
                assert_eq!(line, 2);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(matches!(
            split_statements("DO $$ BEGIN"),
            Err(SqlError::Unterminated { kind: "dollar-quoted string", .. })
        ));
        assert!(matches!(
            split_statements("SELECT 1 /* open"),
            Err(SqlError::Unterminated { kind: "block comment", .. })
        ));
    }

    #[test]
    fn test_lex_marks_quoted_text() {
        let classes: String = lex("a'(';$$)$$(/*)*/")
            .unwrap()
            .into_iter()
            .map(|(_, _, class)| match class {
                Lexeme::Code => 'c',
                Lexeme::Literal => 'l',
                Lexeme::Comment => '-',
            })
            .collect();
        assert_eq!(classes, "clllclllllc-----");
    }

    #[test]
    fn test_lex_reports_byte_offsets() {
        let lexed = lex("'é' x").unwrap();
        let (at, c, class) = lexed[lexed.len() - 1];
        assert_eq!((at, c, class), (5, 'x', Lexeme::Code));
    }

    #[test]
    fn test_statement_kind() {
        assert_eq!(statement_kind("create table if not exists x (id int)"), "CREATE TABLE");
        assert_eq!(statement_kind("CREATE OR REPLACE FUNCTION f()"), "CREATE FUNCTION");
        assert_eq!(statement_kind("CREATE UNIQUE INDEX idx ON t(x)"), "CREATE INDEX");
        assert_eq!(statement_kind("DROP POLICY IF EXISTS \"p\" ON t"), "DROP POLICY");
        assert_eq!(statement_kind("ALTER TABLE t ENABLE ROW LEVEL SECURITY"), "ALTER TABLE");
        assert_eq!(statement_kind("insert into t values (1)"), "INSERT");
        assert_eq!(statement_kind("   "), "EMPTY");
    }

    #[test]
    fn test_preview_flattens_and_truncates() {
        assert_eq!(preview("SELECT\n   1", 40), "SELECT 1");
        assert_eq!(preview("SELECT a, b, c FROM customers", 12), "SELECT a,...");
    }

    #[test]
    fn test_checksum_ignores_comments_but_not_content() {
        let a = split_statements("-- v1\nSELECT 1;").unwrap();
        let b = split_statements("/* v2 */ SELECT 1").unwrap();
        let c = split_statements("SELECT 2;").unwrap();
        assert_eq!(checksum(&a), checksum(&b));
        assert_ne!(checksum(&a), checksum(&c));
        assert_eq!(checksum(&a).len(), 64);
    }
}
