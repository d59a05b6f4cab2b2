//! Row-level security patches.
//!
//! Builds `ALTER TABLE .. ENABLE ROW LEVEL SECURITY` plus a replace-in-place
//! policy for each table and runs them through the migration executor.

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::config::OnError;
use crate::migrate::{Migrator, StatementOutcome};

lazy_static! {
    static ref IDENTIFIER: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

pub const DEFAULT_POLICY_NAME: &str = "Enable all access for authenticated users";
pub const DEFAULT_ROLE: &str = "authenticated";

#[derive(Debug, Error)]
pub enum RlsError {
    #[error("invalid {what} identifier: '{value}'")]
    InvalidIdentifier { what: &'static str, value: String },

    #[error("policy name must not be empty")]
    EmptyPolicyName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PolicyCommand {
    All,
    Select,
    Insert,
    Update,
    Delete,
}

impl PolicyCommand {
    fn as_sql(&self) -> &'static str {
        match self {
            PolicyCommand::All => "ALL",
            PolicyCommand::Select => "SELECT",
            PolicyCommand::Insert => "INSERT",
            PolicyCommand::Update => "UPDATE",
            PolicyCommand::Delete => "DELETE",
        }
    }

    /// INSERT policies take only WITH CHECK
    fn takes_using(&self) -> bool {
        !matches!(self, PolicyCommand::Insert)
    }

    /// SELECT and DELETE policies reject WITH CHECK
    fn takes_with_check(&self) -> bool {
        !matches!(self, PolicyCommand::Select | PolicyCommand::Delete)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RlsPatch {
    pub schema: String,
    pub table: String,
    pub policy_name: String,
    pub command: PolicyCommand,
    pub roles: Vec<String>,
    pub using: Option<String>,
    pub with_check: Option<String>,
}

fn validate<'a>(what: &'static str, value: &'a str) -> Result<&'a str, RlsError> {
    if IDENTIFIER.is_match(value) {
        Ok(value)
    } else {
        Err(RlsError::InvalidIdentifier {
            what,
            value: value.to_string(),
        })
    }
}

fn quote_ident(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

/// Role list entry. `PUBLIC` and the `CURRENT_*` forms are keywords and stay bare.
fn role_spec(role: &str) -> Result<String, RlsError> {
    let role = validate("role", role)?;
    let upper = role.to_ascii_uppercase();
    match upper.as_str() {
        "PUBLIC" | "CURRENT_USER" | "CURRENT_ROLE" | "SESSION_USER" => Ok(upper),
        _ => Ok(quote_ident(role)),
    }
}

fn qualified(schema: &str, table: &str) -> Result<String, RlsError> {
    Ok(format!(
        "{}.{}",
        quote_ident(validate("schema", schema)?),
        quote_ident(validate("table", table)?)
    ))
}

impl RlsPatch {
    /// Full access for signed-in users
    pub fn permissive(table: impl Into<String>) -> Self {
        Self {
            schema: "public".to_string(),
            table: table.into(),
            policy_name: DEFAULT_POLICY_NAME.to_string(),
            command: PolicyCommand::All,
            roles: vec![DEFAULT_ROLE.to_string()],
            using: Some("true".to_string()),
            with_check: Some("true".to_string()),
        }
    }

    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        if !roles.is_empty() {
            self.roles = roles;
        }
        self
    }

    pub fn with_policy_name(mut self, name: impl Into<String>) -> Self {
        self.policy_name = name.into();
        self
    }

    pub fn to_sql(&self) -> Result<Vec<String>, RlsError> {
        let target = qualified(&self.schema, &self.table)?;
        if self.policy_name.trim().is_empty() {
            return Err(RlsError::EmptyPolicyName);
        }
        let roles = self
            .roles
            .iter()
            .map(|r| role_spec(r))
            .collect::<Result<Vec<_>, _>>()?;
        let policy = quote_ident(&self.policy_name);

        let mut create = format!(
            "CREATE POLICY {} ON {} AS PERMISSIVE FOR {}",
            policy,
            target,
            self.command.as_sql()
        );
        if !roles.is_empty() {
            create.push_str(&format!(" TO {}", roles.join(", ")));
        }
        if let (true, Some(using)) = (self.command.takes_using(), &self.using) {
            create.push_str(&format!(" USING ({})", using));
        }
        if let (true, Some(check)) = (self.command.takes_with_check(), &self.with_check) {
            create.push_str(&format!(" WITH CHECK ({})", check));
        }

        Ok(vec![
            format!("ALTER TABLE {} ENABLE ROW LEVEL SECURITY", target),
            format!("DROP POLICY IF EXISTS {} ON {}", policy, target),
            create,
        ])
    }
}

pub fn disable_sql(schema: &str, table: &str) -> Result<String, RlsError> {
    Ok(format!(
        "ALTER TABLE {} DISABLE ROW LEVEL SECURITY",
        qualified(schema, table)?
    ))
}

/// Build the statements for every patch; any invalid patch rejects the whole set
pub fn build(patches: &[RlsPatch]) -> Result<Vec<String>, RlsError> {
    let mut statements = Vec::new();
    for patch in patches {
        statements.extend(patch.to_sql()?);
    }
    Ok(statements)
}

/// Run the statements, stopping at the first failure
pub async fn apply(migrator: &Migrator, statements: &[String]) -> StatementOutcome {
    info!(statements = statements.len(), "Applying row-level security changes");
    migrator
        .exec_statements("rls", statements, OnError::Halt)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::FakeBackend;
    use crate::backend::RetryPolicy;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_permissive_patch_sql() {
        let sql = RlsPatch::permissive("customers").to_sql().unwrap();
        assert_eq!(
            sql,
            vec![
                r#"ALTER TABLE "public"."customers" ENABLE ROW LEVEL SECURITY"#.to_string(),
                r#"DROP POLICY IF EXISTS "Enable all access for authenticated users" ON "public"."customers""#.to_string(),
                r#"CREATE POLICY "Enable all access for authenticated users" ON "public"."customers" AS PERMISSIVE FOR ALL TO "authenticated" USING (true) WITH CHECK (true)"#.to_string(),
            ]
        );
    }

    #[test]
    fn test_select_policy_has_no_with_check() {
        let mut patch = RlsPatch::permissive("lats_products");
        patch.command = PolicyCommand::Select;
        patch.roles = vec!["anon".into(), "authenticated".into()];
        let create = &patch.to_sql().unwrap()[2];
        assert!(create.ends_with(r#"FOR SELECT TO "anon", "authenticated" USING (true)"#));
        assert!(!create.contains("WITH CHECK"));
    }

    #[test]
    fn test_insert_policy_has_no_using() {
        let mut patch = RlsPatch::permissive("payments");
        patch.command = PolicyCommand::Insert;
        let create = &patch.to_sql().unwrap()[2];
        assert!(create.ends_with(r#"FOR INSERT TO "authenticated" WITH CHECK (true)"#));
    }

    #[test]
    fn test_roles_are_quoted_except_keywords() {
        let patch = RlsPatch::permissive("customers").with_roles(vec![
            "Staff".into(),
            "public".into(),
            "current_user".into(),
        ]);
        let create = &patch.to_sql().unwrap()[2];
        assert!(create.contains(r#"TO "Staff", PUBLIC, CURRENT_USER USING"#));
    }

    #[test]
    fn test_policy_name_quotes_are_escaped() {
        let patch = RlsPatch::permissive("customers").with_policy_name(r#"staff "full" access"#);
        let drop = &patch.to_sql().unwrap()[1];
        assert_eq!(
            drop,
            r#"DROP POLICY IF EXISTS "staff ""full"" access" ON "public"."customers""#
        );
    }

    #[test]
    fn test_invalid_identifiers_are_rejected() {
        let err = RlsPatch::permissive("customers; DROP TABLE x").to_sql().unwrap_err();
        assert!(matches!(err, RlsError::InvalidIdentifier { what: "table", .. }));

        let err = RlsPatch::permissive("customers")
            .with_roles(vec!["authenticated".into(), "bad role".into()])
            .to_sql()
            .unwrap_err();
        assert!(matches!(err, RlsError::InvalidIdentifier { what: "role", .. }));

        assert!(disable_sql("public", "1table").is_err());
        assert!(matches!(
            RlsPatch::permissive("t").with_policy_name(" ").to_sql(),
            Err(RlsError::EmptyPolicyName)
        ));
    }

    #[test]
    fn test_build_rejects_whole_set() {
        let patches = vec![RlsPatch::permissive("customers"), RlsPatch::permissive("bad-name")];
        assert!(build(&patches).is_err());
        assert_eq!(build(&patches[..1]).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_apply_halts_on_failure() {
        let dir = TempDir::new().unwrap();
        let pool = crate::db::init(dir.path()).await.unwrap();
        let backend = Arc::new(FakeBackend::new());
        backend.reject_sql_containing("DROP POLICY");
        let migrator = Migrator::new(backend.clone(), pool, RetryPolicy::none());

        let statements = build(&[RlsPatch::permissive("customers")]).unwrap();
        let outcome = apply(&migrator, &statements).await;

        assert_eq!((outcome.ok, outcome.failed, outcome.not_run), (1, 1, 1));
        assert_eq!(backend.executed().len(), 1);
    }
}
