use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::backend::{Privilege, RetryPolicy};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub migrate: MigrateConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Clone, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the hosted backend, e.g. https://xyz.example.co
    #[serde(default)]
    pub url: String,
    /// Anonymous (public) API key
    pub anon_key: Option<String>,
    /// Elevated service-role key, required for DDL and RLS patches
    pub service_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// RPC function used as the raw SQL escape hatch
    #[serde(default = "default_exec_sql_function")]
    pub exec_sql_function: String,
    /// Name of the argument carrying the SQL text
    #[serde(default = "default_exec_sql_arg")]
    pub exec_sql_arg: String,
    #[serde(default = "default_schema")]
    pub schema: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            anon_key: None,
            service_key: None,
            timeout_secs: default_timeout_secs(),
            exec_sql_function: default_exec_sql_function(),
            exec_sql_arg: default_exec_sql_arg(),
            schema: default_schema(),
        }
    }
}

// Keys never show up in logs or panics.
impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("url", &self.url)
            .field("anon_key", &self.anon_key.as_deref().map(redact))
            .field("service_key", &self.service_key.as_deref().map(redact))
            .field("timeout_secs", &self.timeout_secs)
            .field("exec_sql_function", &self.exec_sql_function)
            .field("exec_sql_arg", &self.exec_sql_arg)
            .field("schema", &self.schema)
            .finish()
    }
}

impl BackendConfig {
    /// Strict lookup of the key for a privilege; callers decide whether to fall back.
    pub fn key(&self, privilege: Privilege) -> Option<&str> {
        match privilege {
            Privilege::Anon => self.anon_key.as_deref(),
            Privilege::Service => self.service_key.as_deref(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_exec_sql_function() -> String {
    "exec_sql".to_string()
}

fn default_exec_sql_arg() -> String {
    "sql".to_string()
}

fn default_schema() -> String {
    "public".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8000
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImportConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Pause between chunks so the backend is not flooded
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
    #[serde(default = "default_city")]
    pub default_city: String,
    #[serde(default = "default_country_code")]
    pub country_code: String,
    /// The shop's own number as it appears in call logs
    pub own_number: Option<String>,
    /// Unique column used for upserts; plain inserts when unset
    pub conflict_column: Option<String>,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
            default_city: default_city(),
            country_code: default_country_code(),
            own_number: None,
            conflict_column: None,
        }
    }
}

fn default_batch_size() -> usize {
    50
}

fn default_batch_delay_ms() -> u64 {
    100
}

fn default_city() -> String {
    "Dar es Salaam".to_string()
}

fn default_country_code() -> String {
    "255".to_string()
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    #[default]
    Halt,
    Continue,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MigrateConfig {
    #[serde(default = "default_migrations_dir")]
    pub dir: PathBuf,
    #[serde(default)]
    pub on_error: OnError,
    /// Send each file as a single transactional call
    #[serde(default)]
    pub atomic: bool,
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            dir: default_migrations_dir(),
            on_error: OnError::default(),
            atomic: false,
        }
    }
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("./migrations/backend")
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Outcome of `Config::validate`
#[derive(Debug, Default)]
pub struct ConfigCheck {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ConfigCheck {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| "Failed to parse configuration file")?;
            Ok(config)
        } else {
            info!("No config file found, using defaults");
            Ok(Config::default())
        }
    }

    /// Load the file, then overlay `.env` and process environment variables.
    pub fn load_with_env(path: &Path) -> Result<Self> {
        // A missing .env is normal
        let _ = dotenvy::dotenv();
        let mut config = Self::load(path)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Overlay environment values. Primary names win over the legacy frontend names.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let first = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| lookup(*k).filter(|v| !v.trim().is_empty()))
        };

        if let Some(url) = first(&["SHOPKEEP_BACKEND_URL", "VITE_SUPABASE_URL"]) {
            self.backend.url = url;
        }
        if let Some(key) = first(&["SHOPKEEP_ANON_KEY", "VITE_SUPABASE_ANON_KEY"]) {
            self.backend.anon_key = Some(key);
        }
        if let Some(key) = first(&["SHOPKEEP_SERVICE_KEY", "SUPABASE_SERVICE_ROLE_KEY"]) {
            self.backend.service_key = Some(key);
        }
        if let Some(level) = first(&["SHOPKEEP_LOG"]) {
            self.logging.level = level;
        }
    }

    pub fn validate(&self) -> ConfigCheck {
        let mut check = ConfigCheck::default();

        let url = self.backend.url.trim();
        if url.is_empty() {
            check
                .errors
                .push("backend.url is not set (SHOPKEEP_BACKEND_URL)".to_string());
        } else if !(url.starts_with("https://") || url.starts_with("http://")) {
            check
                .errors
                .push(format!("backend.url must be an http(s) URL, got '{}'", url));
        } else if url.starts_with("http://")
            && !(url.contains("localhost") || url.contains("127.0.0.1"))
        {
            check
                .warnings
                .push("backend.url uses plain http; keys will travel unencrypted".to_string());
        }

        if self.backend.anon_key.is_none() && self.backend.service_key.is_none() {
            check
                .errors
                .push("no API key configured (SHOPKEEP_ANON_KEY or SHOPKEEP_SERVICE_KEY)".to_string());
        } else if self.backend.service_key.is_none() {
            check.warnings.push(
                "no service key set - migrations, RLS patches and imports will run with the anon key"
                    .to_string(),
            );
        }

        if self.import.batch_size == 0 {
            check.errors.push("import.batch_size must be at least 1".to_string());
        }
        if self.retry.max_attempts == 0 {
            check.errors.push("retry.max_attempts must be at least 1".to_string());
        }
        if !self.import.country_code.chars().all(|c| c.is_ascii_digit())
            || self.import.country_code.is_empty()
        {
            check
                .errors
                .push("import.country_code must contain digits only".to_string());
        }
        if self.migrate.on_error == OnError::Continue {
            check.warnings.push(
                "migrate.on_error = continue - a failing statement will not stop the run".to_string(),
            );
        }

        check
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.ledger.data_dir.join("shopkeep.db")
    }
}

/// Show the first few characters of a secret
pub fn redact(secret: &str) -> String {
    let visible: String = secret.chars().take(6).collect();
    if secret.chars().count() <= 6 {
        "******".to_string()
    } else {
        format!("{}******", visible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.import.batch_size, 50);
        assert_eq!(config.import.default_city, "Dar es Salaam");
        assert_eq!(config.backend.exec_sql_function, "exec_sql");
        assert_eq!(config.migrate.on_error, OnError::Halt);
        assert_eq!(config.ledger_path(), PathBuf::from("./data/shopkeep.db"));
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [backend]
            url = "https://demo.example.co"

            [import]
            batch_size = 25
            own_number = "0712378850"

            [migrate]
            on_error = "continue"
            "#,
        )
        .unwrap();

        assert_eq!(config.backend.url, "https://demo.example.co");
        assert_eq!(config.backend.timeout_secs, 30);
        assert_eq!(config.import.batch_size, 25);
        assert_eq!(config.import.own_number.as_deref(), Some("0712378850"));
        assert_eq!(config.migrate.on_error, OnError::Continue);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_env_overrides_file_and_prefers_primary_names() {
        let mut config = Config::default();
        config.backend.url = "https://from-file.example.co".to_string();

        config.apply_env(env(&[
            ("VITE_SUPABASE_URL", "https://legacy.example.co"),
            ("SHOPKEEP_BACKEND_URL", "https://primary.example.co"),
            ("VITE_SUPABASE_ANON_KEY", "anon-legacy"),
            ("SHOPKEEP_LOG", "debug"),
        ]));

        assert_eq!(config.backend.url, "https://primary.example.co");
        assert_eq!(config.backend.anon_key.as_deref(), Some("anon-legacy"));
        assert_eq!(config.backend.service_key, None);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_empty_env_values_are_ignored() {
        let mut config = Config::default();
        config.backend.url = "https://keep.example.co".to_string();
        config.apply_env(env(&[("SHOPKEEP_BACKEND_URL", "  ")]));
        assert_eq!(config.backend.url, "https://keep.example.co");
    }

    #[test]
    fn test_validate_reports_missing_url_and_keys() {
        let check = Config::default().validate();
        assert!(!check.is_ok());
        assert_eq!(check.errors.len(), 2);
    }

    #[test]
    fn test_validate_warns_without_service_key() {
        let mut config = Config::default();
        config.backend.url = "https://demo.example.co".to_string();
        config.backend.anon_key = Some("anon".to_string());

        let check = config.validate();
        assert!(check.is_ok());
        assert!(check.warnings.iter().any(|w| w.contains("service key")));
    }

    #[test]
    fn test_key_selection_does_not_downgrade() {
        let mut backend = BackendConfig::default();
        backend.anon_key = Some("anon".to_string());
        assert_eq!(backend.key(Privilege::Anon), Some("anon"));
        assert_eq!(backend.key(Privilege::Service), None);
    }

    #[test]
    fn test_debug_redacts_keys() {
        let mut backend = BackendConfig::default();
        backend.service_key = Some("eyJhbGciOiJIUzI1NiJ9.secret-part".to_string());
        let printed = format!("{:?}", backend);
        assert!(printed.contains("eyJhbG******"));
        assert!(!printed.contains("secret-part"));
        assert_eq!(redact("abc"), "******");
    }
}
