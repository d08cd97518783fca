//! Layered configuration for `tenantctl`.
//!
//! Sources, lowest precedence first:
//! 1. built-in defaults
//! 2. YAML file given with `--config`
//! 3. environment variables prefixed with `TENANTKIT__` (`__` separates levels,
//!    e.g. `TENANTKIT__DATABASE__ELEVATED__DSN`)
//! 4. command-line overrides

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};
use tenantkit_db::{DatabaseConfig, DbConnConfig, InvalidIdentifier, SqlIdent};

pub const ENV_PREFIX: &str = "TENANTKIT__";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub migrations: MigrationsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationsConfig {
    /// Directory holding `meta/_journal.json` and one `<tag>.sql` per entry.
    #[serde(default = "default_migrations_dir")]
    pub dir: PathBuf,
    /// Tables every tenant namespace must contain after migration.
    /// Left empty, provisioning and audits skip the table checks.
    #[serde(default)]
    pub expected_tables: Vec<String>,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            dir: default_migrations_dir(),
            expected_tables: Vec::new(),
        }
    }
}

impl MigrationsConfig {
    /// # Errors
    /// Returns the first table name that is not a valid identifier.
    pub fn expected_tables(&self) -> Result<Vec<SqlIdent>, InvalidIdentifier> {
        self.expected_tables
            .iter()
            .map(|t| SqlIdent::parse(t))
            .collect()
    }
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("migrations")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence when set.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_owned()
}

/// Values from the command line that win over every other source.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub migrations_dir: Option<PathBuf>,
    pub verbose: u8,
    pub json_logs: bool,
}

impl AppConfig {
    /// Merge defaults, the optional YAML file and `TENANTKIT__*` variables.
    ///
    /// # Errors
    /// Fails if `path` is given but missing, or if any source is malformed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            if !path.is_file() {
                anyhow::bail!("config file does not exist: {}", path.display());
            }
            figment = figment.merge(Yaml::file(path));
        }
        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("invalid configuration")
    }

    pub fn apply_cli_overrides(&mut self, cli: &CliOverrides) {
        if let Some(dir) = &cli.migrations_dir {
            self.migrations.dir.clone_from(dir);
        }
        match cli.verbose {
            0 => {}
            1 => self.logging.level = "info".to_owned(),
            2 => self.logging.level = "debug".to_owned(),
            _ => self.logging.level = "trace".to_owned(),
        }
        if cli.json_logs {
            self.logging.format = LogFormat::Json;
        }
    }

    /// Copy with passwords masked, safe to print.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut out = self.clone();
        for conn in [
            &mut out.database.elevated,
            &mut out.database.restricted,
            &mut out.database.namespaces,
        ]
        .into_iter()
        .flatten()
        {
            redact(conn);
        }
        out
    }

    /// Effective configuration as YAML, credentials redacted.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_saphyr::to_string(&self.redacted())?)
    }
}

fn redact(conn: &mut DbConnConfig) {
    if conn.password.is_some() {
        conn.password = Some("***".to_owned());
    }
    if let Some(dsn) = conn.dsn.as_deref() {
        conn.dsn = Some(tenantkit_db::redact_credentials_in_dsn(Some(dsn)));
    }
}
