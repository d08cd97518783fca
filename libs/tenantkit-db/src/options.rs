//! Building `PgConnectOptions` from configuration and opening pools.

use sea_orm::sqlx::postgres::{PgConnectOptions, PgPoolOptions};

use crate::config::{DbConnConfig, PoolCfg};
use crate::pool_opts::ApplyPoolOpts;
use crate::{DbError, DbHandle, DbRole, Result};

/// Open a pool for `role` from `cfg`.
///
/// # Errors
/// Returns an error if the configuration is invalid, an environment
/// reference cannot be resolved, or the first connection fails.
pub(crate) async fn connect(cfg: &DbConnConfig, role: DbRole) -> Result<DbHandle> {
    let resolved = resolve_env(cfg.clone())?;
    let opts = build_pg_options(&resolved)?;

    let pool_cfg = resolved
        .pool
        .as_ref()
        .map_or_else(|| PoolCfg::for_role(role), |p| p.over(&PoolCfg::for_role(role)));
    pool_cfg.validate()?;

    let log_dsn = describe(&opts);
    tracing::debug!(role = role.as_str(), dsn = %log_dsn, "Building database connection");

    let sqlx_pool = PgPoolOptions::new()
        .apply(&pool_cfg)
        .connect_with(opts)
        .await?;
    let sea = sea_orm::SqlxPostgresConnector::from_sqlx_postgres_pool(sqlx_pool);

    tracing::info!(role = role.as_str(), dsn = %log_dsn, "database pool ready");
    Ok(DbHandle {
        role,
        dsn: log_dsn,
        sea,
    })
}

/// Expand `${VAR}` references in the DSN, password and parameters.
fn resolve_env(mut cfg: DbConnConfig) -> Result<DbConnConfig> {
    if let Some(dsn) = &cfg.dsn {
        cfg.dsn = Some(expand_env_vars(dsn)?);
    }
    if let Some(password) = &cfg.password {
        cfg.password = Some(resolve_password(password)?);
    }
    if let Some(ref mut params) = cfg.params {
        for value in params.values_mut() {
            if value.contains("${") {
                *value = expand_env_vars(value)?;
            }
        }
    }
    Ok(cfg)
}

/// Build connection options; individual fields override DSN parts.
pub(crate) fn build_pg_options(cfg: &DbConnConfig) -> Result<PgConnectOptions> {
    let mut opts = match cfg.dsn.as_deref() {
        Some(dsn) => {
            check_scheme(dsn)?;
            dsn.parse::<PgConnectOptions>()
                .map_err(|e| DbError::InvalidParameter(e.to_string()))?
        }
        None => PgConnectOptions::new(),
    };

    if let Some(host) = &cfg.host {
        opts = opts.host(host);
    }
    if let Some(port) = cfg.port {
        opts = opts.port(port);
    }
    if let Some(user) = &cfg.user {
        opts = opts.username(user);
    }
    if let Some(password) = &cfg.password {
        opts = opts.password(password);
    }
    if let Some(dbname) = &cfg.dbname {
        opts = opts.database(dbname);
    } else if cfg.dsn.is_none() {
        return Err(DbError::InvalidParameter(
            "dbname is required when no dsn is given".to_owned(),
        ));
    }
    if let Some(name) = &cfg.application_name {
        opts = opts.application_name(name);
    }
    if let Some(params) = &cfg.params {
        for (key, value) in params {
            opts = opts.options([(key.as_str(), value.as_str())]);
        }
    }

    Ok(opts)
}

fn check_scheme(dsn: &str) -> Result<()> {
    let s = dsn.trim_start();
    if s.starts_with("postgres://") || s.starts_with("postgresql://") {
        Ok(())
    } else {
        Err(DbError::UnknownDsn(redact_credentials_in_dsn(Some(dsn))))
    }
}

fn describe(opts: &PgConnectOptions) -> String {
    format!(
        "postgresql://<redacted>@{}:{}/{}",
        opts.get_host(),
        opts.get_port(),
        opts.get_database().unwrap_or("")
    )
}

/// Expand environment variables in a string.
fn expand_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| DbError::InvalidParameter(e.to_string()))?;
    let mut result = input.to_owned();

    for caps in re.captures_iter(input) {
        let full_match = &caps[0];
        let var_name = &caps[1];
        let value = std::env::var(var_name)?;
        result = result.replace(full_match, &value);
    }

    Ok(result)
}

/// Resolve password from environment variable if it is exactly `${VAR}`.
fn resolve_password(password: &str) -> Result<String> {
    match password
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
    {
        Some(var_name) => Ok(std::env::var(var_name)?),
        None => Ok(password.to_owned()),
    }
}

/// Redact credentials from DSN for logging.
#[must_use]
pub fn redact_credentials_in_dsn(dsn: Option<&str>) -> String {
    match dsn {
        Some(dsn) if dsn.contains('@') => {
            if let Ok(mut parsed) = url::Url::parse(dsn) {
                if parsed.password().is_some() {
                    // Only fails for cannot-be-a-base URLs, which never carry a password.
                    let _ignored = parsed.set_password(Some("***"));
                }
                parsed.to_string()
            } else {
                "***".to_owned()
            }
        }
        Some(dsn) => dsn.to_owned(),
        None => "none".to_owned(),
    }
}
