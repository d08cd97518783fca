//! Connection and pool configuration.
//!
//! Both roles use the same [`DbConnConfig`] shape. A [`DatabaseConfig`]
//! carries up to three of them: the elevated role, the restricted role, and
//! an optional dedicated connection for namespace tooling.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{DbError, DbRole, Result};

/// One `PostgreSQL` connection definition.
///
/// A DSN, when present, is parsed first; the individual fields then override
/// the matching parts of it. `${VAR}` placeholders in the DSN, the password and
/// `params` values are expanded from the environment at connect time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DbConnConfig {
    /// `postgres://` or `postgresql://` URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dsn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Literal value or a `${VAR}` reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dbname: Option<String>,
    /// Server run-time parameters sent at startup (`statement_timeout`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_name: Option<String>,
    /// Overrides for the role's default pool settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolCfg>,
}

/// Pool tuning. Unset fields fall back to the role defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolCfg {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_conns: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_conns: Option<u32>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub acquire_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub max_lifetime: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_before_acquire: Option<bool>,
}

const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const DEFAULT_MAX_LIFETIME: Duration = Duration::from_secs(30 * 60);

impl PoolCfg {
    /// Defaults for a role: 20 connections for restricted traffic, 5 for
    /// elevated tooling; 30s acquire, 10min idle, 30min lifetime for both.
    #[must_use]
    pub fn for_role(role: DbRole) -> Self {
        let max_conns = match role {
            DbRole::Restricted => 20,
            DbRole::Elevated => 5,
        };
        Self {
            max_conns: Some(max_conns),
            min_conns: Some(0),
            acquire_timeout: Some(DEFAULT_ACQUIRE_TIMEOUT),
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            max_lifetime: Some(DEFAULT_MAX_LIFETIME),
            test_before_acquire: Some(true),
        }
    }

    /// Field-wise overlay: values set on `self` win over `base`.
    #[must_use]
    pub fn over(&self, base: &PoolCfg) -> PoolCfg {
        PoolCfg {
            max_conns: self.max_conns.or(base.max_conns),
            min_conns: self.min_conns.or(base.min_conns),
            acquire_timeout: self.acquire_timeout.or(base.acquire_timeout),
            idle_timeout: self.idle_timeout.or(base.idle_timeout),
            max_lifetime: self.max_lifetime.or(base.max_lifetime),
            test_before_acquire: self.test_before_acquire.or(base.test_before_acquire),
        }
    }

    /// Check value ranges after overlaying.
    ///
    /// # Errors
    /// Returns `DbError::InvalidConfig` when `max_conns` is zero or below `min_conns`.
    pub fn validate(&self) -> Result<()> {
        if self.max_conns == Some(0) {
            return Err(DbError::InvalidConfig(
                "pool.max_conns must be greater than zero".to_owned(),
            ));
        }
        if let (Some(max), Some(min)) = (self.max_conns, self.min_conns)
            && min > max
        {
            return Err(DbError::InvalidConfig(format!(
                "pool.min_conns ({min}) exceeds pool.max_conns ({max})"
            )));
        }
        Ok(())
    }
}

/// Credentials for both roles plus the namespace tooling connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Owner/superuser connection. Required for any administrative command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elevated: Option<DbConnConfig>,
    /// Application connection subject to row-level security.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restricted: Option<DbConnConfig>,
    /// Connection for namespace provisioning; falls back to `elevated`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespaces: Option<DbConnConfig>,
}

impl DatabaseConfig {
    /// # Errors
    /// Returns `DbError::InvalidConfig` when no elevated connection is configured.
    pub fn elevated(&self) -> Result<&DbConnConfig> {
        self.elevated
            .as_ref()
            .ok_or_else(|| DbError::InvalidConfig("database.elevated is not configured".to_owned()))
    }

    /// # Errors
    /// Returns `DbError::InvalidConfig` when no restricted connection is configured.
    pub fn restricted(&self) -> Result<&DbConnConfig> {
        self.restricted.as_ref().ok_or_else(|| {
            DbError::InvalidConfig("database.restricted is not configured".to_owned())
        })
    }

    /// Connection used by the namespace tooling.
    ///
    /// # Errors
    /// Returns `DbError::InvalidConfig` when neither `namespaces` nor `elevated` is set.
    pub fn namespace_tooling(&self) -> Result<&DbConnConfig> {
        match &self.namespaces {
            Some(cfg) => Ok(cfg),
            None => self.elevated(),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn role_defaults() {
        let restricted = PoolCfg::for_role(DbRole::Restricted);
        let elevated = PoolCfg::for_role(DbRole::Elevated);

        assert_eq!(restricted.max_conns, Some(20));
        assert_eq!(elevated.max_conns, Some(5));
        for cfg in [&restricted, &elevated] {
            assert_eq!(cfg.acquire_timeout, Some(Duration::from_secs(30)));
            assert_eq!(cfg.idle_timeout, Some(Duration::from_secs(600)));
            assert_eq!(cfg.max_lifetime, Some(Duration::from_secs(1800)));
        }
    }

    #[test]
    fn overlay_prefers_explicit_values() {
        let user = PoolCfg {
            max_conns: Some(3),
            idle_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let merged = user.over(&PoolCfg::for_role(DbRole::Restricted));

        assert_eq!(merged.max_conns, Some(3));
        assert_eq!(merged.idle_timeout, Some(Duration::from_secs(5)));
        assert_eq!(merged.acquire_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn validate_rejects_bad_ranges() {
        let zero = PoolCfg {
            max_conns: Some(0),
            ..Default::default()
        };
        assert!(matches!(zero.validate(), Err(DbError::InvalidConfig(_))));

        let inverted = PoolCfg {
            max_conns: Some(2),
            min_conns: Some(4),
            ..Default::default()
        };
        let err = inverted.validate().unwrap_err();
        assert!(err.to_string().contains("min_conns (4)"));

        PoolCfg::for_role(DbRole::Elevated).validate().unwrap();
    }

    #[test]
    fn pool_durations_use_humantime() {
        let cfg: PoolCfg =
            serde_json::from_str(r#"{"acquire_timeout":"5s","max_lifetime":"1h"}"#).unwrap();
        assert_eq!(cfg.acquire_timeout, Some(Duration::from_secs(5)));
        assert_eq!(cfg.max_lifetime, Some(Duration::from_secs(3600)));
        assert_eq!(cfg.idle_timeout, None);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = serde_json::from_str::<DbConnConfig>(r#"{"dsn":"postgres://x","engine":"pg"}"#)
            .unwrap_err();
        assert!(err.to_string().contains("engine"));
    }

    #[test]
    fn namespace_tooling_falls_back_to_elevated() {
        let elevated = DbConnConfig {
            dsn: Some("postgres://owner@localhost/app".to_owned()),
            ..Default::default()
        };
        let cfg = DatabaseConfig {
            elevated: Some(elevated.clone()),
            ..Default::default()
        };
        assert_eq!(cfg.namespace_tooling().unwrap(), &elevated);
        assert!(cfg.restricted().is_err());

        let empty = DatabaseConfig::default();
        assert!(matches!(
            empty.namespace_tooling(),
            Err(DbError::InvalidConfig(_))
        ));
    }
}
