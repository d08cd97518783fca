//! Fleet health audit: registered namespaces against what actually exists.

use std::collections::BTreeSet;

use sea_orm::{DatabaseConnection, DbErr};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use super::AdminDb;
use super::catalog;
use super::manifest::MigrationSet;
use super::migrate::{TRACKING_TABLE, applied_records};
use super::registry::{NamespaceRegistry, RegistryError};
use crate::DbError;
use crate::ident::{NamespaceName, SqlIdent, is_system_namespace};

/// First problem found in a registered namespace.
///
/// Checks run in declaration order and stop at the first defect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "defect", rename_all = "snake_case")]
pub enum AuditDefect {
    /// The registered name is not a valid namespace name.
    InvalidName { reason: String },
    /// Registered, but no such namespace exists.
    NamespaceMissing,
    /// Expected tables are absent.
    TableMissing { tables: Vec<String> },
    /// The migration tracking table is absent.
    TrackingTableMissing,
    /// Recorded tags differ from the migration set.
    MigrationMismatch {
        missing: BTreeSet<String>,
        extra: BTreeSet<String>,
    },
    /// Inspecting the namespace failed.
    QueryFailed { message: String },
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error(transparent)]
    Connection(#[from] DbError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("failed to list namespaces: {0}")]
    Catalog(#[source] DbErr),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    /// Registered namespaces examined.
    pub total: usize,
    pub healthy: Vec<String>,
    pub unhealthy: Vec<(String, AuditDefect)>,
    /// Non-system namespaces that exist but are not registered.
    pub orphaned: Vec<String>,
}

impl AuditReport {
    /// No unhealthy and no orphaned namespaces.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.unhealthy.is_empty() && self.orphaned.is_empty()
    }
}

/// Audits every registered namespace against the migration set.
#[derive(Debug, Clone, Copy)]
pub struct HealthAuditor<'a> {
    db: &'a AdminDb,
    migrations: &'a MigrationSet,
    expected_tables: &'a [SqlIdent],
}

impl<'a> HealthAuditor<'a> {
    #[must_use]
    pub fn new(
        db: &'a AdminDb,
        migrations: &'a MigrationSet,
        expected_tables: &'a [SqlIdent],
    ) -> Self {
        Self {
            db,
            migrations,
            expected_tables,
        }
    }

    /// Inspect every registered namespace and look for unregistered ones.
    ///
    /// Read-only. A namespace that cannot be inspected is reported as
    /// unhealthy rather than failing the whole audit.
    ///
    /// # Errors
    /// Returns `AuditError` when the registry or the namespace list cannot be read.
    pub async fn audit(&self) -> Result<AuditReport, AuditError> {
        let entries = NamespaceRegistry::new(self.db).list().await?;
        let conn = self.db.conn()?;
        let existing = catalog::list_schemas(conn)
            .await
            .map_err(AuditError::Catalog)?;
        let expected_tags = self.migrations.tag_set();

        let mut report = AuditReport {
            total: entries.len(),
            ..AuditReport::default()
        };
        for entry in &entries {
            match self.inspect(conn, &entry.name, &existing, &expected_tags).await {
                None => report.healthy.push(entry.name.clone()),
                Some(defect) => {
                    warn!(namespace = %entry.name, defect = ?defect, "unhealthy namespace");
                    report.unhealthy.push((entry.name.clone(), defect));
                }
            }
        }

        let registered: BTreeSet<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        report.orphaned = existing
            .iter()
            .filter(|s| !is_system_namespace(s) && !registered.contains(s.as_str()))
            .cloned()
            .collect();
        for name in &report.orphaned {
            warn!(namespace = %name, "orphaned namespace");
        }

        info!(
            total = report.total,
            healthy = report.healthy.len(),
            unhealthy = report.unhealthy.len(),
            orphaned = report.orphaned.len(),
            "audit complete"
        );
        Ok(report)
    }

    async fn inspect(
        &self,
        conn: &DatabaseConnection,
        name: &str,
        existing: &BTreeSet<String>,
        expected_tags: &BTreeSet<String>,
    ) -> Option<AuditDefect> {
        let namespace = match NamespaceName::parse(name) {
            Ok(ns) => ns,
            Err(e) => {
                return Some(AuditDefect::InvalidName {
                    reason: e.to_string(),
                });
            }
        };
        if !existing.contains(name) {
            return Some(AuditDefect::NamespaceMissing);
        }

        let tables = match catalog::list_tables(conn, namespace.as_str()).await {
            Ok(t) => t,
            Err(e) => {
                return Some(AuditDefect::QueryFailed {
                    message: e.to_string(),
                });
            }
        };
        let missing_tables: Vec<String> = self
            .expected_tables
            .iter()
            .filter(|t| !tables.contains(t.as_str()))
            .map(|t| t.as_str().to_owned())
            .collect();
        if !missing_tables.is_empty() {
            return Some(AuditDefect::TableMissing {
                tables: missing_tables,
            });
        }
        if !tables.contains(TRACKING_TABLE) {
            return Some(AuditDefect::TrackingTableMissing);
        }

        let applied: BTreeSet<String> = match applied_records(conn, &namespace).await {
            Ok(records) => records.into_keys().collect(),
            Err(e) => {
                return Some(AuditDefect::QueryFailed {
                    message: e.to_string(),
                });
            }
        };
        let missing: BTreeSet<String> = expected_tags.difference(&applied).cloned().collect();
        let extra: BTreeSet<String> = applied.difference(expected_tags).cloned().collect();
        if missing.is_empty() && extra.is_empty() {
            None
        } else {
            Some(AuditDefect::MigrationMismatch { missing, extra })
        }
    }
}
