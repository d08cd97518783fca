//! Migrating every registered namespace.

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use super::AdminDb;
use super::catalog;
use super::manifest::MigrationSet;
use super::migrate::{MigrationApplier, MigrationError, MigrationReport};
use super::registry::{NamespaceRegistry, RegistryError};
use crate::DbError;
use crate::ident::{InvalidIdentifier, NamespaceName};

/// Why one namespace could not be migrated.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error(transparent)]
    InvalidName(#[from] InvalidIdentifier),

    #[error("namespace '{0}' is registered but does not exist")]
    NamespaceMissing(String),

    #[error(transparent)]
    Connection(#[from] DbError),

    #[error("failed to inspect namespace '{namespace}': {source}")]
    Inspect {
        namespace: String,
        #[source]
        source: sea_orm::DbErr,
    },

    #[error(transparent)]
    Migration(#[from] MigrationError),
}

/// Per-namespace outcomes of [`FleetMigrator::migrate_all`].
#[derive(Debug, Default)]
pub struct FleetReport {
    /// Namespaces that are now up to date, with what was applied.
    pub migrated: Vec<(String, MigrationReport)>,
    /// Namespaces that failed, in registry order.
    pub failed: Vec<(String, FleetError)>,
}

impl FleetReport {
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.migrated.len()
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    /// Serializable view with errors rendered as text.
    #[must_use]
    pub fn summary(&self) -> FleetSummary {
        FleetSummary {
            succeeded: self.succeeded(),
            migrated: self
                .migrated
                .iter()
                .map(|(name, r)| (name.clone(), r.applied))
                .collect(),
            failed: self
                .failed
                .iter()
                .map(|(name, e)| (name.clone(), e.to_string()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FleetSummary {
    pub succeeded: usize,
    /// `(namespace, entries applied)`.
    pub migrated: Vec<(String, usize)>,
    /// `(namespace, error message)`.
    pub failed: Vec<(String, String)>,
}

/// Applies one [`MigrationSet`] to registered namespaces, one at a time.
#[derive(Debug, Clone, Copy)]
pub struct FleetMigrator<'a> {
    db: &'a AdminDb,
    migrations: &'a MigrationSet,
}

impl<'a> FleetMigrator<'a> {
    #[must_use]
    pub fn new(db: &'a AdminDb, migrations: &'a MigrationSet) -> Self {
        Self { db, migrations }
    }

    /// Migrate every registered namespace in registry order.
    ///
    /// A failing namespace is recorded and the run continues with the next.
    ///
    /// # Errors
    /// Returns `RegistryError` only if the registry itself cannot be read.
    pub async fn migrate_all(&self) -> Result<FleetReport, RegistryError> {
        let entries = NamespaceRegistry::new(self.db).list().await?;
        info!(namespaces = entries.len(), "migrating fleet");

        let mut report = FleetReport::default();
        for entry in entries {
            match self.migrate_one(&entry.name).await {
                Ok(r) => report.migrated.push((entry.name, r)),
                Err(e) => {
                    error!(namespace = %entry.name, error = %e, "namespace migration failed");
                    report.failed.push((entry.name, e));
                }
            }
        }

        info!(
            succeeded = report.succeeded(),
            failed = report.failed.len(),
            "fleet migration complete"
        );
        Ok(report)
    }

    /// Migrate a single namespace, which must already exist.
    ///
    /// # Errors
    /// See [`FleetError`].
    pub async fn migrate_one(&self, name: &str) -> Result<MigrationReport, FleetError> {
        let namespace = NamespaceName::parse(name)?;
        let conn = self.db.conn()?;
        let exists = catalog::schema_exists(conn, namespace.as_str())
            .await
            .map_err(|source| FleetError::Inspect {
                namespace: namespace.to_string(),
                source,
            })?;
        if !exists {
            return Err(FleetError::NamespaceMissing(namespace.to_string()));
        }
        Ok(MigrationApplier::new(self.db, self.migrations)
            .apply(&namespace)
            .await?)
    }
}
