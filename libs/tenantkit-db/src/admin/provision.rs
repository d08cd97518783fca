//! Namespace provisioning: create, migrate, verify, and clean up on failure.

use sea_orm::{ConnectionTrait, DatabaseConnection, DbErr};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use super::AdminDb;
use super::catalog;
use super::manifest::MigrationSet;
use super::migrate::{MigrationApplier, MigrationError, MigrationReport};
use super::registry::RegistryError;
use crate::DbError;
use crate::ident::{InvalidIdentifier, NamespaceName, SqlIdent};

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    InvalidName(#[from] InvalidIdentifier),

    #[error(transparent)]
    Connection(#[from] DbError),

    #[error("failed to inspect namespace '{namespace}': {source}")]
    Inspect {
        namespace: String,
        #[source]
        source: DbErr,
    },

    #[error("failed to create namespace '{namespace}': {source}")]
    CreateNamespace {
        namespace: String,
        #[source]
        source: DbErr,
    },

    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// The expected tables were created in `public` instead of the namespace.
    #[error(
        "migrations for '{namespace}' created {tables:?} in the default namespace instead of the target"
    )]
    MisroutedMigration {
        namespace: String,
        tables: Vec<String>,
    },

    #[error("namespace '{namespace}' is missing expected tables {tables:?} after migration")]
    MissingTables {
        namespace: String,
        tables: Vec<String>,
    },

    #[error("failed to verify namespace '{namespace}': {source}")]
    Verify {
        namespace: String,
        #[source]
        source: DbErr,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Provisioning failed and dropping the half-built namespace failed too.
    #[error("{source}; dropping the namespace afterwards also failed: {cleanup}")]
    CleanupFailed {
        source: Box<ProvisionError>,
        cleanup: DbErr,
    },
}

impl ProvisionError {
    /// The failure that started it all, looking through `CleanupFailed`.
    #[must_use]
    pub fn root(&self) -> &ProvisionError {
        match self {
            ProvisionError::CleanupFailed { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Result of a successful [`NamespaceProvisioner::create`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionOutcome {
    pub namespace: NamespaceName,
    /// `false` when the namespace already existed and was only migrated.
    pub created: bool,
    pub migrations: MigrationReport,
}

/// Creates tenant namespaces and brings them to the current schema version.
#[derive(Debug, Clone, Copy)]
pub struct NamespaceProvisioner<'a> {
    db: &'a AdminDb,
    migrations: &'a MigrationSet,
    expected_tables: &'a [SqlIdent],
}

impl<'a> NamespaceProvisioner<'a> {
    /// `expected_tables` are checked in the namespace after migrating; an
    /// empty slice skips that check.
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

    /// Create `name`, apply all migrations into it and verify the result.
    ///
    /// Idempotent for an existing, healthy namespace. When this call created
    /// the namespace and a later step fails, the namespace is dropped again;
    /// a namespace that existed beforehand is never dropped.
    ///
    /// # Errors
    /// See [`ProvisionError`].
    pub async fn create(&self, name: &str) -> Result<ProvisionOutcome, ProvisionError> {
        let namespace = NamespaceName::parse(name)?;
        let conn = self.db.conn()?;

        let existed = catalog::schema_exists(conn, namespace.as_str())
            .await
            .map_err(|source| ProvisionError::Inspect {
                namespace: namespace.to_string(),
                source,
            })?;

        match self.build(conn, &namespace).await {
            Ok(migrations) => {
                info!(
                    namespace = %namespace,
                    created = !existed,
                    applied = migrations.applied,
                    "namespace provisioned"
                );
                Ok(ProvisionOutcome {
                    namespace,
                    created: !existed,
                    migrations,
                })
            }
            Err(err) if existed => Err(err),
            Err(err) => Err(release(conn, &namespace, err).await),
        }
    }

    async fn build(
        &self,
        conn: &DatabaseConnection,
        namespace: &NamespaceName,
    ) -> Result<MigrationReport, ProvisionError> {
        conn.execute_unprepared(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            namespace.quoted()
        ))
        .await
        .map_err(|source| ProvisionError::CreateNamespace {
            namespace: namespace.to_string(),
            source,
        })?;

        let report = MigrationApplier::new(self.db, self.migrations)
            .apply(namespace)
            .await?;
        self.verify(conn, namespace).await?;
        Ok(report)
    }

    async fn verify(
        &self,
        conn: &DatabaseConnection,
        namespace: &NamespaceName,
    ) -> Result<(), ProvisionError> {
        if self.expected_tables.is_empty() {
            return Ok(());
        }
        let verify_failed = |source: DbErr| ProvisionError::Verify {
            namespace: namespace.to_string(),
            source,
        };

        let present = catalog::list_tables(conn, namespace.as_str())
            .await
            .map_err(verify_failed)?;
        let missing: Vec<String> = self
            .expected_tables
            .iter()
            .filter(|t| !present.contains(t.as_str()))
            .map(|t| t.as_str().to_owned())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        let in_default = catalog::list_tables(conn, "public")
            .await
            .map_err(verify_failed)?;
        let misrouted: Vec<String> = missing
            .iter()
            .filter(|t| in_default.contains(t.as_str()))
            .cloned()
            .collect();
        if misrouted.is_empty() {
            Err(ProvisionError::MissingTables {
                namespace: namespace.to_string(),
                tables: missing,
            })
        } else {
            Err(ProvisionError::MisroutedMigration {
                namespace: namespace.to_string(),
                tables: misrouted,
            })
        }
    }
}

/// Drop a namespace this call created, keeping the original error.
async fn release(
    conn: &DatabaseConnection,
    namespace: &NamespaceName,
    original: ProvisionError,
) -> ProvisionError {
    warn!(namespace = %namespace, error = %original, "provisioning failed, dropping namespace");
    match conn
        .execute_unprepared(&format!(
            "DROP SCHEMA IF EXISTS {} CASCADE",
            namespace.quoted()
        ))
        .await
    {
        Ok(_) => original,
        Err(cleanup) => {
            warn!(namespace = %namespace, error = %cleanup, "failed to drop namespace after provisioning error");
            ProvisionError::CleanupFailed {
                source: Box::new(original),
                cleanup,
            }
        }
    }
}
