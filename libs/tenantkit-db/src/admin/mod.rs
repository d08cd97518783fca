//! Elevated administration: namespace provisioning, migrations, registry,
//! fleet migration, health auditing and row-filter setup.
//!
//! Everything here runs on the elevated role and must never be reachable from
//! request handling code. [`AdminDb::conn`] refuses to work while a tenant
//! scope is active on the current task.

mod catalog;
pub mod audit;
pub mod fleet;
pub mod manifest;
pub mod migrate;
pub mod provision;
pub mod registry;
pub mod rls;

pub use audit::{AuditDefect, AuditError, AuditReport, HealthAuditor};
pub use fleet::{FleetError, FleetMigrator, FleetReport, FleetSummary};
pub use manifest::{ManifestError, MigrationEntry, MigrationSet};
pub use migrate::{MigrationApplier, MigrationError, MigrationReport};
pub use provision::{NamespaceProvisioner, ProvisionError, ProvisionOutcome};
pub use registry::{NamespaceRegistry, RegistryEntry, RegistryError};

use sea_orm::DatabaseConnection;

use crate::config::DbConnConfig;
use crate::ident::SqlIdent;
use crate::{DbError, DbHandle, DbRole};

/// Elevated database access for operator tooling.
#[derive(Debug, Clone)]
pub struct AdminDb {
    handle: DbHandle,
}

/// Open the elevated pool.
///
/// # Errors
/// Returns an error if the configuration is invalid or the pool cannot connect.
pub async fn connect_elevated(cfg: &DbConnConfig) -> crate::Result<AdminDb> {
    let handle = crate::options::connect(cfg, DbRole::Elevated).await?;
    Ok(AdminDb { handle })
}

impl AdminDb {
    /// Wrap an already open connection that runs as the elevated role.
    #[must_use]
    pub fn from_connection(conn: DatabaseConnection) -> Self {
        Self {
            handle: DbHandle::from_connection(DbRole::Elevated, conn),
        }
    }

    /// The elevated connection.
    ///
    /// # Errors
    /// Returns `DbError::ElevatedInsideTenantScope` when called from tenant-scoped work.
    pub fn conn(&self) -> crate::Result<&DatabaseConnection> {
        if crate::tenant::in_tenant_scope() {
            tracing::error!(
                role = self.handle.role().as_str(),
                "elevated connection requested inside a tenant scope"
            );
            return Err(DbError::ElevatedInsideTenantScope);
        }
        Ok(self.handle.sea())
    }

    /// Redacted description of the target database.
    #[must_use]
    pub fn dsn(&self) -> &str {
        self.handle.dsn()
    }

    /// Close the pool.
    pub async fn close(self) {
        self.handle.close().await;
    }

    #[cfg(test)]
    pub(crate) fn into_inner(self) -> DatabaseConnection {
        self.handle.into_sea()
    }
}

/// Provision a namespace, migrate it, verify it and add it to the registry.
///
/// If registration fails after provisioning succeeded, the namespace is left
/// in place and shows up as an orphan in the next audit.
///
/// # Errors
/// See [`ProvisionError`].
pub async fn create_tenant_namespace(
    db: &AdminDb,
    migrations: &MigrationSet,
    expected_tables: &[SqlIdent],
    name: &str,
) -> Result<ProvisionOutcome, ProvisionError> {
    let outcome = NamespaceProvisioner::new(db, migrations, expected_tables)
        .create(name)
        .await?;
    let id = NamespaceRegistry::new(db)
        .register(&outcome.namespace)
        .await?;
    tracing::info!(namespace = %outcome.namespace, registry_id = %id, "tenant namespace ready");
    Ok(outcome)
}

/// Drop a namespace with all its objects and remove it from the registry.
///
/// Returns whether a registry entry was removed.
///
/// # Errors
/// See [`RegistryError`].
pub async fn drop_tenant_namespace(db: &AdminDb, name: &str) -> Result<bool, RegistryError> {
    NamespaceRegistry::new(db).drop_namespace(name).await
}
