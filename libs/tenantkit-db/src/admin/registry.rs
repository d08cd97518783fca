//! Registry of provisioned tenant namespaces.
//!
//! Stored in `public.tenant_namespaces`. Ids are UUID v7, so listing by id
//! returns namespaces in registration order.

use sea_orm::{
    ConnectionTrait, DbBackend, DbErr, FromQueryResult, SqlErr, Statement, TransactionTrait,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use super::AdminDb;
use crate::DbError;
use crate::ident::{InvalidIdentifier, NamespaceName};

/// Table holding the registry, always in `public`.
pub const REGISTRY_TABLE: &str = "public.tenant_namespaces";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("namespace '{0}' is already registered")]
    Conflict(String),

    #[error(transparent)]
    InvalidName(#[from] InvalidIdentifier),

    #[error(transparent)]
    Connection(#[from] DbError),

    #[error("registry {op} failed: {source}")]
    Query {
        op: &'static str,
        #[source]
        source: DbErr,
    },
}

impl RegistryError {
    fn query(op: &'static str) -> impl FnOnce(DbErr) -> Self {
        move |source| RegistryError::Query { op, source }
    }
}

/// One registered namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromQueryResult)]
pub struct RegistryEntry {
    pub id: Uuid,
    pub name: String,
    /// Unix epoch milliseconds.
    pub created_at: i64,
}

#[derive(Debug, FromQueryResult)]
struct PresentRow {
    present: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct NamespaceRegistry<'a> {
    db: &'a AdminDb,
}

impl<'a> NamespaceRegistry<'a> {
    #[must_use]
    pub fn new(db: &'a AdminDb) -> Self {
        Self { db }
    }

    /// Create the registry table if it does not exist yet.
    ///
    /// # Errors
    /// Returns `RegistryError::Query` if the DDL fails.
    pub async fn ensure_table(&self) -> Result<(), RegistryError> {
        let conn = self.db.conn()?;
        conn.execute_unprepared(&format!(
            "CREATE TABLE IF NOT EXISTS {REGISTRY_TABLE} (\
                id UUID PRIMARY KEY, \
                name TEXT NOT NULL UNIQUE, \
                created_at BIGINT NOT NULL\
            )"
        ))
        .await
        .map_err(RegistryError::query("create table"))?;
        Ok(())
    }

    /// Add `namespace` and return its new id.
    ///
    /// # Errors
    /// Returns `RegistryError::Conflict` if the name is already registered.
    pub async fn register(&self, namespace: &NamespaceName) -> Result<Uuid, RegistryError> {
        if self.contains(namespace).await? {
            return Err(RegistryError::Conflict(namespace.to_string()));
        }

        let conn = self.db.conn()?;
        let id = Uuid::now_v7();
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            format!("INSERT INTO {REGISTRY_TABLE} (id, name, created_at) VALUES ($1, $2, $3)"),
            [
                id.into(),
                namespace.as_str().into(),
                chrono::Utc::now().timestamp_millis().into(),
            ],
        );
        match conn.execute(stmt).await {
            Ok(_) => {
                info!(namespace = %namespace, id = %id, "namespace registered");
                Ok(id)
            }
            // Lost a race with a concurrent register.
            Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                Err(RegistryError::Conflict(namespace.to_string()))
            }
            Err(e) => Err(RegistryError::query("insert")(e)),
        }
    }

    /// Remove `namespace`; `false` if it was not registered.
    ///
    /// # Errors
    /// Returns `RegistryError::Query` if the delete fails.
    pub async fn unregister(&self, namespace: &NamespaceName) -> Result<bool, RegistryError> {
        let conn = self.db.conn()?;
        let res = conn
            .execute(delete_stmt(namespace))
            .await
            .map_err(RegistryError::query("delete"))?;
        Ok(res.rows_affected() > 0)
    }

    /// All registered namespaces in registration order.
    ///
    /// # Errors
    /// Returns `RegistryError::Query` if the registry cannot be read.
    pub async fn list(&self) -> Result<Vec<RegistryEntry>, RegistryError> {
        let conn = self.db.conn()?;
        let stmt = Statement::from_string(
            DbBackend::Postgres,
            format!("SELECT id, name, created_at FROM {REGISTRY_TABLE} ORDER BY id"),
        );
        RegistryEntry::find_by_statement(stmt)
            .all(conn)
            .await
            .map_err(RegistryError::query("list"))
    }

    /// # Errors
    /// Returns `RegistryError::Query` if the registry cannot be read.
    pub async fn contains(&self, namespace: &NamespaceName) -> Result<bool, RegistryError> {
        let conn = self.db.conn()?;
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            format!("SELECT EXISTS (SELECT 1 FROM {REGISTRY_TABLE} WHERE name = $1) AS present"),
            [namespace.as_str().into()],
        );
        let row = PresentRow::find_by_statement(stmt)
            .one(conn)
            .await
            .map_err(RegistryError::query("lookup"))?;
        Ok(row.is_some_and(|r| r.present))
    }

    /// Drop the namespace with everything in it and unregister it, atomically.
    ///
    /// Returns whether a registry entry was removed. Dropping a namespace that
    /// does not exist is not an error.
    ///
    /// # Errors
    /// Returns `RegistryError::InvalidName` or `RegistryError::Query`.
    pub async fn drop_namespace(&self, name: &str) -> Result<bool, RegistryError> {
        let namespace = NamespaceName::parse(name)?;
        let conn = self.db.conn()?;

        let txn = conn.begin().await.map_err(RegistryError::query("begin"))?;
        let res = async {
            txn.execute_unprepared(&format!(
                "DROP SCHEMA IF EXISTS {} CASCADE",
                namespace.quoted()
            ))
            .await
            .map_err(RegistryError::query("drop namespace"))?;
            let deleted = txn
                .execute(delete_stmt(&namespace))
                .await
                .map_err(RegistryError::query("delete"))?;
            Ok::<_, RegistryError>(deleted.rows_affected() > 0)
        }
        .await;

        match res {
            Ok(unregistered) => {
                txn.commit().await.map_err(RegistryError::query("commit"))?;
                info!(namespace = %namespace, unregistered, "namespace dropped");
                Ok(unregistered)
            }
            Err(err) => {
                if let Err(e) = txn.rollback().await {
                    warn!(namespace = %namespace, error = %e, "rollback failed");
                }
                Err(err)
            }
        }
    }
}

fn delete_stmt(namespace: &NamespaceName) -> Statement {
    Statement::from_sql_and_values(
        DbBackend::Postgres,
        format!("DELETE FROM {REGISTRY_TABLE} WHERE name = $1"),
        [namespace.as_str().into()],
    )
}
