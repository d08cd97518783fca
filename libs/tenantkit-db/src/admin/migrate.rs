//! Per-namespace migration runner.
//!
//! Each namespace carries its own tracking table,
//! `"<namespace>"."__tenantkit_migrations"`. Every pending entry runs in its
//! own transaction together with its tracking row, with `search_path`
//! pinned to the namespace for that transaction only, so unqualified table
//! names in migration bodies land in the namespace being migrated.

use std::collections::BTreeMap;

use sea_orm::{
    ConnectionTrait, DatabaseConnection, DbBackend, DbErr, FromQueryResult, Statement,
    TransactionTrait,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::AdminDb;
use super::catalog;
use super::manifest::{ManifestError, MigrationEntry, MigrationSet};
use crate::DbError;
use crate::ident::NamespaceName;

/// Name of the per-namespace tracking table.
pub const TRACKING_TABLE: &str = "__tenantkit_migrations";

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Connection(#[from] DbError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("failed to create tracking table in '{namespace}': {source}")]
    CreateTable {
        namespace: String,
        #[source]
        source: DbErr,
    },

    #[error("failed to read migration history of '{namespace}': {source}")]
    QueryHistory {
        namespace: String,
        #[source]
        source: DbErr,
    },

    /// A later entry is recorded as applied while an earlier one is not.
    #[error(
        "migration history of '{namespace}' is out of order: '{applied}' is applied but earlier '{pending}' is not"
    )]
    OutOfOrder {
        namespace: String,
        pending: String,
        applied: String,
    },

    #[error("migration '{tag}' failed in '{namespace}': {source}")]
    EntryFailed {
        namespace: String,
        tag: String,
        #[source]
        source: DbErr,
    },

    #[error("failed to record migration '{tag}' in '{namespace}': {source}")]
    RecordFailed {
        namespace: String,
        tag: String,
        #[source]
        source: DbErr,
    },

    #[error("failed to commit migration '{tag}' in '{namespace}': {source}")]
    CommitFailed {
        namespace: String,
        tag: String,
        #[source]
        source: DbErr,
    },
}

/// Outcome of one [`MigrationApplier::apply`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Entries executed by this run.
    pub applied: usize,
    /// Entries already recorded before this run.
    pub skipped: usize,
    /// Tags executed by this run, in order.
    pub applied_tags: Vec<String>,
}

#[derive(Debug, FromQueryResult)]
struct TrackingRow {
    tag: String,
    hash: String,
}

/// Applies a [`MigrationSet`] to one namespace.
#[derive(Debug, Clone, Copy)]
pub struct MigrationApplier<'a> {
    db: &'a AdminDb,
    migrations: &'a MigrationSet,
}

impl<'a> MigrationApplier<'a> {
    #[must_use]
    pub fn new(db: &'a AdminDb, migrations: &'a MigrationSet) -> Self {
        Self { db, migrations }
    }

    /// Bring `namespace` up to date. Safe to call repeatedly.
    ///
    /// Stops at the first failing entry; entries committed before it stay
    /// applied and recorded.
    ///
    /// # Errors
    /// Returns a [`MigrationError`] describing the first failure.
    pub async fn apply(&self, namespace: &NamespaceName) -> Result<MigrationReport, MigrationError> {
        let conn = self.db.conn()?;
        ensure_tracking_table(conn, namespace).await?;
        let applied = applied_records(conn, namespace).await?;
        check_order(namespace, self.migrations, &applied)?;

        let mut report = MigrationReport::default();
        for entry in self.migrations.entries() {
            if let Some(hash) = applied.get(entry.tag()) {
                if hash != entry.checksum() {
                    warn!(
                        namespace = %namespace,
                        tag = entry.tag(),
                        "applied migration body has changed since it was recorded"
                    );
                }
                debug!(namespace = %namespace, tag = entry.tag(), "Migration already applied, skipping");
                report.skipped += 1;
                continue;
            }

            info!(namespace = %namespace, tag = entry.tag(), "Applying migration");
            apply_entry(conn, namespace, entry).await?;
            report.applied += 1;
            report.applied_tags.push(entry.tag().to_owned());
        }

        info!(
            namespace = %namespace,
            applied = report.applied,
            skipped = report.skipped,
            "Migration run complete"
        );
        Ok(report)
    }

    /// Tags not yet recorded in `namespace`, in apply order.
    ///
    /// A namespace without a tracking table has every entry pending.
    ///
    /// # Errors
    /// Returns `MigrationError::QueryHistory` if the catalog or history cannot be read.
    pub async fn pending(&self, namespace: &NamespaceName) -> Result<Vec<String>, MigrationError> {
        let conn = self.db.conn()?;
        let tables = catalog::list_tables(conn, namespace.as_str())
            .await
            .map_err(|source| MigrationError::QueryHistory {
                namespace: namespace.to_string(),
                source,
            })?;
        if !tables.contains(TRACKING_TABLE) {
            return Ok(self.migrations.tags().map(str::to_owned).collect());
        }
        let applied = applied_records(conn, namespace).await?;
        Ok(self
            .migrations
            .tags()
            .filter(|t| !applied.contains_key(*t))
            .map(str::to_owned)
            .collect())
    }
}

fn tracking_table(namespace: &NamespaceName) -> String {
    format!("{}.\"{TRACKING_TABLE}\"", namespace.quoted())
}

async fn ensure_tracking_table(
    conn: &DatabaseConnection,
    namespace: &NamespaceName,
) -> Result<(), MigrationError> {
    let sql = format!(
        "CREATE TABLE IF NOT EXISTS {} (\
            id BIGSERIAL PRIMARY KEY, \
            tag TEXT NOT NULL UNIQUE, \
            hash TEXT NOT NULL, \
            applied_at BIGINT NOT NULL\
        )",
        tracking_table(namespace)
    );
    conn.execute_unprepared(&sql)
        .await
        .map_err(|source| MigrationError::CreateTable {
            namespace: namespace.to_string(),
            source,
        })?;
    Ok(())
}

/// Recorded tags of `namespace` mapped to the body hash stored with them.
pub(crate) async fn applied_records<C>(
    conn: &C,
    namespace: &NamespaceName,
) -> Result<BTreeMap<String, String>, MigrationError>
where
    C: ConnectionTrait,
{
    let stmt = Statement::from_string(
        DbBackend::Postgres,
        format!("SELECT tag, hash FROM {} ORDER BY id", tracking_table(namespace)),
    );
    let rows = TrackingRow::find_by_statement(stmt)
        .all(conn)
        .await
        .map_err(|source| MigrationError::QueryHistory {
            namespace: namespace.to_string(),
            source,
        })?;
    Ok(rows.into_iter().map(|r| (r.tag, r.hash)).collect())
}

/// Refuse to fill a gap behind an already applied later entry.
fn check_order(
    namespace: &NamespaceName,
    set: &MigrationSet,
    applied: &BTreeMap<String, String>,
) -> Result<(), MigrationError> {
    let entries = set.entries();
    let Some(first_pending) = entries.iter().position(|e| !applied.contains_key(e.tag())) else {
        return Ok(());
    };
    match entries[first_pending + 1..]
        .iter()
        .find(|e| applied.contains_key(e.tag()))
    {
        Some(later) => Err(MigrationError::OutOfOrder {
            namespace: namespace.to_string(),
            pending: entries[first_pending].tag().to_owned(),
            applied: later.tag().to_owned(),
        }),
        None => Ok(()),
    }
}

async fn apply_entry(
    conn: &DatabaseConnection,
    namespace: &NamespaceName,
    entry: &MigrationEntry,
) -> Result<(), MigrationError> {
    let failed = |source: DbErr| MigrationError::EntryFailed {
        namespace: namespace.to_string(),
        tag: entry.tag().to_owned(),
        source,
    };

    let txn = conn.begin().await.map_err(failed)?;

    let res: Result<(), MigrationError> = async {
        txn.execute_unprepared(&format!(
            "SET LOCAL search_path TO {}, public",
            namespace.quoted()
        ))
        .await
        .map_err(failed)?;

        for stmt in entry.statements() {
            txn.execute_unprepared(stmt).await.map_err(failed)?;
        }

        let record = Statement::from_sql_and_values(
            DbBackend::Postgres,
            format!(
                "INSERT INTO {} (tag, hash, applied_at) VALUES ($1, $2, $3)",
                tracking_table(namespace)
            ),
            [
                entry.tag().into(),
                entry.checksum().into(),
                chrono::Utc::now().timestamp_millis().into(),
            ],
        );
        txn.execute(record)
            .await
            .map_err(|source| MigrationError::RecordFailed {
                namespace: namespace.to_string(),
                tag: entry.tag().to_owned(),
                source,
            })?;
        Ok(())
    }
    .await;

    match res {
        Ok(()) => txn
            .commit()
            .await
            .map_err(|source| MigrationError::CommitFailed {
                namespace: namespace.to_string(),
                tag: entry.tag().to_owned(),
                source,
            }),
        Err(err) => {
            if let Err(e) = txn.rollback().await {
                warn!(namespace = %namespace, tag = entry.tag(), error = %e, "rollback failed");
            }
            Err(err)
        }
    }
}
