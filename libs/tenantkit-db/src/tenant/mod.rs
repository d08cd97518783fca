//! Row-scoped tenant isolation.
//!
//! [`TenantDb`] wraps the restricted pool. Every unit of work runs in its own
//! transaction that first binds `app.tenant_id` with `set_config(.., true)`,
//! so the value disappears at commit or rollback and cannot leak to the next
//! borrower of the pooled connection. Row-level security policies installed
//! by [`crate::admin::rls::install_row_filter`] read the same setting.
//!
//! ```rust,no_run
//! # use tenantkit_db::tenant::TenantDb;
//! # async fn demo(db: &TenantDb) {
//! let inserted = db
//!     .run_scoped("11111111-1111-4111-8111-111111111111", |tx| {
//!         Box::pin(async move {
//!             tx.execute(
//!                 "INSERT INTO notes (tenant_id, body) VALUES ($1, $2)",
//!                 [tx.tenant().as_uuid().into(), "hello".into()],
//!             )
//!             .await
//!         })
//!     })
//!     .await;
//! # let _ = inserted;
//! # }
//! ```

mod guard;
mod tx;

pub(crate) use guard::in_tenant_scope;
pub use tx::TenantTx;

use std::time::Duration;

use futures::future::BoxFuture;
use sea_orm::{
    ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbErr, Statement, TransactionTrait,
};
use thiserror::Error;

use crate::config::DbConnConfig;
use crate::ident::{InvalidIdentifier, TenantId};
use crate::{DbHandle, DbRole};
use guard::with_scope_guard;

/// Session setting read by row-level security policies.
pub const TENANT_SETTING: &str = "app.tenant_id";

/// Why a scoped unit of work did not commit.
#[derive(Debug, Error)]
pub enum ScopedError<E> {
    /// The tenant identifier was rejected before any connection was used.
    #[error(transparent)]
    InvalidIdentifier(#[from] InvalidIdentifier),

    #[error("failed to open tenant transaction: {0}")]
    Connection(#[source] DbErr),

    #[error("failed to bind tenant scope: {0}")]
    ScopeBinding(#[source] DbErr),

    /// The work closure failed; the transaction was rolled back.
    #[error("tenant work failed: {0}")]
    Work(#[source] E),

    /// The work closure did not finish in time; the transaction was rolled back.
    #[error("tenant work exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),

    /// The work succeeded but the commit did not.
    #[error("failed to commit tenant transaction: {0}")]
    Commit(#[source] DbErr),
}

impl<E> ScopedError<E> {
    /// The work closure's own error, if that is what failed.
    #[must_use]
    pub fn work_error(&self) -> Option<&E> {
        match self {
            ScopedError::Work(e) => Some(e),
            _ => None,
        }
    }
}

/// Restricted, tenant-scoped database access.
///
/// Exposes no connection outside [`TenantDb::run_scoped`].
#[derive(Debug, Clone)]
pub struct TenantDb {
    handle: DbHandle,
}

/// Open the restricted pool.
///
/// # Errors
/// Returns an error if the configuration is invalid or the pool cannot connect.
pub async fn connect_restricted(cfg: &DbConnConfig) -> crate::Result<TenantDb> {
    let handle = crate::options::connect(cfg, DbRole::Restricted).await?;
    Ok(TenantDb { handle })
}

impl TenantDb {
    /// Wrap an already open connection that runs as the restricted role.
    #[must_use]
    pub fn from_connection(conn: DatabaseConnection) -> Self {
        Self {
            handle: DbHandle::from_connection(DbRole::Restricted, conn),
        }
    }

    /// Run `work` inside a transaction scoped to `tenant`.
    ///
    /// The identifier is validated before a connection is borrowed. The
    /// transaction commits only when `work` returns `Ok`; on any failure it
    /// is rolled back and the error is returned.
    ///
    /// # Errors
    /// See [`ScopedError`].
    pub async fn run_scoped<T, E, F>(&self, tenant: &str, work: F) -> Result<T, ScopedError<E>>
    where
        T: Send,
        E: Send,
        F: for<'a> FnOnce(&'a TenantTx<'a>) -> BoxFuture<'a, Result<T, E>> + Send,
    {
        self.scoped(tenant, None, work).await
    }

    /// Like [`TenantDb::run_scoped`], rolling back when `work` outlives `deadline`.
    ///
    /// The deadline is also set as the transaction's `statement_timeout`, so a
    /// statement still running on the server is cancelled there instead of
    /// holding the connection until it finishes. A failure observed after the
    /// deadline is reported as `DeadlineExceeded`.
    ///
    /// # Errors
    /// See [`ScopedError`]; an expired deadline yields `DeadlineExceeded`.
    pub async fn run_scoped_with_deadline<T, E, F>(
        &self,
        tenant: &str,
        deadline: Duration,
        work: F,
    ) -> Result<T, ScopedError<E>>
    where
        T: Send,
        E: Send,
        F: for<'a> FnOnce(&'a TenantTx<'a>) -> BoxFuture<'a, Result<T, E>> + Send,
    {
        self.scoped(tenant, Some(deadline), work).await
    }

    /// Close the pool.
    pub async fn close(self) {
        self.handle.close().await;
    }

    /// Redacted description of the target database.
    #[must_use]
    pub fn dsn(&self) -> &str {
        self.handle.dsn()
    }

    #[cfg(test)]
    pub(crate) fn into_inner(self) -> DatabaseConnection {
        self.handle.into_sea()
    }

    async fn scoped<T, E, F>(
        &self,
        tenant: &str,
        deadline: Option<Duration>,
        work: F,
    ) -> Result<T, ScopedError<E>>
    where
        T: Send,
        E: Send,
        F: for<'a> FnOnce(&'a TenantTx<'a>) -> BoxFuture<'a, Result<T, E>> + Send,
    {
        let tenant = TenantId::parse(tenant)?;

        let txn = self
            .handle
            .sea()
            .begin()
            .await
            .map_err(ScopedError::Connection)?;

        if let Err(e) = bind_tenant(&txn, tenant).await {
            tracing::warn!(tenant = %tenant, error = %e, "failed to bind tenant scope");
            rollback(txn, tenant).await;
            return Err(ScopedError::ScopeBinding(e));
        }
        if let Some(limit) = deadline
            && let Err(e) = bind_statement_timeout(&txn, limit).await
        {
            tracing::warn!(tenant = %tenant, error = %e, "failed to set statement timeout");
            rollback(txn, tenant).await;
            return Err(ScopedError::ScopeBinding(e));
        }
        tracing::debug!(tenant = %tenant, "tenant scope bound");

        let tx = TenantTx { tx: &txn, tenant };
        let guarded = with_scope_guard(work(&tx));
        let res = match deadline {
            None => guarded.await.map_err(ScopedError::Work),
            Some(limit) => {
                let started = tokio::time::Instant::now();
                match tokio::time::timeout(limit, guarded).await {
                    Ok(Ok(v)) => Ok(v),
                    // Cancelled server-side by statement_timeout.
                    Ok(Err(_)) if started.elapsed() >= limit => {
                        Err(ScopedError::DeadlineExceeded(limit))
                    }
                    Ok(Err(e)) => Err(ScopedError::Work(e)),
                    Err(_) => Err(ScopedError::DeadlineExceeded(limit)),
                }
            }
        };

        match res {
            Ok(v) => {
                txn.commit().await.map_err(ScopedError::Commit)?;
                tracing::debug!(tenant = %tenant, "tenant transaction committed");
                Ok(v)
            }
            Err(e) => {
                rollback(txn, tenant).await;
                Err(e)
            }
        }
    }
}

async fn bind_tenant(txn: &DatabaseTransaction, tenant: TenantId) -> Result<(), DbErr> {
    let stmt = Statement::from_sql_and_values(
        txn.get_database_backend(),
        "SELECT set_config($1, $2, true)",
        [TENANT_SETTING.into(), tenant.to_string().into()],
    );
    txn.execute(stmt).await?;
    Ok(())
}

/// Largest value `statement_timeout` accepts, in milliseconds.
const MAX_STATEMENT_TIMEOUT_MS: u128 = 2_147_483_647;

fn statement_timeout_ms(limit: Duration) -> String {
    limit
        .as_millis()
        .clamp(1, MAX_STATEMENT_TIMEOUT_MS)
        .to_string()
}

async fn bind_statement_timeout(txn: &DatabaseTransaction, limit: Duration) -> Result<(), DbErr> {
    let stmt = Statement::from_sql_and_values(
        txn.get_database_backend(),
        "SELECT set_config('statement_timeout', $1, true)",
        [statement_timeout_ms(limit).into()],
    );
    txn.execute(stmt).await?;
    Ok(())
}

async fn rollback(txn: DatabaseTransaction, tenant: TenantId) {
    match txn.rollback().await {
        Ok(()) => tracing::debug!(tenant = %tenant, "tenant transaction rolled back"),
        Err(e) => tracing::warn!(tenant = %tenant, error = %e, "rollback failed"),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::DbError;
    use crate::admin::AdminDb;
    use crate::test_support::{exec_ok, sql_log};
    use sea_orm::{DatabaseBackend, MockDatabase, Value};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    const TENANT: &str = "11111111-1111-4111-8111-111111111111";

    fn mock(execs: usize) -> TenantDb {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results((0..execs).map(|_| exec_ok()))
            .into_connection();
        TenantDb::from_connection(conn)
    }

    #[tokio::test]
    async fn binds_scope_then_commits() {
        let db = mock(2);

        let affected = db
            .run_scoped(TENANT, |tx| {
                Box::pin(async move {
                    tx.execute(
                        "INSERT INTO notes (tenant_id, body) VALUES ($1, $2)",
                        [tx.tenant().as_uuid().into(), "hello".into()],
                    )
                    .await
                })
            })
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let log = db.into_inner().into_transaction_log();
        let stmts = log[0].statements();
        let sql: Vec<&str> = stmts.iter().map(|s| s.sql.as_str()).collect();
        assert_eq!(sql.len(), 4);
        assert_eq!(sql[0], "BEGIN");
        assert_eq!(sql[1], "SELECT set_config($1, $2, true)");
        assert!(sql[2].starts_with("INSERT INTO notes"));
        assert_eq!(sql[3], "COMMIT");

        let bound = stmts[1].values.as_ref().unwrap();
        assert_eq!(bound.0[0], Value::from(TENANT_SETTING));
        assert_eq!(bound.0[1], Value::from(TENANT));
    }

    #[tokio::test]
    async fn work_error_rolls_back() {
        let db = mock(1);

        let err = db
            .run_scoped(TENANT, |_tx| {
                Box::pin(async move { Err::<(), _>(DbErr::Custom("boom".to_owned())) })
            })
            .await
            .unwrap_err();
        assert!(matches!(err.work_error(), Some(DbErr::Custom(m)) if m == "boom"));

        let sql = sql_log(db.into_inner());
        assert!(sql.iter().any(|s| s.contains("ROLLBACK")));
        assert!(!sql.iter().any(|s| s.contains("COMMIT")));
    }

    #[tokio::test]
    async fn invalid_tenant_never_touches_the_pool() {
        let db = mock(0);
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();

        for bad in ["", "tenant_001", "11111111-1111-4111-8111-11111111111'", "x'; DROP TABLE notes; --"] {
            let flag = flag.clone();
            let err = db
                .run_scoped(bad, move |_tx| {
                    Box::pin(async move {
                        flag.store(true, Ordering::SeqCst);
                        Ok::<(), DbErr>(())
                    })
                })
                .await
                .unwrap_err();
            assert!(matches!(err, ScopedError::InvalidIdentifier(_)), "{bad}");
        }

        assert!(!ran.load(Ordering::SeqCst));
        assert!(db.into_inner().into_transaction_log().is_empty());
    }

    #[tokio::test]
    async fn binding_failure_skips_work() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_errors([DbErr::Custom("permission denied for set_config".to_owned())])
            .into_connection();
        let db = TenantDb::from_connection(conn);
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();

        let err = db
            .run_scoped(TENANT, move |_tx| {
                Box::pin(async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok::<(), DbErr>(())
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ScopedError::ScopeBinding(_)));
        assert!(!ran.load(Ordering::SeqCst));
        let sql = sql_log(db.into_inner());
        assert!(sql.iter().any(|s| s.contains("ROLLBACK")));
    }

    #[tokio::test]
    async fn deadline_rolls_back() {
        let db = mock(2);

        let err = db
            .run_scoped_with_deadline(TENANT, Duration::from_millis(20), |_tx| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<(), DbErr>(())
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ScopedError::DeadlineExceeded(d) if d == Duration::from_millis(20)));
        let sql = sql_log(db.into_inner());
        assert!(sql.iter().any(|s| s.contains("ROLLBACK")));
    }

    #[tokio::test]
    async fn deadline_becomes_server_statement_timeout() {
        let db = mock(2);
        db.run_scoped_with_deadline(TENANT, Duration::from_millis(1500), |_tx| {
            Box::pin(async move { Ok::<(), DbErr>(()) })
        })
        .await
        .unwrap();

        let log = db.into_inner().into_transaction_log();
        let stmts = log[0].statements();
        assert_eq!(stmts[1].sql, "SELECT set_config($1, $2, true)");
        assert_eq!(
            stmts[2].sql,
            "SELECT set_config('statement_timeout', $1, true)"
        );
        assert_eq!(
            stmts[2].values.as_ref().unwrap().0[0],
            Value::from("1500")
        );
        assert_eq!(stmts[3].sql, "COMMIT");
    }

    #[test]
    fn statement_timeout_is_clamped() {
        assert_eq!(statement_timeout_ms(Duration::from_micros(10)), "1");
        assert_eq!(statement_timeout_ms(Duration::from_secs(2)), "2000");
        assert_eq!(
            statement_timeout_ms(Duration::from_secs(u64::MAX)),
            "2147483647"
        );
    }

    #[tokio::test]
    async fn plain_scope_sets_no_statement_timeout() {
        let db = mock(1);
        db.run_scoped(TENANT, |_tx| Box::pin(async move { Ok::<(), DbErr>(()) }))
            .await
            .unwrap();
        let sql = sql_log(db.into_inner());
        assert!(!sql.iter().any(|s| s.contains("statement_timeout")));
    }

    #[tokio::test]
    async fn fast_work_meets_deadline() {
        let db = mock(2);
        let out = db
            .run_scoped_with_deadline(TENANT, Duration::from_secs(5), |tx| {
                Box::pin(async move { Ok::<_, DbErr>(tx.tenant().to_string()) })
            })
            .await
            .unwrap();
        assert_eq!(out, TENANT);
    }

    #[tokio::test]
    async fn elevated_access_is_refused_inside_scope() {
        let db = mock(1);
        let admin = AdminDb::from_connection(
            MockDatabase::new(DatabaseBackend::Postgres).into_connection(),
        );
        assert!(admin.conn().is_ok());

        let inner = admin.clone();
        let refused = db
            .run_scoped(TENANT, move |_tx| {
                Box::pin(async move {
                    Ok::<_, DbErr>(matches!(
                        inner.conn(),
                        Err(DbError::ElevatedInsideTenantScope)
                    ))
                })
            })
            .await
            .unwrap();

        assert!(refused);
        assert!(admin.conn().is_ok());
    }
}
