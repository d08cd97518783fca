use sea_orm::{ConnectionTrait, DatabaseTransaction, DbErr, QueryResult, Statement, Value};

use crate::ident::TenantId;

/// Handle to an open transaction whose tenant scope is already bound.
///
/// Only lent to the work closure of [`super::TenantDb::run_scoped`]; the
/// transaction is committed or rolled back by the executor, never here.
pub struct TenantTx<'a> {
    pub(super) tx: &'a DatabaseTransaction,
    pub(super) tenant: TenantId,
}

impl TenantTx<'_> {
    /// Tenant this transaction is scoped to.
    #[must_use]
    pub fn tenant(&self) -> TenantId {
        self.tenant
    }

    /// Execute a parameterized statement and return the affected row count.
    ///
    /// # Errors
    /// Returns the database error unchanged.
    pub async fn execute<I>(&self, sql: &str, values: I) -> Result<u64, DbErr>
    where
        I: IntoIterator<Item = Value>,
    {
        let res = self.tx.execute(self.statement(sql, values)).await?;
        Ok(res.rows_affected())
    }

    /// Run a parameterized query and return every row.
    ///
    /// # Errors
    /// Returns the database error unchanged.
    pub async fn query_all<I>(&self, sql: &str, values: I) -> Result<Vec<QueryResult>, DbErr>
    where
        I: IntoIterator<Item = Value>,
    {
        self.tx.query_all(self.statement(sql, values)).await
    }

    /// Run a parameterized query and return the first row, if any.
    ///
    /// # Errors
    /// Returns the database error unchanged.
    pub async fn query_one<I>(&self, sql: &str, values: I) -> Result<Option<QueryResult>, DbErr>
    where
        I: IntoIterator<Item = Value>,
    {
        self.tx.query_one(self.statement(sql, values)).await
    }

    /// The underlying transaction, for `SeaORM` entity APIs.
    #[must_use]
    pub fn connection(&self) -> &DatabaseTransaction {
        self.tx
    }

    fn statement<I>(&self, sql: &str, values: I) -> Statement
    where
        I: IntoIterator<Item = Value>,
    {
        Statement::from_sql_and_values(self.tx.get_database_backend(), sql, values)
    }
}
