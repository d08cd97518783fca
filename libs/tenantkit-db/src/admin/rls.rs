//! Row-level security setup for row-scoped tables.
//!
//! The policy compares a tenant column with the transaction-local
//! [`TENANT_SETTING`]. Outside a scope the setting is unset or empty, which
//! matches no rows; row security is forced so the table owner is filtered too.

use sea_orm::{ConnectionTrait, TransactionTrait};
use tracing::info;

use super::AdminDb;
use crate::DbError;
use crate::ident::SqlIdent;
use crate::tenant::TENANT_SETTING;

/// Name of the policy created on each filtered table.
pub const POLICY_NAME: &str = "tenant_isolation";

fn policy_statements(table: &SqlIdent, column: &SqlIdent) -> [String; 4] {
    let t = table.quoted();
    let predicate = format!(
        "{} = NULLIF(current_setting('{TENANT_SETTING}', true), '')::uuid",
        column.quoted()
    );
    [
        format!("ALTER TABLE {t} ENABLE ROW LEVEL SECURITY"),
        format!("ALTER TABLE {t} FORCE ROW LEVEL SECURITY"),
        format!("DROP POLICY IF EXISTS \"{POLICY_NAME}\" ON {t}"),
        format!(
            "CREATE POLICY \"{POLICY_NAME}\" ON {t} USING ({predicate}) WITH CHECK ({predicate})"
        ),
    ]
}

/// Enable and force row-level security on `table`, filtering on `column`.
///
/// Re-running replaces the policy.
///
/// # Errors
/// Returns `DbError::Sea` if any statement fails; nothing is changed then.
pub async fn install_row_filter(
    db: &AdminDb,
    table: &SqlIdent,
    column: &SqlIdent,
) -> Result<(), DbError> {
    let conn = db.conn()?;
    let txn = conn.begin().await?;
    for sql in policy_statements(table, column) {
        if let Err(e) = txn.execute_unprepared(&sql).await {
            rollback(txn).await;
            return Err(e.into());
        }
    }
    txn.commit().await?;
    info!(table = %table, column = %column, "row filter installed");
    Ok(())
}

/// Grant the restricted role plain DML on `table`.
///
/// # Errors
/// Returns `DbError::Sea` if the grant fails.
pub async fn grant_restricted_access(
    db: &AdminDb,
    role: &SqlIdent,
    table: &SqlIdent,
) -> Result<(), DbError> {
    let conn = db.conn()?;
    conn.execute_unprepared(&format!(
        "GRANT SELECT, INSERT, UPDATE, DELETE ON {} TO {}",
        table.quoted(),
        role.quoted()
    ))
    .await?;
    info!(table = %table, role = %role, "restricted role granted access");
    Ok(())
}

async fn rollback(txn: sea_orm::DatabaseTransaction) {
    if let Err(e) = txn.rollback().await {
        tracing::warn!(error = %e, "rollback failed");
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::test_support::{exec_ok, sql_log};
    use sea_orm::{DatabaseBackend, DbErr, MockDatabase};

    fn ident(s: &str) -> SqlIdent {
        SqlIdent::parse(s).unwrap()
    }

    #[test]
    fn policy_reads_the_tenant_setting() {
        let stmts = policy_statements(&ident("notes"), &ident("tenant_id"));
        assert_eq!(stmts[1], "ALTER TABLE \"notes\" FORCE ROW LEVEL SECURITY");
        assert_eq!(
            stmts[3],
            "CREATE POLICY \"tenant_isolation\" ON \"notes\" \
             USING (\"tenant_id\" = NULLIF(current_setting('app.tenant_id', true), '')::uuid) \
             WITH CHECK (\"tenant_id\" = NULLIF(current_setting('app.tenant_id', true), '')::uuid)"
        );
    }

    #[tokio::test]
    async fn install_runs_in_one_transaction() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results((0..4).map(|_| exec_ok()))
            .into_connection();
        let db = AdminDb::from_connection(conn);

        install_row_filter(&db, &ident("notes"), &ident("tenant_id"))
            .await
            .unwrap();

        let sql = sql_log(db.into_inner());
        assert_eq!(sql.len(), 6);
        assert_eq!(sql[0], "BEGIN");
        assert_eq!(sql[5], "COMMIT");
    }

    #[tokio::test]
    async fn failed_statement_rolls_back() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([exec_ok()])
            .append_exec_errors([DbErr::Custom("must be owner of table notes".to_owned())])
            .into_connection();
        let db = AdminDb::from_connection(conn);

        let err = install_row_filter(&db, &ident("notes"), &ident("tenant_id"))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Sea(_)));
        let sql = sql_log(db.into_inner());
        assert_eq!(sql.last().map(String::as_str), Some("ROLLBACK"));
    }

    #[tokio::test]
    async fn grant_quotes_both_identifiers() {
        let conn = MockDatabase::new(DatabaseBackend::Postgres)
            .append_exec_results([exec_ok()])
            .into_connection();
        let db = AdminDb::from_connection(conn);

        grant_restricted_access(&db, &ident("app_user"), &ident("notes"))
            .await
            .unwrap();
        assert_eq!(
            sql_log(db.into_inner()),
            ["GRANT SELECT, INSERT, UPDATE, DELETE ON \"notes\" TO \"app_user\""]
        );
    }
}
