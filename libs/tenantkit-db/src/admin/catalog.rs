//! Read-only queries against the engine catalog.

use std::collections::BTreeSet;

use sea_orm::{ConnectionTrait, DbBackend, DbErr, FromQueryResult, Statement};

#[derive(Debug, FromQueryResult)]
struct NameRow {
    name: String,
}

#[derive(Debug, FromQueryResult)]
struct PresentRow {
    present: bool,
}

/// `true` if a schema named `name` exists.
pub(crate) async fn schema_exists<C>(conn: &C, name: &str) -> Result<bool, DbErr>
where
    C: ConnectionTrait,
{
    let stmt = Statement::from_sql_and_values(
        DbBackend::Postgres,
        "SELECT EXISTS (SELECT 1 FROM pg_catalog.pg_namespace WHERE nspname = $1) AS present",
        [name.into()],
    );
    let row = PresentRow::find_by_statement(stmt).one(conn).await?;
    Ok(row.is_some_and(|r| r.present))
}

/// Every schema name in the database, system schemas included.
pub(crate) async fn list_schemas<C>(conn: &C) -> Result<BTreeSet<String>, DbErr>
where
    C: ConnectionTrait,
{
    let stmt = Statement::from_string(
        DbBackend::Postgres,
        "SELECT nspname AS name FROM pg_catalog.pg_namespace ORDER BY nspname",
    );
    let rows = NameRow::find_by_statement(stmt).all(conn).await?;
    Ok(rows.into_iter().map(|r| r.name).collect())
}

/// Base tables that live in `schema`.
pub(crate) async fn list_tables<C>(conn: &C, schema: &str) -> Result<BTreeSet<String>, DbErr>
where
    C: ConnectionTrait,
{
    let stmt = Statement::from_sql_and_values(
        DbBackend::Postgres,
        "SELECT table_name::text AS name FROM information_schema.tables \
         WHERE table_schema = $1 AND table_type = 'BASE TABLE' ORDER BY table_name",
        [schema.into()],
    );
    let rows = NameRow::find_by_statement(stmt).all(conn).await?;
    Ok(rows.into_iter().map(|r| r.name).collect())
}
