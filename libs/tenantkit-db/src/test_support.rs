//! Helpers for `MockDatabase`-backed unit tests.

use std::collections::BTreeMap;

use sea_orm::{DatabaseConnection, MockExecResult, Value};

pub(crate) fn exec_ok() -> MockExecResult {
    MockExecResult {
        last_insert_id: 0,
        rows_affected: 1,
    }
}

pub(crate) fn exec_rows(rows_affected: u64) -> MockExecResult {
    MockExecResult {
        last_insert_id: 0,
        rows_affected,
    }
}

/// One-column rows, e.g. the result of a `... AS name` catalog query.
pub(crate) fn column(col: &'static str, values: &[&str]) -> Vec<BTreeMap<&'static str, Value>> {
    values
        .iter()
        .map(|v| BTreeMap::from([(col, Value::from(*v))]))
        .collect()
}

pub(crate) fn flag(present: bool) -> Vec<BTreeMap<&'static str, Value>> {
    vec![BTreeMap::from([("present", Value::from(present))])]
}

/// Every statement the mock saw, in order, including `BEGIN`/`COMMIT`/`ROLLBACK`.
pub(crate) fn sql_log(conn: DatabaseConnection) -> Vec<String> {
    conn.into_transaction_log()
        .iter()
        .flat_map(|t| t.statements().iter().map(|s| s.sql.clone()))
        .collect()
}
