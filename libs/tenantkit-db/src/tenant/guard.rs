//! Task-local marker for code running inside a tenant scope.
//!
//! While the marker is set, [`crate::admin::AdminDb::conn`] refuses to hand
//! out the elevated connection. The marker does not follow work onto tasks
//! spawned from inside the scope.

use std::cell::Cell;
use std::future::Future;

tokio::task_local! {
    static IN_TENANT_SCOPE: Cell<bool>;
}

/// `true` while the current task is executing tenant-scoped work.
pub(crate) fn in_tenant_scope() -> bool {
    IN_TENANT_SCOPE.try_with(Cell::get).unwrap_or(false)
}

/// Run `f` with the marker set.
pub(crate) async fn with_scope_guard<F, T>(f: F) -> T
where
    F: Future<Output = T>,
{
    IN_TENANT_SCOPE.scope(Cell::new(true), f).await
}
