#![allow(clippy::unwrap_used, clippy::expect_used)]
#![cfg(feature = "integration")]

//! Row-level isolation against a real `PostgreSQL`.

mod common;

use anyhow::Result;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DbBackend, DbErr, Statement};
use std::time::{Duration, Instant};
use tenantkit_db::admin::{self, rls};
use tenantkit_db::tenant::{self, ScopedError, TenantDb};
use tenantkit_db::{PoolCfg, SqlIdent};

const TENANT_A: &str = "11111111-1111-4111-8111-111111111111";
const TENANT_B: &str = "22222222-2222-4222-8222-222222222222";

/// Table `notes` with a forced row filter, plus a restricted login role.
async fn setup(dut: &common::DbUnderTest) -> Result<TenantDb> {
    let admin = admin::connect_elevated(&dut.elevated()).await?;
    let conn = admin.conn()?;
    conn.execute_unprepared(
        "CREATE TABLE notes (\
            id BIGSERIAL PRIMARY KEY, \
            tenant_id UUID NOT NULL, \
            body TEXT NOT NULL\
        )",
    )
    .await?;
    conn.execute_unprepared("CREATE ROLE app_user LOGIN PASSWORD 'app_pass'")
        .await?;
    conn.execute_unprepared("GRANT USAGE ON SEQUENCE notes_id_seq TO app_user")
        .await?;

    let notes = SqlIdent::parse("notes")?;
    rls::grant_restricted_access(&admin, &SqlIdent::parse("app_user")?, &notes).await?;
    rls::install_row_filter(&admin, &notes, &SqlIdent::parse("tenant_id")?).await?;
    admin.close().await;

    // One connection, so every scope below reuses the same session.
    let mut cfg = dut.as_role("app_user", "app_pass");
    cfg.pool = Some(PoolCfg {
        max_conns: Some(1),
        ..Default::default()
    });
    Ok(tenant::connect_restricted(&cfg).await?)
}

async fn insert(db: &TenantDb, tenant: &str, body: &'static str) -> Result<u64, ScopedError<DbErr>> {
    db.run_scoped(tenant, move |tx| {
        Box::pin(async move {
            tx.execute(
                "INSERT INTO notes (tenant_id, body) VALUES ($1, $2)",
                [tx.tenant().as_uuid().into(), body.into()],
            )
            .await
        })
    })
    .await
}

async fn bodies(db: &TenantDb, tenant: &str) -> Vec<String> {
    db.run_scoped(tenant, |tx| {
        Box::pin(async move {
            let rows = tx
                .query_all("SELECT body FROM notes ORDER BY id", [])
                .await?;
            rows.iter()
                .map(|r| r.try_get::<String>("", "body"))
                .collect::<Result<Vec<_>, DbErr>>()
        })
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn tenants_only_see_their_own_rows() -> Result<()> {
    let dut = common::bring_up_postgres().await?;
    let db = setup(&dut).await?;

    assert_eq!(insert(&db, TENANT_A, "hello").await.unwrap(), 1);

    assert_eq!(bodies(&db, TENANT_A).await, ["hello"]);
    assert!(bodies(&db, TENANT_B).await.is_empty());
    Ok(())
}

async fn current_tenant_setting(conn: &impl ConnectionTrait) -> Option<String> {
    conn.query_one(Statement::from_string(
        DbBackend::Postgres,
        "SELECT current_setting('app.tenant_id', true) AS v",
    ))
    .await
    .unwrap()
    .expect("one row")
    .try_get::<Option<String>>("", "v")
    .unwrap()
}

#[tokio::test]
async fn setting_does_not_outlive_the_transaction() -> Result<()> {
    let dut = common::bring_up_postgres().await?;
    setup(&dut).await?.close().await;

    // One pooled session shared by the scope and the direct checks below.
    let url = dut.as_role("app_user", "app_pass").dsn.unwrap();
    let mut opts = ConnectOptions::new(url);
    opts.max_connections(1).min_connections(1);
    let session = Database::connect(opts).await?;
    let db = TenantDb::from_connection(session.clone());

    insert(&db, TENANT_A, "a").await.unwrap();
    let after = current_tenant_setting(&session).await;
    assert!(
        after.as_deref().is_none_or(str::is_empty),
        "tenant setting survived the scope: {after:?}"
    );
    let visible = session
        .query_all(Statement::from_string(
            DbBackend::Postgres,
            "SELECT body FROM notes",
        ))
        .await?;
    assert!(visible.is_empty(), "rows visible outside any scope");

    let seen = db
        .run_scoped(TENANT_B, |tx| {
            Box::pin(async move {
                let row = tx
                    .query_one("SELECT current_setting('app.tenant_id', true) AS v", [])
                    .await?
                    .expect("one row");
                row.try_get::<String>("", "v")
            })
        })
        .await
        .unwrap();
    assert_eq!(seen, TENANT_B);
    Ok(())
}

#[tokio::test]
async fn writes_for_another_tenant_are_rejected() -> Result<()> {
    let dut = common::bring_up_postgres().await?;
    let db = setup(&dut).await?;

    let err = db
        .run_scoped(TENANT_A, |tx| {
            Box::pin(async move {
                let other = uuid::Uuid::parse_str(TENANT_B).unwrap();
                tx.execute(
                    "INSERT INTO notes (tenant_id, body) VALUES ($1, 'smuggled')",
                    [other.into()],
                )
                .await
            })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ScopedError::Work(_)));
    assert!(bodies(&db, TENANT_B).await.is_empty());
    Ok(())
}

#[tokio::test]
async fn failing_work_leaves_no_trace() -> Result<()> {
    let dut = common::bring_up_postgres().await?;
    let db = setup(&dut).await?;

    let err = db
        .run_scoped(TENANT_A, |tx| {
            Box::pin(async move {
                tx.execute(
                    "INSERT INTO notes (tenant_id, body) VALUES ($1, 'partial')",
                    [tx.tenant().as_uuid().into()],
                )
                .await?;
                Err::<(), _>(DbErr::Custom("business rule violated".to_owned()))
            })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ScopedError::Work(DbErr::Custom(_))));
    assert!(bodies(&db, TENANT_A).await.is_empty());
    Ok(())
}

#[tokio::test]
async fn malformed_tenant_is_rejected_up_front() -> Result<()> {
    let dut = common::bring_up_postgres().await?;
    let db = setup(&dut).await?;

    let err = insert(&db, "' OR 1=1 --", "x").await.unwrap_err();
    assert!(matches!(err, ScopedError::InvalidIdentifier(_)));
    Ok(())
}

#[tokio::test]
async fn deadline_cancels_slow_statement_on_the_server() -> Result<()> {
    let dut = common::bring_up_postgres().await?;
    let db = setup(&dut).await?;

    let started = Instant::now();
    let err = db
        .run_scoped_with_deadline(TENANT_A, Duration::from_millis(500), |tx| {
            Box::pin(async move { tx.execute("SELECT pg_sleep(5)", []).await })
        })
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, ScopedError::DeadlineExceeded(_)), "{err}");
    assert!(elapsed < Duration::from_millis(1500), "took {elapsed:?}");

    // The single pooled connection is free again.
    insert(&db, TENANT_A, "after").await.unwrap();
    assert_eq!(bodies(&db, TENANT_A).await, ["after"]);
    Ok(())
}

#[tokio::test]
async fn commit_failure_is_reported_apart_from_work_failure() -> Result<()> {
    let dut = common::bring_up_postgres().await?;
    let db = setup(&dut).await?;

    let admin = admin::connect_elevated(&dut.elevated()).await?;
    let conn = admin.conn()?;
    conn.execute_unprepared(
        "CREATE TABLE deferred_keys (\
            k INT, \
            CONSTRAINT deferred_keys_k UNIQUE (k) DEFERRABLE INITIALLY DEFERRED\
        )",
    )
    .await?;
    conn.execute_unprepared("GRANT SELECT, INSERT ON deferred_keys TO app_user")
        .await?;

    // Both inserts succeed; the duplicate is only checked at COMMIT.
    let err = db
        .run_scoped(TENANT_A, |tx| {
            Box::pin(async move {
                tx.execute("INSERT INTO deferred_keys (k) VALUES (1), (1)", [])
                    .await
            })
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ScopedError::Commit(_)), "{err}");
    assert!(err.work_error().is_none());

    let count = conn
        .query_one(Statement::from_string(
            DbBackend::Postgres,
            "SELECT count(*)::bigint AS n FROM deferred_keys",
        ))
        .await?
        .expect("one row")
        .try_get::<i64>("", "n")?;
    assert_eq!(count, 0);
    Ok(())
}
