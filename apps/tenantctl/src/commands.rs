//! One function per subcommand. Each returns the process exit code; hard
//! failures propagate as errors and also exit non-zero.

use std::process::ExitCode;

use anyhow::{Context, Result};
use tenantkit_db::{NamespaceName, SqlIdent};
use tenantkit_db::admin::{
    self, AdminDb, AuditDefect, FleetMigrator, HealthAuditor, MigrationSet, NamespaceRegistry,
};

use crate::config::AppConfig;

/// Whether a command may change the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    /// Reads only; a missing registry table is reported, not created.
    ReadOnly,
    /// Creates the registry table first if needed.
    ReadWrite,
}

async fn open(cfg: &AppConfig, access: Access) -> Result<AdminDb> {
    let conn_cfg = cfg.database.namespace_tooling()?;
    let db = admin::connect_elevated(conn_cfg).await?;
    if access == Access::ReadWrite {
        NamespaceRegistry::new(&db).ensure_table().await?;
    }
    Ok(db)
}

fn expected_tables(cfg: &AppConfig) -> Result<Vec<SqlIdent>> {
    let tables = cfg.migrations.expected_tables()?;
    if tables.is_empty() {
        tracing::warn!(
            "migrations.expected_tables is empty; namespaces are not checked for missing or misrouted tables"
        );
    }
    Ok(tables)
}

fn load_migrations(cfg: &AppConfig) -> Result<MigrationSet> {
    let dir = &cfg.migrations.dir;
    MigrationSet::load(dir).with_context(|| format!("loading migrations from {}", dir.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

pub fn check_config(cfg: &AppConfig) -> Result<ExitCode> {
    tracing::info!("checking configuration");
    cfg.database.namespace_tooling()?;
    expected_tables(cfg)?;
    println!("Configuration is valid");
    println!("{}", cfg.to_yaml()?);
    Ok(ExitCode::SUCCESS)
}

pub async fn create_namespace(cfg: &AppConfig, name: &str) -> Result<ExitCode> {
    let namespace = NamespaceName::parse(name)?;
    let expected = expected_tables(cfg)?;
    let migrations = load_migrations(cfg)?;

    let db = open(cfg, Access::ReadWrite).await?;
    let res = admin::create_tenant_namespace(&db, &migrations, &expected, namespace.as_str()).await;
    db.close().await;
    let outcome = res?;

    println!(
        "namespace {} {} ({} migrations applied, {} already present)",
        outcome.namespace,
        if outcome.created { "created" } else { "updated" },
        outcome.migrations.applied,
        outcome.migrations.skipped,
    );
    Ok(ExitCode::SUCCESS)
}

pub async fn migrate_all(cfg: &AppConfig, json: bool) -> Result<ExitCode> {
    let migrations = load_migrations(cfg)?;
    let db = open(cfg, Access::ReadWrite).await?;
    let res = FleetMigrator::new(&db, &migrations).migrate_all().await;
    db.close().await;
    let report = res?;

    if json {
        print_json(&report.summary())?;
    } else {
        for (name, r) in &report.migrated {
            println!("ok    {name}: {} applied, {} skipped", r.applied, r.skipped);
        }
        for (name, e) in &report.failed {
            println!("FAIL  {name}: {e}");
        }
        println!(
            "{} succeeded, {} failed",
            report.succeeded(),
            report.failed.len()
        );
    }
    Ok(exit_code(report.is_clean()))
}

pub async fn migrate_one(cfg: &AppConfig, name: &str) -> Result<ExitCode> {
    let namespace = NamespaceName::parse(name)?;
    let migrations = load_migrations(cfg)?;
    let db = open(cfg, Access::ReadWrite).await?;
    let res = FleetMigrator::new(&db, &migrations)
        .migrate_one(namespace.as_str())
        .await;
    db.close().await;
    let report = res?;

    println!(
        "{namespace}: {} applied, {} skipped",
        report.applied, report.skipped
    );
    for tag in &report.applied_tags {
        println!("  + {tag}");
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn list_namespaces(cfg: &AppConfig, json: bool) -> Result<ExitCode> {
    let db = open(cfg, Access::ReadOnly).await?;
    let res = NamespaceRegistry::new(&db).list().await;
    db.close().await;
    let entries = res?;

    if json {
        print_json(&entries)?;
        return Ok(ExitCode::SUCCESS);
    }
    for e in &entries {
        let created = chrono::DateTime::from_timestamp_millis(e.created_at)
            .map_or_else(|| e.created_at.to_string(), |t| t.to_rfc3339());
        println!("{}  {:<32}  {created}", e.id, e.name);
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn drop_namespace(cfg: &AppConfig, name: &str, confirmed: bool) -> Result<ExitCode> {
    let namespace = NamespaceName::parse(name)?;
    if !confirmed {
        eprintln!(
            "refusing to drop namespace '{namespace}' and all of its data; pass --yes to confirm"
        );
        return Ok(ExitCode::FAILURE);
    }

    let db = open(cfg, Access::ReadWrite).await?;
    let res = admin::drop_tenant_namespace(&db, namespace.as_str()).await;
    db.close().await;

    if res? {
        println!("namespace {namespace} dropped");
    } else {
        println!("namespace {namespace} was not registered; any leftover schema was removed");
    }
    Ok(ExitCode::SUCCESS)
}

pub async fn health_check(cfg: &AppConfig, json: bool) -> Result<ExitCode> {
    let expected = expected_tables(cfg)?;
    let migrations = load_migrations(cfg)?;
    let db = open(cfg, Access::ReadOnly).await?;
    let res = HealthAuditor::new(&db, &migrations, &expected).audit().await;
    db.close().await;
    let report = res?;

    if json {
        print_json(&report)?;
    } else {
        println!(
            "{} registered, {} healthy, {} unhealthy, {} orphaned",
            report.total,
            report.healthy.len(),
            report.unhealthy.len(),
            report.orphaned.len()
        );
        for (name, defect) in &report.unhealthy {
            println!("  - {name}: {}", describe(defect));
        }
        for name in &report.orphaned {
            println!("  - {name}: exists but is not registered");
        }
    }
    Ok(exit_code(report.is_healthy()))
}

fn describe(defect: &AuditDefect) -> String {
    match defect {
        AuditDefect::InvalidName { reason } => format!("invalid name ({reason})"),
        AuditDefect::NamespaceMissing => "registered but missing".to_owned(),
        AuditDefect::TableMissing { tables } => format!("missing tables: {}", tables.join(", ")),
        AuditDefect::TrackingTableMissing => "migration tracking table missing".to_owned(),
        AuditDefect::MigrationMismatch { missing, extra } => {
            let join = |s: &std::collections::BTreeSet<String>| {
                s.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
            };
            format!(
                "migrations out of sync (missing: [{}], unknown: [{}])",
                join(missing),
                join(extra)
            )
        }
        AuditDefect::QueryFailed { message } => format!("inspection failed: {message}"),
    }
}
