mod commands;
mod config;
mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::config::{AppConfig, CliOverrides};

/// tenantctl - manage schema-per-tenant PostgreSQL namespaces
#[derive(Parser)]
#[command(name = "tenantctl")]
#[command(about = "tenantctl - manage schema-per-tenant PostgreSQL namespaces")]
#[command(version)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Migration directory (overrides config)
    #[arg(short, long, global = true)]
    migrations: Option<PathBuf>,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, migrate, verify and register a tenant namespace
    CreateNamespace { name: String },
    /// Bring every registered namespace up to date
    MigrateAll {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Bring one existing namespace up to date
    MigrateOne { name: String },
    /// List registered namespaces
    ListNamespaces {
        #[arg(long)]
        json: bool,
    },
    /// Drop a namespace with all of its data and unregister it
    DropNamespace {
        name: String,
        /// Confirm the drop
        #[arg(long)]
        yes: bool,
    },
    /// Audit every namespace; exits non-zero when anything is unhealthy
    HealthCheck {
        #[arg(long)]
        json: bool,
    },
    /// Validate configuration, print it (credentials redacted) and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // 1) defaults -> 2) YAML -> 3) env (TENANTKIT__*) -> 4) CLI overrides
    let mut config = AppConfig::load(cli.config.as_deref())?;
    config.apply_cli_overrides(&CliOverrides {
        migrations_dir: cli.migrations,
        verbose: cli.verbose,
        json_logs: cli.json_logs,
    });

    logging::init(&config.logging);

    match cli.command {
        Commands::CreateNamespace { name } => commands::create_namespace(&config, &name).await,
        Commands::MigrateAll { json } => commands::migrate_all(&config, json).await,
        Commands::MigrateOne { name } => commands::migrate_one(&config, &name).await,
        Commands::ListNamespaces { json } => commands::list_namespaces(&config, json).await,
        Commands::DropNamespace { name, yes } => {
            commands::drop_namespace(&config, &name, yes).await
        }
        Commands::HealthCheck { json } => commands::health_check(&config, json).await,
        Commands::CheckConfig => commands::check_config(&config),
    }
}
