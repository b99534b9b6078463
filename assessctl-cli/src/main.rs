//! assessctl - operator CLI for the assessment state store
//!
//! Inspect and maintain assessment lifecycle state:
//! - Schema migration and health checks (`migrate`, `health`)
//! - Pool and lifecycle statistics (`stats`)
//! - Listing, inspection and audit history (`list`, `show`, `audit`)
//! - Retry queue, cancellation and retention cleanup (`retry-queue`, `cancel`, `cleanup`)

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod tracing_setup;

use tracing_setup::{init_tracing, TracingConfig};

#[derive(Parser, Debug)]
#[command(
    name = "assessctl",
    author,
    version,
    about = "Inspect and maintain persisted assessment state",
    long_about = "Operator tooling for the assessment state store: run migrations, check pool \
                  health, browse assessments and their audit trail, and clean up old rows."
)]
struct Cli {
    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(long, global = true)]
    debug: bool,

    /// PostgreSQL connection string (overrides config file and DATABASE_URL)
    #[arg(long, global = true, env = "ASSESSCTL_DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply embedded migrations and verify the schema
    Migrate,
    /// Check database connectivity and store readiness
    Health,
    /// Show lifecycle counts and connection pool statistics
    Stats(commands::db::StatsArgs),
    /// List assessments with optional filters
    List(commands::assessments::ListArgs),
    /// Show a single assessment
    Show(commands::assessments::ShowArgs),
    /// Show the audit trail of an assessment
    Audit(commands::assessments::AuditArgs),
    /// List failed assessments that are due for retry
    RetryQueue(commands::assessments::RetryQueueArgs),
    /// Cancel (soft delete) an assessment
    Cancel(commands::assessments::CancelArgs),
    /// Permanently delete finished assessments past the retention window
    Cleanup(commands::assessments::CleanupArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&TracingConfig { debug: cli.debug }).ok();

    let ctx = commands::Context {
        database_url: cli.database_url,
    };

    match cli.command {
        Commands::Migrate => commands::db::run_migrate(&ctx).await?,
        Commands::Health => commands::db::run_health(&ctx).await?,
        Commands::Stats(args) => commands::db::run_stats(&ctx, args).await?,
        Commands::List(args) => commands::assessments::run_list(&ctx, args).await?,
        Commands::Show(args) => commands::assessments::run_show(&ctx, args).await?,
        Commands::Audit(args) => commands::assessments::run_audit(&ctx, args).await?,
        Commands::RetryQueue(args) => commands::assessments::run_retry_queue(&ctx, args).await?,
        Commands::Cancel(args) => commands::assessments::run_cancel(&ctx, args).await?,
        Commands::Cleanup(args) => commands::assessments::run_cleanup(&ctx, args).await?,
    }

    Ok(())
}
