//! Store maintenance commands
//!
//! Commands: migrate, health, stats

use anyhow::{anyhow, Result};
use clap::Parser;
use serde::Serialize;

use assessctl_store::{AssessmentStatistics, AssessmentStateStore, PoolStats};

use super::Context;

#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Print statistics as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct StatsReport {
    assessments: AssessmentStatistics,
    pool: PoolStats,
}

pub async fn run_migrate(ctx: &Context) -> Result<()> {
    let mut config = ctx.config()?;
    config.run_migrations = true;
    let store = AssessmentStateStore::open(config).await?;
    println!("Schema is up to date");
    store.close().await;
    Ok(())
}

pub async fn run_health(ctx: &Context) -> Result<()> {
    let store = ctx.open_store().await?;
    let healthy = store.health().await;
    let stats = store.pool_stats();
    store.close().await;

    if !healthy {
        return Err(anyhow!("Assessment store is unhealthy"));
    }
    println!(
        "healthy: {} connections ({} idle, {} active)",
        stats.total, stats.idle, stats.active
    );
    if stats.is_under_pressure() {
        println!("warning: pool utilization {:.0}%", stats.utilization() * 100.0);
    }
    Ok(())
}

pub async fn run_stats(ctx: &Context, args: StatsArgs) -> Result<()> {
    let store = ctx.open_store().await?;
    let report = StatsReport {
        assessments: store.get_assessment_statistics().await?,
        pool: store.pool_stats(),
    };
    store.close().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let a = &report.assessments;
    println!("Assessments: {} total, {} created in the last hour", a.total, a.created_last_hour);
    println!("  pending:    {}", a.by_state.pending);
    println!("  processing: {}", a.by_state.processing);
    println!("  completed:  {}", a.by_state.completed);
    println!("  failed:     {}", a.by_state.failed);
    println!("  cancelled:  {}", a.by_state.cancelled);
    if let Some(avg) = a.average_processing_seconds {
        println!("  avg processing time: {:.1}s", avg);
    }
    if let Some(ratio) = a.completion_ratio() {
        println!("  completion ratio: {:.1}%", ratio * 100.0);
    }

    let p = &report.pool;
    println!(
        "Pool: {} connections ({} idle, {} active, {} waiting)",
        p.total, p.idle, p.active, p.waiting
    );
    println!(
        "  created {}, acquired {}, released {}, errors {}, avg wait {:.2}ms",
        p.total_created, p.total_acquired, p.total_released, p.total_errored,
        p.average_wait_time_ms
    );
    Ok(())
}
