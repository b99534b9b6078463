//! Assessment inspection and maintenance commands
//!
//! Commands: list, show, audit, retry-queue, cancel, cleanup

use anyhow::{bail, Context as _, Result};
use clap::Parser;

use assessctl_store::{
    AssessmentFilter, AssessmentState, AssessmentStateRecord, Pagination, SortDirection,
    SortField,
};

use super::Context;

// === Arg Structs ===

#[derive(Parser, Debug)]
pub struct ListArgs {
    /// Only show assessments in this state (repeatable)
    #[arg(long = "state", value_name = "STATE")]
    pub states: Vec<AssessmentState>,

    /// Only show assessments for this target
    #[arg(long)]
    pub target: Option<String>,

    /// Only show assessments of this type
    #[arg(long = "type", value_name = "TYPE")]
    pub assessment_type: Option<String>,

    /// Sort by updated time instead of creation time
    #[arg(long)]
    pub by_updated: bool,

    /// Oldest first
    #[arg(long)]
    pub asc: bool,

    /// Page number (1-indexed)
    #[arg(long, default_value_t = 1)]
    pub page: u32,

    /// Assessments per page
    #[arg(long, default_value_t = 50)]
    pub per_page: u32,

    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct ShowArgs {
    /// Assessment ID
    pub id: String,
}

#[derive(Parser, Debug)]
pub struct AuditArgs {
    /// Assessment ID
    pub id: String,

    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct RetryQueueArgs {
    /// Retry budget (defaults to max_retries from config)
    #[arg(long)]
    pub max_retries: Option<i32>,
}

#[derive(Parser, Debug)]
pub struct CancelArgs {
    /// Assessment ID
    pub id: String,
}

#[derive(Parser, Debug)]
pub struct CleanupArgs {
    /// Delete finished assessments completed more than this many days ago
    #[arg(long)]
    pub retention_days: i32,

    /// Confirm the permanent deletion
    #[arg(long)]
    pub yes: bool,
}

// === Command Implementations ===

fn build_filter(args: &ListArgs) -> AssessmentFilter {
    let mut filter = AssessmentFilter::new();
    for state in &args.states {
        filter = filter.in_state(*state);
    }
    if let Some(target) = &args.target {
        filter = filter.for_target(target.clone());
    }
    if let Some(assessment_type) = &args.assessment_type {
        filter = filter.of_type(assessment_type.clone());
    }
    let sort = if args.by_updated {
        SortField::UpdatedAt
    } else {
        SortField::CreatedAt
    };
    let direction = if args.asc {
        SortDirection::Asc
    } else {
        SortDirection::Desc
    };
    filter
        .sorted_by(sort, direction)
        .paginate(Pagination::page(args.page, args.per_page))
}

fn summary_line(record: &AssessmentStateRecord) -> String {
    format!(
        "{:<38} {:<10} v{:<4} {:>3}%  retries={} {}/{}  {}",
        record.assessment_id,
        record.state.as_str(),
        record.version,
        record.progress,
        record.retry_count,
        record.target,
        record.assessment_type,
        record.created_at.format("%Y-%m-%d %H:%M:%S"),
    )
}

pub async fn run_list(ctx: &Context, args: ListArgs) -> Result<()> {
    let filter = build_filter(&args);
    tracing::debug!(?filter, "listing assessments");
    let store = ctx.open_store().await?;
    let page = store.list_assessments(&filter).await;
    store.close().await;
    let page = page?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&page)?);
        return Ok(());
    }

    if page.items.is_empty() {
        println!("No assessments found");
        return Ok(());
    }
    for record in &page.items {
        println!("{}", summary_line(record));
    }
    println!(
        "\nShowing {}-{} of {}{}",
        page.offset + 1,
        page.offset + page.items.len() as u64,
        page.total,
        if page.has_more() { " (use --page for more)" } else { "" }
    );
    Ok(())
}

pub async fn run_show(ctx: &Context, args: ShowArgs) -> Result<()> {
    let store = ctx.open_store().await?;
    let record = store.get_assessment(&args.id).await;
    store.close().await;

    let record = record.with_context(|| format!("Failed to load assessment {}", args.id))?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

pub async fn run_audit(ctx: &Context, args: AuditArgs) -> Result<()> {
    let store = ctx.open_store().await?;
    let trail = store.get_assessment_audit_trail(&args.id).await;
    store.close().await;
    let trail = trail.with_context(|| format!("Failed to load audit trail for {}", args.id))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&trail)?);
        return Ok(());
    }

    for entry in &trail {
        println!(
            "{}  v{}->v{}  {} -> {}  [{}] by {}{}",
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.version_from,
            entry.version_to,
            entry.old_state,
            entry.new_state,
            entry.change_action,
            entry.changed_by,
            entry
                .change_reason
                .as_deref()
                .map(|r| format!(": {}", r))
                .unwrap_or_default(),
        );
    }
    Ok(())
}

pub async fn run_retry_queue(ctx: &Context, args: RetryQueueArgs) -> Result<()> {
    let store = ctx.open_store().await?;
    let max_retries = args.max_retries.unwrap_or(store.config().max_retries);
    let candidates = store.get_assessments_for_retry(max_retries).await;
    store.close().await;
    let candidates = candidates?;

    if candidates.is_empty() {
        println!("Retry queue is empty");
        return Ok(());
    }
    for candidate in &candidates {
        println!(
            "{:<38} v{:<4} retries={}/{}  {}",
            candidate.assessment_id,
            candidate.version,
            candidate.retry_count,
            max_retries,
            candidate.error_message.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

pub async fn run_cancel(ctx: &Context, args: CancelArgs) -> Result<()> {
    let store = ctx.open_store().await?;
    let cancelled = store.delete_assessment(&args.id).await;
    store.close().await;

    if cancelled.with_context(|| format!("Failed to cancel {}", args.id))? {
        println!("Cancelled {}", args.id);
    } else {
        println!("{} is already finished; nothing to cancel", args.id);
    }
    Ok(())
}

pub async fn run_cleanup(ctx: &Context, args: CleanupArgs) -> Result<()> {
    if args.retention_days < 1 {
        bail!("--retention-days must be at least 1");
    }
    if !args.yes {
        bail!(
            "Refusing to delete assessments completed more than {} days ago without --yes",
            args.retention_days
        );
    }

    let store = ctx.open_store().await?;
    let deleted = store.cleanup_old_assessments(args.retention_days).await;
    store.close().await;
    let deleted = deleted?;

    tracing::info!(deleted, retention_days = args.retention_days, "cleanup finished");
    println!("Deleted {} assessment(s)", deleted);
    Ok(())
}
