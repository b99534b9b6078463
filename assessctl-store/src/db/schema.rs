//! Embedded migrations and startup schema verification

use std::collections::HashSet;

use sqlx::PgPool;

use crate::error::{ErrorCode, Result, StoreError};

/// Migrations under `assessctl-store/migrations`, embedded at compile time
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub const STATES_TABLE: &str = "assessment_states";
pub const AUDIT_TABLE: &str = "assessment_state_audit";

/// Columns the store reads or writes, per table
const REQUIRED_COLUMNS: &[(&str, &[&str])] = &[
    (
        STATES_TABLE,
        &[
            "assessment_id",
            "state",
            "version",
            "progress",
            "message",
            "created_at",
            "updated_at",
            "completed_at",
            "target",
            "assessment_type",
            "request_data",
            "result_data",
            "error_message",
            "retry_count",
            "next_retry_at",
            "priority",
            "timeout_seconds",
        ],
    ),
    (
        AUDIT_TABLE,
        &[
            "id",
            "assessment_id",
            "old_state",
            "new_state",
            "version_from",
            "version_to",
            "changed_by",
            "change_reason",
            "change_action",
            "created_at",
            "context",
        ],
    ),
];

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    tracing::info!("running assessment store migrations");
    MIGRATOR.run(pool).await?;
    Ok(())
}

/// Confirm both tables exist with every column the store relies on.
pub async fn verify_schema(pool: &PgPool) -> Result<()> {
    let tables: Vec<String> = REQUIRED_COLUMNS
        .iter()
        .map(|(table, _)| table.to_string())
        .collect();

    let rows: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT table_name::TEXT, column_name::TEXT
        FROM information_schema.columns
        WHERE table_schema = current_schema()
          AND table_name = ANY($1)
        "#,
    )
    .bind(&tables)
    .fetch_all(pool)
    .await
    .map_err(|e| verification_failed(format!("failed to inspect schema: {}", e)))?;

    let found: HashSet<(String, String)> = rows.into_iter().collect();
    let missing = missing_columns(&found);
    if !missing.is_empty() {
        tracing::error!(missing = ?missing, "schema verification failed");
        return Err(verification_failed(format!(
            "missing columns: {}",
            missing.join(", ")
        )));
    }

    tracing::debug!("schema verified");
    Ok(())
}

fn missing_columns(found: &HashSet<(String, String)>) -> Vec<String> {
    REQUIRED_COLUMNS
        .iter()
        .flat_map(|(table, columns)| columns.iter().map(move |column| (*table, *column)))
        .filter(|(table, column)| !found.contains(&(table.to_string(), column.to_string())))
        .map(|(table, column)| format!("{}.{}", table, column))
        .collect()
}

fn verification_failed(message: String) -> StoreError {
    StoreError::processing(ErrorCode::SchemaVerificationFailed, "verify_schema", message)
}
