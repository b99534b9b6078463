//! Assessment state repository
//!
//! Handles the assessment lifecycle with:
//! - Upsert creation (an existing id is reset, never duplicated)
//! - Version-guarded updates under a row lock, validated against the state machine
//! - One audit row per accepted transition, in the same transaction
//! - Paginated listing, retry feed, statistics and retention cleanup

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgRow};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::db::pool::{ConnectionPool, PoolStats};
use crate::db::retry::RetryPolicy;
use crate::db::schema;
use crate::db::transaction::TransactionManager;
use crate::error::{ErrorCode, Result, StoreError};
use crate::models::record::MAX_ASSESSMENT_ID_LEN;
use crate::models::state::{requires_completed_at, TransitionError};
use crate::models::{
    check_transition, AssessmentFilter, AssessmentState, AssessmentStateRecord,
    AssessmentStatistics, AssessmentUpdate, AuditEntry, NewAssessment, Paginated, Payload,
    RetryBudget, RetryCandidate, StateCounts, ValidationError,
};

/// Recorded as `changed_by` when the caller supplies no actor
const SYSTEM_ACTOR: &str = "system";

macro_rules! record_columns {
    () => {
        "assessment_id, state, version, progress, message, created_at, updated_at, \
         completed_at, target, assessment_type, priority, timeout_seconds, request_data, \
         result_data, error_message, retry_count, next_retry_at"
    };
}

/// Raw `assessment_states` row
#[derive(Debug, FromRow)]
struct StateRow {
    assessment_id: String,
    state: String,
    version: i64,
    progress: i32,
    message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    target: String,
    assessment_type: String,
    priority: i32,
    timeout_seconds: Option<i32>,
    request_data: Json<Payload>,
    result_data: Option<Json<Payload>>,
    error_message: Option<String>,
    retry_count: i32,
    next_retry_at: Option<DateTime<Utc>>,
}

impl TryFrom<StateRow> for AssessmentStateRecord {
    type Error = StoreError;

    fn try_from(row: StateRow) -> Result<Self> {
        Ok(Self {
            state: decode_state(&row.state)?,
            assessment_id: row.assessment_id,
            version: row.version,
            progress: row.progress,
            message: row.message,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
            target: row.target,
            assessment_type: row.assessment_type,
            priority: row.priority,
            timeout_seconds: row.timeout_seconds,
            request_data: row.request_data.0,
            result_data: row.result_data.map(|j| j.0),
            error_message: row.error_message,
            retry_count: row.retry_count,
            next_retry_at: row.next_retry_at,
        })
    }
}

/// Raw `assessment_state_audit` row
#[derive(Debug, FromRow)]
struct AuditRow {
    id: i64,
    assessment_id: String,
    old_state: String,
    new_state: String,
    version_from: i64,
    version_to: i64,
    changed_by: String,
    change_reason: Option<String>,
    change_action: String,
    created_at: DateTime<Utc>,
    context: Option<Json<Payload>>,
}

impl TryFrom<AuditRow> for AuditEntry {
    type Error = StoreError;

    fn try_from(row: AuditRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            old_state: decode_state(&row.old_state)?,
            new_state: decode_state(&row.new_state)?,
            assessment_id: row.assessment_id,
            version_from: row.version_from,
            version_to: row.version_to,
            changed_by: row.changed_by,
            change_reason: row.change_reason,
            change_action: row.change_action,
            created_at: row.created_at,
            context: row.context.map(|j| j.0),
        })
    }
}

fn decode_state(raw: &str) -> Result<AssessmentState> {
    raw.parse().map_err(|e: ValidationError| {
        StoreError::processing(ErrorCode::Serialization, "decode_row", e.to_string())
    })
}

/// The fields of a row that drive transition checks
#[derive(Debug, Clone)]
struct LockedRow {
    state: AssessmentState,
    version: i64,
    retry_count: i32,
    completed_at: Option<DateTime<Utc>>,
}

/// Audit row about to be written
#[derive(Debug)]
struct AuditDraft {
    assessment_id: String,
    old_state: AssessmentState,
    new_state: AssessmentState,
    version_from: i64,
    version_to: i64,
    changed_by: String,
    change_reason: Option<String>,
    change_action: String,
    context: Option<Payload>,
}

/// Persistent store for assessment lifecycle state
pub struct AssessmentStateStore {
    pool: Arc<ConnectionPool>,
    tx: TransactionManager,
    config: StoreConfig,
    ready: AtomicBool,
}

impl AssessmentStateStore {
    /// Connect, migrate (if enabled) and verify the schema.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let pool = ConnectionPool::connect(&config.pool, &config.database_url)
            .await
            .map_err(|e| e.into_processing("open", None, 0, Duration::ZERO, false))?;
        Self::from_pool(pool, config).await
    }

    /// Same as [`open`](Self::open) with explicit connect options.
    pub async fn open_with(config: StoreConfig, options: PgConnectOptions) -> Result<Self> {
        config.validate()?;
        let pool = ConnectionPool::connect_with(&config.pool, options)
            .await
            .map_err(|e| e.into_processing("open", None, 0, Duration::ZERO, false))?;
        Self::from_pool(pool, config).await
    }

    /// Build on an existing pool. Not ready until the schema verifies.
    pub async fn from_pool(pool: Arc<ConnectionPool>, config: StoreConfig) -> Result<Self> {
        let tx = TransactionManager::new(
            Arc::clone(&pool),
            RetryPolicy::from_config(&config.retry),
            config.transaction.options(),
        );
        let store = Self {
            pool,
            tx,
            config,
            ready: AtomicBool::new(false),
        };

        if store.config.run_migrations {
            schema::run_migrations(store.pool.raw())
                .await
                .map_err(|e| e.into_processing("migrate", None, 0, Duration::ZERO, false))?;
        }
        schema::verify_schema(store.pool.raw()).await?;

        store.ready.store(true, Ordering::Release);
        tracing::info!(max_retries = store.config.max_retries, "assessment store ready");
        Ok(store)
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire) && !self.pool.is_closed()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.tx
    }

    /// Ready and able to round-trip a query.
    pub async fn health(&self) -> bool {
        self.is_ready() && self.pool.health().await
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub async fn close(&self) {
        self.ready.store(false, Ordering::Release);
        self.pool.close().await;
    }

    fn ensure_ready(&self, operation: &'static str) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(StoreError::processing(
                ErrorCode::NotReady,
                operation,
                "store is not initialized or has been closed",
            ))
        }
    }

    /// Create an assessment, or reset an existing one with the same id.
    ///
    /// Returns the assessment id (generated when `assessment_id` is `None`).
    pub async fn create_assessment(
        &self,
        new: NewAssessment,
        assessment_id: Option<&str>,
    ) -> Result<String> {
        self.ensure_ready("create_assessment")?;
        new.validate()?;
        let id = match assessment_id {
            Some(id) => validate_id(id)?.to_owned(),
            None => Uuid::new_v4().to_string(),
        };

        let key = id.clone();
        let (version, reset) = self
            .tx
            .execute_transaction(
                move |conn| Box::pin(upsert_assessment(conn, key.clone(), new.clone())),
                None,
            )
            .await
            .into_result("create_assessment", Some(id.as_str()))?;

        if reset {
            tracing::info!(assessment_id = %id, version, "assessment reset to pending");
        } else {
            tracing::debug!(assessment_id = %id, "assessment created");
        }
        Ok(id)
    }

    pub async fn get_assessment(&self, assessment_id: &str) -> Result<AssessmentStateRecord> {
        self.ensure_ready("get_assessment")?;
        let key = assessment_id.to_owned();
        self.tx
            .execute_read_only(move |conn| Box::pin(fetch_record(conn, key.clone())))
            .await
            .into_result("get_assessment", Some(assessment_id))?
            .ok_or_else(|| StoreError::not_found(assessment_id))
    }

    /// Apply a field-level update and return the new version.
    ///
    /// State changes require `expected_version`. A version mismatch, an
    /// illegal transition, a retry-count violation, `result_data` outside
    /// COMPLETED, or any write to a row whose `completed_at` is set is a
    /// `StateTransition` error and nothing is written.
    pub async fn update_assessment(
        &self,
        assessment_id: &str,
        update: AssessmentUpdate,
        expected_version: Option<i64>,
    ) -> Result<i64> {
        self.ensure_ready("update_assessment")?;
        update.validate()?;
        if update.is_empty() && update.audit.is_empty() {
            return Err(ValidationError::Empty { field: "update" }.into());
        }

        let key = assessment_id.to_owned();
        let max_retries = self.config.max_retries;
        let version = self
            .tx
            .execute_transaction(
                move |conn| {
                    Box::pin(apply_update(
                        conn,
                        key.clone(),
                        update.clone(),
                        expected_version,
                        max_retries,
                    ))
                },
                None,
            )
            .await
            .into_result("update_assessment", Some(assessment_id))?;

        tracing::debug!(assessment_id, version, "assessment updated");
        Ok(version)
    }

    pub async fn list_assessments(
        &self,
        filter: &AssessmentFilter,
    ) -> Result<Paginated<AssessmentStateRecord>> {
        self.ensure_ready("list_assessments")?;
        let filter = filter.clone();
        self.tx
            .execute_read_only(move |conn| Box::pin(fetch_page(conn, filter.clone())))
            .await
            .into_result("list_assessments", None)
    }

    /// Soft delete: move to CANCELLED. Returns `false` when already terminal.
    pub async fn delete_assessment(&self, assessment_id: &str) -> Result<bool> {
        self.ensure_ready("delete_assessment")?;
        let key = assessment_id.to_owned();
        let max_retries = self.config.max_retries;
        let cancelled = self
            .tx
            .execute_transaction(
                move |conn| Box::pin(soft_delete(conn, key.clone(), max_retries)),
                None,
            )
            .await
            .into_result("delete_assessment", Some(assessment_id))?;

        if cancelled {
            tracing::info!(assessment_id, "assessment cancelled");
        }
        Ok(cancelled)
    }

    /// FAILED assessments with retries left and a due (or unset) retry time,
    /// fewest retries first, then oldest.
    pub async fn get_assessments_for_retry(&self, max_retries: i32) -> Result<Vec<RetryCandidate>> {
        self.ensure_ready("get_assessments_for_retry")?;
        self.tx
            .execute_read_only(move |conn| Box::pin(fetch_retry_candidates(conn, max_retries)))
            .await
            .into_result("get_assessments_for_retry", None)
    }

    pub async fn get_assessment_statistics(&self) -> Result<AssessmentStatistics> {
        self.ensure_ready("get_assessment_statistics")?;
        self.tx
            .execute_read_only(|conn| Box::pin(fetch_statistics(conn)))
            .await
            .into_result("get_assessment_statistics", None)
    }

    /// Hard-delete terminal assessments completed more than `retention_days`
    /// ago. Audit rows go with them.
    pub async fn cleanup_old_assessments(&self, retention_days: i32) -> Result<u64> {
        self.ensure_ready("cleanup_old_assessments")?;
        if retention_days < 1 {
            return Err(ValidationError::OutOfRange {
                field: "retention_days",
                min: 1,
                max: i64::from(i32::MAX),
                value: i64::from(retention_days),
            }
            .into());
        }

        let deleted = self
            .tx
            .execute_transaction(
                move |conn| Box::pin(delete_expired(conn, retention_days)),
                None,
            )
            .await
            .into_result("cleanup_old_assessments", None)?;

        tracing::info!(retention_days, deleted, "old assessments cleaned up");
        Ok(deleted)
    }

    /// PENDING and still-retryable FAILED assessments, highest priority first.
    pub async fn load_pending_assessments(&self) -> Result<Vec<AssessmentStateRecord>> {
        self.ensure_ready("load_pending_assessments")?;
        let max_retries = self.config.max_retries;
        self.tx
            .execute_read_only(move |conn| Box::pin(fetch_pending(conn, max_retries)))
            .await
            .into_result("load_pending_assessments", None)
    }

    /// Audit history, oldest first.
    pub async fn get_assessment_audit_trail(&self, assessment_id: &str) -> Result<Vec<AuditEntry>> {
        self.ensure_ready("get_assessment_audit_trail")?;
        let key = assessment_id.to_owned();
        self.tx
            .execute_read_only(move |conn| Box::pin(fetch_audit_trail(conn, key.clone())))
            .await
            .into_result("get_assessment_audit_trail", Some(assessment_id))
    }
}

fn validate_id(id: &str) -> std::result::Result<&str, ValidationError> {
    if id.trim().is_empty() {
        return Err(ValidationError::Empty {
            field: "assessment_id",
        });
    }
    if id.len() > MAX_ASSESSMENT_ID_LEN {
        return Err(ValidationError::TooLong {
            field: "assessment_id",
            max: MAX_ASSESSMENT_ID_LEN,
        });
    }
    Ok(id)
}

async fn lock_row(conn: &mut PgConnection, assessment_id: &str) -> Result<Option<LockedRow>> {
    let row: Option<(String, i64, i32, Option<DateTime<Utc>>)> = sqlx::query_as(
        r#"
        SELECT state, version, retry_count, completed_at
        FROM assessment_states
        WHERE assessment_id = $1
        FOR UPDATE
        "#,
    )
    .bind(assessment_id)
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some((state, version, retry_count, completed_at)) => Ok(Some(LockedRow {
            state: decode_state(&state)?,
            version,
            retry_count,
            completed_at,
        })),
        None => Ok(None),
    }
}

async fn insert_audit(conn: &mut PgConnection, draft: AuditDraft) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO assessment_state_audit
            (assessment_id, old_state, new_state, version_from, version_to,
             changed_by, change_reason, change_action, context)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(&draft.assessment_id)
    .bind(draft.old_state.as_str())
    .bind(draft.new_state.as_str())
    .bind(draft.version_from)
    .bind(draft.version_to)
    .bind(&draft.changed_by)
    .bind(&draft.change_reason)
    .bind(&draft.change_action)
    .bind(draft.context.map(Json))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Insert a fresh row, or reset an existing one. Returns `(version, was_reset)`.
async fn upsert_assessment(
    conn: &mut PgConnection,
    assessment_id: String,
    new: NewAssessment,
) -> Result<(i64, bool)> {
    let existing = match lock_row(conn, &assessment_id).await? {
        Some(row) => row,
        None => {
            let inserted: Option<i64> = sqlx::query_scalar(
                r#"
                INSERT INTO assessment_states
                    (assessment_id, state, version, progress, target, assessment_type,
                     priority, timeout_seconds, request_data)
                VALUES ($1, 'pending', 1, 0, $2, $3, $4, $5, $6)
                ON CONFLICT (assessment_id) DO NOTHING
                RETURNING version
                "#,
            )
            .bind(&assessment_id)
            .bind(&new.target)
            .bind(&new.assessment_type)
            .bind(new.priority)
            .bind(new.timeout_seconds)
            .bind(Json(&new.request))
            .fetch_optional(&mut *conn)
            .await?;

            if let Some(version) = inserted {
                return Ok((version, false));
            }
            // a concurrent create won the insert; reset its row instead
            lock_row(conn, &assessment_id)
                .await?
                .ok_or_else(|| StoreError::not_found(&assessment_id))?
        }
    };

    let version: i64 = sqlx::query_scalar(
        r#"
        UPDATE assessment_states
        SET state = 'pending',
            version = version + 1,
            progress = 0,
            message = NULL,
            target = $2,
            assessment_type = $3,
            priority = $4,
            timeout_seconds = $5,
            request_data = $6,
            result_data = NULL,
            error_message = NULL,
            next_retry_at = NULL,
            completed_at = NULL,
            updated_at = NOW()
        WHERE assessment_id = $1 AND version = $7
        RETURNING version
        "#,
    )
    .bind(&assessment_id)
    .bind(&new.target)
    .bind(&new.assessment_type)
    .bind(new.priority)
    .bind(new.timeout_seconds)
    .bind(Json(&new.request))
    .bind(existing.version)
    .fetch_one(&mut *conn)
    .await?;

    insert_audit(
        conn,
        AuditDraft {
            assessment_id,
            old_state: existing.state,
            new_state: AssessmentState::Pending,
            version_from: existing.version,
            version_to: version,
            changed_by: new
                .requested_by
                .unwrap_or_else(|| SYSTEM_ACTOR.to_string()),
            change_reason: Some("assessment re-created".to_string()),
            change_action: "reset".to_string(),
            context: None,
        },
    )
    .await?;

    Ok((version, true))
}

async fn apply_update(
    conn: &mut PgConnection,
    assessment_id: String,
    update: AssessmentUpdate,
    expected_version: Option<i64>,
    max_retries: i32,
) -> Result<i64> {
    let current = lock_row(conn, &assessment_id)
        .await?
        .ok_or_else(|| StoreError::not_found(&assessment_id))?;

    if let Some(expected) = expected_version {
        if expected != current.version {
            return Err(StoreError::transition(
                &assessment_id,
                format!(
                    "version mismatch: expected {}, found {}",
                    expected, current.version
                ),
            ));
        }
    }

    // the stamp is written once on entry to a terminal state, so it outlives
    // a later change of max_retries
    if current.completed_at.is_some() {
        return Err(StoreError::transition(
            &assessment_id,
            TransitionError::Terminal {
                state: current.state,
            },
        ));
    }

    let target_state = update.state.unwrap_or(current.state);
    if target_state != current.state && expected_version.is_none() {
        return Err(StoreError::transition(
            &assessment_id,
            "state changes require an expected version",
        ));
    }

    let retry_count = update.retry_count.unwrap_or(current.retry_count);
    let budget = RetryBudget {
        current: current.retry_count,
        proposed: retry_count,
        max_retries,
    };
    let edge = check_transition(current.state, target_state, budget)
        .map_err(|e| StoreError::transition(&assessment_id, e))?;

    if update.result_data.is_some() && target_state != AssessmentState::Completed {
        return Err(StoreError::transition(
            &assessment_id,
            format!("result data can only be written on completion, not in {}", target_state),
        ));
    }

    let stamp_completed = current.completed_at.is_none()
        && requires_completed_at(target_state, retry_count, max_retries);

    let mut query = build_update_query(&assessment_id, current.version, &update, stamp_completed);
    let version = query
        .build_query_scalar::<i64>()
        .fetch_optional(&mut *conn)
        .await?;
    let version = version.ok_or_else(|| {
        StoreError::transition(&assessment_id, "concurrent modification detected")
    })?;

    if edge.is_some() || !update.audit.is_empty() {
        let audit = update.audit;
        let change_action = audit
            .change_action
            .or_else(|| edge.map(|e| e.action().to_string()))
            .unwrap_or_else(|| "update".to_string());
        insert_audit(
            conn,
            AuditDraft {
                assessment_id,
                old_state: current.state,
                new_state: target_state,
                version_from: current.version,
                version_to: version,
                changed_by: audit.changed_by.unwrap_or_else(|| SYSTEM_ACTOR.to_string()),
                change_reason: audit.change_reason,
                change_action,
                context: audit.context,
            },
        )
        .await?;
    }

    Ok(version)
}

/// Version-guarded UPDATE touching only the supplied columns.
fn build_update_query(
    assessment_id: &str,
    current_version: i64,
    update: &AssessmentUpdate,
    stamp_completed: bool,
) -> QueryBuilder<'static, Postgres> {
    let mut query = QueryBuilder::new(
        "UPDATE assessment_states SET version = version + 1, updated_at = NOW()",
    );

    if let Some(state) = update.state {
        query.push(", state = ").push_bind(state.as_str());
    }
    if let Some(progress) = update.progress {
        query.push(", progress = ").push_bind(progress);
    }
    if let Some(message) = &update.message {
        query.push(", message = ").push_bind(message.clone());
    }
    if let Some(result) = &update.result_data {
        query.push(", result_data = ").push_bind(Json(result.clone()));
    }
    if let Some(error) = &update.error_message {
        query.push(", error_message = ").push_bind(error.clone());
    }
    if let Some(retry_count) = update.retry_count {
        query.push(", retry_count = ").push_bind(retry_count);
    }
    if let Some(next_retry_at) = update.next_retry_at {
        query.push(", next_retry_at = ").push_bind(next_retry_at);
    }
    if let Some(priority) = update.priority {
        query.push(", priority = ").push_bind(priority);
    }
    if stamp_completed {
        query.push(", completed_at = NOW()");
    }

    query
        .push(" WHERE assessment_id = ")
        .push_bind(assessment_id.to_owned())
        .push(" AND version = ")
        .push_bind(current_version)
        .push(" RETURNING version");
    query
}

async fn soft_delete(
    conn: &mut PgConnection,
    assessment_id: String,
    max_retries: i32,
) -> Result<bool> {
    let current = lock_row(conn, &assessment_id)
        .await?
        .ok_or_else(|| StoreError::not_found(&assessment_id))?;

    let terminal = current.completed_at.is_some()
        || current.state.is_terminal(current.retry_count, max_retries);
    if terminal {
        return Ok(false);
    }

    let version: i64 = sqlx::query_scalar(
        r#"
        UPDATE assessment_states
        SET state = 'cancelled',
            version = version + 1,
            completed_at = COALESCE(completed_at, NOW()),
            updated_at = NOW()
        WHERE assessment_id = $1 AND version = $2
        RETURNING version
        "#,
    )
    .bind(&assessment_id)
    .bind(current.version)
    .fetch_one(&mut *conn)
    .await?;

    insert_audit(
        conn,
        AuditDraft {
            assessment_id,
            old_state: current.state,
            new_state: AssessmentState::Cancelled,
            version_from: current.version,
            version_to: version,
            changed_by: SYSTEM_ACTOR.to_string(),
            change_reason: Some("deleted".to_string()),
            change_action: "cancel".to_string(),
            context: None,
        },
    )
    .await?;

    Ok(true)
}

async fn fetch_record(
    conn: &mut PgConnection,
    assessment_id: String,
) -> Result<Option<AssessmentStateRecord>> {
    let row: Option<StateRow> = sqlx::query_as(concat!(
        "SELECT ",
        record_columns!(),
        " FROM assessment_states WHERE assessment_id = $1"
    ))
    .bind(&assessment_id)
    .fetch_optional(conn)
    .await?;

    row.map(AssessmentStateRecord::try_from).transpose()
}

async fn fetch_retry_candidates(
    conn: &mut PgConnection,
    max_retries: i32,
) -> Result<Vec<RetryCandidate>> {
    let rows = sqlx::query_as(
        r#"
        SELECT assessment_id, version, retry_count, next_retry_at, error_message
        FROM assessment_states
        WHERE state = 'failed'
          AND retry_count < $1
          AND completed_at IS NULL
          AND (next_retry_at IS NULL OR next_retry_at <= NOW())
        ORDER BY retry_count ASC, created_at ASC
        "#,
    )
    .bind(max_retries)
    .fetch_all(conn)
    .await?;
    Ok(rows)
}

async fn fetch_pending(
    conn: &mut PgConnection,
    max_retries: i32,
) -> Result<Vec<AssessmentStateRecord>> {
    let rows: Vec<StateRow> = sqlx::query_as(concat!(
        "SELECT ",
        record_columns!(),
        " FROM assessment_states \
         WHERE state = 'pending' \
            OR (state = 'failed' AND retry_count < $1 AND completed_at IS NULL) \
         ORDER BY priority DESC, created_at ASC"
    ))
    .bind(max_retries)
    .fetch_all(conn)
    .await?;

    rows.into_iter().map(AssessmentStateRecord::try_from).collect()
}

/// Terminal rows completed before the retention window. Audit rows cascade.
async fn delete_expired(conn: &mut PgConnection, retention_days: i32) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM assessment_states
        WHERE completed_at IS NOT NULL
          AND completed_at < NOW() - make_interval(days => $1)
        "#,
    )
    .bind(retention_days)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

/// SELECT for one page of `list_assessments`, total included via window function.
fn build_list_query(filter: &AssessmentFilter) -> QueryBuilder<'static, Postgres> {
    let mut query = QueryBuilder::new(concat!(
        "SELECT ",
        record_columns!(),
        ", COUNT(*) OVER() AS total_count FROM assessment_states WHERE 1=1"
    ));
    push_filters(&mut query, filter);

    // tie-break on id so pages are stable
    query.push(format!(
        " ORDER BY {} {}, assessment_id ASC",
        filter.sort.column(),
        filter.direction.keyword()
    ));
    let page = filter.page.normalized();
    query
        .push(" LIMIT ")
        .push_bind(i64::from(page.limit))
        .push(" OFFSET ")
        .push_bind(i64::try_from(page.offset).unwrap_or(i64::MAX));
    query
}

/// Row count for a filter, used when a page lands past the last row.
fn build_count_query(filter: &AssessmentFilter) -> QueryBuilder<'static, Postgres> {
    let mut query = QueryBuilder::new("SELECT COUNT(*) FROM assessment_states WHERE 1=1");
    push_filters(&mut query, filter);
    query
}

fn push_filters(query: &mut QueryBuilder<'static, Postgres>, filter: &AssessmentFilter) {
    if !filter.states.is_empty() {
        let states: Vec<String> = filter.states.iter().map(|s| s.as_str().to_owned()).collect();
        query.push(" AND state = ANY(").push_bind(states).push(")");
    }
    if let Some(id) = &filter.assessment_id {
        query.push(" AND assessment_id = ").push_bind(id.clone());
    }
    if let Some(target) = &filter.target {
        query.push(" AND target = ").push_bind(target.clone());
    }
    if let Some(assessment_type) = &filter.assessment_type {
        query
            .push(" AND assessment_type = ")
            .push_bind(assessment_type.clone());
    }
    if let Some(after) = filter.created_after {
        query.push(" AND created_at >= ").push_bind(after);
    }
    if let Some(before) = filter.created_before {
        query.push(" AND created_at < ").push_bind(before);
    }
}

async fn fetch_page(
    conn: &mut PgConnection,
    filter: AssessmentFilter,
) -> Result<Paginated<AssessmentStateRecord>> {
    let page = filter.page.normalized();
    let mut query = build_list_query(&filter);
    let rows: Vec<PgRow> = query.build().fetch_all(&mut *conn).await?;

    let total = match rows.first() {
        Some(row) => row.try_get::<i64, _>("total_count")?,
        None if page.offset > 0 => {
            build_count_query(&filter)
                .build_query_scalar::<i64>()
                .fetch_one(&mut *conn)
                .await?
        }
        None => 0,
    };
    let items = rows
        .iter()
        .map(|row| AssessmentStateRecord::try_from(StateRow::from_row(row)?))
        .collect::<Result<Vec<_>>>()?;

    Ok(Paginated {
        items,
        total,
        limit: page.limit,
        offset: page.offset,
    })
}

async fn fetch_statistics(conn: &mut PgConnection) -> Result<AssessmentStatistics> {
    let row = sqlx::query(
        r#"
        SELECT
            COUNT(*) AS total,
            COUNT(*) FILTER (WHERE state = 'pending') AS pending,
            COUNT(*) FILTER (WHERE state = 'processing') AS processing,
            COUNT(*) FILTER (WHERE state = 'completed') AS completed,
            COUNT(*) FILTER (WHERE state = 'failed') AS failed,
            COUNT(*) FILTER (WHERE state = 'cancelled') AS cancelled,
            CAST(
                AVG(EXTRACT(EPOCH FROM (completed_at - created_at)))
                    FILTER (WHERE completed_at IS NOT NULL)
                AS DOUBLE PRECISION
            ) AS average_processing_seconds,
            COUNT(*) FILTER (WHERE created_at >= NOW() - INTERVAL '1 hour') AS created_last_hour
        FROM assessment_states
        "#,
    )
    .fetch_one(&mut *conn)
    .await?;

    Ok(AssessmentStatistics {
        total: row.try_get("total")?,
        by_state: StateCounts {
            pending: row.try_get("pending")?,
            processing: row.try_get("processing")?,
            completed: row.try_get("completed")?,
            failed: row.try_get("failed")?,
            cancelled: row.try_get("cancelled")?,
        },
        average_processing_seconds: row.try_get("average_processing_seconds")?,
        created_last_hour: row.try_get("created_last_hour")?,
    })
}

async fn fetch_audit_trail(conn: &mut PgConnection, assessment_id: String) -> Result<Vec<AuditEntry>> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM assessment_states WHERE assessment_id = $1)",
    )
    .bind(&assessment_id)
    .fetch_one(&mut *conn)
    .await?;

    if !exists {
        return Err(StoreError::not_found(assessment_id));
    }

    let rows: Vec<AuditRow> = sqlx::query_as(
        r#"
        SELECT id, assessment_id, old_state, new_state, version_from, version_to,
               changed_by, change_reason, change_action, created_at, context
        FROM assessment_state_audit
        WHERE assessment_id = $1
        ORDER BY created_at ASC, id ASC
        "#,
    )
    .bind(&assessment_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter().map(AuditEntry::try_from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Pagination, SortDirection, SortField};
    use chrono::TimeZone;

    #[test]
    fn id_validation() {
        assert_eq!(validate_id("a-1"), Ok("a-1"));
        assert_eq!(
            validate_id("  "),
            Err(ValidationError::Empty {
                field: "assessment_id"
            })
        );
        let long = "x".repeat(MAX_ASSESSMENT_ID_LEN + 1);
        assert!(matches!(
            validate_id(&long),
            Err(ValidationError::TooLong { .. })
        ));
    }

    #[test]
    fn decode_state_rejects_unknown() {
        assert_eq!(decode_state("failed").unwrap(), AssessmentState::Failed);
        let err = decode_state("archived").unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::Serialization));
    }

    #[test]
    fn update_touches_only_supplied_columns() {
        let update = AssessmentUpdate::progress(40).with_message("halfway");
        let query = build_update_query("a1", 3, &update, false);
        assert_eq!(
            query.sql(),
            "UPDATE assessment_states SET version = version + 1, updated_at = NOW(), \
             progress = $1, message = $2 WHERE assessment_id = $3 AND version = $4 \
             RETURNING version"
        );
    }

    #[test]
    fn terminal_update_stamps_completion() {
        let update = AssessmentUpdate::complete(None);
        let query = build_update_query("a1", 5, &update, true);
        let sql = query.sql();
        assert!(sql.contains("state = $1, progress = $2"));
        assert!(sql.contains(", completed_at = NOW()"));
        assert!(sql.ends_with("AND version = $4 RETURNING version"));
    }

    #[test]
    fn reschedule_clears_retry_time() {
        let update = AssessmentUpdate::reschedule(None);
        let query = build_update_query("a1", 3, &update, false);
        assert!(query.sql().contains("next_retry_at = $3"));
        assert!(!query.sql().contains("completed_at"));
    }

    #[test]
    fn count_query_shares_filters() {
        let filter = AssessmentFilter::new()
            .in_state(AssessmentState::Completed)
            .for_target("db-01")
            .paginate(Pagination::page(9, 20));
        assert_eq!(
            build_count_query(&filter).sql(),
            "SELECT COUNT(*) FROM assessment_states WHERE 1=1 AND state = ANY($1) \
             AND target = $2"
        );
    }

    #[test]
    fn unfiltered_list_query() {
        let query = build_list_query(&AssessmentFilter::new());
        let sql = query.sql();
        assert!(sql.starts_with("SELECT assessment_id, state, version"));
        assert!(sql.contains("COUNT(*) OVER() AS total_count"));
        assert!(sql.ends_with(
            "WHERE 1=1 ORDER BY created_at DESC, assessment_id ASC LIMIT $1 OFFSET $2"
        ));
    }

    #[test]
    fn filtered_list_query() {
        let after = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let filter = AssessmentFilter::new()
            .in_state(AssessmentState::Failed)
            .in_state(AssessmentState::Pending)
            .for_target("db-01")
            .of_type("baseline")
            .created_between(Some(after), None)
            .sorted_by(SortField::Priority, SortDirection::Asc)
            .paginate(Pagination::page(3, 20));
        let query = build_list_query(&filter);
        assert!(query.sql().ends_with(
            "WHERE 1=1 AND state = ANY($1) AND target = $2 AND assessment_type = $3 \
             AND created_at >= $4 ORDER BY priority ASC, assessment_id ASC \
             LIMIT $5 OFFSET $6"
        ));
    }
}
