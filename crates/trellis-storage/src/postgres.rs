//! PostgreSQL implementation of DataContext
//!
//! Production persistence with:
//! - SKIP LOCKED claiming so concurrent workers never lease the same job
//! - the dispatch triple (metadata insert, work-queue flip, job insert)
//!   committed in one transaction
//! - single-query manager tick input over manifests, counts and letters
//!
//! Tables live in one logical schema: `metadata`, `step_metadata`, `log`,
//! `manifest`, `manifest_group`, `work_queue`, `dead_letter`,
//! `background_job`. Enum columns are snake_case strings, timestamps UTC,
//! JSON columns accept any shape. All timestamps are stamped with the
//! application clock so due-ness comparisons use a single clock source.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};

use trellis_core::model::{
    new_external_id, BackgroundJob, DeadLetter, DeadLetterStatus, LogEntry, Manifest,
    ManifestGroup, Metadata, ScheduleType, StepMetadata, WorkQueueItem, WorkQueueStatus,
    WorkflowState,
};

use crate::context::*;

/// PostgreSQL implementation of [`DataContext`]
///
/// Uses a connection pool; each operation acquires its own connection, so a
/// single instance is safely shared across every engine component.
///
/// # Example
///
/// ```ignore
/// use trellis_storage::PostgresDataContext;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/trellis").await?;
/// let ctx = PostgresDataContext::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresDataContext {
    pool: PgPool,
}

impl PostgresDataContext {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_error(op: &str, e: sqlx::Error) -> StoreError {
    error!("{op} failed: {e}");
    StoreError::Database(e.to_string())
}

fn parse_enum<T: FromStr<Err = String>>(s: &str) -> Result<T, StoreError> {
    s.parse::<T>().map_err(StoreError::Database)
}

fn metadata_from_row(row: &PgRow) -> Result<Metadata, StoreError> {
    let state: String = row.get("state");
    Ok(Metadata {
        id: row.get("id"),
        external_id: row.get("external_id"),
        name: row.get("name"),
        parent_id: row.get("parent_id"),
        state: parse_enum::<WorkflowState>(&state)?,
        start_time: row.get("start_time"),
        end_time: row.get("end_time"),
        failure_step: row.get("failure_step"),
        failure_exception: row.get("failure_exception"),
        failure_reason: row.get("failure_reason"),
        stack_trace: row.get("stack_trace"),
        input: row.get("input"),
        output: row.get("output"),
        manifest_id: row.get("manifest_id"),
        pending_input: None,
        pending_output: None,
    })
}

fn manifest_from_row(row: &PgRow) -> Result<Manifest, StoreError> {
    let schedule_type: String = row.get("schedule_type");
    Ok(Manifest {
        id: row.get("id"),
        external_id: row.get("external_id"),
        name: row.get("name"),
        full_name: row.get("full_name"),
        property_type: row.get("property_type"),
        properties: row.get("properties"),
        schedule_type: parse_enum::<ScheduleType>(&schedule_type)?,
        cron_expression: row.get("cron_expression"),
        interval_seconds: row.get("interval_seconds"),
        max_retries: row.get("max_retries"),
        is_enabled: row.get("is_enabled"),
        last_successful_run: row.get("last_successful_run"),
        depends_on_manifest_id: row.get("depends_on_manifest_id"),
        manifest_group_id: row.get("manifest_group_id"),
        created_at: row.get("created_at"),
    })
}

fn group_from_row(row: &PgRow) -> ManifestGroup {
    ManifestGroup {
        id: row.get("id"),
        name: row.get("name"),
        max_active_jobs: row.get("max_active_jobs"),
        priority: row.get::<i16, _>("priority") as u8,
        is_enabled: row.get("is_enabled"),
    }
}

fn work_item_from_row(row: &PgRow) -> Result<WorkQueueItem, StoreError> {
    let status: String = row.get("status");
    Ok(WorkQueueItem {
        id: row.get("id"),
        external_id: row.get("external_id"),
        workflow_name: row.get("workflow_name"),
        input: row.get("input"),
        input_type_name: row.get("input_type_name"),
        status: parse_enum::<WorkQueueStatus>(&status)?,
        created_at: row.get("created_at"),
        dispatched_at: row.get("dispatched_at"),
        priority: row.get::<i16, _>("priority") as u8,
        manifest_id: row.get("manifest_id"),
        metadata_id: row.get("metadata_id"),
    })
}

fn dead_letter_from_row(row: &PgRow) -> Result<DeadLetter, StoreError> {
    let status: String = row.get("status");
    Ok(DeadLetter {
        id: row.get("id"),
        manifest_id: row.get("manifest_id"),
        dead_lettered_at: row.get("dead_lettered_at"),
        reason: row.get("reason"),
        retry_count_at_dead_letter: row.get("retry_count_at_dead_letter"),
        status: parse_enum::<DeadLetterStatus>(&status)?,
        resolved_at: row.get("resolved_at"),
        resolution_note: row.get("resolution_note"),
        retry_metadata_id: row.get("retry_metadata_id"),
    })
}

fn job_from_row(row: &PgRow) -> BackgroundJob {
    BackgroundJob {
        id: row.get("id"),
        metadata_id: row.get("metadata_id"),
        input: row.get("input"),
        input_type: row.get("input_type"),
        created_at: row.get("created_at"),
        fetched_at: row.get("fetched_at"),
    }
}

const METADATA_COLUMNS: &str = "id, external_id, name, parent_id, state, start_time, end_time, \
     failure_step, failure_exception, failure_reason, stack_trace, input, output, manifest_id";

const MANIFEST_COLUMNS: &str = "id, external_id, name, full_name, property_type, properties, \
     schedule_type, cron_expression, interval_seconds, max_retries, is_enabled, \
     last_successful_run, depends_on_manifest_id, manifest_group_id, created_at";

#[async_trait]
impl DataContext for PostgresDataContext {
    #[instrument(skip(self, metadata))]
    async fn save_metadata(&self, metadata: Metadata) -> Result<i64, StoreError> {
        if metadata.id == 0 {
            let row = sqlx::query(
                r#"
                INSERT INTO metadata (
                    external_id, name, parent_id, state, start_time, end_time,
                    failure_step, failure_exception, failure_reason, stack_trace,
                    input, output, manifest_id
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                RETURNING id
                "#,
            )
            .bind(&metadata.external_id)
            .bind(&metadata.name)
            .bind(metadata.parent_id)
            .bind(metadata.state.to_string())
            .bind(metadata.start_time)
            .bind(metadata.end_time)
            .bind(&metadata.failure_step)
            .bind(&metadata.failure_exception)
            .bind(&metadata.failure_reason)
            .bind(&metadata.stack_trace)
            .bind(&metadata.input)
            .bind(&metadata.output)
            .bind(metadata.manifest_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_error("insert metadata", e))?;

            let id: i64 = row.get("id");
            debug!(%id, name = %metadata.name, "created metadata");
            Ok(id)
        } else {
            sqlx::query(
                r#"
                UPDATE metadata
                SET state = $2,
                    end_time = $3,
                    failure_step = $4,
                    failure_exception = $5,
                    failure_reason = $6,
                    stack_trace = $7,
                    input = COALESCE($8, input),
                    output = COALESCE($9, output)
                WHERE id = $1
                "#,
            )
            .bind(metadata.id)
            .bind(metadata.state.to_string())
            .bind(metadata.end_time)
            .bind(&metadata.failure_step)
            .bind(&metadata.failure_exception)
            .bind(&metadata.failure_reason)
            .bind(&metadata.stack_trace)
            .bind(&metadata.input)
            .bind(&metadata.output)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("update metadata", e))?;

            Ok(metadata.id)
        }
    }

    #[instrument(skip(self))]
    async fn get_metadata(&self, id: i64) -> Result<Metadata, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {METADATA_COLUMNS} FROM metadata WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get metadata", e))?
        .ok_or(StoreError::MetadataNotFound(id))?;

        metadata_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn get_metadata_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Metadata, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {METADATA_COLUMNS} FROM metadata WHERE external_id = $1"
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get metadata by external id", e))?
        .ok_or(StoreError::MetadataNotFound(0))?;

        metadata_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn list_metadata_for_manifest(
        &self,
        manifest_id: i64,
    ) -> Result<Vec<Metadata>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {METADATA_COLUMNS} FROM metadata WHERE manifest_id = $1 ORDER BY id"
        ))
        .bind(manifest_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list metadata for manifest", e))?;

        rows.iter().map(metadata_from_row).collect()
    }

    #[instrument(skip(self, step))]
    async fn save_step_metadata(&self, step: StepMetadata) -> Result<i64, StoreError> {
        if step.id == 0 {
            let row = sqlx::query(
                r#"
                INSERT INTO step_metadata (
                    external_id, workflow_external_id, name, input_type, output_type,
                    state, has_ran, start_time_utc, end_time_utc, output_json
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                RETURNING id
                "#,
            )
            .bind(&step.external_id)
            .bind(&step.workflow_external_id)
            .bind(&step.name)
            .bind(&step.input_type)
            .bind(&step.output_type)
            .bind(step.state.to_string())
            .bind(step.has_ran)
            .bind(step.start_time_utc)
            .bind(step.end_time_utc)
            .bind(&step.output_json)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_error("insert step metadata", e))?;

            Ok(row.get("id"))
        } else {
            sqlx::query(
                r#"
                UPDATE step_metadata
                SET state = $2, has_ran = $3, start_time_utc = $4,
                    end_time_utc = $5, output_json = $6
                WHERE id = $1
                "#,
            )
            .bind(step.id)
            .bind(step.state.to_string())
            .bind(step.has_ran)
            .bind(step.start_time_utc)
            .bind(step.end_time_utc)
            .bind(&step.output_json)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("update step metadata", e))?;

            Ok(step.id)
        }
    }

    #[instrument(skip(self))]
    async fn list_step_metadata(
        &self,
        workflow_external_id: &str,
    ) -> Result<Vec<StepMetadata>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, external_id, workflow_external_id, name, input_type, output_type,
                   state, has_ran, start_time_utc, end_time_utc, output_json
            FROM step_metadata
            WHERE workflow_external_id = $1
            ORDER BY id
            "#,
        )
        .bind(workflow_external_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list step metadata", e))?;

        rows.iter()
            .map(|row| {
                let state: String = row.get("state");
                Ok(StepMetadata {
                    id: row.get("id"),
                    external_id: row.get("external_id"),
                    workflow_external_id: row.get("workflow_external_id"),
                    name: row.get("name"),
                    input_type: row.get("input_type"),
                    output_type: row.get("output_type"),
                    state: parse_enum(&state)?,
                    has_ran: row.get("has_ran"),
                    start_time_utc: row.get("start_time_utc"),
                    end_time_utc: row.get("end_time_utc"),
                    output_json: row.get("output_json"),
                })
            })
            .collect()
    }

    #[instrument(skip(self, entry))]
    async fn append_log(&self, entry: LogEntry) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO log (metadata_id, level, message, logged_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(entry.metadata_id)
        .bind(&entry.level)
        .bind(&entry.message)
        .bind(entry.logged_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("append log", e))?;

        Ok(row.get("id"))
    }

    #[instrument(skip(self))]
    async fn list_logs(&self, metadata_id: i64) -> Result<Vec<LogEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, metadata_id, level, message, logged_at
            FROM log
            WHERE metadata_id = $1
            ORDER BY id
            "#,
        )
        .bind(metadata_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list logs", e))?;

        Ok(rows
            .into_iter()
            .map(|row| LogEntry {
                id: row.get("id"),
                metadata_id: row.get("metadata_id"),
                level: row.get("level"),
                message: row.get("message"),
                logged_at: row.get("logged_at"),
            })
            .collect())
    }

    #[instrument(skip(self, manifest), fields(external_id = %manifest.external_id))]
    async fn upsert_manifest(&self, manifest: Manifest) -> Result<Manifest, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO manifest (
                external_id, name, full_name, property_type, properties,
                schedule_type, cron_expression, interval_seconds, max_retries,
                is_enabled, depends_on_manifest_id, manifest_group_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (external_id) DO UPDATE SET
                name = EXCLUDED.name,
                full_name = EXCLUDED.full_name,
                property_type = EXCLUDED.property_type,
                properties = EXCLUDED.properties,
                schedule_type = EXCLUDED.schedule_type,
                cron_expression = EXCLUDED.cron_expression,
                interval_seconds = EXCLUDED.interval_seconds,
                max_retries = EXCLUDED.max_retries,
                is_enabled = EXCLUDED.is_enabled,
                depends_on_manifest_id = EXCLUDED.depends_on_manifest_id,
                manifest_group_id = EXCLUDED.manifest_group_id
            RETURNING {MANIFEST_COLUMNS}
            "#
        ))
        .bind(&manifest.external_id)
        .bind(&manifest.name)
        .bind(&manifest.full_name)
        .bind(&manifest.property_type)
        .bind(&manifest.properties)
        .bind(manifest.schedule_type.to_string())
        .bind(&manifest.cron_expression)
        .bind(manifest.interval_seconds)
        .bind(manifest.max_retries)
        .bind(manifest.is_enabled)
        .bind(manifest.depends_on_manifest_id)
        .bind(manifest.manifest_group_id)
        .bind(manifest.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("upsert manifest", e))?;

        let saved = manifest_from_row(&row)?;
        debug!(external_id = %saved.external_id, id = saved.id, "upserted manifest");
        Ok(saved)
    }

    #[instrument(skip(self))]
    async fn get_manifest(&self, id: i64) -> Result<Manifest, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {MANIFEST_COLUMNS} FROM manifest WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get manifest", e))?
        .ok_or_else(|| StoreError::ManifestNotFound(id.to_string()))?;

        manifest_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn get_manifest_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Manifest, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {MANIFEST_COLUMNS} FROM manifest WHERE external_id = $1"
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get manifest by external id", e))?
        .ok_or_else(|| StoreError::ManifestNotFound(external_id.to_string()))?;

        manifest_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn set_last_successful_run(
        &self,
        manifest_id: i64,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE manifest SET last_successful_run = $2 WHERE id = $1")
            .bind(manifest_id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("set last successful run", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ManifestNotFound(manifest_id.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn load_manifest_states(&self) -> Result<Vec<ManifestState>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT m.id, m.external_id, m.name, m.full_name, m.property_type, m.properties,
                   m.schedule_type, m.cron_expression, m.interval_seconds, m.max_retries,
                   m.is_enabled, m.last_successful_run, m.depends_on_manifest_id,
                   m.manifest_group_id, m.created_at,
                   g.id AS g_id, g.name AS g_name, g.max_active_jobs AS g_max_active_jobs,
                   g.priority AS g_priority, g.is_enabled AS g_is_enabled,
                   (SELECT COUNT(*) FROM metadata md
                     WHERE md.manifest_id = m.id AND md.state = 'failed') AS failed_runs,
                   EXISTS(SELECT 1 FROM dead_letter dl
                     WHERE dl.manifest_id = m.id
                       AND dl.status = 'awaiting_intervention') AS has_open_dead_letter,
                   (SELECT COUNT(*) FROM work_queue wq
                     LEFT JOIN metadata wmd ON wmd.id = wq.metadata_id
                     WHERE wq.manifest_id = m.id
                       AND (wq.status = 'queued'
                            OR (wq.status = 'dispatched'
                                AND wmd.state IN ('pending', 'in_progress')))) AS live_queue_count,
                   p.last_successful_run AS parent_last_successful_run
            FROM manifest m
            JOIN manifest_group g ON g.id = m.manifest_group_id
            LEFT JOIN manifest p ON p.id = m.depends_on_manifest_id
            WHERE m.is_enabled
            ORDER BY m.id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("load manifest states", e))?;

        rows.iter()
            .map(|row| {
                Ok(ManifestState {
                    manifest: manifest_from_row(row)?,
                    group: ManifestGroup {
                        id: row.get("g_id"),
                        name: row.get("g_name"),
                        max_active_jobs: row.get("g_max_active_jobs"),
                        priority: row.get::<i16, _>("g_priority") as u8,
                        is_enabled: row.get("g_is_enabled"),
                    },
                    failed_runs: row.get("failed_runs"),
                    has_open_dead_letter: row.get("has_open_dead_letter"),
                    live_queue_count: row.get("live_queue_count"),
                    parent_last_successful_run: row.get("parent_last_successful_run"),
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn get_or_create_group(&self, name: &str) -> Result<ManifestGroup, StoreError> {
        // The no-op update makes the insert return the existing row too.
        let row = sqlx::query(
            r#"
            INSERT INTO manifest_group (name, max_active_jobs, priority, is_enabled)
            VALUES ($1, NULL, 0, TRUE)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id, name, max_active_jobs, priority, is_enabled
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("get or create group", e))?;

        Ok(group_from_row(&row))
    }

    #[instrument(skip(self, group), fields(name = %group.name))]
    async fn save_group(&self, group: ManifestGroup) -> Result<ManifestGroup, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO manifest_group (name, max_active_jobs, priority, is_enabled)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO UPDATE SET
                max_active_jobs = EXCLUDED.max_active_jobs,
                priority = EXCLUDED.priority,
                is_enabled = EXCLUDED.is_enabled
            RETURNING id, name, max_active_jobs, priority, is_enabled
            "#,
        )
        .bind(&group.name)
        .bind(group.max_active_jobs)
        .bind(group.priority as i16)
        .bind(group.is_enabled)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("save group", e))?;

        Ok(group_from_row(&row))
    }

    #[instrument(skip(self))]
    async fn get_group(&self, id: i64) -> Result<ManifestGroup, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, max_active_jobs, priority, is_enabled FROM manifest_group WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get group", e))?
        .ok_or(StoreError::GroupNotFound(id))?;

        Ok(group_from_row(&row))
    }

    #[instrument(skip(self))]
    async fn delete_group(&self, id: i64) -> Result<(), StoreError> {
        let group = self.get_group(id).await?;

        let referencing: i64 =
            sqlx::query("SELECT COUNT(*) AS n FROM manifest WHERE manifest_group_id = $1")
                .bind(id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| db_error("count group manifests", e))?
                .get("n");
        if referencing > 0 {
            return Err(StoreError::GroupInUse(group.name));
        }

        sqlx::query("DELETE FROM manifest_group WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("delete group", e))?;
        Ok(())
    }

    #[instrument(skip(self, item), fields(workflow = %item.workflow_name))]
    async fn enqueue_work(&self, item: NewWorkItem) -> Result<WorkQueueItem, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO work_queue (
                external_id, workflow_name, input, input_type_name, status,
                created_at, priority, manifest_id, metadata_id
            )
            VALUES ($1, $2, $3, $4, 'queued', $5, $6, $7, $8)
            RETURNING id, external_id, workflow_name, input, input_type_name, status,
                      created_at, dispatched_at, priority, manifest_id, metadata_id
            "#,
        )
        .bind(new_external_id())
        .bind(&item.workflow_name)
        .bind(&item.input)
        .bind(&item.input_type_name)
        .bind(Utc::now())
        .bind(trellis_core::model::clamp_priority(item.priority) as i16)
        .bind(item.manifest_id)
        .bind(item.metadata_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("enqueue work", e))?;

        let saved = work_item_from_row(&row)?;
        debug!(id = saved.id, workflow = %saved.workflow_name, "enqueued work item");
        Ok(saved)
    }

    #[instrument(skip(self))]
    async fn load_queued(&self) -> Result<Vec<QueuedWork>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT wq.id, wq.external_id, wq.workflow_name, wq.input, wq.input_type_name,
                   wq.status, wq.created_at, wq.dispatched_at, wq.priority,
                   wq.manifest_id, wq.metadata_id,
                   m.schedule_type AS m_schedule_type,
                   g.id AS g_id, g.is_enabled AS g_is_enabled,
                   g.max_active_jobs AS g_max_active_jobs
            FROM work_queue wq
            LEFT JOIN manifest m ON m.id = wq.manifest_id
            LEFT JOIN manifest_group g ON g.id = m.manifest_group_id
            WHERE wq.status = 'queued'
            ORDER BY wq.created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("load queued work", e))?;

        rows.iter()
            .map(|row| {
                let schedule_type: Option<String> = row.get("m_schedule_type");
                Ok(QueuedWork {
                    item: work_item_from_row(row)?,
                    schedule_type: schedule_type
                        .as_deref()
                        .map(parse_enum::<ScheduleType>)
                        .transpose()?,
                    group_id: row.get("g_id"),
                    group_enabled: row.get::<Option<bool>, _>("g_is_enabled").unwrap_or(true),
                    group_max_active: row.get("g_max_active_jobs"),
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn get_work_item(&self, id: i64) -> Result<WorkQueueItem, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, external_id, workflow_name, input, input_type_name, status,
                   created_at, dispatched_at, priority, manifest_id, metadata_id
            FROM work_queue
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get work item", e))?
        .ok_or(StoreError::WorkItemNotFound(id))?;

        work_item_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn list_work_for_manifest(
        &self,
        manifest_id: i64,
    ) -> Result<Vec<WorkQueueItem>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, external_id, workflow_name, input, input_type_name, status,
                   created_at, dispatched_at, priority, manifest_id, metadata_id
            FROM work_queue
            WHERE manifest_id = $1
            ORDER BY id
            "#,
        )
        .bind(manifest_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list work for manifest", e))?;

        rows.iter().map(work_item_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn cancel_work_item(&self, id: i64) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE work_queue SET status = 'cancelled' WHERE id = $1 AND status = 'queued'")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| db_error("cancel work item", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotQueued(id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn count_active_jobs_per_group(&self) -> Result<HashMap<i64, i64>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT g.id AS group_id, COUNT(md.id) AS active
            FROM metadata md
            JOIN manifest m ON m.id = md.manifest_id
            JOIN manifest_group g ON g.id = m.manifest_group_id
            WHERE md.state IN ('pending', 'in_progress')
            GROUP BY g.id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("count active jobs", e))?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get("group_id"), row.get("active")))
            .collect())
    }

    #[instrument(skip(self, seed))]
    async fn dispatch_work_item(
        &self,
        work_id: i64,
        seed: MetadataSeed,
    ) -> Result<DispatchedWork, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin dispatch", e))?;

        let item_row = sqlx::query(
            r#"
            SELECT id, external_id, workflow_name, input, input_type_name, status,
                   created_at, dispatched_at, priority, manifest_id, metadata_id
            FROM work_queue
            WHERE id = $1 AND status = 'queued'
            FOR UPDATE
            "#,
        )
        .bind(work_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("lock work item", e))?
        .ok_or(StoreError::NotQueued(work_id))?;
        let item = work_item_from_row(&item_row)?;

        let now = Utc::now();
        let metadata = match seed {
            MetadataSeed::New(new) => {
                let row = sqlx::query(&format!(
                    r#"
                    INSERT INTO metadata (
                        external_id, name, parent_id, state, start_time, input, manifest_id
                    )
                    VALUES ($1, $2, $3, 'pending', $4, $5, $6)
                    RETURNING {METADATA_COLUMNS}
                    "#
                ))
                .bind(new_external_id())
                .bind(&new.name)
                .bind(new.parent_id)
                .bind(now)
                .bind(&new.input)
                .bind(new.manifest_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| db_error("insert dispatch metadata", e))?;
                metadata_from_row(&row)?
            }
            MetadataSeed::Existing(id) => {
                let row = sqlx::query(&format!(
                    "SELECT {METADATA_COLUMNS} FROM metadata WHERE id = $1"
                ))
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| db_error("load dispatch metadata", e))?
                .ok_or(StoreError::MetadataNotFound(id))?;
                metadata_from_row(&row)?
            }
        };

        let work_row = sqlx::query(
            r#"
            UPDATE work_queue
            SET status = 'dispatched', dispatched_at = $2, metadata_id = $3
            WHERE id = $1
            RETURNING id, external_id, workflow_name, input, input_type_name, status,
                      created_at, dispatched_at, priority, manifest_id, metadata_id
            "#,
        )
        .bind(work_id)
        .bind(now)
        .bind(metadata.id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("flip work item", e))?;
        let work = work_item_from_row(&work_row)?;

        let job_row = sqlx::query(
            r#"
            INSERT INTO background_job (metadata_id, input, input_type, created_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id, metadata_id, input, input_type, created_at, fetched_at
            "#,
        )
        .bind(metadata.id)
        .bind(&item.input)
        .bind(&item.input_type_name)
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("insert background job", e))?;
        let job = job_from_row(&job_row);

        tx.commit()
            .await
            .map_err(|e| db_error("commit dispatch", e))?;

        debug!(work_id, metadata_id = metadata.id, job_id = job.id, "dispatched work item");
        Ok(DispatchedWork {
            work,
            metadata,
            job,
        })
    }

    #[instrument(skip(self, letter), fields(manifest_id = letter.manifest_id))]
    async fn insert_dead_letter(&self, letter: NewDeadLetter) -> Result<DeadLetter, StoreError> {
        // Conditional insert keeps the at-most-one-open-letter invariant
        // without a separate existence round trip.
        let row = sqlx::query(
            r#"
            INSERT INTO dead_letter (
                manifest_id, dead_lettered_at, reason, retry_count_at_dead_letter, status
            )
            SELECT $1, $2, $3, $4, 'awaiting_intervention'
            WHERE NOT EXISTS (
                SELECT 1 FROM dead_letter
                WHERE manifest_id = $1 AND status = 'awaiting_intervention'
            )
            RETURNING id, manifest_id, dead_lettered_at, reason,
                      retry_count_at_dead_letter, status, resolved_at,
                      resolution_note, retry_metadata_id
            "#,
        )
        .bind(letter.manifest_id)
        .bind(Utc::now())
        .bind(&letter.reason)
        .bind(letter.retry_count_at_dead_letter)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("insert dead letter", e))?
        .ok_or(StoreError::OpenDeadLetterExists(letter.manifest_id))?;

        let saved = dead_letter_from_row(&row)?;
        debug!(id = saved.id, manifest_id = saved.manifest_id, "inserted dead letter");
        Ok(saved)
    }

    #[instrument(skip(self))]
    async fn get_dead_letter(&self, id: i64) -> Result<DeadLetter, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, manifest_id, dead_lettered_at, reason, retry_count_at_dead_letter,
                   status, resolved_at, resolution_note, retry_metadata_id
            FROM dead_letter
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get dead letter", e))?
        .ok_or(StoreError::DeadLetterNotFound(id))?;

        dead_letter_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn list_dead_letters(
        &self,
        status: Option<DeadLetterStatus>,
    ) -> Result<Vec<DeadLetter>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, manifest_id, dead_lettered_at, reason, retry_count_at_dead_letter,
                   status, resolved_at, resolution_note, retry_metadata_id
            FROM dead_letter
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY dead_lettered_at DESC
            "#,
        )
        .bind(status.map(|s| s.to_string()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list dead letters", e))?;

        rows.iter().map(dead_letter_from_row).collect()
    }

    #[instrument(skip(self, resolution))]
    async fn resolve_dead_letter(
        &self,
        id: i64,
        resolution: DeadLetterResolution,
    ) -> Result<DeadLetter, StoreError> {
        let (status, note, retry_metadata_id) = match resolution {
            DeadLetterResolution::Acknowledge { note } => {
                (DeadLetterStatus::Acknowledged, Some(note), None)
            }
            DeadLetterResolution::Retry { retry_metadata_id } => {
                (DeadLetterStatus::Retried, None, Some(retry_metadata_id))
            }
        };

        let row = sqlx::query(
            r#"
            UPDATE dead_letter
            SET status = $2, resolved_at = $3, resolution_note = $4, retry_metadata_id = $5
            WHERE id = $1 AND status = 'awaiting_intervention'
            RETURNING id, manifest_id, dead_lettered_at, reason,
                      retry_count_at_dead_letter, status, resolved_at,
                      resolution_note, retry_metadata_id
            "#,
        )
        .bind(id)
        .bind(status.to_string())
        .bind(Utc::now())
        .bind(&note)
        .bind(retry_metadata_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("resolve dead letter", e))?;

        match row {
            Some(row) => dead_letter_from_row(&row),
            // Distinguish a missing letter from one already resolved.
            None => match self.get_dead_letter(id).await {
                Ok(_) => Err(StoreError::DeadLetterNotOpen(id)),
                Err(e) => Err(e),
            },
        }
    }

    #[instrument(skip(self, job))]
    async fn insert_background_job(
        &self,
        job: NewBackgroundJob,
    ) -> Result<BackgroundJob, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO background_job (metadata_id, input, input_type, created_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id, metadata_id, input, input_type, created_at, fetched_at
            "#,
        )
        .bind(job.metadata_id)
        .bind(&job.input)
        .bind(&job.input_type)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("insert background job", e))?;

        Ok(job_from_row(&row))
    }

    #[instrument(skip(self))]
    async fn claim_background_job(
        &self,
        visibility_timeout: Duration,
    ) -> Result<Option<BackgroundJob>, StoreError> {
        let now = Utc::now();
        let lease_cutoff =
            now - chrono::Duration::from_std(visibility_timeout).unwrap_or_default();

        // SKIP LOCKED keeps concurrent workers off each other's claims; an
        // aged-out lease is claimable again.
        let row = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM background_job
                WHERE fetched_at IS NULL OR fetched_at < $1
                ORDER BY created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE background_job j
            SET fetched_at = $2
            FROM claimable c
            WHERE j.id = c.id
            RETURNING j.id, j.metadata_id, j.input, j.input_type, j.created_at, j.fetched_at
            "#,
        )
        .bind(lease_cutoff)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("claim background job", e))?;

        Ok(row.map(|r| {
            let job = job_from_row(&r);
            debug!(job_id = job.id, metadata_id = job.metadata_id, "claimed background job");
            job
        }))
    }

    #[instrument(skip(self))]
    async fn delete_background_job(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM background_job WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("delete background job", e))?;
        Ok(())
    }

    #[instrument(skip(self, workflow_names))]
    async fn purge_terminal_metadata(
        &self,
        workflow_names: &[String],
        cutoff: DateTime<Utc>,
    ) -> Result<PurgeCounts, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin purge", e))?;

        const VICTIMS: &str = r#"
            SELECT id, external_id FROM metadata
            WHERE name = ANY($1)
              AND start_time < $2
              AND state IN ('completed', 'failed')
        "#;

        let work_items = sqlx::query(&format!(
            "DELETE FROM work_queue WHERE metadata_id IN (SELECT id FROM ({VICTIMS}) v)"
        ))
        .bind(workflow_names)
        .bind(cutoff)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("purge work items", e))?
        .rows_affected();

        let logs = sqlx::query(&format!(
            "DELETE FROM log WHERE metadata_id IN (SELECT id FROM ({VICTIMS}) v)"
        ))
        .bind(workflow_names)
        .bind(cutoff)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("purge logs", e))?
        .rows_affected();

        let step_metadata = sqlx::query(&format!(
            "DELETE FROM step_metadata WHERE workflow_external_id IN (SELECT external_id FROM ({VICTIMS}) v)"
        ))
        .bind(workflow_names)
        .bind(cutoff)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("purge step metadata", e))?
        .rows_affected();

        let metadata = sqlx::query(&format!(
            "DELETE FROM metadata WHERE id IN (SELECT id FROM ({VICTIMS}) v)"
        ))
        .bind(workflow_names)
        .bind(cutoff)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("purge metadata", e))?
        .rows_affected();

        tx.commit().await.map_err(|e| db_error("commit purge", e))?;

        let counts = PurgeCounts {
            metadata,
            step_metadata,
            logs,
            work_items,
        };
        if counts.metadata > 0 {
            debug!(?counts, "purged terminal metadata");
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    // Behavior is covered against the in-memory implementation, which shares
    // these semantics; running this module requires a PostgreSQL database.
}
