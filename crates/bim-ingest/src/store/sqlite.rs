//! SQLite-backed store for single-process ingests

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::types::Json;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::rows::{
    AuditRow, DeidRow, IngestRow, ItemRow, PrivateTagRow, SubjectMapRow, TaskRow,
};
use super::{lease_cutoff, stage_conflict, IngestStore, LEASE_EXPIRED};
use crate::error::{IngestError, Result};
use crate::model::{
    AuditLogEntry, DeidLogEntry, IngestItem, IngestOperation, IngestUpdate, PrivateTag,
    QueueCounts, QueueName, SubjectMap, TaskPayload, TaskRecord, TaskStatus,
};

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) a database file
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        info!(database_url, "Connected to SQLite store");
        Ok(Self { pool })
    }

    /// Private in-memory database; lives as long as the store
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl IngestStore for SqliteStore {
    async fn initialize(&self) -> Result<()> {
        sqlx::migrate!("./migrations/sqlite").run(&self.pool).await?;
        debug!("SQLite schema is up to date");
        Ok(())
    }

    async fn insert_ingest(&self, ingest: &IngestOperation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingest_operations (
                id, name, fs_path, config, stage, created_at, processing_start, processing_end
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(ingest.id)
        .bind(&ingest.name)
        .bind(&ingest.fs_path)
        .bind(Json(&ingest.config))
        .bind(ingest.stage.as_str())
        .bind(ingest.created_at)
        .bind(ingest.processing_start)
        .bind(ingest.processing_end)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_ingest(&self, id: Uuid) -> Result<IngestOperation> {
        let row: Option<IngestRow> = sqlx::query_as(
            r#"
            SELECT id, name, fs_path, config, stage, created_at, processing_start, processing_end
            FROM ingest_operations
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or(IngestError::IngestNotFound(id))?.try_into()
    }

    async fn update_ingest(&self, id: Uuid, update: IngestUpdate) -> Result<()> {
        let next_stage = update.stage;
        let result = sqlx::query(
            r#"
            UPDATE ingest_operations
            SET stage = COALESCE(?1, stage),
                config = COALESCE(?2, config),
                processing_start = COALESCE(?3, processing_start),
                processing_end = COALESCE(?4, processing_end)
            WHERE id = ?5
              AND (
                  ?1 IS NULL
                  OR stage = ?1
                  OR (
                      stage NOT IN ('complete', 'aborted')
                      AND (CASE ?1 WHEN 'scan' THEN 0 WHEN 'review' THEN 1
                           WHEN 'processing' THEN 2 ELSE 3 END)
                        > (CASE stage WHEN 'scan' THEN 0 WHEN 'review' THEN 1
                           WHEN 'processing' THEN 2 ELSE 3 END)
                  )
              )
            "#,
        )
        .bind(next_stage.map(|stage| stage.as_str()))
        .bind(update.config.map(Json))
        .bind(update.processing_start)
        .bind(update.processing_end)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Either the ingest is gone or the stage move was refused
            let current = self.find_ingest(id).await?.stage;
            return Err(stage_conflict(current, next_stage));
        }
        Ok(())
    }

    async fn insert_task(&self, ingest_id: Uuid, payload: &TaskPayload) -> Result<Uuid> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO tasks (id, ingest_id, queue, payload, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(id)
        .bind(ingest_id)
        .bind(payload.queue().as_str())
        .bind(Json(payload))
        .bind(TaskStatus::Waiting.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn claim_task(
        &self,
        queue: QueueName,
        worker_id: &str,
        ingest_id: Option<Uuid>,
    ) -> Result<Option<TaskRecord>> {
        // One statement: SQLite serializes writers, so the row is claimed once.
        let row: Option<TaskRow> = sqlx::query_as(
            r#"
            UPDATE tasks
            SET status = 'running', worker_id = ?1, claimed_at = ?2, heartbeat_at = ?2
            WHERE id = (
                SELECT id FROM tasks
                WHERE queue = ?3
                  AND status = 'waiting'
                  AND (?4 IS NULL OR ingest_id = ?4)
                ORDER BY created_at
                LIMIT 1
            )
            RETURNING id, ingest_id, payload, status, worker_id, claimed_at, heartbeat_at,
                      completed_at, error, created_at
            "#,
        )
        .bind(worker_id)
        .bind(Utc::now())
        .bind(queue.as_str())
        .bind(ingest_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TaskRecord::try_from).transpose()
    }

    async fn complete_task(&self, task_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'complete', completed_at = ?1
            WHERE id = ?2 AND status = 'running'
            "#,
        )
        .bind(Utc::now())
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn fail_task(&self, task_id: Uuid, error: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'failed', completed_at = ?1, error = ?2
            WHERE id = ?3 AND status = 'running'
            "#,
        )
        .bind(Utc::now())
        .bind(error)
        .bind(task_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn heartbeat(&self, task_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE tasks SET heartbeat_at = ?1 WHERE id = ?2 AND status = 'running'")
            .bind(Utc::now())
            .bind(task_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn queue_counts(&self, ingest_id: Uuid, queue: QueueName) -> Result<QueueCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*)
            FROM tasks
            WHERE ingest_id = ?1 AND queue = ?2
            GROUP BY status
            "#,
        )
        .bind(ingest_id)
        .bind(queue.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut counts = QueueCounts::default();
        for (status, count) in rows {
            counts.add(status.parse()?, count.max(0) as u64);
        }
        Ok(counts)
    }

    async fn fail_stale_tasks(&self, ingest_id: Uuid, lease: Duration) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'failed', completed_at = ?1, error = ?2
            WHERE ingest_id = ?3 AND status = 'running' AND heartbeat_at < ?4
            "#,
        )
        .bind(Utc::now())
        .bind(LEASE_EXPIRED)
        .bind(ingest_id)
        .bind(lease_cutoff(lease))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn insert_items(&self, items: &[IngestItem]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for item in items {
            sqlx::query(
                r#"
                INSERT INTO ingest_items (
                    id, ingest_id, subdir, files, size, mtime, item_type, context, warnings, errors
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
            )
            .bind(item.id)
            .bind(item.ingest_id)
            .bind(&item.subdir)
            .bind(Json(&item.files))
            .bind(item.size)
            .bind(item.mtime)
            .bind(item.item_type.as_str())
            .bind(Json(&item.context))
            .bind(Json(&item.warnings))
            .bind(Json(&item.errors))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn find_item(&self, id: Uuid) -> Result<IngestItem> {
        let row: Option<ItemRow> = sqlx::query_as(
            r#"
            SELECT id, ingest_id, subdir, files, size, mtime, item_type, context, warnings, errors
            FROM ingest_items
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(IngestItem::from)
            .ok_or(IngestError::ItemNotFound(id))
    }

    async fn items_for_ingest(&self, ingest_id: Uuid) -> Result<Vec<IngestItem>> {
        let rows: Vec<ItemRow> = sqlx::query_as(
            r#"
            SELECT id, ingest_id, subdir, files, size, mtime, item_type, context, warnings, errors
            FROM ingest_items
            WHERE ingest_id = ?1
            ORDER BY subdir
            "#,
        )
        .bind(ingest_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(IngestItem::from).collect())
    }

    async fn update_item(&self, item: &IngestItem) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE ingest_items
            SET context = ?1, warnings = ?2, errors = ?3
            WHERE id = ?4
            "#,
        )
        .bind(Json(&item.context))
        .bind(Json(&item.warnings))
        .bind(Json(&item.errors))
        .bind(item.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(IngestError::ItemNotFound(item.id));
        }
        Ok(())
    }

    async fn queue_item_work(&self, item: &IngestItem) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let payload = TaskPayload::Work { item_id: item.id };
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE ingest_items
            SET context = ?1, warnings = ?2, errors = ?3
            WHERE id = ?4
            "#,
        )
        .bind(Json(&item.context))
        .bind(Json(&item.warnings))
        .bind(Json(&item.errors))
        .bind(item.id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(IngestError::ItemNotFound(item.id));
        }

        sqlx::query(
            r#"
            INSERT INTO tasks (id, ingest_id, queue, payload, status, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(id)
        .bind(item.ingest_id)
        .bind(payload.queue().as_str())
        .bind(Json(&payload))
        .bind(TaskStatus::Waiting.as_str())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(id)
    }

    async fn insert_audit_entries(&self, entries: &[AuditLogEntry]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for entry in entries {
            sqlx::query(
                r#"
                INSERT INTO audit_log (ingest_id, src_path, dest_path, failed, message)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )
            .bind(entry.ingest_id)
            .bind(&entry.src_path)
            .bind(&entry.dest_path)
            .bind(entry.failed)
            .bind(&entry.message)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn audit_entries(&self, ingest_id: Uuid) -> Result<Vec<AuditLogEntry>> {
        let rows: Vec<AuditRow> = sqlx::query_as(
            r#"
            SELECT ingest_id, src_path, dest_path, failed, message
            FROM audit_log
            WHERE ingest_id = ?1
            ORDER BY id
            "#,
        )
        .bind(ingest_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(AuditLogEntry::from).collect())
    }

    async fn insert_subject_map(&self, map: &SubjectMap) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO subject_maps (ingest_id, subject_id, subject_code, field_values)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(map.ingest_id)
        .bind(&map.subject_id)
        .bind(&map.subject_code)
        .bind(Json(&map.field_values))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn subject_maps(&self, ingest_id: Uuid) -> Result<Vec<SubjectMap>> {
        let rows: Vec<SubjectMapRow> = sqlx::query_as(
            r#"
            SELECT ingest_id, subject_id, subject_code, field_values
            FROM subject_maps
            WHERE ingest_id = ?1
            ORDER BY id
            "#,
        )
        .bind(ingest_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(SubjectMap::from).collect())
    }

    async fn subject_code(
        &self,
        ingest_id: Uuid,
        subject_id: &str,
        prefix: &str,
    ) -> Result<String> {
        // Single statement so concurrent workers cannot hand out the same code.
        // Candidates start after the mapped count and skip codes already
        // taken, e.g. by a loaded mapping.
        sqlx::query(
            r#"
            WITH RECURSIVE candidates(n) AS (
                SELECT COUNT(*) + 1 FROM subject_maps WHERE ingest_id = ?1
                UNION ALL
                SELECT n + 1 FROM candidates
                WHERE EXISTS (
                    SELECT 1 FROM subject_maps
                    WHERE ingest_id = ?1 AND subject_code = ?3 || printf('%04d', n)
                )
            )
            INSERT INTO subject_maps (ingest_id, subject_id, subject_code, field_values)
            SELECT ?1, ?2, ?3 || printf('%04d', n), '[]'
            FROM candidates
            WHERE NOT EXISTS (
                SELECT 1 FROM subject_maps
                WHERE ingest_id = ?1 AND subject_code = ?3 || printf('%04d', n)
            )
            LIMIT 1
            ON CONFLICT (ingest_id, subject_id) DO NOTHING
            "#,
        )
        .bind(ingest_id)
        .bind(subject_id)
        .bind(prefix)
        .execute(&self.pool)
        .await?;

        let code: String = sqlx::query_scalar(
            "SELECT subject_code FROM subject_maps WHERE ingest_id = ?1 AND subject_id = ?2",
        )
        .bind(ingest_id)
        .bind(subject_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(code)
    }

    async fn insert_deid_log(&self, entry: &DeidLogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO deid_logs (ingest_id, path, log_type, field_values)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(entry.ingest_id)
        .bind(&entry.path)
        .bind(&entry.log_type)
        .bind(Json(&entry.field_values))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn deid_logs(&self, ingest_id: Uuid) -> Result<Vec<DeidLogEntry>> {
        let rows: Vec<DeidRow> = sqlx::query_as(
            r#"
            SELECT ingest_id, path, log_type, field_values
            FROM deid_logs
            WHERE ingest_id = ?1
            ORDER BY id
            "#,
        )
        .bind(ingest_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(DeidLogEntry::from).collect())
    }

    async fn insert_private_tag(&self, tag: &PrivateTag) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO private_tags (ingest_id, private_creator, tag, vr, description, vm)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(tag.ingest_id)
        .bind(&tag.private_creator)
        .bind(&tag.tag)
        .bind(&tag.vr)
        .bind(&tag.description)
        .bind(&tag.vm)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn private_tags(&self, ingest_id: Uuid) -> Result<Vec<PrivateTag>> {
        let rows: Vec<PrivateTagRow> = sqlx::query_as(
            r#"
            SELECT ingest_id, private_creator, tag, vr, description, vm
            FROM private_tags
            WHERE ingest_id = ?1
            ORDER BY id
            "#,
        )
        .bind(ingest_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(PrivateTag::from).collect())
    }
}
