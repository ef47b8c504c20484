//! Persistent ingest store
//!
//! The store is the only state shared between the orchestrator and the
//! workers. Every orchestration predicate is a count over it, and the
//! at-most-one-claim guarantee for task records is enforced here, inside a
//! single atomic claim statement.
//!
//! Two backends implement [`IngestStore`]:
//! - [`SqliteStore`]: single-process store, workers run in the orchestrator
//! - [`PgStore`]: shared store for separately deployed workers

mod postgres;
mod rows;
mod sqlite;

pub use postgres::PgStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{IngestError, Result};
use crate::model::{
    AuditLogEntry, DeidLogEntry, IngestItem, IngestOperation, IngestStage, IngestUpdate,
    PrivateTag, QueueCounts, QueueName, SubjectMap, TaskPayload, TaskRecord,
};

/// Error message recorded on tasks failed by lease expiry
pub const LEASE_EXPIRED: &str = "lease expired: no heartbeat from the claiming worker";

#[async_trait]
pub trait IngestStore: Send + Sync {
    /// Create or migrate the schema
    async fn initialize(&self) -> Result<()>;

    // ------------------------------------------------------------------
    // Ingest operations
    // ------------------------------------------------------------------

    async fn insert_ingest(&self, ingest: &IngestOperation) -> Result<()>;

    /// Fails with [`IngestError::IngestNotFound`] for an unknown id
    async fn find_ingest(&self, id: Uuid) -> Result<IngestOperation>;

    /// Apply `update`. A stage change must satisfy
    /// [`IngestStage::can_move_to`], checked atomically in the store;
    /// refused moves fail with [`IngestError::StageConflict`].
    async fn update_ingest(&self, id: Uuid, update: IngestUpdate) -> Result<()>;

    // ------------------------------------------------------------------
    // Task queues
    // ------------------------------------------------------------------

    /// Insert a waiting task; the queue follows from the payload
    async fn insert_task(&self, ingest_id: Uuid, payload: &TaskPayload) -> Result<Uuid>;

    /// Atomically claim the next waiting task of `queue`, marking it running
    /// under `worker_id`. With `ingest_id` set only that ingest's tasks are
    /// considered.
    async fn claim_task(
        &self,
        queue: QueueName,
        worker_id: &str,
        ingest_id: Option<Uuid>,
    ) -> Result<Option<TaskRecord>>;

    /// running -> complete. Returns false when the task was no longer running.
    async fn complete_task(&self, task_id: Uuid) -> Result<bool>;

    /// running -> failed. Returns false when the task was no longer running.
    async fn fail_task(&self, task_id: Uuid, error: &str) -> Result<bool>;

    async fn heartbeat(&self, task_id: Uuid) -> Result<()>;

    async fn queue_counts(&self, ingest_id: Uuid, queue: QueueName) -> Result<QueueCounts>;

    /// Fail running tasks whose last heartbeat is older than `lease`
    async fn fail_stale_tasks(&self, ingest_id: Uuid, lease: Duration) -> Result<u64>;

    /// A queue is complete for an ingest when none of its tasks is waiting
    /// or running. Failed tasks count as done.
    async fn is_queue_complete(&self, ingest_id: Uuid, queue: QueueName) -> Result<bool> {
        Ok(self.queue_counts(ingest_id, queue).await?.is_drained())
    }

    // ------------------------------------------------------------------
    // Items
    // ------------------------------------------------------------------

    async fn insert_items(&self, items: &[IngestItem]) -> Result<()>;

    async fn find_item(&self, id: Uuid) -> Result<IngestItem>;

    async fn items_for_ingest(&self, ingest_id: Uuid) -> Result<Vec<IngestItem>>;

    /// Persist an item's context, warnings and errors
    async fn update_item(&self, item: &IngestItem) -> Result<()>;

    /// Persist `item` and insert its work task in one transaction, so an
    /// item never carries a target without a queued work task
    async fn queue_item_work(&self, item: &IngestItem) -> Result<Uuid>;

    // ------------------------------------------------------------------
    // Audit log
    // ------------------------------------------------------------------

    async fn insert_audit_entries(&self, entries: &[AuditLogEntry]) -> Result<()>;

    async fn audit_entries(&self, ingest_id: Uuid) -> Result<Vec<AuditLogEntry>>;

    // ------------------------------------------------------------------
    // Auxiliary records
    // ------------------------------------------------------------------

    async fn insert_subject_map(&self, map: &SubjectMap) -> Result<()>;

    async fn subject_maps(&self, ingest_id: Uuid) -> Result<Vec<SubjectMap>>;

    /// Code of `subject_id` for this ingest, generating `<prefix><n>` when
    /// the subject has not been seen yet
    async fn subject_code(&self, ingest_id: Uuid, subject_id: &str, prefix: &str)
        -> Result<String>;

    async fn insert_deid_log(&self, entry: &DeidLogEntry) -> Result<()>;

    async fn deid_logs(&self, ingest_id: Uuid) -> Result<Vec<DeidLogEntry>>;

    async fn insert_private_tag(&self, tag: &PrivateTag) -> Result<()>;

    async fn private_tags(&self, ingest_id: Uuid) -> Result<Vec<PrivateTag>>;
}

/// Open the store named by a connection string
pub async fn connect(database_url: &str) -> Result<Arc<dyn IngestStore>> {
    if database_url.starts_with("sqlite:") {
        Ok(Arc::new(SqliteStore::connect(database_url).await?))
    } else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
        Ok(Arc::new(PgStore::connect(database_url).await?))
    } else {
        Err(IngestError::config(format!(
            "Unsupported database URL: {}",
            database_url
        )))
    }
}

/// Cut-off timestamp for lease expiry
pub(crate) fn lease_cutoff(lease: Duration) -> DateTime<Utc> {
    let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_sub_signed(lease)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Error for an update refused by the forward-only stage guard
pub(crate) fn stage_conflict(from: IngestStage, to: Option<IngestStage>) -> IngestError {
    IngestError::StageConflict {
        from,
        to: to.unwrap_or(from),
    }
}

/// Code for the `n`-th subject of an ingest
pub(crate) fn format_subject_code(prefix: &str, n: i64) -> String {
    format!("{}{:04}", prefix, n)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_code_format() {
        assert_eq!(format_subject_code("ex", 1), "ex0001");
        assert_eq!(format_subject_code("S", 12345), "S12345");
    }

    #[test]
    fn test_lease_cutoff_is_in_the_past() {
        let cutoff = lease_cutoff(Duration::from_secs(60));
        assert!(cutoff < Utc::now() - chrono::Duration::seconds(59));
        assert_eq!(lease_cutoff(Duration::MAX), DateTime::<Utc>::MIN_UTC);
    }

    #[tokio::test]
    async fn test_connect_rejects_unknown_scheme() {
        let result = connect("mysql://localhost/bim").await;
        assert!(matches!(result, Err(IngestError::Config(_))));
    }
}
