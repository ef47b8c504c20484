//! Task and queue abstractions consumed by the executor
//!
//! A [`QueueAdapter`] is a non-blocking accessor over a persistent task
//! table: `get` claims at most one task and returns immediately. A [`Task`]
//! is self-reporting: it writes its own status and any downstream records,
//! so the executor never inspects outcomes.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::model::QueueName;
use crate::store::IngestStore;
use crate::tasks::TaskFactory;

/// Identity of one worker: host name plus a per-worker UUID
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerId {
    pub hostname: String,
    pub id: Uuid,
}

impl WorkerId {
    pub fn new() -> Self {
        Self {
            hostname: hostname::get()
                .unwrap_or_else(|_| "unknown".into())
                .to_string_lossy()
                .to_string(),
            id: Uuid::new_v4(),
        }
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.id)
    }
}

/// Self-contained unit of work
#[async_trait]
pub trait Task: Send {
    /// Short description for logs
    fn describe(&self) -> String;

    /// Run to completion or failure, recording the outcome in the store
    async fn execute(self: Box<Self>);
}

/// Non-blocking source of tasks
#[async_trait]
pub trait QueueAdapter: Send + Sync {
    /// Claim the next ready task for `worker`, if any
    async fn get(&self, worker: &WorkerId) -> Result<Option<Box<dyn Task>>>;
}

/// Queue adapter over one named queue of an [`IngestStore`]
pub struct StoreQueue {
    queue: QueueName,
    store: Arc<dyn IngestStore>,
    ingest_id: Option<Uuid>,
    factory: Arc<TaskFactory>,
}

impl StoreQueue {
    /// `ingest_id` scopes claims to one ingest; worker hosts pass `None`.
    pub fn new(
        queue: QueueName,
        store: Arc<dyn IngestStore>,
        ingest_id: Option<Uuid>,
        factory: Arc<TaskFactory>,
    ) -> Self {
        Self {
            queue,
            store,
            ingest_id,
            factory,
        }
    }
}

#[async_trait]
impl QueueAdapter for StoreQueue {
    async fn get(&self, worker: &WorkerId) -> Result<Option<Box<dyn Task>>> {
        let claimed = self
            .store
            .claim_task(self.queue, &worker.to_string(), self.ingest_id)
            .await?;

        Ok(claimed.map(|record| self.factory.build(record)))
    }
}
