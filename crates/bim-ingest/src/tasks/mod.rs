//! Task plug-ins for the discover, scan and work queues
//!
//! Every task records its own outcome. Errors inside a task are caught here,
//! at the task boundary, and turned into a `failed` status; they never reach
//! the executor.

mod discover;
mod scan;
mod work;

pub use discover::{discover_scan_paths, DiscoverTask};
pub use scan::{FolderScanner, ScanRequest, ScanTask, Scanner, ScannerRegistry};
pub use work::{build_packfile, WorkTask};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::model::{IngestOperation, IngestStage, TaskPayload, TaskRecord};
use crate::queue::Task;
use crate::store::IngestStore;
use crate::upload::Uploader;

/// Outcome a task reports for its own record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Complete,
    Failed(String),
}

/// Shared handles every task needs
#[derive(Clone)]
pub struct TaskEnv {
    pub store: Arc<dyn IngestStore>,
    pub scanners: ScannerRegistry,
    pub uploader: Arc<dyn Uploader>,
    /// Heartbeat interval while a task runs; `None` disables heartbeats
    pub heartbeat: Option<Duration>,
}

/// Builds executable tasks from claimed task records
pub struct TaskFactory {
    env: TaskEnv,
}

impl TaskFactory {
    pub fn new(env: TaskEnv) -> Self {
        Self { env }
    }

    pub fn build(&self, record: TaskRecord) -> Box<dyn Task> {
        let env = self.env.clone();
        match record.payload.clone() {
            TaskPayload::Discover => Box::new(DiscoverTask::new(env, record)),
            TaskPayload::Scan {
                path,
                scanner,
                context,
            } => Box::new(ScanTask::new(env, record, path, scanner, context)),
            TaskPayload::Work { item_id } => Box::new(WorkTask::new(env, record, item_id)),
        }
    }
}

impl TaskOutcome {
    pub(crate) fn aborted() -> Self {
        TaskOutcome::Failed("ingest aborted".to_string())
    }
}

/// The task's ingest, or `None` once it has been aborted
pub(crate) async fn live_ingest(
    env: &TaskEnv,
    record: &TaskRecord,
) -> anyhow::Result<Option<IngestOperation>> {
    let ingest = env.store.find_ingest(record.ingest_id).await?;
    Ok((ingest.stage != IngestStage::Aborted).then_some(ingest))
}

/// Run `work` for `record`, heartbeating while it runs, and store the outcome
pub(crate) async fn run_task<F>(env: &TaskEnv, record: &TaskRecord, work: F)
where
    F: Future<Output = anyhow::Result<TaskOutcome>>,
{
    let result = match env.heartbeat {
        None => work.await,
        Some(interval) => {
            tokio::pin!(work);
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    result = &mut work => break result,
                    _ = ticker.tick() => {
                        if let Err(e) = env.store.heartbeat(record.id).await {
                            warn!(task_id = %record.id, error = %e, "Heartbeat failed");
                        }
                    }
                }
            }
        }
    };

    let outcome = result.unwrap_or_else(|e| TaskOutcome::Failed(format!("{:#}", e)));
    let queue = record.payload.queue();

    let recorded = match &outcome {
        TaskOutcome::Complete => env.store.complete_task(record.id).await,
        TaskOutcome::Failed(reason) => {
            warn!(task_id = %record.id, %queue, reason = %reason, "Task failed");
            env.store.fail_task(record.id, reason).await
        }
    };

    match recorded {
        Ok(true) => debug!(task_id = %record.id, %queue, outcome = ?outcome, "Task finished"),
        Ok(false) => warn!(
            task_id = %record.id,
            %queue,
            "Task was no longer running when it finished; outcome dropped"
        ),
        Err(e) => error!(task_id = %record.id, %queue, error = %e, "Failed to record task outcome"),
    }
}
