//! Cross-stage run state

use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::Predicates;
use crate::config::{ImporterConfig, RunConfig, WorkerTopology};
use crate::container::{ContainerResolver, FsContainerFactory};
use crate::error::{IngestError, Result};
use crate::executor::BulkImportExecutor;
use crate::model::{IngestOperation, IngestStage, IngestUpdate, QueueName};
use crate::prompt::{AutoConfirm, ConfirmationPrompt, InterruptPrompt};
use crate::queue::StoreQueue;
use crate::reporter::{LogReporter, ProgressReporter};
use crate::store::IngestStore;
use crate::tasks::{ScannerRegistry, TaskEnv, TaskFactory};
use crate::upload::{FsUploader, Uploader};

/// Signals shared between the stage machine and its controllers
///
/// Both signals are sticky and idempotent. Abort routes the machine onto the
/// abort path; detach stops the local controller and leaves the ingest
/// itself untouched.
#[derive(Debug, Clone, Default)]
pub struct RunSignals {
    abort: CancellationToken,
    detach: CancellationToken,
    ingest_id: Arc<OnceLock<Uuid>>,
}

impl RunSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.abort.cancel();
    }

    pub fn detach(&self) {
        self.detach.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    pub fn is_detached(&self) -> bool {
        self.detach.is_cancelled()
    }

    /// Resolves once either signal fires
    pub async fn stopped(&self) {
        tokio::select! {
            _ = self.abort.cancelled() => {}
            _ = self.detach.cancelled() => {}
        }
    }

    pub(crate) async fn detached(&self) {
        self.detach.cancelled().await
    }

    /// Id of the ingest this run drives, once known
    pub fn ingest_id(&self) -> Option<Uuid> {
        self.ingest_id.get().copied()
    }

    fn set_ingest_id(&self, id: Uuid) {
        if self.ingest_id.set(id).is_err() && self.ingest_id() != Some(id) {
            warn!(ingest_id = %id, "Run is already bound to another ingest");
        }
    }
}

/// External collaborators of a run
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn IngestStore>,
    pub reporter: Arc<dyn ProgressReporter>,
    pub prompt: Arc<dyn ConfirmationPrompt>,
    pub interrupt_prompt: Arc<dyn InterruptPrompt>,
    pub containers: Arc<dyn ContainerResolver>,
    pub uploader: Arc<dyn Uploader>,
    pub scanners: ScannerRegistry,
}

impl Collaborators {
    /// Filesystem destination below `dest_root`, headless reporting, and
    /// prompts that decline
    pub fn new(store: Arc<dyn IngestStore>, dest_root: impl AsRef<Path>) -> Self {
        let dest_root = dest_root.as_ref();
        Self {
            store,
            reporter: Arc::new(LogReporter::new()),
            prompt: Arc::new(AutoConfirm(false)),
            interrupt_prompt: Arc::new(AutoConfirm(false)),
            containers: Arc::new(FsContainerFactory::new(dest_root)),
            uploader: Arc::new(FsUploader::new(dest_root)),
            scanners: ScannerRegistry::with_defaults(),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn ConfirmationPrompt>) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn with_interrupt_prompt(mut self, prompt: Arc<dyn InterruptPrompt>) -> Self {
        self.interrupt_prompt = prompt;
        self
    }

    pub fn with_scanners(mut self, scanners: ScannerRegistry) -> Self {
        self.scanners = scanners;
        self
    }
}

/// State threaded through every stage
///
/// `ingest` and `executor` are the only fields stages replace.
pub struct Context {
    pub config: RunConfig,
    /// `None` when this process only hosts workers
    pub importer_config: Option<ImporterConfig>,
    pub store: Arc<dyn IngestStore>,
    pub reporter: Arc<dyn ProgressReporter>,
    pub prompt: Arc<dyn ConfirmationPrompt>,
    pub interrupt_prompt: Arc<dyn InterruptPrompt>,
    pub containers: Arc<dyn ContainerResolver>,
    pub uploader: Arc<dyn Uploader>,
    pub scanners: ScannerRegistry,
    pub signals: RunSignals,
    pub ingest: Option<IngestOperation>,
    pub executor: Option<BulkImportExecutor>,
}

impl Context {
    pub fn new(
        config: RunConfig,
        importer_config: Option<ImporterConfig>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            config,
            importer_config,
            store: collaborators.store,
            reporter: collaborators.reporter,
            prompt: collaborators.prompt,
            interrupt_prompt: collaborators.interrupt_prompt,
            containers: collaborators.containers,
            uploader: collaborators.uploader,
            scanners: collaborators.scanners,
            signals: RunSignals::new(),
            ingest: None,
            executor: None,
        }
    }

    pub fn predicates(&self) -> Predicates {
        Predicates {
            worker_mode: self.importer_config.is_none(),
            local_workers: self.config.topology == WorkerTopology::Local,
        }
    }

    pub fn abort(&self) {
        self.signals.abort();
    }

    pub fn ingest(&self) -> Result<&IngestOperation> {
        self.ingest
            .as_ref()
            .ok_or_else(|| IngestError::InvalidStage("no current ingest".to_string()))
    }

    pub fn set_ingest(&mut self, ingest: IngestOperation) {
        self.signals.set_ingest_id(ingest.id);
        self.ingest = Some(ingest);
    }

    /// Persist `update` on the current ingest and refresh the local copy
    ///
    /// When another controller already aborted the ingest the update is
    /// dropped and this run is routed onto the abort path.
    pub async fn update_ingest(&mut self, update: IngestUpdate) -> Result<()> {
        let id = self.ingest()?.id;
        match self.store.update_ingest(id, update).await {
            Ok(()) => {}
            Err(IngestError::StageConflict {
                from: IngestStage::Aborted,
                to,
            }) => {
                warn!(ingest_id = %id, stage = %to, "Ingest was aborted elsewhere");
                self.abort();
            }
            Err(e) => return Err(e),
        }
        self.ingest = Some(self.store.find_ingest(id).await?);
        Ok(())
    }

    pub fn task_env(&self) -> TaskEnv {
        TaskEnv {
            store: self.store.clone(),
            scanners: self.scanners.clone(),
            uploader: self.uploader.clone(),
            heartbeat: self.config.heartbeat_interval(),
        }
    }

    /// Start the worker pool over the discover, scan and work queues
    ///
    /// `scope` limits claims to one ingest; worker hosts pass `None`.
    pub fn start_executor(&mut self, scope: Option<Uuid>) -> Result<()> {
        if self
            .executor
            .as_ref()
            .is_some_and(BulkImportExecutor::is_running)
        {
            debug!("Workers already running");
            return Ok(());
        }

        let factory = Arc::new(TaskFactory::new(self.task_env()));
        let mut executor = BulkImportExecutor::new(self.config.worker_backoff);
        for queue in QueueName::ALL {
            executor.add_queue(
                queue.as_str(),
                Arc::new(StoreQueue::new(
                    queue,
                    self.store.clone(),
                    scope,
                    factory.clone(),
                )),
            )?;
        }
        executor.start(self.config.workers);
        self.executor = Some(executor);
        Ok(())
    }

    /// Poll until `queue` is drained for the current ingest
    ///
    /// Returns `false` when the run was aborted or detached first, including
    /// an abort persisted by another controller. With a
    /// task lease configured, running tasks whose heartbeat expired are
    /// failed on every poll.
    pub async fn wait_until_drained(&self, queue: QueueName) -> Result<bool> {
        let ingest_id = self.ingest()?.id;
        let interval: Duration = self.config.poll_interval;

        loop {
            if self.signals.is_aborted() || self.signals.is_detached() {
                return Ok(false);
            }

            if let Some(lease) = self.config.task_lease {
                let failed = self.store.fail_stale_tasks(ingest_id, lease).await?;
                if failed > 0 {
                    warn!(ingest_id = %ingest_id, failed, "Failed tasks with an expired lease");
                }
            }

            if self.store.find_ingest(ingest_id).await?.stage == IngestStage::Aborted {
                warn!(ingest_id = %ingest_id, "Ingest was aborted elsewhere");
                self.abort();
                return Ok(false);
            }

            if self.store.is_queue_complete(ingest_id, queue).await? {
                return Ok(true);
            }

            tokio::select! {
                _ = self.signals.stopped() => {}
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}
