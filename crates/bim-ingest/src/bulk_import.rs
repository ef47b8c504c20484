//! Orchestration surface
//!
//! [`BulkImport::run`] drives a new ingest (or a worker host) from
//! `Initialize` to `Shutdown`. [`BulkImport::watch`] re-attaches to an
//! existing ingest and resumes from its persisted stage.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{ImporterConfig, RunConfig};
use crate::error::{IngestError, Result};
use crate::prompt::{InterruptChoice, InterruptPrompt};
use crate::reporter::ProgressReporter;
use crate::stage::{Collaborators, Context, RunSignals, StageKind};

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { ingest_id: Uuid },
    Aborted { ingest_id: Option<Uuid> },
    /// The controller stopped; the ingest keeps running on remote workers
    Detached { ingest_id: Option<Uuid> },
    /// A worker host was told to stop
    WorkersStopped,
}

pub struct BulkImport {
    ctx: Context,
    handle_interrupts: bool,
}

impl BulkImport {
    /// Orchestrator for a new ingest of `importer_config`
    pub fn new(
        config: RunConfig,
        importer_config: ImporterConfig,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            ctx: Context::new(config, Some(importer_config), collaborators),
            handle_interrupts: true,
        }
    }

    /// Orchestrator for an existing ingest; see [`BulkImport::watch`]
    pub fn watcher(config: RunConfig, collaborators: Collaborators) -> Self {
        Self {
            ctx: Context::new(config, None, collaborators),
            handle_interrupts: true,
        }
    }

    /// Worker host: runs only the executor until stopped
    pub fn worker(config: RunConfig, collaborators: Collaborators) -> Self {
        Self {
            ctx: Context::new(config, None, collaborators),
            handle_interrupts: true,
        }
    }

    /// Leave interrupt handling to the caller
    pub fn without_interrupt_handler(mut self) -> Self {
        self.handle_interrupts = false;
        self
    }

    /// Handle for aborting or detaching the run from another task
    pub fn signals(&self) -> RunSignals {
        self.ctx.signals.clone()
    }

    /// Request the abort path; takes effect when the current stage returns
    pub fn abort(&self) {
        self.ctx.abort();
    }

    /// Interrupt policy of this run, for callers that deliver their own
    /// interrupts
    pub fn interrupt_handler(&self) -> InterruptHandler {
        let predicates = self.ctx.predicates();
        InterruptHandler {
            signals: self.ctx.signals.clone(),
            reporter: self.ctx.reporter.clone(),
            prompt: self.ctx.interrupt_prompt.clone(),
            worker_mode: predicates.worker_mode,
            local_workers: predicates.local_workers,
        }
    }

    pub async fn run(&mut self) -> Result<RunOutcome> {
        self.drive(StageKind::Initialize).await
    }

    /// Re-attach to `ingest_id` and resume from its persisted stage
    pub async fn watch(&mut self, ingest_id: Uuid) -> Result<RunOutcome> {
        self.ctx.store.initialize().await?;
        let ingest = self.ctx.store.find_ingest(ingest_id).await?;
        let stage = StageKind::resume_from(ingest.stage);
        info!(ingest_id = %ingest_id, persisted = %ingest.stage, resume = %stage, "Watching ingest");

        self.ctx.importer_config = Some(ingest.config.importer_config.clone());
        self.ctx.set_ingest(ingest);
        if !stage.is_terminal() {
            self.ctx.reporter.start(ingest_id);
        }
        if self.ctx.predicates().local_workers {
            self.ctx.start_executor(Some(ingest_id))?;
        }

        self.drive(stage).await
    }

    async fn drive(&mut self, start: StageKind) -> Result<RunOutcome> {
        let listener = self.handle_interrupts.then(|| self.spawn_interrupt_listener());

        let result = self.drive_stages(start).await;
        if let Err(e) = &result {
            error!(error = %e, "Run failed; shutting down");
            if let Err(e) = StageKind::Shutdown.run(&mut self.ctx).await {
                warn!(error = %e, "Shutdown after failure did not complete");
            }
        }

        if let Some(listener) = listener {
            listener.abort();
        }
        result
    }

    async fn drive_stages(&mut self, start: StageKind) -> Result<RunOutcome> {
        let mut stage = start;
        let mut terminal = None;

        loop {
            debug!(stage = %stage, "Running stage");
            stage.run(&mut self.ctx).await?;
            if stage.is_terminal() {
                terminal = Some(stage);
            }

            let signals = &self.ctx.signals;
            let next = if signals.is_detached()
                && !signals.is_aborted()
                && stage != StageKind::Shutdown
            {
                Some(StageKind::Shutdown)
            } else {
                stage.next(&self.ctx)
            };

            match next {
                Some(next) => stage = next,
                None => break,
            }
        }

        let ingest_id = self.ctx.signals.ingest_id();
        if self.ctx.predicates().worker_mode {
            return Ok(RunOutcome::WorkersStopped);
        }
        let aborted = self.ctx.signals.is_aborted();
        match (terminal, ingest_id) {
            (Some(StageKind::Aborted), _) => Ok(RunOutcome::Aborted { ingest_id }),
            // Aborted elsewhere while completing
            (Some(StageKind::Completed), _) if aborted => Ok(RunOutcome::Aborted { ingest_id }),
            (Some(StageKind::Completed), Some(ingest_id)) => Ok(RunOutcome::Completed { ingest_id }),
            _ if self.ctx.signals.is_detached() => Ok(RunOutcome::Detached { ingest_id }),
            _ => Err(IngestError::InvalidStage(
                "run ended without reaching a terminal stage".to_string(),
            )),
        }
    }

    fn spawn_interrupt_listener(&self) -> JoinHandle<()> {
        let handler = self.interrupt_handler();
        tokio::spawn(async move {
            loop {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to install Ctrl+C handler: {}", e);
                    return;
                }
                handler.handle().await;
            }
        })
    }
}

/// Reacts to an operator interrupt
///
/// - worker host: stop the workers after their current tasks
/// - local workers: abort the ingest
/// - remote workers: ask whether to abort or detach
pub struct InterruptHandler {
    signals: RunSignals,
    reporter: Arc<dyn ProgressReporter>,
    prompt: Arc<dyn InterruptPrompt>,
    worker_mode: bool,
    local_workers: bool,
}

impl InterruptHandler {
    pub async fn handle(&self) {
        if self.signals.is_aborted() || self.signals.is_detached() {
            warn!("Already stopping; waiting for running tasks to finish");
            return;
        }

        self.reporter.suspend();

        if self.worker_mode {
            info!("Interrupted; workers stop after their current tasks");
            self.signals.detach();
            return;
        }

        let choice = if self.local_workers {
            InterruptChoice::Abort
        } else {
            let prompt = self.prompt.clone();
            let ingest_id = self.signals.ingest_id();
            tokio::task::spawn_blocking(move || prompt.choose(ingest_id))
                .await
                .unwrap_or_else(|e| {
                    warn!(error = %e, "Interrupt prompt failed; aborting");
                    InterruptChoice::Abort
                })
        };

        match choice {
            InterruptChoice::Abort => {
                warn!("Interrupted; aborting ingest");
                self.signals.abort();
                self.reporter.resume();
            }
            InterruptChoice::Detach => {
                info!(ingest_id = ?self.signals.ingest_id(), "Detaching; the ingest keeps running");
                self.signals.detach();
            }
        }
    }
}
