//! Worker pool over named task queues
//!
//! Each worker repeatedly probes the registered queues in registration
//! order and executes the first task it gets. Registration order is a strict
//! priority: a free worker drains earlier queues before touching later ones.
//! Stop is cooperative and checked between tasks only; a running task always
//! finishes first.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::config::DEFAULT_WORKER_BACKOFF;
use crate::error::{IngestError, Result};
use crate::queue::{QueueAdapter, Task, WorkerId};

type Queues = Arc<Vec<(String, Arc<dyn QueueAdapter>)>>;

pub struct BulkImportExecutor {
    queues: Vec<(String, Arc<dyn QueueAdapter>)>,
    backoff: Duration,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    started: bool,
}

impl Default for BulkImportExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_WORKER_BACKOFF)
    }
}

impl BulkImportExecutor {
    pub fn new(backoff: Duration) -> Self {
        Self {
            queues: Vec::new(),
            backoff,
            cancel: CancellationToken::new(),
            workers: Vec::new(),
            started: false,
        }
    }

    /// Register a queue; earlier registrations have higher priority
    pub fn add_queue(&mut self, name: impl Into<String>, queue: Arc<dyn QueueAdapter>) -> Result<()> {
        let name = name.into();
        if self.started {
            return Err(IngestError::executor(format!(
                "cannot add queue '{}' after the workers were started",
                name
            )));
        }
        debug!(queue = %name, priority = self.queues.len(), "Registered queue");
        self.queues.push((name, queue));
        Ok(())
    }

    /// Spawn `worker_count` workers. No effect while already running.
    pub fn start(&mut self, worker_count: usize) {
        if self.started {
            debug!("Executor already started");
            return;
        }
        self.started = true;
        if self.cancel.is_cancelled() {
            self.cancel = CancellationToken::new();
        }

        let queues: Queues = Arc::new(self.queues.clone());
        for _ in 0..worker_count {
            let worker = WorkerId::new();
            let span = tracing::info_span!("worker", worker = %worker);
            let handle = tokio::spawn(
                worker_loop(worker, queues.clone(), self.cancel.clone(), self.backoff)
                    .instrument(span),
            );
            self.workers.push(handle);
        }
        info!(workers = worker_count, queues = self.queues.len(), "Workers started");
    }

    pub fn is_running(&self) -> bool {
        self.started && !self.workers.is_empty()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Token that stops the workers when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop issuing new tasks and wait for every worker to exit
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        self.join().await;
    }

    /// Wait for every worker to exit
    ///
    /// Cancel-safe: a handle is removed only after it has completed.
    pub async fn join(&mut self) {
        while let Some(handle) = self.workers.last_mut() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker terminated abnormally");
            }
            self.workers.pop();
        }
        self.started = false;
    }
}

async fn worker_loop(worker: WorkerId, queues: Queues, cancel: CancellationToken, backoff: Duration) {
    debug!("Worker started");

    while !cancel.is_cancelled() {
        match next_task(&worker, &queues).await {
            Some(task) => {
                let description = task.describe();
                debug!(task = %description, "Executing task");
                task.execute().await;
            }
            None => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }

    debug!("Worker stopped");
}

/// First task from the queues in priority order
async fn next_task(worker: &WorkerId, queues: &Queues) -> Option<Box<dyn Task>> {
    for (name, queue) in queues.iter() {
        match queue.get(worker).await {
            Ok(Some(task)) => return Some(task),
            Ok(None) => {}
            Err(e) => warn!(queue = %name, error = %e, "Failed to poll queue"),
        }
    }
    None
}
