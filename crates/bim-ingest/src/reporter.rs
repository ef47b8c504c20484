//! Progress reporting
//!
//! The stage machine drives a reporter through its lifecycle at phase
//! boundaries: `start` once the ingest exists, `suspend` while the operator
//! is prompted, `resume` afterwards, `begin_processing` when work tasks are
//! queued, and `shutdown` at the end. Reporters poll the store on their own;
//! they never block the stage machine.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::container::ContainerSummary;
use crate::model::{ItemSummary, QueueCounts, QueueName};
use crate::store::IngestStore;

/// Outcome of the process phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessSummary {
    pub work: QueueCounts,
    pub files_uploaded: u64,
    pub files_failed: u64,
    pub elapsed: Option<Duration>,
}

pub trait ProgressReporter: Send + Sync {
    fn start(&self, ingest_id: Uuid);
    fn suspend(&self);
    fn resume(&self);
    fn begin_processing(&self);
    fn shutdown(&self);
    fn is_running(&self) -> bool;
    fn report_review_summary(&self, items: &ItemSummary, containers: &ContainerSummary);
    fn report_process_summary(&self, summary: &ProcessSummary);
}

/// Format bytes into human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Scan,
    Process,
}

impl Phase {
    fn queue(self) -> QueueName {
        match self {
            Phase::Scan => QueueName::Scan,
            Phase::Process => QueueName::Work,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Phase::Scan => "Scanning",
            Phase::Process => "Uploading",
        }
    }
}

struct TerminalState {
    ingest_id: Option<Uuid>,
    phase: Phase,
    bar: Option<ProgressBar>,
    poller: Option<JoinHandle<()>>,
}

/// Progress bar over the store's queue counts
pub struct TerminalReporter {
    store: Arc<dyn IngestStore>,
    poll_interval: Duration,
    state: Arc<Mutex<TerminalState>>,
}

impl TerminalReporter {
    pub fn new(store: Arc<dyn IngestStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
            state: Arc::new(Mutex::new(TerminalState {
                ingest_id: None,
                phase: Phase::Scan,
                bar: None,
                poller: None,
            })),
        }
    }

    fn create_bar(phase: Phase) -> ProgressBar {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{msg}\n{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta})",
        )
        .map(|style| style.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        bar.set_message(phase.label());
        bar.enable_steady_tick(Duration::from_millis(100));
        bar
    }

    fn spawn_poller(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let state = self.state.clone();
        let interval = self.poll_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let (ingest_id, phase) = {
                    let state = lock(&state);
                    match state.ingest_id {
                        Some(id) => (id, state.phase),
                        None => break,
                    }
                };

                match store.queue_counts(ingest_id, phase.queue()).await {
                    Ok(counts) => {
                        let state = lock(&state);
                        if let Some(bar) = &state.bar {
                            bar.set_length(counts.total());
                            bar.set_position(counts.finished());
                            if counts.failed > 0 {
                                bar.set_message(format!(
                                    "{} ({} failed)",
                                    phase.label(),
                                    counts.failed
                                ));
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to poll progress"),
                }
            }
        })
    }
}

impl ProgressReporter for TerminalReporter {
    fn start(&self, ingest_id: Uuid) {
        {
            let mut state = lock(&self.state);
            if state.ingest_id.is_some() {
                return;
            }
            state.ingest_id = Some(ingest_id);
            state.bar = Some(Self::create_bar(state.phase));
        }
        let poller = self.spawn_poller();
        lock(&self.state).poller = Some(poller);
    }

    fn suspend(&self) {
        if let Some(bar) = &lock(&self.state).bar {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        }
    }

    fn resume(&self) {
        if let Some(bar) = &lock(&self.state).bar {
            bar.set_draw_target(ProgressDrawTarget::stderr());
        }
    }

    fn begin_processing(&self) {
        let mut state = lock(&self.state);
        state.phase = Phase::Process;
        if let Some(bar) = state.bar.take() {
            bar.finish_and_clear();
        }
        if state.ingest_id.is_some() {
            state.bar = Some(Self::create_bar(Phase::Process));
        }
    }

    fn shutdown(&self) {
        let mut state = lock(&self.state);
        state.ingest_id = None;
        if let Some(poller) = state.poller.take() {
            poller.abort();
        }
        if let Some(bar) = state.bar.take() {
            bar.finish_and_clear();
        }
    }

    fn is_running(&self) -> bool {
        lock(&self.state).ingest_id.is_some()
    }

    fn report_review_summary(&self, items: &ItemSummary, containers: &ContainerSummary) {
        let print = || {
            println!();
            println!("Scan summary");
            println!("  Items:      {}", items.items);
            println!("  Files:      {}", items.files);
            println!("  Size:       {}", format_bytes(items.bytes));
            if items.packfiles > 0 {
                println!("  Packfiles:  {}", items.packfiles);
            }
            if items.with_errors > 0 {
                println!("  With errors: {}", items.with_errors);
            }
            println!();
            println!("Containers");
            for (level, count) in &containers.levels {
                println!(
                    "  {:<12} {} existing, {} new",
                    level.as_str(),
                    count.existing,
                    count.new
                );
            }
            println!();
        };

        match &lock(&self.state).bar {
            Some(bar) => bar.suspend(print),
            None => print(),
        }
    }

    fn report_process_summary(&self, summary: &ProcessSummary) {
        let print = || {
            println!();
            println!("Process summary");
            println!("  Work tasks: {} complete, {} failed", summary.work.complete, summary.work.failed);
            println!("  Files:      {} uploaded, {} failed", summary.files_uploaded, summary.files_failed);
            if let Some(elapsed) = summary.elapsed {
                println!("  Elapsed:    {:.1}s", elapsed.as_secs_f64());
            }
            println!();
        };

        match &lock(&self.state).bar {
            Some(bar) => bar.suspend(print),
            None => print(),
        }
    }
}

/// Reporter for headless runs: every report is a tracing event
#[derive(Debug, Default)]
pub struct LogReporter {
    ingest_id: Mutex<Option<Uuid>>,
}

impl LogReporter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressReporter for LogReporter {
    fn start(&self, ingest_id: Uuid) {
        *lock(&self.ingest_id) = Some(ingest_id);
        info!(ingest_id = %ingest_id, "Progress reporting started");
    }

    fn suspend(&self) {}

    fn resume(&self) {}

    fn begin_processing(&self) {
        if let Some(ingest_id) = *lock(&self.ingest_id) {
            info!(ingest_id = %ingest_id, "Processing started");
        }
    }

    fn shutdown(&self) {
        lock(&self.ingest_id).take();
    }

    fn is_running(&self) -> bool {
        lock(&self.ingest_id).is_some()
    }

    fn report_review_summary(&self, items: &ItemSummary, containers: &ContainerSummary) {
        info!(
            items = items.items,
            files = items.files,
            bytes = items.bytes,
            packfiles = items.packfiles,
            with_errors = items.with_errors,
            new_containers = containers.new_containers(),
            "Scan summary"
        );
    }

    fn report_process_summary(&self, summary: &ProcessSummary) {
        info!(
            complete = summary.work.complete,
            failed = summary.work.failed,
            files_uploaded = summary.files_uploaded,
            files_failed = summary.files_failed,
            elapsed_secs = summary.elapsed.map(|elapsed| elapsed.as_secs_f64()),
            "Process summary"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
        assert_eq!(format_bytes(1099511627776), "1.00 TB");
    }

    #[test]
    fn test_log_reporter_lifecycle() {
        let reporter = LogReporter::new();
        assert!(!reporter.is_running());
        reporter.start(Uuid::new_v4());
        assert!(reporter.is_running());
        reporter.begin_processing();
        reporter.shutdown();
        assert!(!reporter.is_running());
    }

    #[tokio::test]
    async fn test_terminal_reporter_lifecycle() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let reporter = TerminalReporter::new(store, Duration::from_millis(10));

        reporter.start(Uuid::new_v4());
        assert!(reporter.is_running());
        reporter.suspend();
        reporter.resume();
        reporter.begin_processing();
        tokio::time::sleep(Duration::from_millis(30)).await;
        reporter.shutdown();
        assert!(!reporter.is_running());
    }
}
