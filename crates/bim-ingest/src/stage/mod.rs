//! Orchestrator state machine
//!
//! ```text
//! Initialize ─┬─ worker host ──▶ StartWorkers ──▶ Shutdown
//!             └─▶ CreateIngest ─┬─ local workers ──▶ StartWorkers ─┐
//!                               └──────────────────────────────────┴─▶ WaitForDiscover
//! WaitForDiscover ──▶ WaitForScan ──▶ Review ──▶ Process ──▶ Completed ──▶ Shutdown
//!                          any stage ── abort ──▶ Aborted ──▶ Shutdown
//! ```
//!
//! Each stage runs one phase against the shared [`Context`]; the next stage
//! is a pure function of the stage kind, two run predicates and the abort
//! flag. Abort is checked uniformly when the next stage is chosen, never
//! inside a stage's own logic.

mod context;
mod stages;

pub use context::{Collaborators, Context, RunSignals};

use std::fmt;

use crate::error::Result;
use crate::model::IngestStage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Initialize,
    StartWorkers,
    CreateIngest,
    WaitForDiscover,
    WaitForScan,
    Review,
    Process,
    Completed,
    Aborted,
    Shutdown,
}

impl StageKind {
    pub const ALL: [StageKind; 10] = [
        StageKind::Initialize,
        StageKind::StartWorkers,
        StageKind::CreateIngest,
        StageKind::WaitForDiscover,
        StageKind::WaitForScan,
        StageKind::Review,
        StageKind::Process,
        StageKind::Completed,
        StageKind::Aborted,
        StageKind::Shutdown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Initialize => "initialize",
            StageKind::StartWorkers => "start_workers",
            StageKind::CreateIngest => "create_ingest",
            StageKind::WaitForDiscover => "wait_for_discover",
            StageKind::WaitForScan => "wait_for_scan",
            StageKind::Review => "review",
            StageKind::Process => "process",
            StageKind::Completed => "completed",
            StageKind::Aborted => "aborted",
            StageKind::Shutdown => "shutdown",
        }
    }

    /// Terminal outcome of an ingest
    pub fn is_terminal(&self) -> bool {
        matches!(self, StageKind::Completed | StageKind::Aborted)
    }

    /// Stage that resumes an ingest persisted in `stage`
    pub fn resume_from(stage: IngestStage) -> StageKind {
        match stage {
            IngestStage::Scan => StageKind::WaitForDiscover,
            IngestStage::Review => StageKind::Review,
            IngestStage::Processing => StageKind::Process,
            IngestStage::Complete => StageKind::Completed,
            IngestStage::Aborted => StageKind::Aborted,
        }
    }

    /// Run this stage's phase
    pub async fn run(self, ctx: &mut Context) -> Result<()> {
        match self {
            StageKind::Initialize => stages::initialize(ctx).await,
            StageKind::StartWorkers => stages::start_workers(ctx).await,
            StageKind::CreateIngest => stages::create_ingest(ctx).await,
            StageKind::WaitForDiscover => stages::wait_for_discover(ctx).await,
            StageKind::WaitForScan => stages::wait_for_scan(ctx).await,
            StageKind::Review => stages::review(ctx).await,
            StageKind::Process => stages::process(ctx).await,
            StageKind::Completed => stages::completed(ctx).await,
            StageKind::Aborted => stages::aborted(ctx).await,
            StageKind::Shutdown => stages::shutdown(ctx).await,
        }
    }

    /// Stage to run after this one, `None` once the machine is done
    pub fn next(self, ctx: &Context) -> Option<StageKind> {
        next_stage(self, &ctx.predicates(), ctx.signals.is_aborted())
    }

    /// Request the abort path; idempotent
    pub fn abort(self, ctx: &Context) {
        ctx.abort();
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Facts about the run that steer the transition table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Predicates {
    /// This process only hosts workers
    pub worker_mode: bool,
    /// Workers run inside the orchestrator process
    pub local_workers: bool,
}

/// Transition table
pub fn next_stage(kind: StageKind, predicates: &Predicates, aborted: bool) -> Option<StageKind> {
    use StageKind::*;

    if aborted && !matches!(kind, Completed | Aborted | Shutdown) {
        return Some(Aborted);
    }

    match kind {
        Initialize if predicates.worker_mode => Some(StartWorkers),
        Initialize => Some(CreateIngest),
        StartWorkers if predicates.worker_mode => Some(Shutdown),
        StartWorkers => Some(WaitForDiscover),
        CreateIngest if predicates.local_workers => Some(StartWorkers),
        CreateIngest => Some(WaitForDiscover),
        WaitForDiscover => Some(WaitForScan),
        WaitForScan => Some(Review),
        Review => Some(Process),
        Process => Some(Completed),
        Completed | Aborted => Some(Shutdown),
        Shutdown => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use StageKind::*;

    const ORCHESTRATOR_LOCAL: Predicates = Predicates {
        worker_mode: false,
        local_workers: true,
    };
    const ORCHESTRATOR_REMOTE: Predicates = Predicates {
        worker_mode: false,
        local_workers: false,
    };
    const WORKER_HOST: Predicates = Predicates {
        worker_mode: true,
        local_workers: true,
    };

    fn path(start: StageKind, predicates: &Predicates) -> Vec<StageKind> {
        let mut stages = vec![start];
        let mut current = start;
        while let Some(next) = next_stage(current, predicates, false) {
            assert!(stages.len() < StageKind::ALL.len() + 1, "machine loops");
            stages.push(next);
            current = next;
        }
        stages
    }

    #[test]
    fn test_local_orchestrator_path() {
        assert_eq!(
            path(Initialize, &ORCHESTRATOR_LOCAL),
            vec![
                Initialize,
                CreateIngest,
                StartWorkers,
                WaitForDiscover,
                WaitForScan,
                Review,
                Process,
                Completed,
                Shutdown
            ]
        );
    }

    #[test]
    fn test_remote_orchestrator_skips_worker_start() {
        assert_eq!(
            path(Initialize, &ORCHESTRATOR_REMOTE),
            vec![
                Initialize,
                CreateIngest,
                WaitForDiscover,
                WaitForScan,
                Review,
                Process,
                Completed,
                Shutdown
            ]
        );
    }

    #[test]
    fn test_worker_host_path() {
        assert_eq!(
            path(Initialize, &WORKER_HOST),
            vec![Initialize, StartWorkers, Shutdown]
        );
    }

    #[test]
    fn test_abort_overrides_every_non_terminal_stage() {
        for predicates in [ORCHESTRATOR_LOCAL, ORCHESTRATOR_REMOTE, WORKER_HOST] {
            for kind in StageKind::ALL {
                let next = next_stage(kind, &predicates, true);
                match kind {
                    Completed | Aborted => assert_eq!(next, Some(Shutdown)),
                    Shutdown => assert_eq!(next, None),
                    _ => assert_eq!(next, Some(Aborted), "{kind} ignored abort"),
                }
            }
        }
    }

    #[test]
    fn test_every_path_reaches_exactly_one_terminal_stage() {
        for predicates in [ORCHESTRATOR_LOCAL, ORCHESTRATOR_REMOTE] {
            for start in StageKind::ALL {
                for abort_at in StageKind::ALL {
                    let mut current = start;
                    let mut aborted = false;
                    let mut terminals = Vec::new();
                    let mut steps = 0;
                    loop {
                        if current.is_terminal() {
                            terminals.push(current);
                        }
                        if current == abort_at {
                            aborted = true;
                        }
                        match next_stage(current, &predicates, aborted) {
                            Some(next) => current = next,
                            None => break,
                        }
                        steps += 1;
                        assert!(steps <= 2 * StageKind::ALL.len(), "machine loops");
                    }
                    if start != Shutdown {
                        assert_eq!(terminals.len(), 1, "{start} aborting at {abort_at}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_resume_table() {
        assert_eq!(StageKind::resume_from(IngestStage::Scan), WaitForDiscover);
        assert_eq!(StageKind::resume_from(IngestStage::Review), Review);
        assert_eq!(StageKind::resume_from(IngestStage::Processing), Process);
        assert_eq!(StageKind::resume_from(IngestStage::Complete), Completed);
        assert_eq!(StageKind::resume_from(IngestStage::Aborted), Aborted);
    }
}
