//! Operator prompts
//!
//! Prompts block the calling thread; the orchestrator runs them on a
//! blocking thread.

use inquire::{Confirm, Select};
use std::fmt;
use tracing::warn;
use uuid::Uuid;

/// Review gate confirmation
pub trait ConfirmationPrompt: Send + Sync {
    fn confirm(&self, message: &str) -> bool;
}

/// What to do when the operator interrupts a run backed by a remote store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptChoice {
    /// Abort the ingest and stop the workers
    Abort,
    /// Stop watching; the ingest keeps running on the remote workers
    Detach,
}

impl fmt::Display for InterruptChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterruptChoice::Abort => write!(f, "Abort the ingest"),
            InterruptChoice::Detach => write!(f, "Detach and keep it running"),
        }
    }
}

pub trait InterruptPrompt: Send + Sync {
    fn choose(&self, ingest_id: Option<Uuid>) -> InterruptChoice;
}

/// Interactive terminal prompts
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalPrompt;

impl ConfirmationPrompt for TerminalPrompt {
    fn confirm(&self, message: &str) -> bool {
        match Confirm::new(message).with_default(false).prompt() {
            Ok(answer) => answer,
            Err(e) => {
                warn!(error = %e, "Confirmation prompt failed; treating as no");
                false
            }
        }
    }
}

impl InterruptPrompt for TerminalPrompt {
    fn choose(&self, ingest_id: Option<Uuid>) -> InterruptChoice {
        let message = match ingest_id {
            Some(id) => format!("Interrupted ingest {}. What now?", id),
            None => "Interrupted. What now?".to_string(),
        };

        match Select::new(
            &message,
            vec![InterruptChoice::Detach, InterruptChoice::Abort],
        )
        .prompt()
        {
            Ok(choice) => choice,
            Err(e) => {
                warn!(error = %e, "Interrupt prompt failed; aborting");
                InterruptChoice::Abort
            }
        }
    }
}

/// Fixed answers for unattended runs and tests
#[derive(Debug, Clone, Copy)]
pub struct AutoConfirm(pub bool);

impl ConfirmationPrompt for AutoConfirm {
    fn confirm(&self, _message: &str) -> bool {
        self.0
    }
}

impl InterruptPrompt for AutoConfirm {
    /// `AutoConfirm(true)` detaches, `AutoConfirm(false)` aborts
    fn choose(&self, _ingest_id: Option<Uuid>) -> InterruptChoice {
        if self.0 {
            InterruptChoice::Detach
        } else {
            InterruptChoice::Abort
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_confirm_answers() {
        assert!(AutoConfirm(true).confirm("continue?"));
        assert!(!AutoConfirm(false).confirm("continue?"));
        assert_eq!(AutoConfirm(true).choose(None), InterruptChoice::Detach);
        assert_eq!(AutoConfirm(false).choose(None), InterruptChoice::Abort);
    }
}
