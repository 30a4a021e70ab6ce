//! Cooperative sleep abstraction.
//!
//! Every wait in a run (Wait verdicts, obstacle settle delays, retry
//! pauses) goes through one [`Sleeper`] so cancellation behaves the same
//! everywhere. A sleep races the run's cancellation token; cancellation
//! wins immediately.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Outcome of a cooperative sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    /// The full duration elapsed.
    Elapsed,
    /// The run was cancelled mid-sleep.
    Cancelled,
}

/// Cancellation-aware sleeper bound to one run.
#[derive(Debug, Clone)]
pub struct Sleeper {
    cancel: CancellationToken,
}

impl Sleeper {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Sleeper that can never be cancelled (tests, standalone tools).
    pub fn detached() -> Self {
        Self {
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Sleep for `duration`, returning early on cancellation.
    pub async fn sleep(&self, duration: Duration) -> SleepOutcome {
        tokio::select! {
            () = self.cancel.cancelled() => SleepOutcome::Cancelled,
            () = tokio::time::sleep(duration) => SleepOutcome::Elapsed,
        }
    }

    /// Sleep for `ms` milliseconds.
    pub async fn sleep_ms(&self, ms: u64) -> SleepOutcome {
        self.sleep(Duration::from_millis(ms)).await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
