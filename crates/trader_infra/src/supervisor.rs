//! Bounded restart of account workers.
//!
//! Each attempt runs on its own task so a panic is observed as a failed
//! attempt instead of taking the process down.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, warn};

use crate::config::Tunables;
use crate::worker::{WorkerError, WorkerExit};

/// Doubling delay, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.initial.saturating_mul(1u32 << shift).min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub backoff: Backoff,
    pub max_restarts: u32,
}

impl RestartPolicy {
    pub fn from_tunables(t: &Tunables) -> Self {
        Self {
            backoff: Backoff::new(t.restart_initial_backoff, t.restart_max_backoff),
            max_restarts: t.restart_max_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorExit {
    Completed(WorkerExit),
    GaveUp { restarts: u32, last_error: String },
    Cancelled,
}

/// Run `worker` until it completes, is cancelled, or fails more than
/// `policy.max_restarts` times in a row.
pub async fn supervise<F, Fut>(
    name: &str,
    policy: &RestartPolicy,
    cancel: CancellationToken,
    mut worker: F,
) -> SupervisorExit
where
    F: FnMut(CancellationToken) -> Fut,
    Fut: Future<Output = Result<WorkerExit, WorkerError>> + Send + 'static,
{
    let mut restarts = 0u32;
    loop {
        if cancel.is_cancelled() {
            return SupervisorExit::Cancelled;
        }

        let handle = tokio::spawn(worker(cancel.child_token()).in_current_span());
        let result = match handle.await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(join) if join.is_panic() => Err(format!("worker panicked: {join}")),
            Err(join) => Err(format!("worker aborted: {join}")),
        };

        let err = match result {
            Ok(WorkerExit::Cancelled) => {
                info!(account = %name, "worker cancelled");
                return SupervisorExit::Cancelled;
            }
            Ok(exit) => {
                info!(account = %name, ?exit, "worker finished");
                return SupervisorExit::Completed(exit);
            }
            Err(err) => err,
        };

        if restarts >= policy.max_restarts {
            error!(account = %name, restarts, error = %err, "restart budget exhausted");
            return SupervisorExit::GaveUp {
                restarts,
                last_error: err,
            };
        }
        restarts += 1;
        let delay = policy.backoff.delay(restarts);
        warn!(account = %name, restarts, ?delay, error = %err, "worker failed; restarting");

        let slept = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        };
        if !slept {
            return SupervisorExit::Cancelled;
        }
    }
}
