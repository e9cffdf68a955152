//! Lifecycle hooks and the bounded-wait executor.
//!
//! A hook body runs on its own detached OS thread and reports completion by
//! dropping a oneshot sender. The executor races that against a deadline;
//! on timeout it stops waiting, but the hook keeps running.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error};

/// Error type returned by hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A zero-argument fallible lifecycle callback.
pub type Hook = Arc<dyn Fn() -> Result<(), BoxError> + Send + Sync>;

/// Wrap a closure as a [`Hook`].
pub fn hook<F>(f: F) -> Hook
where
    F: Fn() -> Result<(), BoxError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// How a bounded wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The work signalled completion before the deadline.
    Completed,
    /// The deadline elapsed first; the work may still be running.
    TimedOut,
}

/// Run `work` and wait for its completion signal for at most `wait`.
///
/// `work` receives the deadline and returns a receiver that resolves when
/// the work is done, whether by a send or by the sender being dropped.
pub async fn execute_with_timeout<W>(action: &str, wait: Duration, work: W) -> Outcome
where
    W: FnOnce(Instant) -> oneshot::Receiver<()>,
{
    let deadline = Instant::now() + wait;
    let done = work(deadline);

    tokio::select! {
        _ = done => {
            debug!(action, "Hooks completed");
            Outcome::Completed
        }
        _ = tokio::time::sleep_until(deadline) => {
            error!(
                pid = std::process::id(),
                action,
                wait_ms = wait.as_millis() as u64,
                "Hook execution timed out"
            );
            Outcome::TimedOut
        }
    }
}

/// Run `chain` in order on a detached thread.
///
/// A failing hook is logged and does not stop the ones after it. The
/// returned receiver resolves once the last hook returns.
pub(crate) fn spawn_chain(action: &str, chain: Vec<(&'static str, Hook)>) -> oneshot::Receiver<()> {
    let (done, rx) = oneshot::channel::<()>();
    let pid = std::process::id();
    let thread_action = action.to_string();

    let spawned = std::thread::Builder::new()
        .name(format!("molt-{action}"))
        .spawn(move || {
            let _done = done;
            for (name, hook) in chain {
                if let Err(e) = hook() {
                    error!(pid, action = %thread_action, hook = name, error = %e, "Hook failed");
                }
            }
        });

    if let Err(e) = spawned {
        // The closure, and the sender with it, was dropped, so `rx` resolves
        // immediately.
        error!(pid, action, error = %e, "Failed to start hook thread");
    }

    rx
}
