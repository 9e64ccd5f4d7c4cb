//! Delayed one-shot tasks
//!
//! Trigger-based reporting schedules work a fixed delay after the console call
//! that armed it. Scheduled tasks are fire-and-forget and cannot be cancelled.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

/// Work to run once the delay elapses
pub type ScheduledTask = Box<dyn FnOnce() + Send + 'static>;

/// Runs a task after a delay without blocking the caller
pub trait TaskScheduler: Send + Sync + Debug {
    fn schedule(&self, delay: Duration, task: ScheduledTask);
}

pub type SharedScheduler = Arc<dyn TaskScheduler>;

/// Scheduler backed by `tokio::time::sleep` on the ambient runtime.
///
/// Outside a runtime there is no timer to arm, so the task is dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl TaskScheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: ScheduledTask) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    task();
                });
            }
            Err(_) => {
                tracing::debug!(?delay, "no async runtime; scheduled task dropped");
            }
        }
    }
}
