// Job Executor Interface
// The injected capability through which external job logic enters the core

use crate::execution::models::JobOutput;
use crate::graph::Job;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use std::sync::OnceLock;
use std::time::Duration;

/// Error returned by a job's external action.
///
/// Contained at the job level: it marks the job run Failed and never
/// crashes the scheduler or aborts unrelated pipelines.
#[derive(Debug, Clone, Error)]
pub enum ExecutorError {
    #[error("action failed: {0}")]
    ActionFailed(String),
    #[error("action timed out after {0:?}")]
    TimedOut(Duration),
    #[error("action canceled")]
    Canceled,
}

impl ExecutorError {
    pub fn action_failed(reason: impl Into<String>) -> Self {
        Self::ActionFailed(reason.into())
    }
}

/// Create a linked cancellation handle/signal pair.
///
/// The handle side cancels; the signal side is cloned into every worker and
/// executor context for the run.
pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

/// Requests cancellation of one pipeline run
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

/// Observes cancellation of one pipeline run
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    /// A signal that never fires, for runs without external cancellation.
    ///
    /// All callers share one channel whose sender lives in a static, so the
    /// channel never closes and repeated calls allocate nothing new.
    pub fn never() -> Self {
        static NEVER: OnceLock<(watch::Sender<bool>, watch::Receiver<bool>)> = OnceLock::new();
        let (_tx, rx) = NEVER.get_or_init(|| watch::channel(false));
        Self { rx: rx.clone() }
    }

    pub fn is_canceled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested (or the handle is dropped
    /// without canceling, in which case this pends forever)
    pub async fn canceled(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Handle dropped without canceling; nothing can fire now.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Per-invocation context handed to the executor
#[derive(Debug, Clone)]
pub struct ExecContext {
    pub pipeline_run_id: Uuid,
    /// 1-based attempt counter (see `RetryPolicy`)
    pub attempt: u32,
    pub cancel: CancelSignal,
}

/// External collaborator wrapping the actual build/test/deploy tooling.
///
/// The engine never knows what a job does; it hands over the `Job` (whose
/// `action` handle the implementation interprets) and records the outcome.
/// Implementations must respect `ctx.cancel` and return within the job's
/// declared timeout.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &Job, ctx: ExecContext) -> Result<JobOutput, ExecutorError>;
}
