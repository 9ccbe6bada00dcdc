// Lifecycle Events
// Ordered event stream emitted on every pipeline, stage and rollback transition

use crate::execution::models::{JobStatus, PipelineStatus, RunPurpose};
use crate::promotion::GatePolicy;
use crate::rollback::RollbackStrategy;

use tokio::sync::mpsc;
use uuid::Uuid;

use std::time::Duration;

/// Sender half of a lifecycle event channel
pub type EventSender = mpsc::UnboundedSender<PipelineEvent>;

/// Receiver half of a lifecycle event channel
pub type EventReceiver = mpsc::UnboundedReceiver<PipelineEvent>;

/// Create a new lifecycle event channel.
///
/// Events for a given pipeline run are sent from its single scheduling loop,
/// so the channel preserves the order of the underlying state transitions.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted by the scheduler, promotion coordinator and rollback
/// controller. The notification router consumes these; dashboards may too.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A pipeline run started executing
    RunStarted {
        run_id: Uuid,
        purpose: RunPurpose,
        total_jobs: usize,
    },

    /// A job's executor was invoked
    JobStarted {
        run_id: Uuid,
        job_id: String,
        attempt: u32,
    },

    /// A job reached a terminal state
    JobCompleted {
        run_id: Uuid,
        job_id: String,
        status: JobStatus,
        attempts: u32,
        duration: Duration,
    },

    /// A job's condition became unsatisfiable
    JobSkipped {
        run_id: Uuid,
        job_id: String,
        reason: String,
    },

    /// A pipeline run reached a terminal state
    RunCompleted {
        run_id: Uuid,
        purpose: RunPurpose,
        status: PipelineStatus,
        duration: Duration,
        reason: Option<String>,
    },

    /// A promotion stage started its validation/deploy run
    StageStarted {
        promotion_id: Uuid,
        stage_id: Uuid,
        stage_name: String,
        order: usize,
    },

    /// A stage run succeeded and is blocked on its approval gate
    StageAwaitingApproval {
        promotion_id: Uuid,
        stage_id: Uuid,
        stage_name: String,
        gate: GatePolicy,
    },

    /// An approval was recorded against a waiting stage
    ApprovalRecorded {
        stage_id: Uuid,
        approver: String,
        approvals: u32,
        required: u32,
    },

    /// A rejection was recorded against a waiting stage
    RejectionRecorded {
        stage_id: Uuid,
        approver: String,
        reason: String,
    },

    /// A stage passed its gate; the next stage may start
    StageAdvanced {
        promotion_id: Uuid,
        stage_id: Uuid,
        stage_name: String,
    },

    /// A stage failed, was rejected, or its gate timed out
    StageHalted {
        promotion_id: Uuid,
        stage_id: Uuid,
        stage_name: String,
        is_production: bool,
        reason: String,
    },

    /// The terminal stage advanced; the promotion is complete
    PromotionCompleted {
        promotion_id: Uuid,
        change_set_id: String,
    },

    /// A compensating run was scheduled for a halted stage
    RollbackStarted {
        action_id: Uuid,
        stage_id: Uuid,
        strategy: RollbackStrategy,
    },

    /// A compensating run finished
    RollbackCompleted {
        action_id: Uuid,
        stage_id: Uuid,
        strategy: RollbackStrategy,
        succeeded: bool,
    },

    /// No rollback strategy was executable; manual intervention required
    RollbackUnavailable {
        stage_id: Uuid,
        stage_name: String,
        is_production: bool,
        reason: String,
    },
}

impl PipelineEvent {
    pub fn run_started(run_id: Uuid, purpose: RunPurpose, total_jobs: usize) -> Self {
        Self::RunStarted {
            run_id,
            purpose,
            total_jobs,
        }
    }

    pub fn job_started(run_id: Uuid, job_id: impl Into<String>, attempt: u32) -> Self {
        Self::JobStarted {
            run_id,
            job_id: job_id.into(),
            attempt,
        }
    }

    pub fn job_completed(
        run_id: Uuid,
        job_id: impl Into<String>,
        status: JobStatus,
        attempts: u32,
        duration: Duration,
    ) -> Self {
        Self::JobCompleted {
            run_id,
            job_id: job_id.into(),
            status,
            attempts,
            duration,
        }
    }

    pub fn job_skipped(run_id: Uuid, job_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::JobSkipped {
            run_id,
            job_id: job_id.into(),
            reason: reason.into(),
        }
    }

    pub fn run_completed(
        run_id: Uuid,
        purpose: RunPurpose,
        status: PipelineStatus,
        duration: Duration,
        reason: Option<String>,
    ) -> Self {
        Self::RunCompleted {
            run_id,
            purpose,
            status,
            duration,
            reason,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EmitEvent {
    fn emit(&self, event: PipelineEvent);
}

impl EmitEvent for EventSender {
    fn emit(&self, event: PipelineEvent) {
        let _ = self.send(event);
    }
}

impl EmitEvent for Option<EventSender> {
    fn emit(&self, event: PipelineEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}
