// Conveyor
// Deployment pipeline orchestration: job graphs, staged promotions, rollback

pub mod execution;
pub mod graph;
pub mod notify;
pub mod promotion;
pub mod rollback;
pub mod store;

// Re-export graph types
pub use graph::{
    ActionRef, GraphError, GraphErrorKind, Job, JobGraph, JobId, RetryPolicy, RunCondition,
};

// Re-export execution types
pub use execution::{
    cancellation, event_channel, CancelHandle, CancelSignal, EventReceiver, EventSender,
    ExecContext, ExecutorError, JobExecutor, JobOutput, JobRun, JobStatus, PipelineEvent,
    PipelineRun, PipelineStatus, RunPurpose, Scheduler, SchedulerConfig,
};

// Re-export promotion types
pub use promotion::{
    ChangeSet, GatePolicy, Promotion, PromotionCoordinator, PromotionPlan, PromotionStatus, Stage,
    StagePlan, StageStatus,
};

// Re-export rollback types
pub use rollback::{
    RollbackAction, RollbackController, RollbackError, RollbackPolicy, RollbackStatus,
    RollbackStrategy,
};

// Re-export notification types
pub use notify::{
    ChannelKind, EventSource, Notification, NotificationChannel, NotificationRouter, QuietHours,
    RouterConfig, Severity,
};

// Re-export state store
pub use store::{StateStore, StoreConfig};
