// Execution
// Condition evaluation, the bounded-concurrency scheduler and its event stream

pub mod condition;
pub mod events;
pub mod executor;
pub mod models;
pub mod scheduler;

pub use condition::{evaluate, Eligibility};
pub use events::{event_channel, EmitEvent, EventReceiver, EventSender, PipelineEvent};
pub use executor::{
    cancellation, CancelHandle, CancelSignal, ExecContext, ExecutorError, JobExecutor,
};
pub use models::{JobOutput, JobRun, JobStatus, PipelineRun, PipelineStatus, RunPurpose};
pub use scheduler::{Scheduler, SchedulerConfig};
