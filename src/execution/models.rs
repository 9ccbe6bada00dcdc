// Execution Records
// Durable run state for pipelines and their jobs

use crate::graph::{JobGraph, JobId};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::collections::BTreeMap;

/// Lifecycle status of one job within a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Created, dependencies not yet satisfied
    Pending,
    /// Ready to run, handed to a worker but not yet started
    Eligible,
    Running,
    Succeeded,
    Failed,
    /// Condition can never be satisfied; deliberately not a failure
    Skipped,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped | JobStatus::Canceled
        )
    }
}

/// Opaque output produced by a job's executor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOutput {
    pub message: Option<String>,
    pub data: Option<serde_json::Value>,
}

impl JobOutput {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            data: None,
        }
    }
}

/// One job's execution record within a pipeline run.
///
/// Created when the job graph is submitted; mutated only by the scheduler;
/// immutable once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub job_id: JobId,
    pub pipeline_run_id: Uuid,
    pub status: JobStatus,
    /// How many executor invocations were made (retries included)
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub output: Option<JobOutput>,
    /// Human-readable reason for a Failed/Skipped/Canceled terminal state
    pub failure_reason: Option<String>,
}

impl JobRun {
    pub fn new(job_id: impl Into<JobId>, pipeline_run_id: Uuid) -> Self {
        Self {
            job_id: job_id.into(),
            pipeline_run_id,
            status: JobStatus::Pending,
            attempts: 0,
            started_at: None,
            ended_at: None,
            output: None,
            failure_reason: None,
        }
    }
}

/// Why a pipeline run exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunPurpose {
    /// A forward deployment or validation run
    Forward,
    /// A compensating run created by the rollback controller
    Rollback,
}

/// Derived overall status of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStatus {
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PipelineStatus::Running)
    }
}

/// One execution of a job graph.
///
/// The overall status is always computed from the latest job run states,
/// never cached, so readers cannot observe a stale aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub purpose: RunPurpose,
    pub job_runs: BTreeMap<JobId, JobRun>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    /// Create a run with a pending job run per graph node
    pub fn for_graph(graph: &JobGraph, purpose: RunPurpose) -> Self {
        let id = Uuid::new_v4();
        let job_runs = graph
            .job_ids()
            .map(|job_id| (job_id.clone(), JobRun::new(job_id.clone(), id)))
            .collect();

        Self {
            id,
            purpose,
            job_runs,
            created_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Compute the overall status from job run states.
    ///
    /// Running while any job is non-terminal; Succeeded iff every job ended
    /// Succeeded or Skipped; Canceled when cancellation (and no failure)
    /// ended the run; Failed otherwise.
    pub fn status(&self) -> PipelineStatus {
        let mut any_failed = false;
        let mut any_canceled = false;

        for run in self.job_runs.values() {
            match run.status {
                JobStatus::Failed => any_failed = true,
                JobStatus::Canceled => any_canceled = true,
                status if !status.is_terminal() => return PipelineStatus::Running,
                _ => {}
            }
        }

        if any_failed {
            PipelineStatus::Failed
        } else if any_canceled {
            PipelineStatus::Canceled
        } else {
            PipelineStatus::Succeeded
        }
    }

    /// First recorded failure reason among failed jobs, for notifications
    pub fn failure_reason(&self) -> Option<&str> {
        self.job_runs
            .values()
            .filter(|run| run.status == JobStatus::Failed)
            .find_map(|run| run.failure_reason.as_deref())
    }

    pub fn job_run(&self, job_id: &str) -> Option<&JobRun> {
        self.job_runs.get(job_id)
    }
}
