// Execution Scheduler
// Drives a job graph to completion with bounded concurrency

use crate::execution::condition::{self, Eligibility};
use crate::execution::events::{EmitEvent, EventSender, PipelineEvent};
use crate::execution::executor::{CancelSignal, ExecContext, ExecutorError, JobExecutor};
use crate::execution::models::{JobOutput, JobStatus, PipelineRun, RunPurpose};
use crate::graph::{Job, JobGraph};
use crate::store::StateStore;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for graph execution
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    /// Maximum jobs running at once (None = unbounded; dependencies are the
    /// only serialization by default)
    pub max_parallel: Option<usize>,
}

/// Executes job graphs against the state store.
///
/// The scheduling loop is the single serialization point per run: all job
/// state transitions, condition re-evaluation and store writes happen on it,
/// so two near-simultaneous completions can never race to an inconsistent
/// ready-set.
pub struct Scheduler {
    store: Arc<StateStore>,
    config: SchedulerConfig,
    events: Option<EventSender>,
}

/// What a worker task reports back to the scheduling loop
struct TaskOutcome {
    job_id: String,
    attempts: u32,
    /// When the worker actually began executing; None if it never started
    started_at: Option<DateTime<Utc>>,
    result: Result<JobOutput, ExecutorError>,
}

impl Scheduler {
    pub fn new(store: Arc<StateStore>) -> Self {
        Self {
            store,
            config: SchedulerConfig::default(),
            events: None,
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Execute the graph until no job is pending, eligible or running.
    ///
    /// Executor errors are contained: the job is marked Failed and the rest
    /// of the graph keeps evaluating (an `on-failure` branch may still need
    /// to run). Cancellation marks pending jobs Canceled and aborts running
    /// executors.
    pub async fn run(
        &self,
        graph: &JobGraph,
        executor: Arc<dyn JobExecutor>,
        purpose: RunPurpose,
        mut cancel: CancelSignal,
    ) -> PipelineRun {
        let started = std::time::Instant::now();
        let mut run = PipelineRun::for_graph(graph, purpose);
        self.store.put_run(run.clone()).await;
        self.events
            .emit(PipelineEvent::run_started(run.id, purpose, graph.len()));

        let permits = self
            .config
            .max_parallel
            .unwrap_or(Semaphore::MAX_PERMITS)
            .max(1);
        let semaphore = Arc::new(Semaphore::new(permits));

        let (task_tx, mut task_rx) = mpsc::unbounded_channel::<String>();
        let mut join_set: JoinSet<TaskOutcome> = JoinSet::new();
        let mut task_ids: HashMap<tokio::task::Id, String> = HashMap::new();
        let mut canceled = false;

        loop {
            if !canceled {
                self.dispatch_ready(
                    graph,
                    &mut run,
                    &executor,
                    &semaphore,
                    &task_tx,
                    &cancel,
                    &mut join_set,
                    &mut task_ids,
                )
                .await;
            }

            if join_set.is_empty() {
                break;
            }

            tokio::select! {
                _ = cancel.canceled(), if !canceled => {
                    canceled = true;
                    self.cancel_pending(&mut run).await;
                    join_set.abort_all();
                }
                Some(job_id) = task_rx.recv() => {
                    self.mark_running(&mut run, &job_id).await;
                }
                Some(joined) = join_set.join_next_with_id() => {
                    match joined {
                        Ok((id, outcome)) => {
                            task_ids.remove(&id);
                            self.record_outcome(&mut run, outcome).await;
                        }
                        Err(err) => {
                            // Aborted or panicked worker; resolve the job id
                            // from the task id we recorded at spawn.
                            if let Some(job_id) = task_ids.remove(&err.id()) {
                                let reason = if err.is_panic() {
                                    "job worker panicked".to_string()
                                } else {
                                    "job canceled".to_string()
                                };
                                let status = if err.is_panic() {
                                    JobStatus::Failed
                                } else {
                                    JobStatus::Canceled
                                };
                                self.finish_job(&mut run, &job_id, status, 0, None, Some(reason))
                                    .await;
                            }
                        }
                    }
                }
            }
        }

        run.ended_at = Some(Utc::now());
        self.store.put_run(run.clone()).await;
        let reason = run.failure_reason().map(|r| r.to_string());
        self.events.emit(PipelineEvent::run_completed(
            run.id,
            purpose,
            run.status(),
            started.elapsed(),
            reason,
        ));
        run
    }

    /// Recompute the ready-set and spawn every newly eligible job.
    ///
    /// Skips cascade, so the pass repeats until it stops making progress.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch_ready(
        &self,
        graph: &JobGraph,
        run: &mut PipelineRun,
        executor: &Arc<dyn JobExecutor>,
        semaphore: &Arc<Semaphore>,
        task_tx: &mpsc::UnboundedSender<String>,
        cancel: &CancelSignal,
        join_set: &mut JoinSet<TaskOutcome>,
        task_ids: &mut HashMap<tokio::task::Id, String>,
    ) {
        let mut progressed = true;
        while progressed {
            progressed = false;

            let mut ready = Vec::new();
            let mut skipped = Vec::new();
            for job in graph.jobs() {
                let pending = run
                    .job_run(&job.id)
                    .map(|r| r.status == JobStatus::Pending)
                    .unwrap_or(false);
                if !pending {
                    continue;
                }
                match condition::evaluate(job, &run.job_runs) {
                    Eligibility::Ready => ready.push(job.clone()),
                    Eligibility::Skip => skipped.push(job.id.clone()),
                    Eligibility::Blocked => {}
                }
            }

            for job_id in skipped {
                progressed = true;
                self.finish_job(
                    run,
                    &job_id,
                    JobStatus::Skipped,
                    0,
                    None,
                    Some("run condition can no longer be satisfied".to_string()),
                )
                .await;
                self.events.emit(PipelineEvent::job_skipped(
                    run.id,
                    job_id,
                    "run condition can no longer be satisfied",
                ));
            }

            for job in ready {
                if let Some(job_run) = run.job_runs.get_mut(&job.id) {
                    job_run.status = JobStatus::Eligible;
                }
                self.store.put_run(run.clone()).await;

                let handle = join_set.spawn(execute_job(
                    job.clone(),
                    executor.clone(),
                    semaphore.clone(),
                    task_tx.clone(),
                    cancel.clone(),
                    run.id,
                ));
                task_ids.insert(handle.id(), job.id.clone());
            }
        }
    }

    async fn mark_running(&self, run: &mut PipelineRun, job_id: &str) {
        self.ensure_running(run, job_id, Utc::now()).await;
    }

    /// Idempotent running transition. Observed either from the worker's
    /// start message or, when a fast job's completion wins the select race
    /// against that message, from its outcome.
    async fn ensure_running(
        &self,
        run: &mut PipelineRun,
        job_id: &str,
        started_at: DateTime<Utc>,
    ) {
        let Some(job_run) = run.job_runs.get_mut(job_id) else {
            return;
        };
        // A worker that started right before cancellation may report late.
        if job_run.status != JobStatus::Eligible {
            return;
        }
        job_run.status = JobStatus::Running;
        job_run.started_at = Some(started_at);
        self.store.put_run(run.clone()).await;
        self.events
            .emit(PipelineEvent::job_started(run.id, job_id, 1));
    }

    async fn record_outcome(&self, run: &mut PipelineRun, outcome: TaskOutcome) {
        if let Some(started_at) = outcome.started_at {
            self.ensure_running(run, &outcome.job_id, started_at).await;
        }
        match outcome.result {
            Ok(output) => {
                self.finish_job(
                    run,
                    &outcome.job_id,
                    JobStatus::Succeeded,
                    outcome.attempts,
                    Some(output),
                    None,
                )
                .await;
            }
            Err(ExecutorError::Canceled) => {
                self.finish_job(
                    run,
                    &outcome.job_id,
                    JobStatus::Canceled,
                    outcome.attempts,
                    None,
                    Some("job canceled".to_string()),
                )
                .await;
            }
            Err(err) => {
                self.finish_job(
                    run,
                    &outcome.job_id,
                    JobStatus::Failed,
                    outcome.attempts,
                    None,
                    Some(err.to_string()),
                )
                .await;
            }
        }
    }

    async fn cancel_pending(&self, run: &mut PipelineRun) {
        let waiting: Vec<String> = run
            .job_runs
            .values()
            .filter(|r| matches!(r.status, JobStatus::Pending | JobStatus::Eligible))
            .map(|r| r.job_id.clone())
            .collect();
        for job_id in waiting {
            self.finish_job(
                run,
                &job_id,
                JobStatus::Canceled,
                0,
                None,
                Some("pipeline run canceled".to_string()),
            )
            .await;
        }
    }

    async fn finish_job(
        &self,
        run: &mut PipelineRun,
        job_id: &str,
        status: JobStatus,
        attempts: u32,
        output: Option<JobOutput>,
        failure_reason: Option<String>,
    ) {
        let duration;
        {
            let Some(job_run) = run.job_runs.get_mut(job_id) else {
                return;
            };
            if job_run.status.is_terminal() {
                return;
            }
            job_run.status = status;
            job_run.attempts = attempts.max(job_run.attempts);
            job_run.ended_at = Some(Utc::now());
            job_run.output = output;
            job_run.failure_reason = failure_reason;
            duration = job_run
                .started_at
                .zip(job_run.ended_at)
                .and_then(|(s, e)| (e - s).to_std().ok())
                .unwrap_or(Duration::ZERO);
        }
        self.store.put_run(run.clone()).await;
        self.events.emit(PipelineEvent::job_completed(
            run.id, job_id, status, attempts, duration,
        ));
    }
}

/// Worker body: waits for a concurrency permit, then invokes the executor
/// with the job's declared timeout and bounded retry policy.
async fn execute_job(
    job: Job,
    executor: Arc<dyn JobExecutor>,
    semaphore: Arc<Semaphore>,
    task_tx: mpsc::UnboundedSender<String>,
    cancel: CancelSignal,
    pipeline_run_id: uuid::Uuid,
) -> TaskOutcome {
    let _permit = match semaphore.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            return TaskOutcome {
                job_id: job.id.clone(),
                attempts: 0,
                started_at: None,
                result: Err(ExecutorError::Canceled),
            }
        }
    };
    let _ = task_tx.send(job.id.clone());
    let started_at = Utc::now();

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let ctx = ExecContext {
            pipeline_run_id,
            attempt,
            cancel: cancel.clone(),
        };
        let invocation = executor.execute(&job, ctx);
        let result = match job.timeout {
            Some(limit) => match timeout(limit, invocation).await {
                Ok(result) => result,
                Err(_) => Err(ExecutorError::TimedOut(limit)),
            },
            None => invocation.await,
        };

        match result {
            Ok(output) => {
                return TaskOutcome {
                    job_id: job.id,
                    attempts: attempt,
                    started_at: Some(started_at),
                    result: Ok(output),
                }
            }
            Err(ExecutorError::Canceled) => {
                return TaskOutcome {
                    job_id: job.id,
                    attempts: attempt,
                    started_at: Some(started_at),
                    result: Err(ExecutorError::Canceled),
                }
            }
            Err(err) => {
                if attempt >= job.retry.max_attempts {
                    return TaskOutcome {
                        job_id: job.id,
                        attempts: attempt,
                        started_at: Some(started_at),
                        result: Err(err),
                    };
                }
                tracing::debug!(job = %job.id, attempt, "retrying after executor error: {err}");
                sleep(job.retry.backoff * attempt).await;
            }
        }
    }
}
