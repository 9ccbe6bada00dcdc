// Rollback Controller
// Selects and executes a compensating action when a stage fails

use crate::execution::{
    CancelSignal, EmitEvent, EventSender, JobExecutor, PipelineEvent, PipelineStatus, RunPurpose,
    Scheduler,
};
use crate::graph::{ActionRef, GraphError, Job, JobGraph};
use crate::promotion::{ChangeSet, Stage};
use crate::store::StateStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use std::sync::Arc;

/// A compensating action kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RollbackStrategy {
    /// Redeploy the last known-good run recorded for the same stage position
    RedeployPrevious,
    /// Remove the change set's deltas; requires the change set to declare
    /// itself reversible
    DestructiveRemoval,
    /// Disable the change set's associated feature flag
    FeatureFlagDisable,
}

impl RollbackStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackStrategy::RedeployPrevious => "redeploy-previous",
            RollbackStrategy::DestructiveRemoval => "destructive-removal",
            RollbackStrategy::FeatureFlagDisable => "flag-disable",
        }
    }
}

/// Status of a rollback action, mirroring its underlying pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollbackStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// A tracked compensating run for one halted stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackAction {
    pub id: Uuid,
    pub target_stage_id: Uuid,
    pub strategy: RollbackStrategy,
    /// The compensating pipeline run, once scheduled
    pub pipeline_run_id: Option<Uuid>,
    pub status: RollbackStatus,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

impl RollbackAction {
    pub fn new(
        target_stage_id: Uuid,
        strategy: RollbackStrategy,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            target_stage_id,
            strategy,
            pipeline_run_id: None,
            status: RollbackStatus::Pending,
            reason: reason.into(),
            created_at: Utc::now(),
        }
    }
}

/// Which strategies may be tried, in preference order.
///
/// The default prefers the least destructive executable option: redeploying
/// a known-good build, then turning a flag off, then removing deltas.
#[derive(Debug, Clone)]
pub struct RollbackPolicy {
    pub preference: Vec<RollbackStrategy>,
}

impl Default for RollbackPolicy {
    fn default() -> Self {
        Self {
            preference: vec![
                RollbackStrategy::RedeployPrevious,
                RollbackStrategy::FeatureFlagDisable,
                RollbackStrategy::DestructiveRemoval,
            ],
        }
    }
}

#[derive(Debug, Error)]
pub enum RollbackError {
    /// No strategy was executable; the stage stays halted for manual action
    #[error("no executable rollback strategy for stage '{stage}': {reason}")]
    StrategyUnavailable { stage: String, reason: String },
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Reacts to stage failures by scheduling a compensating pipeline run.
///
/// The controller never guesses: a strategy is only selected when its
/// preconditions hold, and when none do it escalates instead of applying a
/// partially-matching one. Every executed action runs through the same
/// scheduler as a forward deployment, so it is tracked, persisted and
/// notified identically.
pub struct RollbackController {
    store: Arc<StateStore>,
    scheduler: Scheduler,
    executor: Arc<dyn JobExecutor>,
    policy: RollbackPolicy,
    events: Option<EventSender>,
}

impl RollbackController {
    pub fn new(store: Arc<StateStore>, executor: Arc<dyn JobExecutor>) -> Self {
        Self {
            scheduler: Scheduler::new(store.clone()),
            store,
            executor,
            policy: RollbackPolicy::default(),
            events: None,
        }
    }

    pub fn with_policy(mut self, policy: RollbackPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.scheduler = Scheduler::new(self.store.clone()).with_events(events.clone());
        self.events = Some(events);
        self
    }

    /// Decide whether the failed stage gets an automatic rollback, and if so
    /// execute it as a tracked pipeline run.
    ///
    /// Returns `Ok(None)` when the stage is not rollback-eligible (only a
    /// notification is warranted, and the caller already sent it).
    pub async fn on_stage_failure(
        &self,
        stage: &Stage,
        change_set: &ChangeSet,
    ) -> Result<Option<RollbackAction>, RollbackError> {
        if !stage.rollback_eligible {
            tracing::debug!(stage = %stage.name, "stage not rollback-eligible, skipping");
            return Ok(None);
        }

        let Some((strategy, action_ref)) = self.select_strategy(stage, change_set).await else {
            let reason = format!(
                "change set '{}' declares no reversible deltas or feature flag, \
                 and no prior successful run exists for position {}",
                change_set.id, stage.order
            );
            tracing::error!(stage = %stage.name, %reason, "rollback unavailable");
            self.events.emit(PipelineEvent::RollbackUnavailable {
                stage_id: stage.id,
                stage_name: stage.name.clone(),
                is_production: stage.is_production,
                reason: reason.clone(),
            });
            return Err(RollbackError::StrategyUnavailable {
                stage: stage.name.clone(),
                reason,
            });
        };

        let mut action = RollbackAction::new(
            stage.id,
            strategy,
            stage
                .failure_reason
                .clone()
                .unwrap_or_else(|| "stage halted".to_string()),
        );
        self.store.put_rollback(action.clone()).await;
        self.events.emit(PipelineEvent::RollbackStarted {
            action_id: action.id,
            stage_id: stage.id,
            strategy,
        });
        tracing::info!(
            stage = %stage.name,
            strategy = strategy.as_str(),
            "scheduling compensating run"
        );

        let graph = JobGraph::new(vec![Job::new("rollback", action_ref)])?;
        action.status = RollbackStatus::Running;
        self.store.put_rollback(action.clone()).await;
        let run = self
            .scheduler
            .run(
                &graph,
                self.executor.clone(),
                RunPurpose::Rollback,
                CancelSignal::never(),
            )
            .await;

        action.pipeline_run_id = Some(run.id);
        action.status = match run.status() {
            PipelineStatus::Succeeded => RollbackStatus::Succeeded,
            _ => RollbackStatus::Failed,
        };
        self.store.put_rollback(action.clone()).await;
        self.events.emit(PipelineEvent::RollbackCompleted {
            action_id: action.id,
            stage_id: stage.id,
            strategy,
            succeeded: action.status == RollbackStatus::Succeeded,
        });

        Ok(Some(action))
    }

    /// First strategy in preference order whose preconditions hold, with the
    /// action handle the executor will interpret
    async fn select_strategy(
        &self,
        stage: &Stage,
        change_set: &ChangeSet,
    ) -> Option<(RollbackStrategy, ActionRef)> {
        for strategy in &self.policy.preference {
            match strategy {
                RollbackStrategy::RedeployPrevious => {
                    if let Some(run_id) = self
                        .store
                        .last_successful_run_for_stage(&stage.name, stage.order, stage.id)
                        .await
                    {
                        return Some((
                            *strategy,
                            ActionRef::new(format!("rollback:redeploy-previous:{run_id}")),
                        ));
                    }
                }
                RollbackStrategy::DestructiveRemoval => {
                    if change_set.reversible {
                        return Some((
                            *strategy,
                            ActionRef::new(format!(
                                "rollback:destructive-removal:{}",
                                change_set.id
                            )),
                        ));
                    }
                }
                RollbackStrategy::FeatureFlagDisable => {
                    if let Some(flag) = &change_set.feature_flag {
                        return Some((
                            *strategy,
                            ActionRef::new(format!("rollback:flag-disable:{flag}")),
                        ));
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{event_channel, ExecContext, ExecutorError, JobOutput};
    use crate::promotion::{GatePolicy, StagePlan, StageStatus};

    use async_trait::async_trait;

    struct OkExecutor;

    #[async_trait]
    impl JobExecutor for OkExecutor {
        async fn execute(&self, job: &Job, _ctx: ExecContext) -> Result<JobOutput, ExecutorError> {
            Ok(JobOutput::message(format!("{} done", job.action.as_str())))
        }
    }

    struct FailExecutor;

    #[async_trait]
    impl JobExecutor for FailExecutor {
        async fn execute(&self, _job: &Job, _ctx: ExecContext) -> Result<JobOutput, ExecutorError> {
            Err(ExecutorError::action_failed("target unreachable"))
        }
    }

    fn halted_stage(rollback_eligible: bool) -> Stage {
        let plan = StagePlan::new("staging", JobGraph::new(Vec::new()).unwrap())
            .with_gate(GatePolicy::Auto);
        let plan = if rollback_eligible {
            plan.rollback_eligible()
        } else {
            plan
        };
        let mut stage = Stage::new(Uuid::new_v4(), 1, &plan);
        stage.status = StageStatus::Halted;
        stage.failure_reason = Some("validation failed".to_string());
        stage
    }

    async fn record_prior_success(store: &StateStore, name: &str, order: usize) -> Uuid {
        let plan = StagePlan::new(name, JobGraph::new(Vec::new()).unwrap());
        let mut prior = Stage::new(Uuid::new_v4(), order, &plan);
        prior.status = StageStatus::Advanced;
        let run_id = Uuid::new_v4();
        prior.pipeline_run_id = Some(run_id);
        store.put_stage(prior).await;
        run_id
    }

    #[test]
    fn test_new_action_starts_pending() {
        let action = RollbackAction::new(
            Uuid::new_v4(),
            RollbackStrategy::RedeployPrevious,
            "validation failed",
        );
        assert_eq!(action.status, RollbackStatus::Pending);
        assert!(action.pipeline_run_id.is_none());
    }

    #[tokio::test]
    async fn test_ineligible_stage_is_left_alone() {
        let store = Arc::new(StateStore::new());
        let controller = RollbackController::new(store.clone(), Arc::new(OkExecutor));
        let stage = halted_stage(false);
        let change_set = ChangeSet::new("cs-1", "change").reversible();

        let result = controller.on_stage_failure(&stage, &change_set).await;
        assert!(matches!(result, Ok(None)));
        assert!(store.rollback(stage.id).await.is_none());
    }

    #[tokio::test]
    async fn test_redeploy_previous_selected_when_prior_run_exists() {
        let store = Arc::new(StateStore::new());
        let prior_run = record_prior_success(&store, "staging", 1).await;
        let controller = RollbackController::new(store.clone(), Arc::new(OkExecutor));
        let stage = halted_stage(true);
        // flag also present: preference order still picks redeploy
        let change_set = ChangeSet::new("cs-1", "change").with_feature_flag("beta");

        let action = controller
            .on_stage_failure(&stage, &change_set)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(action.strategy, RollbackStrategy::RedeployPrevious);
        assert_eq!(action.status, RollbackStatus::Succeeded);

        // the compensating run went through the ordinary scheduler
        let run = store.run(action.pipeline_run_id.unwrap()).await.unwrap();
        assert_eq!(run.purpose, RunPurpose::Rollback);
        assert_eq!(run.status(), PipelineStatus::Succeeded);
        let handle = run.job_run("rollback").unwrap();
        assert!(handle.output.is_some());
        let _ = prior_run;
    }

    #[tokio::test]
    async fn test_flag_disable_when_no_prior_run() {
        let store = Arc::new(StateStore::new());
        let controller = RollbackController::new(store.clone(), Arc::new(OkExecutor));
        let stage = halted_stage(true);
        let change_set = ChangeSet::new("cs-1", "change").with_feature_flag("checkout_v2");

        let action = controller
            .on_stage_failure(&stage, &change_set)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(action.strategy, RollbackStrategy::FeatureFlagDisable);
    }

    #[tokio::test]
    async fn test_destructive_removal_requires_reversible_declaration() {
        let store = Arc::new(StateStore::new());
        let controller = RollbackController::new(store.clone(), Arc::new(OkExecutor));
        let stage = halted_stage(true);
        let change_set = ChangeSet::new("cs-1", "change").reversible();

        let action = controller
            .on_stage_failure(&stage, &change_set)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(action.strategy, RollbackStrategy::DestructiveRemoval);
    }

    #[tokio::test]
    async fn test_no_strategy_escalates_instead_of_guessing() {
        let store = Arc::new(StateStore::new());
        let (tx, mut rx) = event_channel();
        let controller =
            RollbackController::new(store.clone(), Arc::new(OkExecutor)).with_events(tx);
        let stage = halted_stage(true);
        let change_set = ChangeSet::new("cs-1", "change");

        let result = controller.on_stage_failure(&stage, &change_set).await;
        assert!(matches!(
            result,
            Err(RollbackError::StrategyUnavailable { .. })
        ));

        let event = rx.try_recv().unwrap();
        assert!(matches!(event, PipelineEvent::RollbackUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_failed_compensating_run_is_tracked() {
        let store = Arc::new(StateStore::new());
        let controller = RollbackController::new(store.clone(), Arc::new(FailExecutor));
        let stage = halted_stage(true);
        let change_set = ChangeSet::new("cs-1", "change").reversible();

        let action = controller
            .on_stage_failure(&stage, &change_set)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(action.status, RollbackStatus::Failed);
        let stored = store.rollback(action.id).await.unwrap();
        assert_eq!(stored.status, RollbackStatus::Failed);
    }
}
