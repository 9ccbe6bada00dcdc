// Promotion Coordinator
// Walks a change set through its ordered stages, gates and halts

use crate::execution::{
    cancellation, CancelHandle, EmitEvent, EventSender, JobExecutor, PipelineEvent, PipelineStatus,
    RunPurpose, Scheduler, SchedulerConfig,
};
use crate::promotion::models::{
    Approval, GatePolicy, Promotion, PromotionPlan, PromotionStatus, Rejection, Stage, StagePlan,
    StageStatus,
};
use crate::rollback::{RollbackController, RollbackPolicy};
use crate::store::StateStore;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::timeout;
use uuid::Uuid;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Error)]
pub enum GateError {
    #[error("stage {stage_id} not found")]
    UnknownStage { stage_id: Uuid },
    /// Approvals only apply to a stage blocked on its gate; anything else is
    /// rejected so a late approval can never resurrect a halted stage
    #[error("stage {stage_id} is not awaiting approval")]
    NotAwaitingApproval { stage_id: Uuid },
}

#[derive(Debug, Error)]
pub enum PromotionError {
    #[error("promotion {0} not found")]
    UnknownPromotion(Uuid),
    #[error("promotion {0} already completed")]
    AlreadyCompleted(Uuid),
    #[error("promotion {0} was abandoned")]
    Abandoned(Uuid),
}

/// How a stage attempt ended, from the coordinator's point of view
enum StageOutcome {
    Advanced,
    Halted,
}

/// What the gate wait resolved to
enum GateDecision {
    Approved(Stage),
    Rejected(Stage),
    TimedOut,
}

/// Drives promotions stage by stage.
///
/// Stages are strictly sequential: a stage only starts after the previous one
/// advanced through its gate. A halted stage stops the walk and leaves the
/// promotion in flight; resubmission creates a fresh stage record at the same
/// position rather than mutating the halted one.
pub struct PromotionCoordinator {
    store: Arc<StateStore>,
    executor: Arc<dyn JobExecutor>,
    scheduler_config: SchedulerConfig,
    rollback_policy: RollbackPolicy,
    events: Option<EventSender>,
    /// Wakers for stages blocked on a manual gate
    gates: Mutex<HashMap<Uuid, Arc<Notify>>>,
    /// Cancel handles for stages with a run in flight
    cancels: Mutex<HashMap<Uuid, CancelHandle>>,
}

impl PromotionCoordinator {
    pub fn new(store: Arc<StateStore>, executor: Arc<dyn JobExecutor>) -> Self {
        Self {
            store,
            executor,
            scheduler_config: SchedulerConfig::default(),
            rollback_policy: RollbackPolicy::default(),
            events: None,
            gates: Mutex::new(HashMap::new()),
            cancels: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler_config = config;
        self
    }

    pub fn with_rollback_policy(mut self, policy: RollbackPolicy) -> Self {
        self.rollback_policy = policy;
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Submit a change set and walk it through every stage of the plan.
    ///
    /// Returns once the promotion completes or a stage halts. Manual gates
    /// block in place until `record_approval`, `record_rejection` or the
    /// stage's approval timeout resolves them.
    pub async fn run(&self, plan: PromotionPlan) -> Promotion {
        let mut promotion = Promotion::new(plan.change_set.clone());
        self.store.put_promotion(promotion.clone()).await;
        tracing::info!(
            promotion = %promotion.id,
            change_set = %promotion.change_set.id,
            stages = plan.stages.len(),
            "promotion submitted"
        );

        self.run_stages(&mut promotion, &plan.stages, 0).await;
        promotion
    }

    /// Resubmit a promotion from a given position after a halt.
    ///
    /// Fresh stage records are created for the resubmitted positions; the
    /// halted records stay behind as the audit trail.
    pub async fn resubmit(
        &self,
        promotion_id: Uuid,
        from_order: usize,
        stages: &[StagePlan],
    ) -> Result<Promotion, PromotionError> {
        let mut promotion = self
            .store
            .promotion(promotion_id)
            .await
            .ok_or(PromotionError::UnknownPromotion(promotion_id))?;
        match promotion.status {
            PromotionStatus::Completed => {
                return Err(PromotionError::AlreadyCompleted(promotion_id))
            }
            PromotionStatus::Abandoned => return Err(PromotionError::Abandoned(promotion_id)),
            PromotionStatus::InFlight => {}
        }

        tracing::info!(promotion = %promotion.id, from_order, "promotion resubmitted");
        self.run_stages(&mut promotion, stages, from_order).await;
        Ok(promotion)
    }

    /// Close out an in-flight promotion that will not be resubmitted.
    ///
    /// The halted stage records stay behind as the audit trail; an abandoned
    /// promotion rejects further resubmission. Idempotent.
    pub async fn abandon(&self, promotion_id: Uuid) -> Result<Promotion, PromotionError> {
        let mut promotion = self
            .store
            .promotion(promotion_id)
            .await
            .ok_or(PromotionError::UnknownPromotion(promotion_id))?;
        match promotion.status {
            PromotionStatus::Completed => Err(PromotionError::AlreadyCompleted(promotion_id)),
            PromotionStatus::Abandoned => Ok(promotion),
            PromotionStatus::InFlight => {
                promotion.status = PromotionStatus::Abandoned;
                self.store.put_promotion(promotion.clone()).await;
                tracing::info!(promotion = %promotion.id, "promotion abandoned");
                Ok(promotion)
            }
        }
    }

    /// Record a human approval against a waiting stage.
    ///
    /// A repeat approval from the same approver is ignored rather than
    /// counted twice toward a quorum.
    pub async fn record_approval(
        &self,
        stage_id: Uuid,
        approver: impl Into<String>,
    ) -> Result<(), GateError> {
        let approver = approver.into();
        let mut stage = self
            .store
            .stage(stage_id)
            .await
            .ok_or(GateError::UnknownStage { stage_id })?;
        if stage.status != StageStatus::AwaitingApproval {
            return Err(GateError::NotAwaitingApproval { stage_id });
        }

        if !stage.has_approval_from(&approver) {
            stage.approvals.push(Approval {
                approver: approver.clone(),
                at: Utc::now(),
            });
            self.store.put_stage(stage.clone()).await;
        }

        self.events.emit(PipelineEvent::ApprovalRecorded {
            stage_id,
            approver,
            approvals: stage.approvals.len() as u32,
            required: stage.gate.required_approvals(),
        });
        self.wake_gate(stage_id);
        Ok(())
    }

    /// Record a human rejection; the waiting stage halts.
    pub async fn record_rejection(
        &self,
        stage_id: Uuid,
        approver: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<(), GateError> {
        let approver = approver.into();
        let reason = reason.into();
        let mut stage = self
            .store
            .stage(stage_id)
            .await
            .ok_or(GateError::UnknownStage { stage_id })?;
        if stage.status != StageStatus::AwaitingApproval {
            return Err(GateError::NotAwaitingApproval { stage_id });
        }

        stage.rejection = Some(Rejection {
            approver: approver.clone(),
            reason: reason.clone(),
            at: Utc::now(),
        });
        self.store.put_stage(stage).await;

        self.events.emit(PipelineEvent::RejectionRecorded {
            stage_id,
            approver,
            reason,
        });
        self.wake_gate(stage_id);
        Ok(())
    }

    /// Cancel a stage's in-flight pipeline run. Returns false when the stage
    /// has no run in flight.
    pub fn cancel_stage(&self, stage_id: Uuid) -> bool {
        match self.cancels.lock() {
            Ok(cancels) => match cancels.get(&stage_id) {
                Some(handle) => {
                    handle.cancel();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    async fn run_stages(&self, promotion: &mut Promotion, plans: &[StagePlan], from: usize) {
        for (offset, plan) in plans.iter().enumerate() {
            let stage = Stage::new(promotion.id, from + offset, plan);
            promotion.stage_ids.push(stage.id);
            self.store.put_promotion(promotion.clone()).await;

            match self.run_stage(promotion, stage, plan).await {
                StageOutcome::Advanced => continue,
                StageOutcome::Halted => return,
            }
        }

        promotion.status = PromotionStatus::Completed;
        self.store.put_promotion(promotion.clone()).await;
        self.events.emit(PipelineEvent::PromotionCompleted {
            promotion_id: promotion.id,
            change_set_id: promotion.change_set.id.clone(),
        });
        tracing::info!(promotion = %promotion.id, "promotion completed");
    }

    async fn run_stage(
        &self,
        promotion: &Promotion,
        mut stage: Stage,
        plan: &StagePlan,
    ) -> StageOutcome {
        stage.status = StageStatus::Running;
        self.store.put_stage(stage.clone()).await;
        self.events.emit(PipelineEvent::StageStarted {
            promotion_id: promotion.id,
            stage_id: stage.id,
            stage_name: stage.name.clone(),
            order: stage.order,
        });

        let (handle, signal) = cancellation();
        if let Ok(mut cancels) = self.cancels.lock() {
            cancels.insert(stage.id, handle);
        }
        let run = self
            .scheduler()
            .run(&plan.graph, self.executor.clone(), RunPurpose::Forward, signal)
            .await;
        if let Ok(mut cancels) = self.cancels.lock() {
            cancels.remove(&stage.id);
        }

        stage.pipeline_run_id = Some(run.id);
        match run.status() {
            PipelineStatus::Succeeded => match stage.gate {
                GatePolicy::Auto => {
                    stage.status = StageStatus::Advanced;
                    self.store.put_stage(stage.clone()).await;
                    self.events.emit(PipelineEvent::StageAdvanced {
                        promotion_id: promotion.id,
                        stage_id: stage.id,
                        stage_name: stage.name.clone(),
                    });
                    StageOutcome::Advanced
                }
                GatePolicy::ManualSingle | GatePolicy::ManualQuorum(_) => {
                    self.await_gate(promotion, stage).await
                }
            },
            PipelineStatus::Canceled => {
                self.halt(promotion, stage, "stage run canceled".to_string())
                    .await
            }
            _ => {
                let reason = run
                    .failure_reason()
                    .map(str::to_string)
                    .unwrap_or_else(|| "stage run failed".to_string());
                self.halt(promotion, stage, reason).await
            }
        }
    }

    /// Park the stage on its manual gate until approvals satisfy it, a
    /// rejection lands, or the approval timeout expires.
    async fn await_gate(&self, promotion: &Promotion, mut stage: Stage) -> StageOutcome {
        stage.status = StageStatus::AwaitingApproval;
        self.store.put_stage(stage.clone()).await;

        let notify = Arc::new(Notify::new());
        if let Ok(mut gates) = self.gates.lock() {
            gates.insert(stage.id, notify.clone());
        }
        self.events.emit(PipelineEvent::StageAwaitingApproval {
            promotion_id: promotion.id,
            stage_id: stage.id,
            stage_name: stage.name.clone(),
            gate: stage.gate,
        });
        tracing::info!(
            stage = %stage.name,
            required = stage.gate.required_approvals(),
            "awaiting approval"
        );

        // Re-read the record after every wake; the store is the authority,
        // the Notify is only a doorbell.
        let wait = async {
            loop {
                let current = self
                    .store
                    .stage(stage.id)
                    .await
                    .unwrap_or_else(|| stage.clone());
                if current.rejection.is_some() {
                    return GateDecision::Rejected(current);
                }
                if current.gate_satisfied() {
                    return GateDecision::Approved(current);
                }
                notify.notified().await;
            }
        };

        let decision = match stage.approval_timeout {
            Some(limit) => timeout(limit, wait)
                .await
                .unwrap_or(GateDecision::TimedOut),
            None => wait.await,
        };
        if let Ok(mut gates) = self.gates.lock() {
            gates.remove(&stage.id);
        }

        match decision {
            GateDecision::Approved(mut current) => {
                current.status = StageStatus::Advanced;
                self.store.put_stage(current.clone()).await;
                self.events.emit(PipelineEvent::StageAdvanced {
                    promotion_id: promotion.id,
                    stage_id: current.id,
                    stage_name: current.name.clone(),
                });
                StageOutcome::Advanced
            }
            GateDecision::Rejected(current) => {
                let reason = current
                    .rejection
                    .as_ref()
                    .map(|r| format!("rejected by {}: {}", r.approver, r.reason))
                    .unwrap_or_else(|| "rejected".to_string());
                self.halt(promotion, current, reason).await
            }
            GateDecision::TimedOut => {
                let limit = stage.approval_timeout.unwrap_or(Duration::ZERO);
                let reason = format!("approval not granted within {limit:?}");
                self.halt(promotion, stage, reason).await
            }
        }
    }

    /// Halt the stage and consult the rollback controller. A halted stage
    /// is observed identically whether it halted on run failure, rejection
    /// or gate timeout.
    async fn halt(
        &self,
        promotion: &Promotion,
        mut stage: Stage,
        reason: String,
    ) -> StageOutcome {
        stage.status = StageStatus::Halted;
        stage.failure_reason = Some(reason.clone());
        self.store.put_stage(stage.clone()).await;
        self.events.emit(PipelineEvent::StageHalted {
            promotion_id: promotion.id,
            stage_id: stage.id,
            stage_name: stage.name.clone(),
            is_production: stage.is_production,
            reason: reason.clone(),
        });
        tracing::warn!(stage = %stage.name, %reason, "stage halted");

        let rollback = self.rollback_controller();
        if let Err(error) = rollback
            .on_stage_failure(&stage, &promotion.change_set)
            .await
        {
            tracing::warn!(stage = %stage.name, %error, "no automatic rollback");
        }

        StageOutcome::Halted
    }

    fn scheduler(&self) -> Scheduler {
        let scheduler =
            Scheduler::new(self.store.clone()).with_config(self.scheduler_config.clone());
        match &self.events {
            Some(events) => scheduler.with_events(events.clone()),
            None => scheduler,
        }
    }

    fn rollback_controller(&self) -> RollbackController {
        let controller = RollbackController::new(self.store.clone(), self.executor.clone())
            .with_policy(self.rollback_policy.clone());
        match &self.events {
            Some(events) => controller.with_events(events.clone()),
            None => controller,
        }
    }

    fn wake_gate(&self, stage_id: Uuid) {
        if let Ok(gates) = self.gates.lock() {
            if let Some(notify) = gates.get(&stage_id) {
                notify.notify_one();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{event_channel, ExecContext, ExecutorError, JobOutput};
    use crate::graph::{ActionRef, Job, JobGraph};
    use crate::promotion::ChangeSet;
    use crate::rollback::RollbackStatus;

    use async_trait::async_trait;
    use tokio::time::sleep;

    /// Fails any job whose action contains one of the given substrings
    struct SelectiveExecutor {
        fail_actions: Vec<&'static str>,
    }

    impl SelectiveExecutor {
        fn all_ok() -> Arc<Self> {
            Arc::new(Self {
                fail_actions: Vec::new(),
            })
        }

        fn failing(actions: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                fail_actions: actions,
            })
        }
    }

    #[async_trait]
    impl JobExecutor for SelectiveExecutor {
        async fn execute(&self, job: &Job, _ctx: ExecContext) -> Result<JobOutput, ExecutorError> {
            let action = job.action.as_str();
            if self.fail_actions.iter().any(|f| action.contains(f)) {
                return Err(ExecutorError::action_failed(format!("{action} failed")));
            }
            Ok(JobOutput::message(format!("{action} done")))
        }
    }

    fn deploy_graph(env: &str) -> JobGraph {
        JobGraph::new(vec![Job::new(
            "deploy",
            ActionRef::new(format!("deploy:{env}")),
        )])
        .unwrap()
    }

    fn four_stage_plan() -> PromotionPlan {
        PromotionPlan::new(
            ChangeSet::new("cs-1", "new checkout flow").with_feature_flag("checkout_v2"),
            vec![
                StagePlan::new("dev", deploy_graph("dev")),
                StagePlan::new("test", deploy_graph("test")),
                StagePlan::new("uat", deploy_graph("uat")).with_gate(GatePolicy::ManualSingle),
                StagePlan::new("prod", deploy_graph("prod")).production(),
            ],
        )
    }

    async fn stage_at(
        store: &StateStore,
        change_set: &str,
        order: usize,
    ) -> Option<Stage> {
        let (_, stages) = store.promotion_for_change_set(change_set).await?;
        stages.into_iter().rev().find(|s| s.order == order)
    }

    /// Poll until the stage at `order` reaches the wanted status
    async fn wait_for_status(
        store: &StateStore,
        change_set: &str,
        order: usize,
        status: StageStatus,
    ) -> Stage {
        for _ in 0..200 {
            if let Some(stage) = stage_at(store, change_set, order).await {
                if stage.status == status {
                    return stage;
                }
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("stage {order} never reached {status:?}");
    }

    #[tokio::test]
    async fn test_auto_stages_advance_to_completion() {
        let store = Arc::new(StateStore::new());
        let coordinator = PromotionCoordinator::new(store.clone(), SelectiveExecutor::all_ok());
        let plan = PromotionPlan::new(
            ChangeSet::new("cs-1", "change"),
            vec![
                StagePlan::new("dev", deploy_graph("dev")),
                StagePlan::new("test", deploy_graph("test")),
            ],
        );

        let promotion = coordinator.run(plan).await;
        assert_eq!(promotion.status, PromotionStatus::Completed);

        let (_, stages) = store.promotion_for_change_set("cs-1").await.unwrap();
        assert_eq!(stages.len(), 2);
        assert!(stages.iter().all(|s| s.status == StageStatus::Advanced));
        // every stage has its own tracked run
        for stage in &stages {
            let run = store.run(stage.pipeline_run_id.unwrap()).await.unwrap();
            assert_eq!(run.status(), PipelineStatus::Succeeded);
        }
    }

    #[tokio::test]
    async fn test_manual_gate_blocks_until_approved() {
        let store = Arc::new(StateStore::new());
        let coordinator = Arc::new(PromotionCoordinator::new(
            store.clone(),
            SelectiveExecutor::all_ok(),
        ));

        let runner = coordinator.clone();
        let task = tokio::spawn(async move { runner.run(four_stage_plan()).await });

        let uat = wait_for_status(&store, "cs-1", 2, StageStatus::AwaitingApproval).await;

        // the walk must stall here: prod never starts without the approval
        sleep(Duration::from_millis(50)).await;
        assert!(stage_at(&store, "cs-1", 3).await.is_none());
        assert!(!task.is_finished());

        coordinator.record_approval(uat.id, "ana").await.unwrap();

        let promotion = task.await.unwrap();
        assert_eq!(promotion.status, PromotionStatus::Completed);
        let prod = stage_at(&store, "cs-1", 3).await.unwrap();
        assert_eq!(prod.status, StageStatus::Advanced);
    }

    #[tokio::test]
    async fn test_quorum_ignores_duplicate_approver() {
        let store = Arc::new(StateStore::new());
        let coordinator = Arc::new(PromotionCoordinator::new(
            store.clone(),
            SelectiveExecutor::all_ok(),
        ));
        let plan = PromotionPlan::new(
            ChangeSet::new("cs-1", "change"),
            vec![StagePlan::new("uat", deploy_graph("uat"))
                .with_gate(GatePolicy::ManualQuorum(2))],
        );

        let runner = coordinator.clone();
        let task = tokio::spawn(async move { runner.run(plan).await });
        let stage = wait_for_status(&store, "cs-1", 0, StageStatus::AwaitingApproval).await;

        coordinator.record_approval(stage.id, "ana").await.unwrap();
        coordinator.record_approval(stage.id, "ana").await.unwrap();
        sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        coordinator.record_approval(stage.id, "ben").await.unwrap();
        let promotion = task.await.unwrap();
        assert_eq!(promotion.status, PromotionStatus::Completed);

        let stage = store.stage(stage.id).await.unwrap();
        assert_eq!(stage.approvals.len(), 2);
    }

    #[tokio::test]
    async fn test_rejection_halts_the_stage() {
        let store = Arc::new(StateStore::new());
        let coordinator = Arc::new(PromotionCoordinator::new(
            store.clone(),
            SelectiveExecutor::all_ok(),
        ));
        let plan = PromotionPlan::new(
            ChangeSet::new("cs-1", "change"),
            vec![
                StagePlan::new("uat", deploy_graph("uat")).with_gate(GatePolicy::ManualSingle),
                StagePlan::new("prod", deploy_graph("prod")).production(),
            ],
        );

        let runner = coordinator.clone();
        let task = tokio::spawn(async move { runner.run(plan).await });
        let stage = wait_for_status(&store, "cs-1", 0, StageStatus::AwaitingApproval).await;

        coordinator
            .record_rejection(stage.id, "ana", "smoke test regressions")
            .await
            .unwrap();

        let promotion = task.await.unwrap();
        assert_eq!(promotion.status, PromotionStatus::InFlight);

        let stage = store.stage(stage.id).await.unwrap();
        assert_eq!(stage.status, StageStatus::Halted);
        assert!(stage
            .failure_reason
            .unwrap()
            .contains("smoke test regressions"));
        // the rejected stage stops the walk
        assert!(stage_at(&store, "cs-1", 1).await.is_none());
    }

    #[tokio::test]
    async fn test_approval_cannot_resurrect_halted_stage() {
        let store = Arc::new(StateStore::new());
        let coordinator = Arc::new(PromotionCoordinator::new(
            store.clone(),
            SelectiveExecutor::all_ok(),
        ));
        let plan = PromotionPlan::new(
            ChangeSet::new("cs-1", "change"),
            vec![StagePlan::new("uat", deploy_graph("uat"))
                .with_gate(GatePolicy::ManualSingle)
                .with_approval_timeout(Duration::from_millis(20))],
        );

        let promotion = coordinator.run(plan).await;
        assert_eq!(promotion.status, PromotionStatus::InFlight);

        let stage = stage_at(&store, "cs-1", 0).await.unwrap();
        assert_eq!(stage.status, StageStatus::Halted);
        assert!(matches!(
            coordinator.record_approval(stage.id, "ana").await,
            Err(GateError::NotAwaitingApproval { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_stage_halts_and_consults_rollback() {
        let store = Arc::new(StateStore::new());
        let (tx, mut rx) = event_channel();
        let coordinator = PromotionCoordinator::new(
            store.clone(),
            SelectiveExecutor::failing(vec!["deploy:test"]),
        )
        .with_events(tx);

        let plan = PromotionPlan::new(
            ChangeSet::new("cs-1", "change").with_feature_flag("checkout_v2"),
            vec![
                StagePlan::new("dev", deploy_graph("dev")),
                StagePlan::new("test", deploy_graph("test")).rollback_eligible(),
                StagePlan::new("prod", deploy_graph("prod")).production(),
            ],
        );

        let promotion = coordinator.run(plan).await;
        assert_eq!(promotion.status, PromotionStatus::InFlight);

        let test_stage = stage_at(&store, "cs-1", 1).await.unwrap();
        assert_eq!(test_stage.status, StageStatus::Halted);
        assert!(stage_at(&store, "cs-1", 2).await.is_none());

        // flag disable was the executable strategy
        let actions = store.rollbacks_for_stage(test_stage.id).await;
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].status, RollbackStatus::Succeeded);

        let mut saw_halt = false;
        let mut saw_rollback = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                PipelineEvent::StageHalted { stage_name, .. } => {
                    assert_eq!(stage_name, "test");
                    saw_halt = true;
                }
                PipelineEvent::RollbackCompleted { succeeded, .. } => {
                    assert!(succeeded);
                    saw_rollback = true;
                }
                _ => {}
            }
        }
        assert!(saw_halt);
        assert!(saw_rollback);
    }

    #[tokio::test]
    async fn test_resubmit_creates_fresh_stage_record() {
        let store = Arc::new(StateStore::new());
        let failing = PromotionCoordinator::new(
            store.clone(),
            SelectiveExecutor::failing(vec!["deploy:test"]),
        );
        let stages = vec![
            StagePlan::new("dev", deploy_graph("dev")),
            StagePlan::new("test", deploy_graph("test")),
        ];
        let plan = PromotionPlan::new(ChangeSet::new("cs-1", "change"), stages.clone());

        let promotion = failing.run(plan).await;
        let halted = stage_at(&store, "cs-1", 1).await.unwrap();
        assert_eq!(halted.status, StageStatus::Halted);

        let fixed = PromotionCoordinator::new(store.clone(), SelectiveExecutor::all_ok());
        let promotion = fixed
            .resubmit(promotion.id, 1, &stages[1..])
            .await
            .unwrap();
        assert_eq!(promotion.status, PromotionStatus::Completed);

        // fresh record at the same position, halted one untouched
        let (_, records) = store.promotion_for_change_set("cs-1").await.unwrap();
        let at_position: Vec<_> = records.iter().filter(|s| s.order == 1).collect();
        assert_eq!(at_position.len(), 2);
        assert_eq!(store.stage(halted.id).await.unwrap().status, StageStatus::Halted);
        assert!(at_position
            .iter()
            .any(|s| s.status == StageStatus::Advanced));
    }

    #[tokio::test]
    async fn test_abandoned_promotion_rejects_resubmission() {
        let store = Arc::new(StateStore::new());
        let coordinator = PromotionCoordinator::new(
            store.clone(),
            SelectiveExecutor::failing(vec!["deploy:dev"]),
        );
        let plan = PromotionPlan::new(
            ChangeSet::new("cs-1", "change"),
            vec![StagePlan::new("dev", deploy_graph("dev"))],
        );

        let promotion = coordinator.run(plan).await;
        assert_eq!(promotion.status, PromotionStatus::InFlight);

        let abandoned = coordinator.abandon(promotion.id).await.unwrap();
        assert_eq!(abandoned.status, PromotionStatus::Abandoned);
        assert_eq!(
            store.promotion(promotion.id).await.unwrap().status,
            PromotionStatus::Abandoned
        );

        // abandoning again is a no-op
        let again = coordinator.abandon(promotion.id).await.unwrap();
        assert_eq!(again.status, PromotionStatus::Abandoned);

        let result = coordinator
            .resubmit(promotion.id, 0, &[StagePlan::new("dev", deploy_graph("dev"))])
            .await;
        assert!(matches!(result, Err(PromotionError::Abandoned(_))));
    }

    #[tokio::test]
    async fn test_completed_promotion_cannot_be_abandoned() {
        let store = Arc::new(StateStore::new());
        let coordinator = PromotionCoordinator::new(store.clone(), SelectiveExecutor::all_ok());
        let plan = PromotionPlan::new(
            ChangeSet::new("cs-1", "change"),
            vec![StagePlan::new("dev", deploy_graph("dev"))],
        );

        let promotion = coordinator.run(plan).await;
        let result = coordinator.abandon(promotion.id).await;
        assert!(matches!(result, Err(PromotionError::AlreadyCompleted(_))));
    }

    #[tokio::test]
    async fn test_resubmit_rejects_completed_promotion() {
        let store = Arc::new(StateStore::new());
        let coordinator = PromotionCoordinator::new(store.clone(), SelectiveExecutor::all_ok());
        let plan = PromotionPlan::new(
            ChangeSet::new("cs-1", "change"),
            vec![StagePlan::new("dev", deploy_graph("dev"))],
        );

        let promotion = coordinator.run(plan).await;
        let result = coordinator
            .resubmit(promotion.id, 0, &[StagePlan::new("dev", deploy_graph("dev"))])
            .await;
        assert!(matches!(result, Err(PromotionError::AlreadyCompleted(_))));
    }
}
