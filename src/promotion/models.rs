// Promotion Records
// Stages, gates and the ordered promotion a change set passes through

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::time::Duration;

/// Approval policy guarding advancement out of a stage.
///
/// Automated threshold checks are not gates: they are ordinary `Auto` stages
/// whose run fails when the threshold is not met. Manual gates are strictly
/// human sign-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GatePolicy {
    /// Advance as soon as the stage run succeeds
    Auto,
    /// One human approval required
    ManualSingle,
    /// A quorum of distinct human approvals required
    ManualQuorum(u32),
}

impl GatePolicy {
    /// Number of distinct approvals this gate requires
    pub fn required_approvals(&self) -> u32 {
        match self {
            GatePolicy::Auto => 0,
            GatePolicy::ManualSingle => 1,
            GatePolicy::ManualQuorum(n) => *n,
        }
    }
}

/// Lifecycle of one stage attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    Pending,
    Running,
    /// Run succeeded; blocked on the gate
    AwaitingApproval,
    /// Gate satisfied; the next stage may start
    Advanced,
    /// Run failed, gate rejected or timed out; never auto-retried
    Halted,
}

/// A recorded human approval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub approver: String,
    pub at: DateTime<Utc>,
}

/// A recorded human rejection; halts the stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub approver: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// One environment-scoped attempt to advance a change set.
///
/// A halted stage is never mutated back to life; resubmission creates a
/// fresh `Stage` record at the same position, preserving the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub id: Uuid,
    pub promotion_id: Uuid,
    pub name: String,
    /// Position in the promotion sequence
    pub order: usize,
    pub gate: GatePolicy,
    pub is_production: bool,
    /// Whether automatic rollback may be attempted when this stage fails
    pub rollback_eligible: bool,
    pub approval_timeout: Option<Duration>,
    /// The validation/deploy run for this attempt, once started
    pub pipeline_run_id: Option<Uuid>,
    pub status: StageStatus,
    pub approvals: Vec<Approval>,
    pub rejection: Option<Rejection>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Stage {
    pub fn new(promotion_id: Uuid, order: usize, plan: &StagePlan) -> Self {
        Self {
            id: Uuid::new_v4(),
            promotion_id,
            name: plan.name.clone(),
            order,
            gate: plan.gate,
            is_production: plan.is_production,
            rollback_eligible: plan.rollback_eligible,
            approval_timeout: plan.approval_timeout,
            pipeline_run_id: None,
            status: StageStatus::Pending,
            approvals: Vec::new(),
            rejection: None,
            failure_reason: None,
            created_at: Utc::now(),
        }
    }

    /// Whether enough distinct approvals were recorded for the gate
    pub fn gate_satisfied(&self) -> bool {
        self.approvals.len() as u32 >= self.gate.required_approvals()
    }

    pub fn has_approval_from(&self, approver: &str) -> bool {
        self.approvals.iter().any(|a| a.approver == approver)
    }
}

/// The change set a promotion carries, with the declarations the rollback
/// strategies depend on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeSet {
    pub id: String,
    pub description: String,
    /// The deltas can be removed destructively (enables DestructiveRemoval)
    pub reversible: bool,
    /// Associated feature flag key (enables FeatureFlagDisable)
    pub feature_flag: Option<String>,
}

impl ChangeSet {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            reversible: false,
            feature_flag: None,
        }
    }

    pub fn reversible(mut self) -> Self {
        self.reversible = true;
        self
    }

    pub fn with_feature_flag(mut self, key: impl Into<String>) -> Self {
        self.feature_flag = Some(key.into());
        self
    }
}

/// Overall state of a promotion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PromotionStatus {
    InFlight,
    Completed,
    Abandoned,
}

/// The ordered sequence of stage attempts for one change set.
///
/// `stage_ids` may hold several attempts at the same position; the latest
/// record per position is the current one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Promotion {
    pub id: Uuid,
    pub change_set: ChangeSet,
    pub stage_ids: Vec<Uuid>,
    pub status: PromotionStatus,
    pub created_at: DateTime<Utc>,
}

impl Promotion {
    pub fn new(change_set: ChangeSet) -> Self {
        Self {
            id: Uuid::new_v4(),
            change_set,
            stage_ids: Vec::new(),
            status: PromotionStatus::InFlight,
            created_at: Utc::now(),
        }
    }
}

/// Definition of one stage in a promotion plan
#[derive(Debug, Clone)]
pub struct StagePlan {
    pub name: String,
    pub gate: GatePolicy,
    pub is_production: bool,
    pub rollback_eligible: bool,
    pub approval_timeout: Option<Duration>,
    pub graph: crate::graph::JobGraph,
}

impl StagePlan {
    pub fn new(name: impl Into<String>, graph: crate::graph::JobGraph) -> Self {
        Self {
            name: name.into(),
            gate: GatePolicy::Auto,
            is_production: false,
            rollback_eligible: false,
            approval_timeout: None,
            graph,
        }
    }

    pub fn with_gate(mut self, gate: GatePolicy) -> Self {
        self.gate = gate;
        self
    }

    pub fn production(mut self) -> Self {
        self.is_production = true;
        self
    }

    pub fn rollback_eligible(mut self) -> Self {
        self.rollback_eligible = true;
        self
    }

    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout = Some(timeout);
        self
    }
}

/// An ordered promotion plan for one change set
#[derive(Debug, Clone)]
pub struct PromotionPlan {
    pub change_set: ChangeSet,
    pub stages: Vec<StagePlan>,
}

impl PromotionPlan {
    pub fn new(change_set: ChangeSet, stages: Vec<StagePlan>) -> Self {
        Self { change_set, stages }
    }
}
