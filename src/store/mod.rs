// State Store
// The single source of truth for runs, stages, promotions and rollbacks

use crate::execution::{PipelineRun, PipelineStatus};
use crate::promotion::{Promotion, Stage, StageStatus};
use crate::rollback::RollbackAction;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use std::collections::HashMap;
use std::time::Duration;

/// Store-level configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How long terminal records are kept before `prune` removes them
    pub retention: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

/// In-memory durable record store.
///
/// Each record family sits behind its own lock and every record is replaced
/// wholesale under a write lock, so writes are serialized per family while
/// unrelated pipelines proceed in parallel. Each run is written by exactly
/// one scheduling loop, which keeps per-run transitions append-only in
/// practice.
#[derive(Debug, Default)]
pub struct StateStore {
    config: StoreConfig,
    runs: RwLock<HashMap<Uuid, PipelineRun>>,
    stages: RwLock<HashMap<Uuid, Stage>>,
    promotions: RwLock<HashMap<Uuid, Promotion>>,
    rollbacks: RwLock<HashMap<Uuid, RollbackAction>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub async fn put_run(&self, run: PipelineRun) {
        self.runs.write().await.insert(run.id, run);
    }

    pub async fn run(&self, id: Uuid) -> Option<PipelineRun> {
        self.runs.read().await.get(&id).cloned()
    }

    pub async fn put_stage(&self, stage: Stage) {
        self.stages.write().await.insert(stage.id, stage);
    }

    pub async fn stage(&self, id: Uuid) -> Option<Stage> {
        self.stages.read().await.get(&id).cloned()
    }

    pub async fn put_promotion(&self, promotion: Promotion) {
        self.promotions.write().await.insert(promotion.id, promotion);
    }

    pub async fn promotion(&self, id: Uuid) -> Option<Promotion> {
        self.promotions.read().await.get(&id).cloned()
    }

    pub async fn put_rollback(&self, action: RollbackAction) {
        self.rollbacks.write().await.insert(action.id, action);
    }

    pub async fn rollback(&self, id: Uuid) -> Option<RollbackAction> {
        self.rollbacks.read().await.get(&id).cloned()
    }

    /// Rollback actions recorded against one stage, oldest first
    pub async fn rollbacks_for_stage(&self, stage_id: Uuid) -> Vec<RollbackAction> {
        let mut actions: Vec<RollbackAction> = self
            .rollbacks
            .read()
            .await
            .values()
            .filter(|action| action.target_stage_id == stage_id)
            .cloned()
            .collect();
        actions.sort_by_key(|action| action.created_at);
        actions
    }

    /// Promotion for a change set, with its stage records in submission order
    pub async fn promotion_for_change_set(
        &self,
        change_set_id: &str,
    ) -> Option<(Promotion, Vec<Stage>)> {
        let promotion = self
            .promotions
            .read()
            .await
            .values()
            .find(|p| p.change_set.id == change_set_id)
            .cloned()?;

        let stages = self.stages.read().await;
        let records = promotion
            .stage_ids
            .iter()
            .filter_map(|id| stages.get(id).cloned())
            .collect();
        drop(stages);

        Some((promotion, records))
    }

    /// Pipeline runs that failed within the given window, newest first
    pub async fn recent_failures(&self, window: Duration) -> Vec<PipelineRun> {
        let cutoff = Utc::now() - chrono_duration(window);
        let mut failures: Vec<PipelineRun> = self
            .runs
            .read()
            .await
            .values()
            .filter(|run| run.status() == PipelineStatus::Failed)
            .filter(|run| run.ended_at.map(|at| at >= cutoff).unwrap_or(false))
            .cloned()
            .collect();
        failures.sort_by_key(|run| std::cmp::Reverse(run.ended_at));
        failures
    }

    /// The most recent known-good run recorded for a stage position, used by
    /// the rollback controller to decide whether RedeployPrevious applies.
    pub async fn last_successful_run_for_stage(
        &self,
        name: &str,
        order: usize,
        exclude_stage: Uuid,
    ) -> Option<Uuid> {
        self.stages
            .read()
            .await
            .values()
            .filter(|stage| {
                stage.id != exclude_stage
                    && stage.name == name
                    && stage.order == order
                    && stage.status == StageStatus::Advanced
            })
            .max_by_key(|stage| stage.created_at)
            .and_then(|stage| stage.pipeline_run_id)
    }

    /// Drop terminal records older than the configured retention.
    ///
    /// Retention is a store concern only; the engine never depends on old
    /// records being present except through the queries above.
    pub async fn prune(&self, now: DateTime<Utc>) {
        let cutoff = now - chrono_duration(self.config.retention);

        self.runs.write().await.retain(|_, run| {
            !run.status().is_terminal() || run.ended_at.map(|at| at >= cutoff).unwrap_or(true)
        });
        self.stages.write().await.retain(|_, stage| {
            !matches!(stage.status, StageStatus::Advanced | StageStatus::Halted)
                || stage.created_at >= cutoff
        });
        self.rollbacks
            .write()
            .await
            .retain(|_, action| action.created_at >= cutoff);
        self.promotions
            .write()
            .await
            .retain(|_, promotion| promotion.created_at >= cutoff);
    }
}

fn chrono_duration(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or(ChronoDuration::MAX)
}
