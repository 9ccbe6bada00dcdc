// Promotion
// Ordered environment stages, approval gates and the coordinator driving them

pub mod coordinator;
pub mod models;

pub use coordinator::{GateError, PromotionCoordinator, PromotionError};
pub use models::{
    Approval, ChangeSet, GatePolicy, Promotion, PromotionPlan, PromotionStatus, Rejection, Stage,
    StagePlan, StageStatus,
};
