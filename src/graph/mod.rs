// Job Graph Model
// Validated DAG of jobs for one pipeline definition

mod models;

pub use models::{
    ActionRef, GraphError, GraphErrorKind, Job, JobGraph, JobId, RetryPolicy, RunCondition,
};
