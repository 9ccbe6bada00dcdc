// Condition Evaluator
// Pure eligibility decision for a job given the outcomes recorded so far

use crate::execution::models::{JobRun, JobStatus};
use crate::graph::{Job, JobId, RunCondition};

use std::collections::BTreeMap;

/// Outcome of evaluating one job against the current run state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    /// All dependencies terminal and the condition is satisfied
    Ready,
    /// Some dependency is not yet terminal; ask again later
    Blocked,
    /// The condition can never be satisfied; mark the job Skipped
    Skip,
}

/// Decide whether `job` may run, given the job runs recorded so far.
///
/// Total and side-effect free: identical inputs always give identical
/// answers. Called by the scheduler after every state change.
///
/// Rules:
/// - every dependency must be terminal before the job becomes Ready
/// - `Success` requires all dependencies Succeeded; a Failed, Skipped or
///   Canceled dependency makes the condition unsatisfiable immediately
/// - `Failure` requires at least one Failed dependency once all are terminal
/// - `Always` only waits for terminality
pub fn evaluate(job: &Job, runs: &BTreeMap<JobId, JobRun>) -> Eligibility {
    let mut all_terminal = true;
    let mut any_failed = false;
    let mut any_unsatisfiable = false;

    for dep in &job.depends_on {
        let status = match runs.get(dep) {
            Some(run) => run.status,
            // Unknown dependency cannot happen on a validated graph; treat
            // as never-terminal rather than guessing.
            None => return Eligibility::Blocked,
        };

        if !status.is_terminal() {
            all_terminal = false;
        }
        match status {
            JobStatus::Failed => {
                any_failed = true;
                any_unsatisfiable = true;
            }
            JobStatus::Skipped | JobStatus::Canceled => any_unsatisfiable = true,
            _ => {}
        }
    }

    match job.condition {
        RunCondition::Success => {
            if any_unsatisfiable {
                Eligibility::Skip
            } else if all_terminal {
                Eligibility::Ready
            } else {
                Eligibility::Blocked
            }
        }
        RunCondition::Failure => {
            if !all_terminal {
                Eligibility::Blocked
            } else if any_failed {
                Eligibility::Ready
            } else {
                Eligibility::Skip
            }
        }
        RunCondition::Always => {
            if all_terminal {
                Eligibility::Ready
            } else {
                Eligibility::Blocked
            }
        }
    }
}
