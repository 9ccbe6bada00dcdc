// Job Graph Model
// Jobs with declared dependencies and run conditions, validated into a DAG

use serde::{Deserialize, Serialize};

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

/// Identifier of a job, unique within one graph.
pub type JobId = String;

/// Error type for graph construction and validation
#[derive(Debug, Clone)]
pub struct GraphError {
    pub message: String,
    pub kind: GraphErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphErrorKind {
    /// Circular dependency detected
    CyclicDependency,
    /// Reference to a job that does not exist
    UnknownDependency,
    /// Two jobs share the same id
    DuplicateJob,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "graph error: {}", self.message)
    }
}

impl std::error::Error for GraphError {}

impl GraphError {
    pub fn cyclic(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::CyclicDependency,
        }
    }

    pub fn unknown_dependency(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::UnknownDependency,
        }
    }

    pub fn duplicate_job(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: GraphErrorKind::DuplicateJob,
        }
    }
}

/// When a job is allowed to run, relative to the outcomes of its dependencies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunCondition {
    /// Run only if every dependency succeeded (the default)
    Success,
    /// Run only if at least one dependency failed
    Failure,
    /// Run once all dependencies are terminal, regardless of outcome
    Always,
}

impl Default for RunCondition {
    fn default() -> Self {
        Self::Success
    }
}

/// Opaque handle identifying the external action a job performs.
///
/// The engine never interprets this; it is passed verbatim to the injected
/// `JobExecutor`, which maps it onto real build/test/deploy tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionRef(String);

impl ActionRef {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Bounded retry declared on a job, applied at the executor-invocation level.
///
/// The scheduler never retries on its own; a job that wants retries declares
/// them here. `max_attempts` counts the first attempt, so the default of 1
/// means no retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::from_secs(0),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }
}

/// A single unit of executable work with dependencies and a run condition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(default)]
    pub depends_on: BTreeSet<JobId>,
    #[serde(default)]
    pub condition: RunCondition,
    pub action: ActionRef,
    #[serde(default)]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Job {
    pub fn new(id: impl Into<JobId>, action: ActionRef) -> Self {
        Self {
            id: id.into(),
            depends_on: BTreeSet::new(),
            condition: RunCondition::default(),
            action,
            timeout: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Add a dependency edge to another job in the same graph
    pub fn depends_on(mut self, id: impl Into<JobId>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    pub fn with_condition(mut self, condition: RunCondition) -> Self {
        self.condition = condition;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// The validated DAG of all jobs for one pipeline definition.
///
/// Immutable once built; construction fails fast on duplicate ids, unknown
/// dependencies, or cycles. Safe to share across workers without locking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobGraph {
    jobs: BTreeMap<JobId, Job>,
}

impl JobGraph {
    /// Build and validate a graph from a list of jobs
    pub fn new(jobs: Vec<Job>) -> Result<Self, GraphError> {
        let mut map = BTreeMap::new();
        for job in jobs {
            if map.contains_key(&job.id) {
                return Err(GraphError::duplicate_job(format!(
                    "job '{}' is defined more than once",
                    job.id
                )));
            }
            map.insert(job.id.clone(), job);
        }

        let graph = Self { jobs: map };
        graph.validate()?;
        Ok(graph)
    }

    pub fn get(&self, id: &str) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn job_ids(&self) -> impl Iterator<Item = &JobId> {
        self.jobs.keys()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn validate(&self) -> Result<(), GraphError> {
        for job in self.jobs.values() {
            for dep in &job.depends_on {
                if !self.jobs.contains_key(dep) {
                    return Err(GraphError::unknown_dependency(format!(
                        "job '{}' depends on unknown job '{}'",
                        job.id, dep
                    )));
                }
            }
        }

        self.detect_cycles()
    }

    /// Detect cycles using DFS with a recursion stack
    fn detect_cycles(&self) -> Result<(), GraphError> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();

        for id in self.jobs.keys() {
            if !visited.contains(id.as_str()) {
                if let Some(cycle) = self.dfs_cycle(id, &mut visited, &mut rec_stack) {
                    return Err(GraphError::cyclic(format!(
                        "circular dependency detected: {}",
                        cycle.join(" -> ")
                    )));
                }
            }
        }

        Ok(())
    }

    fn dfs_cycle<'a>(
        &'a self,
        id: &'a str,
        visited: &mut HashSet<&'a str>,
        rec_stack: &mut HashSet<&'a str>,
    ) -> Option<Vec<String>> {
        visited.insert(id);
        rec_stack.insert(id);

        if let Some(job) = self.jobs.get(id) {
            for dep in &job.depends_on {
                if !visited.contains(dep.as_str()) {
                    if let Some(mut cycle) = self.dfs_cycle(dep, visited, rec_stack) {
                        cycle.insert(0, id.to_string());
                        return Some(cycle);
                    }
                } else if rec_stack.contains(dep.as_str()) {
                    return Some(vec![id.to_string(), dep.clone()]);
                }
            }
        }

        rec_stack.remove(id);
        None
    }

    /// Group jobs into levels where every job's dependencies sit in an
    /// earlier level. Introspection only; the scheduler itself is
    /// completion-driven because outcome conditions can change eligibility
    /// mid-run.
    pub fn execution_levels(&self) -> Vec<Vec<&JobId>> {
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for job in self.jobs.values() {
            in_degree.entry(&job.id).or_insert(0);
            dependents.entry(&job.id).or_default();
            for dep in &job.depends_on {
                dependents.entry(dep.as_str()).or_default().push(&job.id);
                *in_degree.entry(&job.id).or_insert(0) += 1;
            }
        }

        let mut assigned: HashMap<&str, usize> = HashMap::new();
        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .collect();

        while let Some(id) = queue.pop_front() {
            let level = self
                .jobs
                .get(id)
                .map(|job| {
                    job.depends_on
                        .iter()
                        .filter_map(|dep| assigned.get(dep.as_str()))
                        .max()
                        .map(|l| l + 1)
                        .unwrap_or(0)
                })
                .unwrap_or(0);
            assigned.insert(id, level);

            if let Some(next) = dependents.get(id) {
                for &dependent in next {
                    if let Some(deg) = in_degree.get_mut(dependent) {
                        *deg -= 1;
                        if *deg == 0 {
                            queue.push_back(dependent);
                        }
                    }
                }
            }
        }

        let mut levels: Vec<Vec<&JobId>> = Vec::new();
        for (id, job) in &self.jobs {
            let level = assigned.get(job.id.as_str()).copied().unwrap_or(0);
            if level >= levels.len() {
                levels.resize(level + 1, Vec::new());
            }
            levels[level].push(id);
        }
        levels
    }
}
