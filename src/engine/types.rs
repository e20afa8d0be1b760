use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Status of an individual job in the queue.
///
/// `Done` and `Dead` are terminal. `Failed` only ever appears transiently
/// between a failing attempt and the scheduling decision that follows it —
/// a persisted job is re-queued for retry or marked dead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
    Dead,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Done => write!(f, "done"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Dead => write!(f, "dead"),
        }
    }
}

/// How the delay between retry attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    /// Same delay before every retry.
    Fixed,
    /// Delay doubles each attempt: `base × 2^(n-1)`.
    Exp,
}

/// Retry configuration attached to each workflow step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempt budget, first execution included.
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    /// Initial backoff duration in seconds.
    pub base_delay_s: f64,
    /// Optional ceiling on the computed delay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delay_s: Option<f64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffKind::Exp,
            base_delay_s: 1.0,
            max_delay_s: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given the number of attempts that
    /// have already failed (`failed_attempts >= 1`). Non-decreasing in
    /// `failed_attempts`, up to `max_delay_s` when configured.
    pub fn delay_s(&self, failed_attempts: u32) -> f64 {
        let n = failed_attempts.max(1);
        let raw = match self.backoff {
            BackoffKind::Fixed => self.base_delay_s,
            BackoffKind::Exp => self.base_delay_s * 2.0_f64.powi((n - 1) as i32),
        };
        match self.max_delay_s {
            Some(cap) => raw.min(cap),
            None => raw,
        }
    }
}

/// What causes a workflow to be dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    /// Dispatched when one of the named user events arrives.
    Events(Vec<String>),
    /// Dispatched on a cron schedule (scheduling itself lives outside
    /// this crate; the expression is carried as data).
    Cron(String),
}

fn default_timeout_s() -> f64 {
    30.0
}

/// One named unit of work in a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// Unique within the owning workflow.
    pub id: String,
    /// Registry name of the reasoning service to call.
    pub tool: String,
    /// Tool mode/action for this step.
    pub mode: String,
    /// Static call body. Dependent steps also receive upstream results
    /// alongside this at enqueue time.
    #[serde(default)]
    pub body: serde_json::Value,
    #[serde(default = "default_timeout_s")]
    pub timeout_s: f64,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Step ids that must reach `done` before this step may run.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Complete workflow definition: named steps plus dependency edges.
/// Immutable once loaded; versionless (latest wins).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub key: String,
    pub trigger: Trigger,
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowSpec {
    /// Steps with no dependencies — what the dispatcher seeds the queue with.
    pub fn root_steps(&self) -> Vec<&WorkflowStep> {
        self.steps.iter().filter(|s| s.depends_on.is_empty()).collect()
    }

    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Validate the step graph. Returns human-readable problems; an empty
    /// vec means the spec is dispatchable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                errors.push(format!("Duplicate step id '{}'", step.id));
            }
        }

        let step_ids: HashSet<&str> = self.steps.iter().map(|s| s.id.as_str()).collect();
        for step in &self.steps {
            for dep in &step.depends_on {
                if !step_ids.contains(dep.as_str()) {
                    errors.push(format!(
                        "Step '{}' depends on '{}', which does not exist",
                        step.id, dep
                    ));
                }
            }
        }

        if self.root_steps().is_empty() {
            errors.push(format!(
                "Workflow '{}' has no step with empty depends_on",
                self.key
            ));
        }

        // Kahn's algorithm for cycle detection.
        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &self.steps {
            in_degree.entry(step.id.as_str()).or_insert(0);
            for dep in &step.depends_on {
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(step.id.as_str());
                *in_degree.entry(step.id.as_str()).or_insert(0) += 1;
            }
        }

        let mut remaining: HashSet<&str> = step_ids.clone();
        loop {
            let ready: Vec<&str> = remaining
                .iter()
                .filter(|id| in_degree.get(**id).copied().unwrap_or(0) == 0)
                .copied()
                .collect();

            if ready.is_empty() {
                if !remaining.is_empty() {
                    let mut cycle: Vec<&str> = remaining.iter().copied().collect();
                    cycle.sort_unstable();
                    errors.push(format!(
                        "Cycle detected in workflow '{}'. Remaining steps: {:?}",
                        self.key, cycle
                    ));
                }
                break;
            }

            for id in &ready {
                remaining.remove(id);
                if let Some(deps) = dependents.get(id) {
                    for dep in deps {
                        if let Some(deg) = in_degree.get_mut(dep) {
                            *deg -= 1;
                        }
                    }
                }
            }
        }

        errors
    }
}

/// One execution instance of a workflow for one user/trigger.
///
/// Carries a resolved snapshot of the spec's steps so the queue can fan
/// out dependents without consulting the definition store again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: String,
    pub workflow_key: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent_id: Option<String>,
    pub status: RunStatus,
    pub started: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
    /// Caller-supplied dispatch payload, referenced by step bodies via
    /// `${payload.*}` placeholders.
    #[serde(default)]
    pub payload: serde_json::Value,
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowRun {
    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Resolved call a worker executes for one step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobPayload {
    pub tool: String,
    pub mode: String,
    #[serde(default)]
    pub body: serde_json::Value,
    /// Results of the steps this one depended on, keyed by step id.
    #[serde(default)]
    pub upstream: HashMap<String, serde_json::Value>,
}

/// Durable queue entry for one step of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobQueueEntry {
    pub job_id: String,
    pub run_id: String,
    pub step_id: String,
    pub user_id: String,
    pub status: JobStatus,
    pub priority: i32,
    /// Attempts executed so far (successful or not).
    pub attempts: u32,
    pub max_attempts: u32,
    /// Earliest instant the job may be claimed.
    pub next_run_at: DateTime<Utc>,
    pub payload: JobPayload,
    /// Tool result data recorded when the job reached `done`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl JobQueueEntry {
    /// Fresh queued entry for a step of a run, eligible immediately.
    pub fn new(run: &WorkflowRun, step: &WorkflowStep, payload: JobPayload) -> Self {
        Self {
            job_id: uuid::Uuid::new_v4().to_string(),
            run_id: run.run_id.clone(),
            step_id: step.id.clone(),
            user_id: run.user_id.clone(),
            status: JobStatus::Queued,
            priority: 0,
            attempts: 0,
            max_attempts: step.retry.max_attempts,
            next_run_at: Utc::now(),
            payload,
            result: None,
            created_at: Utc::now(),
        }
    }
}

/// One execution attempt of a job. Append-only audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobAttempt {
    pub attempt_id: String,
    pub job_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
}

impl JobAttempt {
    /// Open a new attempt row for a freshly claimed job.
    pub fn begin(job_id: &str) -> Self {
        Self {
            attempt_id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            success: false,
            status_code: None,
            error_text: None,
        }
    }

    /// Close the attempt with its outcome.
    pub fn finish(
        mut self,
        success: bool,
        status_code: Option<u16>,
        error_text: Option<String>,
    ) -> Self {
        self.finished_at = Some(Utc::now());
        self.success = success;
        self.status_code = status_code;
        self.error_text = error_text;
        self
    }
}
