use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde_json::json;

use crate::engine::types::{BackoffKind, RetryPolicy, Trigger, WorkflowSpec, WorkflowStep};

/// Pluggable source of workflow definitions. The dispatcher consults the
/// configured source first and falls back to [`builtin`].
#[async_trait]
pub trait WorkflowSource: Send + Sync {
    /// Load the definition for `key`. `Ok(None)` means the source does not
    /// know the workflow (fallback territory); `Err` means the source
    /// itself failed.
    async fn load(&self, key: &str) -> Result<Option<WorkflowSpec>>;

    /// Keys this source can serve.
    async fn keys(&self) -> Result<Vec<String>>;
}

/// Workflow definitions stored as one `{key}.yaml` file per workflow.
pub struct YamlWorkflowSource {
    dir: PathBuf,
}

impl YamlWorkflowSource {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl WorkflowSource for YamlWorkflowSource {
    async fn load(&self, key: &str) -> Result<Option<WorkflowSpec>> {
        let path = self.dir.join(format!("{}.yaml", key));
        if !path.exists() {
            return Ok(None);
        }

        let contents = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read workflow file: {}", path.display()))?;
        let spec: WorkflowSpec = serde_yml::from_str(&contents)
            .with_context(|| format!("Failed to parse workflow file: {}", path.display()))?;

        if spec.key != key {
            anyhow::bail!(
                "Workflow file {} declares key '{}', expected '{}'",
                path.display(),
                spec.key,
                key
            );
        }

        Ok(Some(spec))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("yaml")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// In-process fallback table.
///
/// These definitions mirror the ones published to the workflow store and
/// must stay identical to them — a drifted fallback dispatches a different
/// DAG depending on which path resolved the key.
pub fn builtin(key: &str) -> Option<WorkflowSpec> {
    match key {
        "weekly_seed_v1" => Some(weekly_seed_v1()),
        "daily_warmup_v1" => Some(daily_warmup_v1()),
        _ => None,
    }
}

pub fn builtin_keys() -> Vec<&'static str> {
    vec!["daily_warmup_v1", "weekly_seed_v1"]
}

fn llm_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        backoff: BackoffKind::Exp,
        base_delay_s: 2.0,
        max_delay_s: Some(60.0),
    }
}

/// Seeds one week of course material: objectives first, then materials and
/// dialogue bank in parallel, then ingest of the combined output.
fn weekly_seed_v1() -> WorkflowSpec {
    WorkflowSpec {
        key: "weekly_seed_v1".to_string(),
        trigger: Trigger::Events(vec!["week_started".to_string()]),
        steps: vec![
            WorkflowStep {
                id: "clo_begin_week".to_string(),
                tool: "clo".to_string(),
                mode: "begin_week".to_string(),
                body: json!({ "week": "${payload.week}" }),
                timeout_s: 60.0,
                retry: llm_retry(),
                depends_on: vec![],
            },
            WorkflowStep {
                id: "ta_generate_week".to_string(),
                tool: "ta".to_string(),
                mode: "generate_week".to_string(),
                body: json!({
                    "week": "${payload.week}",
                    "plan": "${steps.clo_begin_week}",
                }),
                timeout_s: 120.0,
                retry: llm_retry(),
                depends_on: vec!["clo_begin_week".to_string()],
            },
            WorkflowStep {
                id: "socratic_seed".to_string(),
                tool: "socratic".to_string(),
                mode: "seed".to_string(),
                body: json!({
                    "week": "${payload.week}",
                    "plan": "${steps.clo_begin_week}",
                }),
                timeout_s: 120.0,
                retry: llm_retry(),
                depends_on: vec!["clo_begin_week".to_string()],
            },
            WorkflowStep {
                id: "brand_ingest".to_string(),
                tool: "brand".to_string(),
                mode: "ingest".to_string(),
                body: json!({
                    "week": "${payload.week}",
                    "sources": {
                        "materials": "${steps.ta_generate_week}",
                        "dialogue": "${steps.socratic_seed}",
                    },
                }),
                timeout_s: 60.0,
                retry: RetryPolicy {
                    max_attempts: 3,
                    backoff: BackoffKind::Exp,
                    base_delay_s: 1.0,
                    max_delay_s: Some(30.0),
                },
                depends_on: vec!["ta_generate_week".to_string(), "socratic_seed".to_string()],
            },
        ],
    }
}

/// Pre-generates a day plan and its lecture ahead of the learner's start.
fn daily_warmup_v1() -> WorkflowSpec {
    WorkflowSpec {
        key: "daily_warmup_v1".to_string(),
        trigger: Trigger::Cron("0 5 * * *".to_string()),
        steps: vec![
            WorkflowStep {
                id: "clo_plan_day".to_string(),
                tool: "clo".to_string(),
                mode: "plan_day".to_string(),
                body: json!({
                    "week": "${payload.week}",
                    "day": "${payload.day}",
                }),
                timeout_s: 60.0,
                retry: llm_retry(),
                depends_on: vec![],
            },
            WorkflowStep {
                id: "lecturer_deliver".to_string(),
                tool: "lecturer".to_string(),
                mode: "deliver".to_string(),
                body: json!({ "plan": "${steps.clo_plan_day}" }),
                timeout_s: 120.0,
                retry: llm_retry(),
                depends_on: vec!["clo_plan_day".to_string()],
            },
        ],
    }
}
