use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::interpolate::{resolve_body, BodyScope};
use crate::engine::types::*;
use crate::storage::Store;
use crate::workflows::{self, WorkflowSource};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),
    #[error("workflow '{key}' is not dispatchable: {problems}")]
    InvalidSpec { key: String, problems: String },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// What a successful dispatch hands back to the caller.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DispatchReceipt {
    pub run_id: String,
    pub status: RunStatus,
    pub steps_enqueued: usize,
}

/// Creates workflow runs and seeds the job queue with their root steps.
pub struct Dispatcher {
    store: Arc<dyn Store>,
    source: Option<Arc<dyn WorkflowSource>>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            source: None,
        }
    }

    /// Attach an external workflow-definition source. The built-in table
    /// remains the fallback.
    pub fn with_source(mut self, source: Arc<dyn WorkflowSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Resolve a workflow definition: configured source first, built-in
    /// table when the source misses or is unavailable.
    pub async fn resolve_spec(&self, key: &str) -> Option<WorkflowSpec> {
        if let Some(ref source) = self.source {
            match source.load(key).await {
                Ok(Some(spec)) => return Some(spec),
                Ok(None) => {}
                Err(e) => {
                    warn!(key = %key, error = %format!("{:#}", e), "Workflow source failed; using built-in table");
                }
            }
        }
        workflows::builtin(key)
    }

    /// Create a run for `workflow_key` and enqueue its root steps.
    ///
    /// Fails fast — persisting nothing — when the workflow is unknown or
    /// its step graph is not dispatchable. Every dispatch creates an
    /// independent run; there is no de-duplication.
    pub async fn dispatch(
        &self,
        user_id: &str,
        workflow_key: &str,
        intent_id: Option<String>,
        payload: serde_json::Value,
    ) -> Result<DispatchReceipt, DispatchError> {
        let spec = self
            .resolve_spec(workflow_key)
            .await
            .ok_or_else(|| DispatchError::UnknownWorkflow(workflow_key.to_string()))?;

        let problems = spec.validate();
        if !problems.is_empty() {
            return Err(DispatchError::InvalidSpec {
                key: workflow_key.to_string(),
                problems: problems.join("; "),
            });
        }

        let run = WorkflowRun {
            run_id: Uuid::new_v4().to_string(),
            workflow_key: workflow_key.to_string(),
            user_id: user_id.to_string(),
            intent_id,
            status: RunStatus::Running,
            started: Utc::now(),
            finished: None,
            payload,
            steps: spec.steps.clone(),
        };
        self.store.insert_run(&run).await?;

        let empty_steps = HashMap::new();
        let scope = BodyScope {
            payload: &run.payload,
            steps: &empty_steps,
        };

        let mut steps_enqueued = 0;
        for step in spec.root_steps() {
            let job = JobQueueEntry::new(
                &run,
                step,
                JobPayload {
                    tool: step.tool.clone(),
                    mode: step.mode.clone(),
                    body: resolve_body(&step.body, &scope),
                    upstream: HashMap::new(),
                },
            );
            self.store.insert_job(&job).await?;
            steps_enqueued += 1;
        }

        info!(
            run_id = %run.run_id,
            workflow = %workflow_key,
            user = %user_id,
            intent = %run.intent_id.as_deref().unwrap_or("-"),
            steps_enqueued = steps_enqueued,
            "Dispatched workflow"
        );

        Ok(DispatchReceipt {
            run_id: run.run_id,
            status: RunStatus::Running,
            steps_enqueued,
        })
    }
}
