use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::engine::queue::{ClaimedJob, JobQueue};
use crate::tools::{idempotency_key, CallOptions, ToolCall, ToolError, ToolOutcome, ToolRegistry};

/// Pool of polling workers draining the job queue.
///
/// Workers are independent: each claims one job at a time and blocks only
/// on the outbound tool call and the store round-trips.
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    registry: Arc<ToolRegistry>,
    workers: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(queue: Arc<JobQueue>, registry: Arc<ToolRegistry>) -> Self {
        Self {
            queue,
            registry,
            workers: num_cpus::get(),
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Spawn the worker tasks. They run until the process exits.
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        info!(workers = self.workers, "Starting worker pool");

        (0..self.workers)
            .map(|id| {
                let queue = self.queue.clone();
                let registry = self.registry.clone();
                let poll = self.poll_interval;

                tokio::spawn(async move {
                    loop {
                        match queue.claim_next().await {
                            Ok(Some(claimed)) => {
                                execute_job(&queue, &registry, claimed).await;
                            }
                            Ok(None) => tokio::time::sleep(poll).await,
                            Err(e) => {
                                error!(worker = id, error = %format!("{:#}", e), "Claim failed");
                                tokio::time::sleep(poll).await;
                            }
                        }
                    }
                })
            })
            .collect()
    }
}

/// Execute one claimed job against its tool and report the outcome back to
/// the queue. Never returns an error: every path resolves the claim.
pub async fn execute_job(queue: &JobQueue, registry: &ToolRegistry, claimed: ClaimedJob) {
    let payload = claimed.job.payload.clone();

    let call = match ToolCall::resolve(&payload.tool, &payload.mode, &payload.body) {
        Some(call) => call,
        None => {
            let message = format!("unknown tool call: {}/{}", payload.tool, payload.mode);
            report(
                queue
                    .fail(claimed, None, &message, false)
                    .await,
            );
            return;
        }
    };

    let opts = CallOptions {
        etag_if_none_match: None,
        idempotency_key: Some(idempotency_key(
            &claimed.job.run_id,
            &claimed.job.step_id,
            claimed.job.attempts,
        )),
        timeout_s: Some(claimed.step.timeout_s),
    };

    let user_id = claimed.job.user_id.clone();
    let result = registry.call(&user_id, &call, opts).await;

    match result {
        Ok(ToolOutcome::Fresh { data, .. }) => report(queue.complete(claimed, data).await),
        Ok(ToolOutcome::NotModified) => {
            // Upstream reports no change; the step is satisfied without
            // new data.
            debug!(step = %claimed.step.id, "Tool reported not modified");
            report(queue.complete(claimed, serde_json::Value::Null).await);
        }
        Err(ToolError::RateLimited { .. }) => report(queue.rate_limited(claimed).await),
        Err(e @ ToolError::Degraded { .. }) => {
            let status = e.status_code();
            report(queue.fail(claimed, status, &e.to_string(), true).await);
        }
        Err(e @ ToolError::Rejected { .. }) => {
            let status = e.status_code();
            report(queue.fail(claimed, status, &e.to_string(), false).await);
        }
        Err(e @ ToolError::Invalid(_)) => {
            report(queue.fail(claimed, None, &e.to_string(), false).await);
        }
    }
}

fn report(result: anyhow::Result<()>) {
    if let Err(e) = result {
        error!(error = %format!("{:#}", e), "Failed to record job outcome");
    }
}
