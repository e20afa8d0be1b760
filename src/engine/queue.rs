use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use crate::engine::interpolate::{resolve_body, BodyScope};
use crate::engine::types::*;
use crate::storage::Store;

/// Requeue delay applied when a tool call was rate-limited. Short on
/// purpose: the bucket refills continuously.
const RATE_LIMIT_REQUEUE_S: f64 = 5.0;

/// A job a worker has exclusively claimed, together with its open attempt
/// row and the resolved step it executes.
pub struct ClaimedJob {
    pub job: JobQueueEntry,
    pub step: WorkflowStep,
    pub attempt: JobAttempt,
}

/// Durable job queue with claim semantics, backoff scheduling and
/// dependency-aware fan-out.
pub struct JobQueue {
    store: Arc<dyn Store>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Claim the next eligible job: queued, due, and with every dependency
    /// done. The queued→running flip is atomic in the store, so losing a
    /// race to another worker just moves on to the next candidate.
    pub async fn claim_next(&self) -> Result<Option<ClaimedJob>> {
        let now = Utc::now();
        let candidates = self.store.due_jobs(now, 16).await?;

        for job in candidates {
            let run = self.store.get_run(&job.run_id).await?;
            let step = match run.step(&job.step_id) {
                Some(s) => s.clone(),
                None => {
                    warn!(job_id = %job.job_id, step = %job.step_id, "Job references unknown step; marking dead");
                    let mut dead = job.clone();
                    dead.status = JobStatus::Dead;
                    self.store.update_job(&dead).await?;
                    continue;
                }
            };

            if !self.deps_done(&run, &step).await? {
                continue;
            }

            if !self.store.try_claim_job(&job.job_id).await? {
                debug!(job_id = %job.job_id, "Lost claim race");
                continue;
            }

            let mut claimed = job;
            claimed.status = JobStatus::Running;
            claimed.attempts += 1;
            self.store.update_job(&claimed).await?;

            let attempt = JobAttempt::begin(&claimed.job_id);
            self.store.insert_attempt(&attempt).await?;

            debug!(
                job_id = %claimed.job_id,
                step = %claimed.step_id,
                attempt = claimed.attempts,
                max = claimed.max_attempts,
                "Claimed job"
            );

            return Ok(Some(ClaimedJob {
                job: claimed,
                step,
                attempt,
            }));
        }

        Ok(None)
    }

    async fn deps_done(&self, run: &WorkflowRun, step: &WorkflowStep) -> Result<bool> {
        if step.depends_on.is_empty() {
            return Ok(true);
        }
        let jobs = self.store.jobs_for_run(&run.run_id).await?;
        let done: HashSet<&str> = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Done)
            .map(|j| j.step_id.as_str())
            .collect();
        Ok(step.depends_on.iter().all(|d| done.contains(d.as_str())))
    }

    /// Record a successful attempt: close the attempt row, mark the job
    /// done with its result, enqueue every newly unblocked dependent, and
    /// complete the run once all steps are done.
    pub async fn complete(&self, claimed: ClaimedJob, data: serde_json::Value) -> Result<()> {
        let ClaimedJob {
            mut job, attempt, ..
        } = claimed;

        self.store
            .update_attempt(&attempt.finish(true, None, None))
            .await?;

        job.status = JobStatus::Done;
        job.result = Some(data);
        self.store.update_job(&job).await?;

        info!(job_id = %job.job_id, step = %job.step_id, run_id = %job.run_id, "Job done");

        self.fan_out(&job.run_id).await
    }

    /// Enqueue every step of the run that is not yet in the queue and whose
    /// dependencies are all done; mark the run completed when nothing is
    /// left. Re-scans the full step snapshot each time, so a dependent
    /// missed by one completion is picked up by the next.
    async fn fan_out(&self, run_id: &str) -> Result<()> {
        let run = self.store.get_run(run_id).await?;
        let jobs = self.store.jobs_for_run(run_id).await?;

        let enqueued: HashSet<&str> = jobs.iter().map(|j| j.step_id.as_str()).collect();
        let done: HashMap<String, serde_json::Value> = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Done)
            .map(|j| {
                (
                    j.step_id.clone(),
                    j.result.clone().unwrap_or(serde_json::Value::Null),
                )
            })
            .collect();

        for step in &run.steps {
            if enqueued.contains(step.id.as_str()) {
                continue;
            }
            if !step.depends_on.iter().all(|d| done.contains_key(d)) {
                continue;
            }

            let scope = BodyScope {
                payload: &run.payload,
                steps: &done,
            };
            let upstream: HashMap<String, serde_json::Value> = step
                .depends_on
                .iter()
                .filter_map(|d| done.get(d).map(|v| (d.clone(), v.clone())))
                .collect();
            let payload = JobPayload {
                tool: step.tool.clone(),
                mode: step.mode.clone(),
                body: resolve_body(&step.body, &scope),
                upstream,
            };

            let entry = JobQueueEntry::new(&run, step, payload);
            self.store.insert_job(&entry).await?;
            info!(job_id = %entry.job_id, step = %step.id, run_id = %run_id, "Unblocked dependent step");
        }

        if done.len() == run.steps.len() && run.status == RunStatus::Running {
            self.store
                .set_run_status(run_id, RunStatus::Completed)
                .await?;
            info!(run_id = %run_id, "Run completed");
        }

        Ok(())
    }

    /// Record a failed attempt and schedule what happens next: a backoff
    /// retry while budget remains and the failure is retriable, the dead
    /// letter state otherwise. A dead step fails the owning run; sibling
    /// branches keep executing.
    pub async fn fail(
        &self,
        claimed: ClaimedJob,
        status_code: Option<u16>,
        error_text: &str,
        retriable: bool,
    ) -> Result<()> {
        let ClaimedJob {
            mut job,
            step,
            attempt,
        } = claimed;

        self.store
            .update_attempt(&attempt.finish(false, status_code, Some(error_text.to_string())))
            .await?;

        if retriable && job.attempts < job.max_attempts {
            let delay = step.retry.delay_s(job.attempts);
            job.status = JobStatus::Queued;
            job.next_run_at = Utc::now() + Duration::milliseconds((delay * 1000.0) as i64);
            self.store.update_job(&job).await?;

            info!(
                job_id = %job.job_id,
                step = %job.step_id,
                attempt = job.attempts,
                max = job.max_attempts,
                delay_s = delay,
                "Job failed; retry scheduled"
            );
            return Ok(());
        }

        job.status = JobStatus::Dead;
        self.store.update_job(&job).await?;
        self.store
            .set_run_status(&job.run_id, RunStatus::Failed)
            .await?;

        warn!(
            job_id = %job.job_id,
            step = %job.step_id,
            run_id = %job.run_id,
            attempts = job.attempts,
            retriable = retriable,
            error = %error_text,
            "Job dead; run failed"
        );

        Ok(())
    }

    /// Put a rate-limited job back in the queue after a short delay. The
    /// denial is not a failure: the attempt budget is restored.
    pub async fn rate_limited(&self, claimed: ClaimedJob) -> Result<()> {
        let ClaimedJob {
            mut job, attempt, ..
        } = claimed;

        self.store
            .update_attempt(&attempt.finish(false, None, Some("rate limited".to_string())))
            .await?;

        job.attempts = job.attempts.saturating_sub(1);
        job.status = JobStatus::Queued;
        job.next_run_at =
            Utc::now() + Duration::milliseconds((RATE_LIMIT_REQUEUE_S * 1000.0) as i64);
        self.store.update_job(&job).await?;

        debug!(job_id = %job.job_id, step = %job.step_id, "Rate limited; requeued");
        Ok(())
    }
}
