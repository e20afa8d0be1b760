pub mod mem_store;
pub mod sqlite_store;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::engine::types::*;
use crate::limiter::RateLimitBucket;
use crate::session::EducationSession;

/// Persistence boundary for workflow runs, the job queue, attempt audit
/// rows, rate-limit buckets and learning sessions.
///
/// Injected explicitly into every component's constructor; there is no
/// package-level client, so tests swap in [`mem_store::MemStore`].
#[async_trait]
pub trait Store: Send + Sync {
    // --- workflow runs ---

    async fn insert_run(&self, run: &WorkflowRun) -> Result<()>;

    async fn get_run(&self, run_id: &str) -> Result<WorkflowRun>;

    async fn set_run_status(&self, run_id: &str, status: RunStatus) -> Result<()>;

    /// List runs, newest first, optionally filtered by user and status.
    async fn list_runs(
        &self,
        user_id: Option<&str>,
        status: Option<RunStatus>,
    ) -> Result<Vec<WorkflowRun>>;

    // --- job queue ---

    async fn insert_job(&self, job: &JobQueueEntry) -> Result<()>;

    async fn get_job(&self, job_id: &str) -> Result<JobQueueEntry>;

    async fn jobs_for_run(&self, run_id: &str) -> Result<Vec<JobQueueEntry>>;

    /// Queued jobs whose `next_run_at` has passed, highest priority then
    /// oldest first. Dependency gating happens above this call.
    async fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobQueueEntry>>;

    /// Atomically flip a job from `queued` to `running`. Returns false
    /// when the job was not claimable (another worker won, or the job
    /// already moved on).
    async fn try_claim_job(&self, job_id: &str) -> Result<bool>;

    async fn update_job(&self, job: &JobQueueEntry) -> Result<()>;

    // --- job attempts ---

    async fn insert_attempt(&self, attempt: &JobAttempt) -> Result<()>;

    async fn update_attempt(&self, attempt: &JobAttempt) -> Result<()>;

    /// Attempts for a job, oldest first.
    async fn attempts_for_job(&self, job_id: &str) -> Result<Vec<JobAttempt>>;

    // --- rate-limit buckets ---

    async fn get_bucket(&self, key: &str) -> Result<Option<RateLimitBucket>>;

    async fn put_bucket(&self, bucket: &RateLimitBucket) -> Result<()>;

    // --- learning sessions ---

    async fn get_session(
        &self,
        user_id: &str,
        week: u32,
        day: u32,
    ) -> Result<Option<EducationSession>>;

    async fn upsert_session(&self, session: &EducationSession) -> Result<()>;

    /// All sessions for a user, newest (week, day) first.
    async fn sessions_for_user(&self, user_id: &str) -> Result<Vec<EducationSession>>;
}
