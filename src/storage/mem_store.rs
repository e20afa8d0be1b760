use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::engine::types::*;
use crate::limiter::RateLimitBucket;
use crate::session::EducationSession;
use crate::storage::Store;

#[derive(Default)]
struct Inner {
    runs: HashMap<String, WorkflowRun>,
    jobs: HashMap<String, JobQueueEntry>,
    attempts: Vec<JobAttempt>,
    buckets: HashMap<String, RateLimitBucket>,
    sessions: HashMap<(String, u32, u32), EducationSession>,
}

/// In-memory store. Holds state only for the lifetime of the instance;
/// used by tests and embedded runs.
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn insert_run(&self, run: &WorkflowRun) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .runs
            .insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<WorkflowRun> {
        self.inner
            .lock()
            .unwrap()
            .runs
            .get(run_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Run not found: {}", run_id))
    }

    async fn set_run_status(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let run = inner
            .runs
            .get_mut(run_id)
            .ok_or_else(|| anyhow::anyhow!("Run not found: {}", run_id))?;
        if matches!(status, RunStatus::Completed | RunStatus::Failed) && run.finished.is_none() {
            run.finished = Some(Utc::now());
        }
        run.status = status;
        Ok(())
    }

    async fn list_runs(
        &self,
        user_id: Option<&str>,
        status: Option<RunStatus>,
    ) -> Result<Vec<WorkflowRun>> {
        let inner = self.inner.lock().unwrap();
        let mut runs: Vec<WorkflowRun> = inner
            .runs
            .values()
            .filter(|r| user_id.is_none_or(|u| r.user_id == u))
            .filter(|r| status.as_ref().is_none_or(|s| &r.status == s))
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started.cmp(&a.started));
        Ok(runs)
    }

    async fn insert_job(&self, job: &JobQueueEntry) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .jobs
            .insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<JobQueueEntry> {
        self.inner
            .lock()
            .unwrap()
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Job not found: {}", job_id))
    }

    async fn jobs_for_run(&self, run_id: &str) -> Result<Vec<JobQueueEntry>> {
        let inner = self.inner.lock().unwrap();
        let mut jobs: Vec<JobQueueEntry> = inner
            .jobs
            .values()
            .filter(|j| j.run_id == run_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    async fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobQueueEntry>> {
        let inner = self.inner.lock().unwrap();
        let mut due: Vec<JobQueueEntry> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued && j.next_run_at <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.next_run_at.cmp(&b.next_run_at))
        });
        due.truncate(limit);
        Ok(due)
    }

    async fn try_claim_job(&self, job_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.jobs.get_mut(job_id) {
            Some(job) if job.status == JobStatus::Queued => {
                job.status = JobStatus::Running;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => anyhow::bail!("Job not found: {}", job_id),
        }
    }

    async fn update_job(&self, job: &JobQueueEntry) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.jobs.contains_key(&job.job_id) {
            anyhow::bail!("Job not found: {}", job.job_id);
        }
        inner.jobs.insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    async fn insert_attempt(&self, attempt: &JobAttempt) -> Result<()> {
        self.inner.lock().unwrap().attempts.push(attempt.clone());
        Ok(())
    }

    async fn update_attempt(&self, attempt: &JobAttempt) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner
            .attempts
            .iter_mut()
            .find(|a| a.attempt_id == attempt.attempt_id)
        {
            Some(existing) => {
                *existing = attempt.clone();
                Ok(())
            }
            None => anyhow::bail!("Attempt not found: {}", attempt.attempt_id),
        }
    }

    async fn attempts_for_job(&self, job_id: &str) -> Result<Vec<JobAttempt>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .attempts
            .iter()
            .filter(|a| a.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn get_bucket(&self, key: &str) -> Result<Option<RateLimitBucket>> {
        Ok(self.inner.lock().unwrap().buckets.get(key).cloned())
    }

    async fn put_bucket(&self, bucket: &RateLimitBucket) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .buckets
            .insert(bucket.key.clone(), bucket.clone());
        Ok(())
    }

    async fn get_session(
        &self,
        user_id: &str,
        week: u32,
        day: u32,
    ) -> Result<Option<EducationSession>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .sessions
            .get(&(user_id.to_string(), week, day))
            .cloned())
    }

    async fn upsert_session(&self, session: &EducationSession) -> Result<()> {
        self.inner.lock().unwrap().sessions.insert(
            (session.user_id.clone(), session.week, session.day),
            session.clone(),
        );
        Ok(())
    }

    async fn sessions_for_user(&self, user_id: &str) -> Result<Vec<EducationSession>> {
        let inner = self.inner.lock().unwrap();
        let mut sessions: Vec<EducationSession> = inner
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| (b.week, b.day).cmp(&(a.week, a.day)));
        Ok(sessions)
    }
}
