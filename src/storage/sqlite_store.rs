use anyhow::{Context as _, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use crate::engine::types::*;
use crate::limiter::RateLimitBucket;
use crate::session::{EducationSession, Phase};
use crate::storage::Store;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS workflow_runs (
    run_id       TEXT PRIMARY KEY,
    workflow_key TEXT NOT NULL,
    user_id      TEXT NOT NULL,
    intent_id    TEXT,
    status       TEXT NOT NULL,
    started      TEXT NOT NULL,
    finished     TEXT,
    payload      TEXT NOT NULL,
    steps        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS job_queue (
    job_id       TEXT PRIMARY KEY,
    run_id       TEXT NOT NULL,
    step_id      TEXT NOT NULL,
    user_id      TEXT NOT NULL,
    status       TEXT NOT NULL,
    priority     INTEGER NOT NULL,
    attempts     INTEGER NOT NULL,
    max_attempts INTEGER NOT NULL,
    next_run_at  TEXT NOT NULL,
    payload      TEXT NOT NULL,
    result       TEXT,
    created_at   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_job_queue_due ON job_queue (status, next_run_at);
CREATE INDEX IF NOT EXISTS idx_job_queue_run ON job_queue (run_id);

CREATE TABLE IF NOT EXISTS job_attempts (
    attempt_id  TEXT PRIMARY KEY,
    job_id      TEXT NOT NULL,
    started_at  TEXT NOT NULL,
    finished_at TEXT,
    success     INTEGER NOT NULL,
    status_code INTEGER,
    error_text  TEXT
);
CREATE INDEX IF NOT EXISTS idx_job_attempts_job ON job_attempts (job_id);

CREATE TABLE IF NOT EXISTS rate_limits (
    key               TEXT PRIMARY KEY,
    tokens            REAL NOT NULL,
    capacity          REAL NOT NULL,
    refill_rate_per_s REAL NOT NULL,
    last_refill_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS education_sessions (
    user_id    TEXT NOT NULL,
    week       INTEGER NOT NULL,
    day        INTEGER NOT NULL,
    session_id TEXT NOT NULL,
    phase      TEXT NOT NULL,
    artifacts  TEXT NOT NULL,
    etag       TEXT,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (user_id, week, day)
);
"#;

/// SQLite-backed store. One file, schema bootstrapped on connect.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `path` and ensure the
    /// schema exists.
    pub async fn connect(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("Failed to open database: {}", path))?;

        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .context("Failed to bootstrap schema")?;

        Ok(Self { pool })
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)
        .with_context(|| format!("Invalid timestamp: {}", s))?
        .with_timezone(&Utc))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn parse_run_status(s: &str) -> Result<RunStatus> {
    match s {
        "running" => Ok(RunStatus::Running),
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        other => anyhow::bail!("Invalid run status in store: {}", other),
    }
}

fn parse_job_status(s: &str) -> Result<JobStatus> {
    match s {
        "queued" => Ok(JobStatus::Queued),
        "running" => Ok(JobStatus::Running),
        "done" => Ok(JobStatus::Done),
        "failed" => Ok(JobStatus::Failed),
        "dead" => Ok(JobStatus::Dead),
        other => anyhow::bail!("Invalid job status in store: {}", other),
    }
}

fn run_from_row(row: &SqliteRow) -> Result<WorkflowRun> {
    let steps_json: String = row.try_get("steps")?;
    let payload_json: String = row.try_get("payload")?;
    let status: String = row.try_get("status")?;
    let started: String = row.try_get("started")?;
    let finished: Option<String> = row.try_get("finished")?;

    Ok(WorkflowRun {
        run_id: row.try_get("run_id")?,
        workflow_key: row.try_get("workflow_key")?,
        user_id: row.try_get("user_id")?,
        intent_id: row.try_get("intent_id")?,
        status: parse_run_status(&status)?,
        started: parse_ts(&started)?,
        finished: parse_opt_ts(finished)?,
        payload: serde_json::from_str(&payload_json).context("Corrupt payload column")?,
        steps: serde_json::from_str(&steps_json).context("Corrupt steps column")?,
    })
}

fn job_from_row(row: &SqliteRow) -> Result<JobQueueEntry> {
    let status: String = row.try_get("status")?;
    let next_run_at: String = row.try_get("next_run_at")?;
    let created_at: String = row.try_get("created_at")?;
    let payload_json: String = row.try_get("payload")?;
    let result_json: Option<String> = row.try_get("result")?;
    let attempts: i64 = row.try_get("attempts")?;
    let max_attempts: i64 = row.try_get("max_attempts")?;
    let priority: i64 = row.try_get("priority")?;

    Ok(JobQueueEntry {
        job_id: row.try_get("job_id")?,
        run_id: row.try_get("run_id")?,
        step_id: row.try_get("step_id")?,
        user_id: row.try_get("user_id")?,
        status: parse_job_status(&status)?,
        priority: priority as i32,
        attempts: attempts as u32,
        max_attempts: max_attempts as u32,
        next_run_at: parse_ts(&next_run_at)?,
        payload: serde_json::from_str(&payload_json).context("Corrupt payload column")?,
        result: result_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Corrupt result column")?,
        created_at: parse_ts(&created_at)?,
    })
}

fn attempt_from_row(row: &SqliteRow) -> Result<JobAttempt> {
    let started_at: String = row.try_get("started_at")?;
    let finished_at: Option<String> = row.try_get("finished_at")?;
    let success: i64 = row.try_get("success")?;
    let status_code: Option<i64> = row.try_get("status_code")?;

    Ok(JobAttempt {
        attempt_id: row.try_get("attempt_id")?,
        job_id: row.try_get("job_id")?,
        started_at: parse_ts(&started_at)?,
        finished_at: parse_opt_ts(finished_at)?,
        success: success != 0,
        status_code: status_code.map(|c| c as u16),
        error_text: row.try_get("error_text")?,
    })
}

fn session_from_row(row: &SqliteRow) -> Result<EducationSession> {
    let phase: String = row.try_get("phase")?;
    let artifacts_json: String = row.try_get("artifacts")?;
    let week: i64 = row.try_get("week")?;
    let day: i64 = row.try_get("day")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(EducationSession {
        session_id: row.try_get("session_id")?,
        user_id: row.try_get("user_id")?,
        week: week as u32,
        day: day as u32,
        phase: phase.parse::<Phase>()?,
        artifacts: serde_json::from_str(&artifacts_json).context("Corrupt artifacts column")?,
        etag: row.try_get("etag")?,
        updated_at: parse_ts(&updated_at)?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn insert_run(&self, run: &WorkflowRun) -> Result<()> {
        sqlx::query(
            "INSERT INTO workflow_runs \
             (run_id, workflow_key, user_id, intent_id, status, started, finished, payload, steps) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&run.run_id)
        .bind(&run.workflow_key)
        .bind(&run.user_id)
        .bind(&run.intent_id)
        .bind(run.status.to_string())
        .bind(run.started.to_rfc3339())
        .bind(run.finished.map(|t| t.to_rfc3339()))
        .bind(serde_json::to_string(&run.payload)?)
        .bind(serde_json::to_string(&run.steps)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<WorkflowRun> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Run not found: {}", run_id))?;
        run_from_row(&row)
    }

    async fn set_run_status(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let finished = matches!(status, RunStatus::Completed | RunStatus::Failed)
            .then(|| Utc::now().to_rfc3339());
        let result = sqlx::query(
            "UPDATE workflow_runs SET status = ?, finished = COALESCE(finished, ?) \
             WHERE run_id = ?",
        )
        .bind(status.to_string())
        .bind(finished)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("Run not found: {}", run_id);
        }
        Ok(())
    }

    async fn list_runs(
        &self,
        user_id: Option<&str>,
        status: Option<RunStatus>,
    ) -> Result<Vec<WorkflowRun>> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_runs \
             WHERE (? IS NULL OR user_id = ?) AND (? IS NULL OR status = ?) \
             ORDER BY started DESC",
        )
        .bind(user_id)
        .bind(user_id)
        .bind(status.as_ref().map(|s| s.to_string()))
        .bind(status.as_ref().map(|s| s.to_string()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn insert_job(&self, job: &JobQueueEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO job_queue \
             (job_id, run_id, step_id, user_id, status, priority, attempts, max_attempts, \
              next_run_at, payload, result, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&job.job_id)
        .bind(&job.run_id)
        .bind(&job.step_id)
        .bind(&job.user_id)
        .bind(job.status.to_string())
        .bind(job.priority as i64)
        .bind(job.attempts as i64)
        .bind(job.max_attempts as i64)
        .bind(job.next_run_at.to_rfc3339())
        .bind(serde_json::to_string(&job.payload)?)
        .bind(job.result.as_ref().map(serde_json::to_string).transpose()?)
        .bind(job.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<JobQueueEntry> {
        let row = sqlx::query("SELECT * FROM job_queue WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Job not found: {}", job_id))?;
        job_from_row(&row)
    }

    async fn jobs_for_run(&self, run_id: &str) -> Result<Vec<JobQueueEntry>> {
        let rows = sqlx::query("SELECT * FROM job_queue WHERE run_id = ? ORDER BY created_at ASC")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn due_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<JobQueueEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM job_queue WHERE status = 'queued' AND next_run_at <= ? \
             ORDER BY priority DESC, next_run_at ASC LIMIT ?",
        )
        .bind(now.to_rfc3339())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn try_claim_job(&self, job_id: &str) -> Result<bool> {
        // Conditional update is the claim: at most one worker sees
        // rows_affected == 1 for a given queued job.
        let result =
            sqlx::query("UPDATE job_queue SET status = 'running' WHERE job_id = ? AND status = 'queued'")
                .bind(job_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_job(&self, job: &JobQueueEntry) -> Result<()> {
        let result = sqlx::query(
            "UPDATE job_queue SET status = ?, priority = ?, attempts = ?, max_attempts = ?, \
             next_run_at = ?, payload = ?, result = ? WHERE job_id = ?",
        )
        .bind(job.status.to_string())
        .bind(job.priority as i64)
        .bind(job.attempts as i64)
        .bind(job.max_attempts as i64)
        .bind(job.next_run_at.to_rfc3339())
        .bind(serde_json::to_string(&job.payload)?)
        .bind(job.result.as_ref().map(serde_json::to_string).transpose()?)
        .bind(&job.job_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("Job not found: {}", job.job_id);
        }
        Ok(())
    }

    async fn insert_attempt(&self, attempt: &JobAttempt) -> Result<()> {
        sqlx::query(
            "INSERT INTO job_attempts \
             (attempt_id, job_id, started_at, finished_at, success, status_code, error_text) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&attempt.attempt_id)
        .bind(&attempt.job_id)
        .bind(attempt.started_at.to_rfc3339())
        .bind(attempt.finished_at.map(|t| t.to_rfc3339()))
        .bind(attempt.success as i64)
        .bind(attempt.status_code.map(|c| c as i64))
        .bind(&attempt.error_text)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_attempt(&self, attempt: &JobAttempt) -> Result<()> {
        let result = sqlx::query(
            "UPDATE job_attempts SET finished_at = ?, success = ?, status_code = ?, error_text = ? \
             WHERE attempt_id = ?",
        )
        .bind(attempt.finished_at.map(|t| t.to_rfc3339()))
        .bind(attempt.success as i64)
        .bind(attempt.status_code.map(|c| c as i64))
        .bind(&attempt.error_text)
        .bind(&attempt.attempt_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("Attempt not found: {}", attempt.attempt_id);
        }
        Ok(())
    }

    async fn attempts_for_job(&self, job_id: &str) -> Result<Vec<JobAttempt>> {
        let rows =
            sqlx::query("SELECT * FROM job_attempts WHERE job_id = ? ORDER BY started_at ASC")
                .bind(job_id)
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(attempt_from_row).collect()
    }

    async fn get_bucket(&self, key: &str) -> Result<Option<RateLimitBucket>> {
        let row = sqlx::query("SELECT * FROM rate_limits WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            let last_refill_at: String = row.try_get("last_refill_at")?;
            Ok(RateLimitBucket {
                key: row.try_get("key")?,
                tokens: row.try_get("tokens")?,
                capacity: row.try_get("capacity")?,
                refill_rate_per_s: row.try_get("refill_rate_per_s")?,
                last_refill_at: parse_ts(&last_refill_at)?,
            })
        })
        .transpose()
    }

    async fn put_bucket(&self, bucket: &RateLimitBucket) -> Result<()> {
        sqlx::query(
            "INSERT INTO rate_limits (key, tokens, capacity, refill_rate_per_s, last_refill_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET tokens = excluded.tokens, \
             capacity = excluded.capacity, refill_rate_per_s = excluded.refill_rate_per_s, \
             last_refill_at = excluded.last_refill_at",
        )
        .bind(&bucket.key)
        .bind(bucket.tokens)
        .bind(bucket.capacity)
        .bind(bucket.refill_rate_per_s)
        .bind(bucket.last_refill_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(
        &self,
        user_id: &str,
        week: u32,
        day: u32,
    ) -> Result<Option<EducationSession>> {
        let row = sqlx::query(
            "SELECT * FROM education_sessions WHERE user_id = ? AND week = ? AND day = ?",
        )
        .bind(user_id)
        .bind(week as i64)
        .bind(day as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn upsert_session(&self, session: &EducationSession) -> Result<()> {
        sqlx::query(
            "INSERT INTO education_sessions \
             (user_id, week, day, session_id, phase, artifacts, etag, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(user_id, week, day) DO UPDATE SET phase = excluded.phase, \
             artifacts = excluded.artifacts, etag = excluded.etag, \
             updated_at = excluded.updated_at",
        )
        .bind(&session.user_id)
        .bind(session.week as i64)
        .bind(session.day as i64)
        .bind(&session.session_id)
        .bind(session.phase.as_str())
        .bind(serde_json::to_string(&session.artifacts)?)
        .bind(&session.etag)
        .bind(session.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn sessions_for_user(&self, user_id: &str) -> Result<Vec<EducationSession>> {
        let rows = sqlx::query(
            "SELECT * FROM education_sessions WHERE user_id = ? ORDER BY week DESC, day DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(session_from_row).collect()
    }
}
