//! Tests for Store implementations: MemStore and SqliteStore run the same
//! suite, so both backends keep identical semantics.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::json;

use mentorflow::engine::types::*;
use mentorflow::limiter::RateLimitBucket;
use mentorflow::session::{EducationSession, Phase};
use mentorflow::storage::mem_store::MemStore;
use mentorflow::storage::sqlite_store::SqliteStore;
use mentorflow::storage::Store;

// --- Fixtures ---

fn sample_step(id: &str, deps: &[&str]) -> WorkflowStep {
    WorkflowStep {
        id: id.to_string(),
        tool: "clo".to_string(),
        mode: "begin_week".to_string(),
        body: json!({"week": 1}),
        timeout_s: 30.0,
        retry: RetryPolicy::default(),
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
    }
}

fn sample_run(user: &str) -> WorkflowRun {
    WorkflowRun {
        run_id: uuid::Uuid::new_v4().to_string(),
        workflow_key: "weekly_seed_v1".to_string(),
        user_id: user.to_string(),
        intent_id: Some("intent-1".to_string()),
        status: RunStatus::Running,
        started: Utc::now(),
        finished: None,
        payload: json!({"week": 1}),
        steps: vec![sample_step("a", &[]), sample_step("b", &["a"])],
    }
}

fn sample_job(run: &WorkflowRun) -> JobQueueEntry {
    JobQueueEntry::new(
        run,
        &run.steps[0],
        JobPayload {
            tool: "clo".to_string(),
            mode: "begin_week".to_string(),
            body: json!({"week": 1}),
            upstream: Default::default(),
        },
    )
}

async fn sqlite_store() -> (tempfile::TempDir, Arc<SqliteStore>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test.db");
    let store = SqliteStore::connect(path.to_str().unwrap()).await.unwrap();
    (dir, Arc::new(store))
}

// --- Shared suite ---

async fn suite_run_round_trip(store: &dyn Store) {
    let run = sample_run("u1");
    store.insert_run(&run).await.unwrap();

    let loaded = store.get_run(&run.run_id).await.unwrap();
    assert_eq!(loaded.workflow_key, "weekly_seed_v1");
    assert_eq!(loaded.intent_id.as_deref(), Some("intent-1"));
    assert_eq!(loaded.status, RunStatus::Running);
    assert_eq!(loaded.steps.len(), 2);
    assert_eq!(loaded.payload["week"], json!(1));
    assert!(loaded.finished.is_none());

    store
        .set_run_status(&run.run_id, RunStatus::Completed)
        .await
        .unwrap();
    let loaded = store.get_run(&run.run_id).await.unwrap();
    assert_eq!(loaded.status, RunStatus::Completed);
    assert!(loaded.finished.is_some());

    assert!(store.get_run("missing").await.is_err());
}

async fn suite_list_runs_filters(store: &dyn Store) {
    let run_a = sample_run("u1");
    let mut run_b = sample_run("u2");
    run_b.status = RunStatus::Failed;

    store.insert_run(&run_a).await.unwrap();
    store.insert_run(&run_b).await.unwrap();

    assert_eq!(store.list_runs(None, None).await.unwrap().len(), 2);
    assert_eq!(store.list_runs(Some("u1"), None).await.unwrap().len(), 1);
    assert_eq!(
        store
            .list_runs(None, Some(RunStatus::Failed))
            .await
            .unwrap()
            .len(),
        1
    );
    assert_eq!(
        store
            .list_runs(Some("u2"), Some(RunStatus::Running))
            .await
            .unwrap()
            .len(),
        0
    );
}

async fn suite_job_lifecycle(store: &dyn Store) {
    let run = sample_run("u1");
    store.insert_run(&run).await.unwrap();

    let mut job = sample_job(&run);
    store.insert_job(&job).await.unwrap();

    let due = store.due_jobs(Utc::now(), 10).await.unwrap();
    assert_eq!(due.len(), 1);

    // A job scheduled in the future is not due.
    job.next_run_at = Utc::now() + Duration::seconds(60);
    store.update_job(&job).await.unwrap();
    assert!(store.due_jobs(Utc::now(), 10).await.unwrap().is_empty());

    job.next_run_at = Utc::now() - Duration::seconds(1);
    store.update_job(&job).await.unwrap();

    // Exactly one claim wins.
    assert!(store.try_claim_job(&job.job_id).await.unwrap());
    assert!(!store.try_claim_job(&job.job_id).await.unwrap());

    let loaded = store.get_job(&job.job_id).await.unwrap();
    assert_eq!(loaded.status, JobStatus::Running);

    // Claimed jobs are no longer due.
    assert!(store.due_jobs(Utc::now(), 10).await.unwrap().is_empty());

    let jobs = store.jobs_for_run(&run.run_id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].job_id, job.job_id);
}

async fn suite_attempts(store: &dyn Store) {
    let run = sample_run("u1");
    store.insert_run(&run).await.unwrap();
    let job = sample_job(&run);
    store.insert_job(&job).await.unwrap();

    let first = JobAttempt::begin(&job.job_id);
    store.insert_attempt(&first).await.unwrap();
    store
        .update_attempt(&first.clone().finish(false, Some(503), Some("boom".to_string())))
        .await
        .unwrap();

    let second = JobAttempt::begin(&job.job_id);
    store.insert_attempt(&second).await.unwrap();
    store
        .update_attempt(&second.clone().finish(true, None, None))
        .await
        .unwrap();

    let attempts = store.attempts_for_job(&job.job_id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert!(!attempts[0].success);
    assert_eq!(attempts[0].status_code, Some(503));
    assert_eq!(attempts[0].error_text.as_deref(), Some("boom"));
    assert!(attempts[1].success);
    assert!(attempts[1].finished_at.is_some());
}

async fn suite_buckets(store: &dyn Store) {
    assert!(store.get_bucket("k").await.unwrap().is_none());

    let bucket = RateLimitBucket {
        key: "k".to_string(),
        tokens: 3.5,
        capacity: 10.0,
        refill_rate_per_s: 0.5,
        last_refill_at: Utc::now(),
    };
    store.put_bucket(&bucket).await.unwrap();

    let loaded = store.get_bucket("k").await.unwrap().unwrap();
    assert_eq!(loaded.tokens, 3.5);
    assert_eq!(loaded.capacity, 10.0);

    // Upsert overwrites.
    let mut updated = bucket.clone();
    updated.tokens = 1.0;
    store.put_bucket(&updated).await.unwrap();
    let loaded = store.get_bucket("k").await.unwrap().unwrap();
    assert_eq!(loaded.tokens, 1.0);
}

async fn suite_sessions(store: &dyn Store) {
    assert!(store.get_session("u1", 1, 1).await.unwrap().is_none());

    let mut session = EducationSession::new("u1", 1, 1);
    session
        .artifacts
        .insert("plan".to_string(), json!({"topics": []}));
    session.etag = Some("\"v1\"".to_string());
    store.upsert_session(&session).await.unwrap();

    let loaded = store.get_session("u1", 1, 1).await.unwrap().unwrap();
    assert_eq!(loaded.phase, Phase::Planning);
    assert_eq!(loaded.etag.as_deref(), Some("\"v1\""));
    assert!(loaded.artifacts.contains_key("plan"));

    session.phase = Phase::Lecture;
    session
        .artifacts
        .insert("lecture".to_string(), json!({"title": "t"}));
    store.upsert_session(&session).await.unwrap();

    let loaded = store.get_session("u1", 1, 1).await.unwrap().unwrap();
    assert_eq!(loaded.phase, Phase::Lecture);
    assert_eq!(loaded.artifacts.len(), 2);

    store
        .upsert_session(&EducationSession::new("u1", 2, 1))
        .await
        .unwrap();
    let sessions = store.sessions_for_user("u1").await.unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0].week, 2, "newest (week, day) first");
}

// ===== MemStore =====

#[tokio::test]
async fn mem_run_round_trip() {
    suite_run_round_trip(&MemStore::new()).await;
}

#[tokio::test]
async fn mem_list_runs_filters() {
    suite_list_runs_filters(&MemStore::new()).await;
}

#[tokio::test]
async fn mem_job_lifecycle() {
    suite_job_lifecycle(&MemStore::new()).await;
}

#[tokio::test]
async fn mem_attempts() {
    suite_attempts(&MemStore::new()).await;
}

#[tokio::test]
async fn mem_buckets() {
    suite_buckets(&MemStore::new()).await;
}

#[tokio::test]
async fn mem_sessions() {
    suite_sessions(&MemStore::new()).await;
}

// ===== SqliteStore =====

#[tokio::test]
async fn sqlite_run_round_trip() {
    let (_dir, store) = sqlite_store().await;
    suite_run_round_trip(store.as_ref()).await;
}

#[tokio::test]
async fn sqlite_list_runs_filters() {
    let (_dir, store) = sqlite_store().await;
    suite_list_runs_filters(store.as_ref()).await;
}

#[tokio::test]
async fn sqlite_job_lifecycle() {
    let (_dir, store) = sqlite_store().await;
    suite_job_lifecycle(store.as_ref()).await;
}

#[tokio::test]
async fn sqlite_attempts() {
    let (_dir, store) = sqlite_store().await;
    suite_attempts(store.as_ref()).await;
}

#[tokio::test]
async fn sqlite_buckets() {
    let (_dir, store) = sqlite_store().await;
    suite_buckets(store.as_ref()).await;
}

#[tokio::test]
async fn sqlite_sessions() {
    let (_dir, store) = sqlite_store().await;
    suite_sessions(store.as_ref()).await;
}

#[tokio::test]
async fn sqlite_schema_survives_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("persist.db");

    let run = sample_run("u1");
    {
        let store = SqliteStore::connect(path.to_str().unwrap()).await.unwrap();
        store.insert_run(&run).await.unwrap();
    }

    let store = SqliteStore::connect(path.to_str().unwrap()).await.unwrap();
    let loaded = store.get_run(&run.run_id).await.unwrap();
    assert_eq!(loaded.user_id, "u1");
}
