//! Integration tests for the durable job queue and retry engine.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use mentorflow::engine::types::*;
use mentorflow::engine::{Dispatcher, JobQueue};
use mentorflow::storage::mem_store::MemStore;
use mentorflow::storage::Store;
use mentorflow::workflows::WorkflowSource;

/// Fixed in-memory definition table for tests.
struct TableSource(HashMap<String, WorkflowSpec>);

#[async_trait]
impl WorkflowSource for TableSource {
    async fn load(&self, key: &str) -> anyhow::Result<Option<WorkflowSpec>> {
        Ok(self.0.get(key).cloned())
    }

    async fn keys(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.0.keys().cloned().collect())
    }
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        backoff: BackoffKind::Exp,
        base_delay_s: 0.0,
        max_delay_s: None,
    }
}

fn step(id: &str, deps: &[&str], retry: RetryPolicy) -> WorkflowStep {
    WorkflowStep {
        id: id.to_string(),
        tool: "clo".to_string(),
        mode: "begin_week".to_string(),
        body: json!({ "week": "${payload.week}" }),
        timeout_s: 5.0,
        retry,
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
    }
}

fn harness(specs: Vec<WorkflowSpec>) -> (Arc<MemStore>, Dispatcher, JobQueue) {
    let store = Arc::new(MemStore::new());
    let table: HashMap<String, WorkflowSpec> =
        specs.into_iter().map(|s| (s.key.clone(), s)).collect();
    let dispatcher =
        Dispatcher::new(store.clone()).with_source(Arc::new(TableSource(table)));
    let queue = JobQueue::new(store.clone());
    (store, dispatcher, queue)
}

// --- Dependency fan-out ---

#[tokio::test]
async fn weekly_seed_fans_out_in_dependency_order() {
    let store = Arc::new(MemStore::new());
    let dispatcher = Dispatcher::new(store.clone());
    let queue = JobQueue::new(store.clone());

    let receipt = dispatcher
        .dispatch("u1", "weekly_seed_v1", None, json!({ "week": 2 }))
        .await
        .unwrap();
    assert_eq!(receipt.steps_enqueued, 1);

    // Only the root step is queued.
    let jobs = store.jobs_for_run(&receipt.run_id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].step_id, "clo_begin_week");
    // The dispatch payload was interpolated into the body.
    assert_eq!(jobs[0].payload.body["week"], json!(2));

    // Root completes: exactly the two middle steps unblock.
    let claimed = queue.claim_next().await.unwrap().unwrap();
    assert_eq!(claimed.step.id, "clo_begin_week");
    queue
        .complete(claimed, json!({ "objectives": ["own the borrow checker"] }))
        .await
        .unwrap();

    let jobs = store.jobs_for_run(&receipt.run_id).await.unwrap();
    let queued: Vec<&str> = jobs
        .iter()
        .filter(|j| j.status == JobStatus::Queued)
        .map(|j| j.step_id.as_str())
        .collect();
    assert_eq!(jobs.len(), 3);
    assert!(queued.contains(&"ta_generate_week"));
    assert!(queued.contains(&"socratic_seed"));

    // One branch done: the join step must not appear yet.
    let claimed = queue.claim_next().await.unwrap().unwrap();
    let first_branch = claimed.step.id.clone();
    queue.complete(claimed, json!({ "items": 12 })).await.unwrap();

    let jobs = store.jobs_for_run(&receipt.run_id).await.unwrap();
    assert!(
        !jobs.iter().any(|j| j.step_id == "brand_ingest"),
        "join step enqueued before both branches were done"
    );

    // Second branch done: the join unblocks with both upstream results.
    let claimed = queue.claim_next().await.unwrap().unwrap();
    assert_ne!(claimed.step.id, first_branch);
    queue.complete(claimed, json!({ "items": 7 })).await.unwrap();

    let jobs = store.jobs_for_run(&receipt.run_id).await.unwrap();
    let brand = jobs
        .iter()
        .find(|j| j.step_id == "brand_ingest")
        .expect("join step never enqueued");
    assert_eq!(brand.status, JobStatus::Queued);
    assert_eq!(brand.payload.upstream.len(), 2);
    assert!(brand.payload.upstream.contains_key("ta_generate_week"));
    assert!(brand.payload.upstream.contains_key("socratic_seed"));

    // Join completes: the run is done, no step was skipped.
    let claimed = queue.claim_next().await.unwrap().unwrap();
    queue.complete(claimed, json!({ "ingested": true })).await.unwrap();

    let jobs = store.jobs_for_run(&receipt.run_id).await.unwrap();
    assert_eq!(jobs.len(), 4);
    assert!(jobs.iter().all(|j| j.status == JobStatus::Done));

    let run = store.get_run(&receipt.run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.finished.is_some());
}

#[tokio::test]
async fn dependent_never_queued_while_dependency_pending() {
    let spec = WorkflowSpec {
        key: "chain".to_string(),
        trigger: Trigger::Events(vec!["go".to_string()]),
        steps: vec![
            step("a", &[], fast_retry(1)),
            step("b", &["a"], fast_retry(1)),
        ],
    };
    let (store, dispatcher, queue) = harness(vec![spec]);

    let receipt = dispatcher
        .dispatch("u1", "chain", None, json!({ "week": 1 }))
        .await
        .unwrap();

    let jobs = store.jobs_for_run(&receipt.run_id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].step_id, "a");

    // The dependency dies: the dependent must never be enqueued.
    let claimed = queue.claim_next().await.unwrap().unwrap();
    queue.fail(claimed, Some(400), "rejected", false).await.unwrap();

    let jobs = store.jobs_for_run(&receipt.run_id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Dead);

    let run = store.get_run(&receipt.run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
}

// --- Retry accounting ---

#[tokio::test]
async fn degraded_three_times_then_success_ends_done() {
    let spec = WorkflowSpec {
        key: "flaky".to_string(),
        trigger: Trigger::Events(vec!["go".to_string()]),
        steps: vec![step("s", &[], fast_retry(5))],
    };
    let (store, dispatcher, queue) = harness(vec![spec]);

    let receipt = dispatcher
        .dispatch("u1", "flaky", None, json!({ "week": 1 }))
        .await
        .unwrap();

    for _ in 0..3 {
        let claimed = queue.claim_next().await.unwrap().unwrap();
        queue
            .fail(claimed, Some(503), "service unavailable", true)
            .await
            .unwrap();
    }

    let claimed = queue.claim_next().await.unwrap().unwrap();
    queue.complete(claimed, json!({ "ok": true })).await.unwrap();

    let jobs = store.jobs_for_run(&receipt.run_id).await.unwrap();
    assert_eq!(jobs[0].status, JobStatus::Done);
    assert_eq!(jobs[0].attempts, 4);

    let attempts = store.attempts_for_job(&jobs[0].job_id).await.unwrap();
    assert_eq!(attempts.len(), 4);
    assert_eq!(attempts.iter().filter(|a| !a.success).count(), 3);
    assert_eq!(attempts.iter().filter(|a| a.success).count(), 1);
    assert!(attempts
        .iter()
        .filter(|a| !a.success)
        .all(|a| a.status_code == Some(503)));

    let run = store.get_run(&receipt.run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
}

#[tokio::test]
async fn rejection_on_first_attempt_ends_dead_immediately() {
    let spec = WorkflowSpec {
        key: "rejected".to_string(),
        trigger: Trigger::Events(vec!["go".to_string()]),
        steps: vec![step("s", &[], fast_retry(5))],
    };
    let (store, dispatcher, queue) = harness(vec![spec]);

    let receipt = dispatcher
        .dispatch("u1", "rejected", None, json!({ "week": 1 }))
        .await
        .unwrap();

    let claimed = queue.claim_next().await.unwrap().unwrap();
    queue
        .fail(claimed, Some(400), "validation failed", false)
        .await
        .unwrap();

    let jobs = store.jobs_for_run(&receipt.run_id).await.unwrap();
    assert_eq!(jobs[0].status, JobStatus::Dead);
    assert_eq!(jobs[0].attempts, 1);

    let attempts = store.attempts_for_job(&jobs[0].job_id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status_code, Some(400));

    let run = store.get_run(&receipt.run_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
}

#[tokio::test]
async fn attempts_never_exceed_max_before_dead() {
    let spec = WorkflowSpec {
        key: "doomed".to_string(),
        trigger: Trigger::Events(vec!["go".to_string()]),
        steps: vec![step("s", &[], fast_retry(3))],
    };
    let (store, dispatcher, queue) = harness(vec![spec]);

    let receipt = dispatcher
        .dispatch("u1", "doomed", None, json!({ "week": 1 }))
        .await
        .unwrap();

    loop {
        match queue.claim_next().await.unwrap() {
            Some(claimed) => queue
                .fail(claimed, Some(500), "boom", true)
                .await
                .unwrap(),
            None => break,
        }
    }

    let jobs = store.jobs_for_run(&receipt.run_id).await.unwrap();
    assert_eq!(jobs[0].status, JobStatus::Dead);
    assert_eq!(jobs[0].attempts, 3);

    let attempts = store.attempts_for_job(&jobs[0].job_id).await.unwrap();
    assert_eq!(attempts.len(), 3);
}

// --- Rate-limited requeue ---

#[tokio::test]
async fn rate_limited_requeue_consumes_no_attempt() {
    let spec = WorkflowSpec {
        key: "limited".to_string(),
        trigger: Trigger::Events(vec!["go".to_string()]),
        steps: vec![step("s", &[], fast_retry(2))],
    };
    let (store, dispatcher, queue) = harness(vec![spec]);

    let receipt = dispatcher
        .dispatch("u1", "limited", None, json!({ "week": 1 }))
        .await
        .unwrap();

    let claimed = queue.claim_next().await.unwrap().unwrap();
    queue.rate_limited(claimed).await.unwrap();

    let jobs = store.jobs_for_run(&receipt.run_id).await.unwrap();
    assert_eq!(jobs[0].status, JobStatus::Queued);
    assert_eq!(jobs[0].attempts, 0, "denial must not consume the budget");
    assert!(jobs[0].next_run_at > Utc::now(), "requeue must be delayed");

    // Not claimable until the delay passes.
    assert!(queue.claim_next().await.unwrap().is_none());

    // Fast-forward the schedule; the job runs with a full budget.
    let mut job = jobs[0].clone();
    job.next_run_at = Utc::now();
    store.update_job(&job).await.unwrap();

    let claimed = queue.claim_next().await.unwrap().unwrap();
    assert_eq!(claimed.job.attempts, 1);
    queue.complete(claimed, json!({})).await.unwrap();
}

// --- Claim exclusivity ---

#[tokio::test]
async fn claimed_job_cannot_be_claimed_again() {
    let spec = WorkflowSpec {
        key: "solo".to_string(),
        trigger: Trigger::Events(vec!["go".to_string()]),
        steps: vec![step("s", &[], fast_retry(1))],
    };
    let (_store, dispatcher, queue) = harness(vec![spec]);

    dispatcher
        .dispatch("u1", "solo", None, json!({ "week": 1 }))
        .await
        .unwrap();

    let first = queue.claim_next().await.unwrap();
    assert!(first.is_some());

    let second = queue.claim_next().await.unwrap();
    assert!(second.is_none(), "a running job must not be claimable");
}
