//! Tests for workflow dispatch: spec resolution, fail-fast validation,
//! and run independence.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use mentorflow::engine::dispatcher::DispatchError;
use mentorflow::engine::types::*;
use mentorflow::engine::Dispatcher;
use mentorflow::storage::mem_store::MemStore;
use mentorflow::storage::Store;
use mentorflow::workflows::WorkflowSource;

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

/// A source that always errors, standing in for an unreachable store.
struct BrokenSource;

#[async_trait]
impl WorkflowSource for BrokenSource {
    async fn load(&self, _key: &str) -> anyhow::Result<Option<WorkflowSpec>> {
        anyhow::bail!("definition store unreachable")
    }

    async fn keys(&self) -> anyhow::Result<Vec<String>> {
        anyhow::bail!("definition store unreachable")
    }
}

#[tokio::test]
async fn dispatch_unknown_workflow_fails() {
    let store = Arc::new(MemStore::new());
    let dispatcher = Dispatcher::new(store.clone());

    let err = dispatcher
        .dispatch("u1", "no_such_workflow", None, json!(null))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::UnknownWorkflow(_)));

    assert!(store.list_runs(None, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn dispatch_twice_creates_independent_runs() {
    let store = Arc::new(MemStore::new());
    let dispatcher = Dispatcher::new(store.clone());

    let first = dispatcher
        .dispatch("u1", "weekly_seed_v1", None, json!({ "week": 1 }))
        .await
        .unwrap();
    let second = dispatcher
        .dispatch("u1", "weekly_seed_v1", None, json!({ "week": 1 }))
        .await
        .unwrap();

    assert_ne!(first.run_id, second.run_id);
    assert_eq!(store.list_runs(Some("u1"), None).await.unwrap().len(), 2);
}

#[tokio::test]
async fn malformed_spec_persists_nothing() {
    let spec = WorkflowSpec {
        key: "cyclic".to_string(),
        trigger: Trigger::Events(vec!["go".to_string()]),
        steps: vec![
            WorkflowStep {
                id: "a".to_string(),
                tool: "clo".to_string(),
                mode: "begin_week".to_string(),
                body: json!({}),
                timeout_s: 5.0,
                retry: RetryPolicy::default(),
                depends_on: vec!["b".to_string()],
            },
            WorkflowStep {
                id: "b".to_string(),
                tool: "ta".to_string(),
                mode: "generate_week".to_string(),
                body: json!({}),
                timeout_s: 5.0,
                retry: RetryPolicy::default(),
                depends_on: vec!["a".to_string()],
            },
        ],
    };

    let store = Arc::new(MemStore::new());
    let table: HashMap<String, WorkflowSpec> =
        [("cyclic".to_string(), spec)].into_iter().collect();
    let dispatcher = Dispatcher::new(store.clone()).with_source(Arc::new(TableSource(table)));

    let err = dispatcher
        .dispatch("u1", "cyclic", None, json!(null))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidSpec { .. }));

    assert!(store.list_runs(None, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn broken_source_falls_back_to_builtin_table() {
    let store = Arc::new(MemStore::new());
    let dispatcher = Dispatcher::new(store.clone()).with_source(Arc::new(BrokenSource));

    let receipt = dispatcher
        .dispatch("u1", "weekly_seed_v1", Some("intent-7".to_string()), json!({ "week": 4 }))
        .await
        .unwrap();

    let run = store.get_run(&receipt.run_id).await.unwrap();
    assert_eq!(run.workflow_key, "weekly_seed_v1");
    assert_eq!(run.intent_id.as_deref(), Some("intent-7"));
    assert_eq!(run.status, RunStatus::Running);
}

#[tokio::test]
async fn run_snapshot_carries_resolved_steps() {
    let store = Arc::new(MemStore::new());
    let dispatcher = Dispatcher::new(store.clone());

    let receipt = dispatcher
        .dispatch("u1", "daily_warmup_v1", None, json!({ "week": 2, "day": 3 }))
        .await
        .unwrap();
    assert_eq!(receipt.steps_enqueued, 1);

    let run = store.get_run(&receipt.run_id).await.unwrap();
    assert_eq!(run.steps.len(), 2);
    assert_eq!(run.payload["day"], json!(3));

    // Root body was resolved from the dispatch payload at enqueue time.
    let jobs = store.jobs_for_run(&receipt.run_id).await.unwrap();
    assert_eq!(jobs[0].payload.body["week"], json!(2));
    assert_eq!(jobs[0].payload.body["day"], json!(3));
}
