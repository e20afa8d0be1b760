//! Tests for workflow definition sources: the built-in table and the
//! YAML file source.

use std::io::Write;

use mentorflow::engine::types::Trigger;
use mentorflow::workflows::{builtin, builtin_keys, WorkflowSource, YamlWorkflowSource};

#[test]
fn builtin_specs_are_dispatchable() {
    for key in builtin_keys() {
        let spec = builtin(key).unwrap();
        assert_eq!(spec.key, key);
        let errors = spec.validate();
        assert!(errors.is_empty(), "builtin '{}' invalid: {:?}", key, errors);
        assert!(!spec.root_steps().is_empty());
    }
}

#[test]
fn builtin_weekly_seed_shape() {
    let spec = builtin("weekly_seed_v1").unwrap();
    assert_eq!(spec.steps.len(), 4);

    let brand = spec.step("brand_ingest").unwrap();
    assert_eq!(brand.depends_on.len(), 2);
    assert!(brand.depends_on.contains(&"ta_generate_week".to_string()));
    assert!(brand.depends_on.contains(&"socratic_seed".to_string()));

    let roots: Vec<&str> = spec.root_steps().iter().map(|s| s.id.as_str()).collect();
    assert_eq!(roots, vec!["clo_begin_week"]);
}

#[test]
fn unknown_builtin_is_none() {
    assert!(builtin("nope_v9").is_none());
}

#[tokio::test]
async fn yaml_source_loads_matching_key() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("review_loop_v1.yaml");
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(
        br#"
key: review_loop_v1
trigger:
  events: [review_requested]
steps:
  - id: collect
    tool: ta
    mode: review_practice
    body:
      practice: "${payload.practice}"
      submission: "${payload.submission}"
  - id: reflect
    tool: clo
    mode: reflect
    depends_on: [collect]
    body:
      week: "${payload.week}"
      day: "${payload.day}"
      journal: "${steps.collect}"
"#,
    )
    .unwrap();

    let source = YamlWorkflowSource::new(dir.path());
    let spec = source.load("review_loop_v1").await.unwrap().unwrap();

    assert_eq!(spec.key, "review_loop_v1");
    assert_eq!(spec.steps.len(), 2);
    assert_eq!(spec.trigger, Trigger::Events(vec!["review_requested".to_string()]));
    assert!(spec.validate().is_empty());
    assert_eq!(spec.steps[1].depends_on, vec!["collect"]);
    // Defaults fill in what the file leaves out.
    assert_eq!(spec.steps[0].timeout_s, 30.0);
    assert_eq!(spec.steps[0].retry.max_attempts, 3);
}

#[tokio::test]
async fn yaml_source_misses_unknown_key() {
    let dir = tempfile::tempdir().unwrap();
    let source = YamlWorkflowSource::new(dir.path());
    assert!(source.load("absent").await.unwrap().is_none());
}

#[tokio::test]
async fn yaml_source_rejects_key_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("alias.yaml");
    std::fs::write(
        &path,
        "key: different_name\ntrigger:\n  cron: '0 5 * * *'\nsteps: []\n",
    )
    .unwrap();

    let source = YamlWorkflowSource::new(dir.path());
    assert!(source.load("alias").await.is_err());
}

#[tokio::test]
async fn yaml_source_lists_keys_sorted() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["b_flow.yaml", "a_flow.yaml", "notes.txt"] {
        std::fs::write(dir.path().join(name), "").unwrap();
    }

    let source = YamlWorkflowSource::new(dir.path());
    assert_eq!(source.keys().await.unwrap(), vec!["a_flow", "b_flow"]);
}

#[tokio::test]
async fn yaml_source_missing_dir_is_empty() {
    let source = YamlWorkflowSource::new("/nonexistent_mentorflow_dir");
    assert!(source.keys().await.unwrap().is_empty());
    assert!(source.load("anything").await.unwrap().is_none());
}
