//! Tests for mentorflow.yaml config loading.

use std::io::Write;
use std::path::Path;

use mentorflow::cli::config::MentorflowConfig;

#[test]
fn explicit_missing_path_errors() {
    let result = MentorflowConfig::load(Some(Path::new("/nonexistent/mentorflow.yaml")));
    assert!(result.is_err());
}

#[test]
fn full_config_parses() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mentorflow.yaml");
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(
        br#"
host: 127.0.0.1
port: 8080
db_path: /var/lib/mentorflow/state.db
agents_base_url: http://agents.internal:8801
workflows_dir: /etc/mentorflow/workflows
workers: 4
poll_interval_ms: 250
"#,
    )
    .unwrap();

    let config = MentorflowConfig::load(Some(&path)).unwrap();
    assert_eq!(config.host.as_deref(), Some("127.0.0.1"));
    assert_eq!(config.port, Some(8080));
    assert_eq!(config.db_path.as_deref(), Some("/var/lib/mentorflow/state.db"));
    assert_eq!(
        config.agents_base_url.as_deref(),
        Some("http://agents.internal:8801")
    );
    assert_eq!(config.workflows_dir.as_deref(), Some("/etc/mentorflow/workflows"));
    assert_eq!(config.workers, Some(4));
    assert_eq!(config.poll_interval_ms, Some(250));
}

#[test]
fn partial_config_leaves_rest_none() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mentorflow.yaml");
    std::fs::write(&path, "port: 9000\n").unwrap();

    let config = MentorflowConfig::load(Some(&path)).unwrap();
    assert_eq!(config.port, Some(9000));
    assert!(config.host.is_none());
    assert!(config.db_path.is_none());
    assert!(config.workers.is_none());
}

#[test]
fn invalid_yaml_errors() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mentorflow.yaml");
    std::fs::write(&path, "port: [not a number\n").unwrap();

    assert!(MentorflowConfig::load(Some(&path)).is_err());
}
