use std::path::Path;

use anyhow::{Context as _, Result};
use serde::Deserialize;

/// Configuration loaded from `mentorflow.yaml`.
/// All fields are optional — missing fields fall back to CLI/env/defaults.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct MentorflowConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub db_path: Option<String>,
    /// Base URL the reasoning-service endpoints hang off.
    pub agents_base_url: Option<String>,
    /// Directory of `{key}.yaml` workflow definitions.
    pub workflows_dir: Option<String>,
    pub workers: Option<usize>,
    pub poll_interval_ms: Option<u64>,
}

impl MentorflowConfig {
    /// Load configuration from a YAML file.
    ///
    /// - If `path` is `Some`, load that specific file (error if missing).
    /// - If `path` is `None`, auto-detect `mentorflow.yaml` in cwd; return
    ///   defaults if absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_path = match path {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file not found: {}", p.display());
                }
                p.to_path_buf()
            }
            None => {
                let default_path = Path::new("mentorflow.yaml");
                if !default_path.exists() {
                    return Ok(Self::default());
                }
                default_path.to_path_buf()
            }
        };

        let contents = std::fs::read_to_string(&file_path)
            .with_context(|| format!("Failed to read config file: {}", file_path.display()))?;

        let config: MentorflowConfig = serde_yml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", file_path.display()))?;

        Ok(config)
    }
}
