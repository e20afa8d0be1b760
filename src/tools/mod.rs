pub mod call;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

pub use call::ToolCall;

use crate::limiter::{RateLimitConfig, RateLimiter};

/// Failure taxonomy for a tool invocation.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    /// Bucket exhausted. A denial, not a failure — the caller backs off
    /// without consuming a retry attempt.
    #[error("rate limited on {key}")]
    RateLimited { key: String },
    /// Infrastructure-level failure: network error, timeout, or 5xx.
    /// Safe to retry.
    #[error("tool '{tool}' degraded: {message}")]
    Degraded {
        tool: String,
        status: Option<u16>,
        message: String,
    },
    /// Semantic rejection (4xx). Retrying cannot fix it.
    #[error("tool '{tool}' rejected call ({status}): {message}")]
    Rejected {
        tool: String,
        status: u16,
        message: String,
    },
    /// The response came back 2xx but failed local validation.
    #[error("invalid tool response: {0}")]
    Invalid(String),
}

impl ToolError {
    pub fn is_degraded(&self) -> bool {
        matches!(self, ToolError::Degraded { .. })
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ToolError::RateLimited { .. })
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            ToolError::Degraded { status, .. } => *status,
            ToolError::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Successful invocation outcome. `NotModified` is first-class so callers
/// cannot forget the cached-reuse path.
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    /// Fresh payload plus the ETag to persist for the next conditional call.
    Fresh { data: Value, etag: Option<String> },
    /// Upstream reports the signal unchanged since `If-None-Match`.
    NotModified,
}

pub type ToolResult = Result<ToolOutcome, ToolError>;

/// Per-call knobs. All optional.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// ETag from the previous fresh result, for conditional fetch.
    pub etag_if_none_match: Option<String>,
    /// Correlation/idempotency header value.
    pub idempotency_key: Option<String>,
    /// Overrides the default 30s request timeout.
    pub timeout_s: Option<f64>,
}

/// Registry entry for one reasoning service.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub version: &'static str,
    /// Per-user call budget, in calls per minute.
    pub per_minute: f64,
    /// Endpoint path under the agents base URL.
    pub path: &'static str,
    pub description: &'static str,
}

/// Typed, idempotency-aware gateway to the external reasoning services.
///
/// Every call is admission-checked against the per-user bucket for the
/// target tool before any bytes leave the process.
pub struct ToolRegistry {
    base_url: String,
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    tools: HashMap<&'static str, ToolDescriptor>,
}

impl ToolRegistry {
    pub fn new(base_url: &str, limiter: Arc<RateLimiter>) -> Self {
        let mut tools = HashMap::new();
        for descriptor in builtin_tools() {
            tools.insert(descriptor.name, descriptor);
        }
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
            limiter,
            tools,
        }
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    /// All registered tools, sorted by name.
    pub fn list(&self) -> Vec<&ToolDescriptor> {
        let mut entries: Vec<&ToolDescriptor> = self.tools.values().collect();
        entries.sort_by_key(|d| d.name);
        entries
    }

    /// Rate-limit key guarding one user's budget on one tool.
    pub fn limit_key(user_id: &str, tool: &str) -> String {
        format!("user:{}:agent:{}", user_id, tool)
    }

    /// Invoke a tool for a user. See [`ToolError`] for the outcome taxonomy.
    pub async fn call(&self, user_id: &str, call: &ToolCall, opts: CallOptions) -> ToolResult {
        let tool = call.tool();
        let descriptor = self
            .tools
            .get(tool)
            .ok_or_else(|| ToolError::Invalid(format!("Unknown tool: {}", tool)))?;

        let key = Self::limit_key(user_id, tool);
        let admitted = self
            .limiter
            .admit(&key, 1.0, RateLimitConfig::per_minute(descriptor.per_minute))
            .await
            .map_err(|e| ToolError::Degraded {
                tool: tool.to_string(),
                status: None,
                message: format!("rate limiter unavailable: {:#}", e),
            })?;
        if !admitted {
            return Err(ToolError::RateLimited { key });
        }

        let url = format!("{}{}", self.base_url, descriptor.path);
        let timeout = Duration::from_secs_f64(opts.timeout_s.unwrap_or(30.0));
        let body = serde_json::json!({
            "action": call.mode(),
            "payload": call.payload(),
            "userId": user_id,
        });

        let mut request = self.client.post(&url).timeout(timeout).json(&body);
        if let Some(ref etag) = opts.etag_if_none_match {
            request = request.header(reqwest::header::IF_NONE_MATCH, etag.as_str());
        }
        if let Some(ref idem) = opts.idempotency_key {
            request = request.header("Idempotency-Key", idem.as_str());
        }

        debug!(tool = %tool, mode = %call.mode(), user = %user_id, "Calling tool");

        let response = request.send().await.map_err(|e| ToolError::Degraded {
            tool: tool.to_string(),
            status: None,
            message: format!("{:#}", e),
        })?;

        let status = response.status();
        let status_u16 = status.as_u16();

        if status_u16 == 304 {
            return Ok(ToolOutcome::NotModified);
        }

        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let text = response.text().await.map_err(|e| ToolError::Degraded {
            tool: tool.to_string(),
            status: Some(status_u16),
            message: format!("{:#}", e),
        })?;

        if status.is_server_error() {
            warn!(tool = %tool, status = status_u16, "Tool degraded");
            return Err(ToolError::Degraded {
                tool: tool.to_string(),
                status: Some(status_u16),
                message: truncate(&text, 500),
            });
        }
        if status.is_client_error() {
            return Err(ToolError::Rejected {
                tool: tool.to_string(),
                status: status_u16,
                message: truncate(&text, 500),
            });
        }
        if !status.is_success() {
            return Err(ToolError::Degraded {
                tool: tool.to_string(),
                status: Some(status_u16),
                message: format!("unexpected status {}", status_u16),
            });
        }

        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| ToolError::Invalid(format!("non-JSON body: {}", e)))?;
        // Tools answer `{data: ...}`; tolerate a bare payload.
        let data = match parsed.get("data") {
            Some(d) => d.clone(),
            None => parsed,
        };

        Ok(ToolOutcome::Fresh { data, etag })
    }
}

/// Validate that `required` fields are present on a successful tool
/// payload. A miss is a local [`ToolError::Invalid`], never an
/// infrastructure failure.
pub fn parse_tool_result<'a>(
    data: &'a Value,
    required: &[&str],
) -> Result<&'a serde_json::Map<String, Value>, ToolError> {
    let map = data
        .as_object()
        .ok_or_else(|| ToolError::Invalid("tool payload is not an object".to_string()))?;
    for field in required {
        if !map.contains_key(*field) {
            return Err(ToolError::Invalid(format!("missing field '{}'", field)));
        }
    }
    Ok(map)
}

/// Stable correlation key for one attempt of one step.
pub fn idempotency_key(run_id: &str, step_id: &str, attempt: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_bytes());
    hasher.update(b":");
    hasher.update(step_id.as_bytes());
    hasher.update(b":");
    hasher.update(attempt.to_le_bytes());
    hex::encode(&hasher.finalize()[..16])
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

fn builtin_tools() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            name: "clo",
            version: "1.2.0",
            per_minute: 4.0,
            path: "/agents/clo",
            description: "Curriculum planner — weekly objectives and day plans",
        },
        ToolDescriptor {
            name: "lecturer",
            version: "1.0.3",
            per_minute: 4.0,
            path: "/agents/lecturer",
            description: "Lecture delivery from a day plan",
        },
        ToolDescriptor {
            name: "ta",
            version: "2.1.0",
            per_minute: 8.0,
            path: "/agents/ta",
            description: "Teaching assistant — checks, exercises, reviews",
        },
        ToolDescriptor {
            name: "socratic",
            version: "0.9.1",
            per_minute: 6.0,
            path: "/agents/socratic",
            description: "Guided-dialogue session preparation",
        },
        ToolDescriptor {
            name: "grader",
            version: "1.4.0",
            per_minute: 2.0,
            path: "/agents/grader",
            description: "Coding workspace provisioning and grading",
        },
        ToolDescriptor {
            name: "brand",
            version: "1.0.0",
            per_minute: 6.0,
            path: "/agents/brand",
            description: "Course material ingest",
        },
    ]
}
