//! Daemon configuration, deserialized from a TOML file by the wrapper
//! binary. The runtime only ever sees this typed struct.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub investigation: InvestigationConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: d_port(),
            host: d_host(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM providers & roles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Registered OpenAI-compatible endpoints.
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Role → "provider_id/model" spec. Known roles: `supervisor`,
    /// `specialist`, `summarizer`. Unlisted roles fall back to the first
    /// provider's default model.
    #[serde(default)]
    pub roles: HashMap<String, String>,
    /// Deadline for one LLM request, streaming included (seconds).
    #[serde(default = "d_llm_timeout")]
    pub request_timeout_secs: u64,
    /// Retries for an LLM call that fails before producing any content.
    #[serde(default = "d_retry_budget")]
    pub retry_budget: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            roles: HashMap::new(),
            request_timeout_secs: d_llm_timeout(),
            retry_budget: d_retry_budget(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub base_url: String,
    /// Inline API key. Prefer `api_key_env` outside of tests.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable to read the API key from.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "d_model")]
    pub default_model: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Tool names executed without approval on top of their descriptor's
    /// safety class (config-level auto-approve set).
    #[serde(default)]
    pub auto_approve: Vec<String>,
    /// Regex patterns over the argument JSON; matching calls are refused.
    #[serde(default = "d_deny_patterns")]
    pub deny_patterns: Vec<String>,
    /// Per-call deadline (seconds).
    #[serde(default = "d_tool_timeout")]
    pub call_timeout_secs: u64,
    /// Byte cap on tool output fed back to the model. Persisted output is
    /// never truncated.
    #[serde(default = "d_output_limit")]
    pub output_limit_bytes: usize,
    /// How long a gated call waits for a human decision (seconds).
    #[serde(default = "d_approval_timeout")]
    pub approval_timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            auto_approve: Vec::new(),
            deny_patterns: d_deny_patterns(),
            call_timeout_secs: d_tool_timeout(),
            output_limit_bytes: d_output_limit(),
            approval_timeout_secs: d_approval_timeout(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Storage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for the task database and per-task todo snapshots.
    #[serde(default = "d_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: d_data_dir(),
        }
    }
}

impl StorageConfig {
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("podscope.db")
    }

    pub fn todo_dir(&self) -> PathBuf {
        self.data_dir.join("todos")
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Investigation loop knobs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvestigationConfig {
    #[serde(default = "d_supervisor_turns")]
    pub supervisor_max_turns: usize,
    #[serde(default = "d_specialist_turns")]
    pub specialist_max_turns: usize,
    /// Consecutive identical tool calls tolerated before the loop guard
    /// short-circuits the agent.
    #[serde(default = "d_dup_limit")]
    pub duplicate_call_limit: usize,
}

impl Default for InvestigationConfig {
    fn default() -> Self {
        Self {
            supervisor_max_turns: d_supervisor_turns(),
            specialist_max_turns: d_specialist_turns(),
            duplicate_call_limit: d_dup_limit(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Observability backends
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which diagnostic backends are wired up, per kubecontext. Tools backed by
/// a disabled backend are not exposed to agents for that context.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub default: BackendFlags,
    /// Per-kubecontext overrides.
    #[serde(default)]
    pub contexts: HashMap<String, BackendFlags>,
}

impl ObservabilityConfig {
    pub fn for_context(&self, kubecontext: Option<&str>) -> &BackendFlags {
        kubecontext
            .and_then(|ctx| self.contexts.get(ctx))
            .unwrap_or(&self.default)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackendFlags {
    /// Log aggregation backend (Loki-style).
    #[serde(default = "d_true")]
    pub logs: bool,
    /// Metrics backend (Prometheus-style).
    #[serde(default = "d_true")]
    pub metrics: bool,
}

impl Default for BackendFlags {
    fn default() -> Self {
        Self {
            logs: true,
            metrics: true,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "server.port".into(),
                message: "port must be greater than 0".into(),
            });
        }

        if self.llm.providers.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "llm.providers".into(),
                message: "no LLM providers configured; investigations will fail".into(),
            });
        }

        for provider in &self.llm.providers {
            if !provider.base_url.starts_with("http://")
                && !provider.base_url.starts_with("https://")
            {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    field: format!("llm.providers.{}.base_url", provider.id),
                    message: format!(
                        "base_url must start with http:// or https:// (got \"{}\")",
                        provider.base_url
                    ),
                });
            }
        }

        for (role, spec) in &self.llm.roles {
            let provider_id = spec.split('/').next().unwrap_or(spec);
            if !self.llm.providers.iter().any(|p| p.id == provider_id) {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Warning,
                    field: format!("llm.roles.{role}"),
                    message: format!("references unknown provider \"{provider_id}\""),
                });
            }
        }

        for pattern in &self.tools.deny_patterns {
            if let Err(e) = regex_check(pattern) {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    field: "tools.deny_patterns".into(),
                    message: format!("invalid regex \"{pattern}\": {e}"),
                });
            }
        }

        if self.investigation.supervisor_max_turns == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "investigation.supervisor_max_turns".into(),
                message: "must be at least 1".into(),
            });
        }

        issues
    }
}

// Cheap syntactic sanity check without pulling `regex` into this crate; the
// gateway compiles the real `RegexSet` at startup and surfaces its errors.
fn regex_check(pattern: &str) -> Result<(), String> {
    let mut depth = 0i32;
    for c in pattern.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {}
        }
        if depth < 0 {
            return Err("unbalanced parentheses".into());
        }
    }
    if depth != 0 {
        return Err("unbalanced parentheses".into());
    }
    Ok(())
}

// ── serde default helpers ───────────────────────────────────────────

fn d_port() -> u16 {
    4400
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_model() -> String {
    "gpt-4o-mini".into()
}
fn d_llm_timeout() -> u64 {
    120
}
fn d_retry_budget() -> u32 {
    2
}
fn d_tool_timeout() -> u64 {
    30
}
fn d_output_limit() -> usize {
    10_240
}
fn d_approval_timeout() -> u64 {
    900
}
fn d_supervisor_turns() -> usize {
    20
}
fn d_specialist_turns() -> usize {
    10
}
fn d_dup_limit() -> usize {
    3
}
fn d_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn d_deny_patterns() -> Vec<String> {
    vec![
        r"kubectl\s+delete\s+namespace".into(),
        r"rm\s+-rf\s+/".into(),
        r"drain\s+--force".into(),
    ]
}
fn d_true() -> bool {
    true
}
