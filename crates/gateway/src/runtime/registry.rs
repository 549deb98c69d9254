//! The tool registry — uniform descriptors and dispatch for every callable
//! exposed to agents.
//!
//! A descriptor carries the JSON parameter schema shown to the LLM, a safety
//! class, an optional UI component hint, a per-tool title template for the
//! desktop client, and the invoker that actually runs the call. Tools are
//! selected by name; unknown names are an error, never a panic.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use regex::RegexSet;
use serde_json::Value;

use ps_domain::tool::ToolDefinition;

use super::mux::EventMux;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Invocation types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-call context threaded into every invoker.
#[derive(Clone)]
pub struct ToolContext {
    pub task_id: String,
    pub trace_id: String,
    /// Active kubecontext for the trace, mutable via `set_kubecontext`.
    pub kubecontext: Arc<RwLock<Option<String>>>,
    /// Event sink — lets self-describing tools (todo board, sub-agents)
    /// emit their own events.
    pub mux: Arc<EventMux>,
}

impl ToolContext {
    pub fn current_kubecontext(&self) -> Option<String> {
        self.kubecontext.read().clone()
    }
}

/// The result of a tool invocation: a textual or structured output plus a
/// success flag.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub output: Value,
    pub success: bool,
}

impl ToolOutcome {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            output: Value::String(content.into()),
            success: true,
        }
    }

    pub fn structured(output: Value) -> Self {
        Self {
            output,
            success: true,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            output: Value::String(message.into()),
            success: false,
        }
    }

    /// The textual form fed back to the model.
    pub fn model_text(&self) -> String {
        match &self.output {
            Value::String(s) => s.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_default(),
        }
    }
}

#[async_trait::async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, arguments: &Value, ctx: &ToolContext) -> ToolOutcome;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Descriptors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyClass {
    /// Executes immediately.
    Auto,
    /// Requires a human decision unless pre-approved for the session.
    Gated,
}

/// Maps tool arguments to a one-line human title, e.g. "Listing pods in prod".
pub type TitleFn = fn(&Value) -> String;

pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema (object) for the arguments.
    pub parameters: Value,
    pub safety: SafetyClass,
    /// Tag the desktop client uses to render structured output.
    pub ui_component: Option<String>,
    /// Agent tags this tool is exposed to ("supervisor", "logs", ...).
    pub agents: Vec<String>,
    pub title: Option<TitleFn>,
    pub invoker: Arc<dyn ToolInvoker>,
}

impl ToolSpec {
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }

    /// Human title for the UI; falls back to Title Case of the tool name.
    pub fn describe(&self, arguments: &Value) -> String {
        match self.title {
            Some(f) => f(arguments),
            None => title_case(&self.name),
        }
    }

    /// Check the arguments object against the schema's `required` list.
    pub fn validate_arguments(&self, arguments: &Value) -> Result<(), String> {
        if !arguments.is_object() {
            return Err("arguments must be a JSON object".into());
        }
        let required = self
            .parameters
            .get("required")
            .and_then(|r| r.as_array())
            .map(|a| a.as_slice())
            .unwrap_or_default();
        for field in required {
            let Some(name) = field.as_str() else { continue };
            if arguments.get(name).is_none() {
                return Err(format!("missing required argument: {name}"));
            }
        }
        Ok(())
    }
}

/// Title Case fallback for tools without an explicit title template.
pub fn title_case(tool_name: &str) -> String {
    tool_name
        .split('_')
        .filter(|p| !p.is_empty())
        .map(|p| {
            let mut chars = p.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ToolRegistry {
    tools: HashMap<String, Arc<ToolSpec>>,
    deny: RegexSet,
}

impl ToolRegistry {
    /// Build an empty registry with the configured deny patterns compiled
    /// once. Invalid patterns are dropped with a warning.
    pub fn new(deny_patterns: &[String]) -> Self {
        let valid: Vec<&String> = deny_patterns
            .iter()
            .filter(|p| match regex::Regex::new(p) {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!(pattern = %p, error = %e, "invalid deny pattern, skipping");
                    false
                }
            })
            .collect();
        let deny = RegexSet::new(valid).unwrap_or_else(|_| RegexSet::empty());
        Self {
            tools: HashMap::new(),
            deny,
        }
    }

    pub fn register(&mut self, spec: ToolSpec) {
        if self.tools.contains_key(&spec.name) {
            tracing::warn!(tool = %spec.name, "duplicate tool registration, replacing");
        }
        self.tools.insert(spec.name.clone(), Arc::new(spec));
    }

    pub fn get(&self, name: &str) -> Option<Arc<ToolSpec>> {
        self.tools.get(name).cloned()
    }

    /// Descriptors visible to one agent tag, sorted by name so the schemas
    /// sent to the model are deterministic.
    pub fn specs_for_agent(&self, agent_tag: &str) -> Vec<Arc<ToolSpec>> {
        let mut specs: Vec<Arc<ToolSpec>> = self
            .tools
            .values()
            .filter(|s| s.agents.iter().any(|a| a == agent_tag))
            .cloned()
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn definitions_for_agent(&self, agent_tag: &str) -> Vec<ToolDefinition> {
        self.specs_for_agent(agent_tag)
            .iter()
            .map(|s| s.definition())
            .collect()
    }

    /// Human title for a call. Unknown tools fall back to Title Case.
    pub fn describe(&self, name: &str, arguments: &Value) -> String {
        match self.get(name) {
            Some(spec) => spec.describe(arguments),
            None => title_case(name),
        }
    }

    /// Returns a refusal message when the serialized arguments match one of
    /// the configured deny patterns.
    pub fn check_denied(&self, arguments: &Value) -> Option<String> {
        let rendered = arguments.to_string();
        if self.deny.is_match(&rendered) {
            Some("call blocked by the configured deny policy".into())
        } else {
            None
        }
    }

    /// Invoke a tool by name with schema validation. Unknown names produce a
    /// failed outcome, not a panic.
    pub async fn invoke(&self, name: &str, arguments: &Value, ctx: &ToolContext) -> ToolOutcome {
        let Some(spec) = self.get(name) else {
            return ToolOutcome::failure(format!("tool not found: {name}"));
        };
        if let Err(msg) = spec.validate_arguments(arguments) {
            return ToolOutcome::failure(msg);
        }
        if let Some(msg) = self.check_denied(arguments) {
            return ToolOutcome::failure(msg);
        }
        spec.invoker.invoke(arguments, ctx).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
