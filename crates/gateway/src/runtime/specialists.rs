//! Specialist agents: logging, resource discovery, and metrics analysis.
//!
//! Each specialist is an ordinary [`run_agent`] run with its own tool set
//! and instructions. Its final message is parsed into a [`SubTask`] (the
//! structured contribution persisted on the task), and a plain-text summary
//! goes back to the supervisor as the tool result. A specialist never kills
//! the supervisor: failures become failed tool outcomes.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use ps_domain::event::EventPayload;
use ps_domain::task::{PlanStep, SubTask};
use ps_domain::tool::Message;
use ps_store::EventStore;

use super::agent::{run_agent, AgentEnv, AgentOutcome, AgentRun};
use super::registry::{SafetyClass, TitleFn, ToolContext, ToolInvoker, ToolOutcome, ToolSpec};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Specialist kinds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Specialist {
    Logging,
    Discovery,
    Monitoring,
}

impl Specialist {
    pub const ALL: [Specialist; 3] = [
        Specialist::Logging,
        Specialist::Discovery,
        Specialist::Monitoring,
    ];

    /// The tool name the supervisor sees.
    pub fn tool_name(self) -> &'static str {
        match self {
            Self::Logging => "log_analysis",
            Self::Discovery => "resource_discovery",
            Self::Monitoring => "metrics_analysis",
        }
    }

    /// Name reported in `agent_started` / `agent_completed` events.
    pub fn agent_name(self) -> &'static str {
        match self {
            Self::Logging => "logging",
            Self::Discovery => "discovery",
            Self::Monitoring => "monitoring",
        }
    }

    /// Registry tag selecting this specialist's tools.
    pub fn agent_tag(self) -> &'static str {
        match self {
            Self::Logging => "logs",
            Self::Discovery => "discovery",
            Self::Monitoring => "metrics",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Self::Logging => "Investigating Logs",
            Self::Discovery => "Discovering Resources & Events",
            Self::Monitoring => "Analyzing Metrics & Performance",
        }
    }

    fn focus(self) -> &'static str {
        match self {
            Self::Logging => {
                "application and system logs, error patterns, and trace correlations"
            }
            Self::Discovery => {
                "cluster state: resource specs, owner chains, events, and recent changes"
            }
            Self::Monitoring => "metrics, resource usage, saturation, and firing alerts",
        }
    }

    pub fn instructions(self) -> String {
        format!(
            "You are a Kubernetes {} specialist working on a static snapshot of the \
             system; repeating a query yields identical results, so never retry the \
             same call hoping for different output. Your focus: {}. Investigate the \
             question using your tools, then report your findings in exactly this \
             layout:\n\
             subject: one line naming what you examined\n\
             status: the number of distinct issues you found (0 if none)\n\
             reason: one line explaining the issues, empty if none\n\
             goal: one line stating what should be checked next and why\n\
             discovery:\n\
             your detailed findings in markdown, with resource names in backticks",
            self.agent_name(),
            self.focus()
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SubTask parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parse a specialist's final message into a SubTask. The layout is
/// forgiving: `key: value` header lines in any order, then everything after
/// `discovery:` (or the whole text when no headers are present) becomes the
/// discovery body. The plan comes from the run's tool-call log, not the
/// model output.
pub fn parse_subtask(kind: Specialist, text: &str, plan: Vec<PlanStep>) -> SubTask {
    let cleaned = text.trim().trim_start_matches("```").trim_end_matches("```");

    let mut subject = None;
    let mut status = 0u32;
    let mut reason = None;
    let mut goal = None;
    let mut discovery_lines: Vec<&str> = Vec::new();
    let mut in_discovery = false;

    for line in cleaned.lines() {
        if in_discovery {
            discovery_lines.push(line);
            continue;
        }
        let trimmed = line.trim();
        let lower = trimmed.to_ascii_lowercase();
        if let Some(rest) = lower.strip_prefix("subject:") {
            subject = non_empty(&trimmed[trimmed.len() - rest.len()..]);
        } else if let Some(rest) = lower.strip_prefix("status:") {
            status = trimmed[trimmed.len() - rest.len()..]
                .trim()
                .parse()
                .unwrap_or(0);
        } else if let Some(rest) = lower.strip_prefix("reason:") {
            reason = non_empty(&trimmed[trimmed.len() - rest.len()..]);
        } else if let Some(rest) = lower.strip_prefix("goal:") {
            goal = non_empty(&trimmed[trimmed.len() - rest.len()..]);
        } else if lower.starts_with("discovery:") {
            in_discovery = true;
            let rest = &trimmed["discovery:".len()..];
            if !rest.trim().is_empty() {
                discovery_lines.push(rest.trim());
            }
        }
    }

    let discovery = if discovery_lines.is_empty() {
        cleaned.trim().to_string()
    } else {
        discovery_lines.join("\n").trim().to_string()
    };

    let subject = subject.unwrap_or_else(|| kind.title().to_string());
    SubTask {
        id: uuid::Uuid::new_v4().to_string(),
        reason: reason.unwrap_or_else(|| subject.clone()),
        subject,
        status,
        goal: goal.unwrap_or_default(),
        plan,
        discovery,
        created_at: Utc::now(),
    }
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Running a specialist
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Drive one specialist on a question. Persists and emits the SubTask and
/// returns the textual summary handed to the supervisor.
pub async fn run_specialist(
    env: &AgentEnv,
    store: &EventStore,
    kind: Specialist,
    question: &str,
    max_turns: usize,
) -> ToolOutcome {
    let run = AgentRun {
        agent_name: kind.agent_name().to_string(),
        instructions: kind.instructions(),
        input: vec![Message::user(question)],
        tools: env.registry.specs_for_agent(kind.agent_tag()),
        max_turns,
        temperature: Some(0.1),
        deadline_exempt: Vec::new(),
    };

    let (outcome, plan) = run_agent(env, run).await;
    let text = match outcome {
        AgentOutcome::Final(text) => text,
        AgentOutcome::MaxTurns(text) => format!(
            "{text}\n\n[the {} specialist ran out of turns before finishing]",
            kind.agent_name()
        ),
        AgentOutcome::Cancelled => {
            return ToolOutcome::failure("specialist cancelled");
        }
        AgentOutcome::Failed(message) => {
            return ToolOutcome::failure(format!(
                "{} specialist failed: {message}",
                kind.agent_name()
            ));
        }
    };

    let subtask = parse_subtask(kind, &text, plan);
    if let Err(e) = store.add_subtask(&env.ctx.task_id, &subtask) {
        tracing::warn!(task_id = %env.ctx.task_id, error = %e, "subtask persist failed");
    }
    let summary = format!(
        "subject: {}\nissues_found: {}\n\n{}",
        subtask.subject, subtask.status, subtask.discovery
    );
    env.ctx.mux.emit(
        &env.ctx.task_id,
        EventPayload::SubtaskAdded { subtask },
    );

    ToolOutcome::text(summary)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sub-agents as supervisor tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct SubAgentInvoker {
    env: AgentEnv,
    store: Arc<EventStore>,
    kind: Specialist,
    max_turns: usize,
}

#[async_trait::async_trait]
impl ToolInvoker for SubAgentInvoker {
    async fn invoke(&self, args: &Value, _ctx: &ToolContext) -> ToolOutcome {
        let Some(question) = args.get("question").and_then(|v| v.as_str()) else {
            return ToolOutcome::failure("missing required argument: question");
        };
        run_specialist(&self.env, &self.store, self.kind, question, self.max_turns).await
    }
}

/// Build the three specialist tools for one investigation. They capture the
/// trace's environment, so each invocation streams through the same event
/// log and observes the same abort signal.
pub fn subagent_tools(
    env: &AgentEnv,
    store: &Arc<EventStore>,
    specialist_max_turns: usize,
) -> Vec<Arc<ToolSpec>> {
    Specialist::ALL
        .iter()
        .map(|&kind| {
            let title: TitleFn = match kind {
                Specialist::Logging => |_| "Investigating Logs".to_string(),
                Specialist::Discovery => |_| "Discovering Resources & Events".to_string(),
                Specialist::Monitoring => |_| "Analyzing Metrics & Performance".to_string(),
            };
            Arc::new(ToolSpec {
                name: kind.tool_name().to_string(),
                description: format!(
                    "Delegate a question to the {} specialist ({}). \
                     Returns its structured findings.",
                    kind.agent_name(),
                    kind.focus()
                ),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "question": {
                            "type": "string",
                            "description": "What the specialist should investigate",
                        },
                    },
                    "required": ["question"],
                }),
                safety: SafetyClass::Auto,
                ui_component: None,
                agents: vec!["supervisor".into()],
                title: Some(title),
                invoker: Arc::new(SubAgentInvoker {
                    env: env.clone(),
                    store: store.clone(),
                    kind,
                    max_turns: specialist_max_turns,
                }),
            })
        })
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_layout() {
        let text = "subject: crash loop in `payment-service`\n\
                    status: 2\n\
                    reason: container exits with OOM\n\
                    goal: check memory limits on the deployment\n\
                    discovery:\n\
                    The container `app` was OOM-killed 14 times.\n\
                    Limits are set to 64Mi.";
        let subtask = parse_subtask(Specialist::Logging, text, Vec::new());
        assert_eq!(subtask.subject, "crash loop in `payment-service`");
        assert_eq!(subtask.status, 2);
        assert_eq!(subtask.reason, "container exits with OOM");
        assert!(subtask.goal.contains("memory limits"));
        assert!(subtask.discovery.contains("OOM-killed 14 times"));
    }

    #[test]
    fn parse_freeform_text_becomes_discovery() {
        let text = "No issues found; the pods are all running normally.";
        let subtask = parse_subtask(Specialist::Discovery, text, Vec::new());
        assert_eq!(subtask.subject, "Discovering Resources & Events");
        assert_eq!(subtask.status, 0);
        assert_eq!(subtask.discovery, text);
    }

    #[test]
    fn parse_keeps_plan_from_tool_log() {
        let plan = vec![PlanStep {
            tool_name: "get_pod_logs".into(),
            arguments: serde_json::json!({ "pod_name": "x" }),
            output_excerpt: "...".into(),
            call_id: Some("c1".into()),
        }];
        let subtask = parse_subtask(Specialist::Logging, "status: 1", plan);
        assert_eq!(subtask.plan.len(), 1);
        assert_eq!(subtask.plan[0].tool_name, "get_pod_logs");
    }

    #[test]
    fn parse_bad_status_defaults_to_zero() {
        let subtask = parse_subtask(Specialist::Monitoring, "status: lots", Vec::new());
        assert_eq!(subtask.status, 0);
    }

    #[test]
    fn specialist_naming_is_stable() {
        assert_eq!(Specialist::Logging.tool_name(), "log_analysis");
        assert_eq!(Specialist::Discovery.tool_name(), "resource_discovery");
        assert_eq!(Specialist::Monitoring.tool_name(), "metrics_analysis");
    }
}
