//! The supervisor orchestrator — owns one investigation from request to
//! `done`.
//!
//! It creates the durable task, runs the metadata pre-pass, drives the
//! supervisor agent (which sees the three specialists as ordinary tools),
//! parses the final report, patches the task, and tears the session state
//! down. Events for the whole investigation form one totally-ordered stream
//! with dense step indices starting at 0.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;

use ps_domain::event::{ErrorKind, EventPayload, TaskEvent};
use ps_domain::task::{NamedBlob, NewTask, TaskPatch, TaskStatus};
use ps_domain::tool::Message;
use ps_providers::registry::ProviderHandle;
use ps_store::StoreError;

use crate::state::AppState;

use super::agent::{run_agent, AgentEnv, AgentOutcome, AgentRun, RunLimits};
use super::registry::ToolContext;
use super::specialists::subagent_tools;
use super::summarizer::{fallback_title, generate_title, TitleCard};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / start types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct InvestigateRequest {
    pub prompt: String,
    /// Explicit `provider/model` override for the supervisor.
    pub model: Option<String>,
    pub kubecontext: Option<String>,
    pub resource_context: Vec<NamedBlob>,
    pub log_context: Vec<NamedBlob>,
}

#[derive(Debug)]
pub enum StartError {
    /// Malformed input; rejected before any event is emitted.
    InvalidRequest(String),
    NoProvider,
    Store(StoreError),
}

pub struct StartedInvestigation {
    pub task_id: String,
    pub trace_id: String,
    /// Live subscription opened before the supervisor starts, so the caller
    /// observes every event from `trace_started` on.
    pub events: broadcast::Receiver<TaskEvent>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// start_investigation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Create the task, wire up the session state, and spawn the supervisor.
/// Returns synchronously with a live event subscription.
pub fn start_investigation(
    state: &AppState,
    req: InvestigateRequest,
) -> Result<StartedInvestigation, StartError> {
    if req.prompt.trim().is_empty() {
        return Err(StartError::InvalidRequest("prompt must not be empty".into()));
    }

    let supervisor = match &req.model {
        Some(spec) => state.llm.resolve_spec(spec),
        None => state.llm.for_role("supervisor"),
    }
    .ok_or(StartError::NoProvider)?;

    let task_id = uuid::Uuid::new_v4().to_string();
    let trace_id = uuid::Uuid::new_v4().to_string();

    state
        .store
        .create_task(&NewTask {
            task_id: task_id.clone(),
            title: fallback_title(&req.prompt),
            prompt: req.prompt.clone(),
            resource_context: req.resource_context.clone(),
            log_context: req.log_context.clone(),
        })
        .map_err(StartError::Store)?;
    state.mux.open(&task_id).map_err(StartError::Store)?;

    let signal = state.aborts.register(&trace_id);
    state.traces.bind(&task_id, &trace_id);

    // Subscribe before spawning so the first event is never missed.
    let Some(events) = state.mux.subscribe(&task_id) else {
        // The channel was just opened; losing it means the store/mux pair is
        // in a bad state, so surface it as a store failure.
        state.aborts.remove(&trace_id);
        state.traces.unbind(&task_id);
        return Err(StartError::Store(StoreError::TaskMissing(task_id)));
    };

    let drive_state = state.clone();
    let drive_task = task_id.clone();
    let drive_trace = trace_id.clone();
    tokio::spawn(async move {
        drive(drive_state, drive_task, drive_trace, req, supervisor, signal).await;
    });

    Ok(StartedInvestigation {
        task_id,
        trace_id,
        events,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The drive loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn drive(
    state: AppState,
    task_id: String,
    trace_id: String,
    req: InvestigateRequest,
    supervisor: ProviderHandle,
    signal: super::cancel::AbortSignal,
) {
    state.mux.emit(
        &task_id,
        EventPayload::TraceStarted {
            trace_id: trace_id.clone(),
        },
    );

    // ── Metadata pre-pass: a quick title from the prompt alone.
    let summarizer = state.llm.for_role("summarizer");
    let title = match &summarizer {
        Some((provider, model)) => {
            match generate_title(provider.clone(), model.clone(), &req.prompt, None).await {
                Ok(card) if !card.title.is_empty() => card.title,
                Ok(_) => fallback_title(&req.prompt),
                Err(e) => {
                    tracing::warn!(task_id, error = %e, "title pre-pass failed");
                    fallback_title(&req.prompt)
                }
            }
        }
        None => fallback_title(&req.prompt),
    };
    if let Err(e) = state.store.update_task(
        &task_id,
        &TaskPatch {
            title: Some(title),
            ..Default::default()
        },
    ) {
        tracing::warn!(task_id, error = %e, "title patch failed");
    }

    // ── Build the per-trace environment.
    let (provider, model) = supervisor;
    let ctx = ToolContext {
        task_id: task_id.clone(),
        trace_id: trace_id.clone(),
        kubecontext: Arc::new(RwLock::new(req.kubecontext.clone())),
        mux: state.mux.clone(),
    };
    let env = AgentEnv {
        provider,
        model,
        mux: state.mux.clone(),
        approvals: state.approvals.clone(),
        registry: state.registry.clone(),
        signal,
        ctx,
        limits: RunLimits::from_config(&state.config),
    };

    let mut tools = state.registry.specs_for_agent("supervisor");
    tools.extend(subagent_tools(
        &env,
        &state.store,
        state.config.investigation.specialist_max_turns,
    ));
    tools.sort_by(|a, b| a.name.cmp(&b.name));

    let run = AgentRun {
        agent_name: "supervisor".into(),
        instructions: supervisor_instructions(),
        input: vec![Message::user(build_user_message(&req))],
        tools,
        max_turns: state.config.investigation.supervisor_max_turns,
        temperature: Some(0.2),
        deadline_exempt: super::specialists::Specialist::ALL
            .iter()
            .map(|s| s.tool_name().to_string())
            .collect(),
    };

    let (outcome, _) = run_agent(&env, run).await;

    match outcome {
        AgentOutcome::Final(text) => {
            complete(&state, &task_id, &req.prompt, &text, summarizer, None).await;
        }
        AgentOutcome::MaxTurns(text) => {
            // The report is truncated, not failed: keep the partial findings.
            complete(
                &state,
                &task_id,
                &req.prompt,
                &text,
                summarizer,
                Some("the investigation stopped after exhausting its turn budget"),
            )
            .await;
        }
        AgentOutcome::Cancelled => {
            state.mux.emit(
                &task_id,
                EventPayload::Error {
                    error_kind: ErrorKind::Cancelled,
                    message: "investigation aborted by user".into(),
                    call_id: None,
                },
            );
            patch_status(&state, &task_id, TaskStatus::Cancelled);
            state.mux.emit(&task_id, EventPayload::Done);
        }
        AgentOutcome::Failed(message) => {
            tracing::error!(task_id, error = %message, "investigation failed");
            patch_status(&state, &task_id, TaskStatus::Failed);
            state.mux.emit(&task_id, EventPayload::Done);
        }
    }

    teardown(&state, &task_id, &trace_id);
}

/// Parse the report, run the post-pass, patch the task, close the stream.
async fn complete(
    state: &AppState,
    task_id: &str,
    prompt: &str,
    final_text: &str,
    summarizer: Option<ProviderHandle>,
    truncation_note: Option<&str>,
) {
    let (mut summary, remediation) = parse_report(final_text);
    if let Some(note) = truncation_note {
        summary = format!("{summary}\n\n_Note: {note}._");
    }

    // ── Post-pass: title and tags informed by the root cause.
    let card: Option<TitleCard> = match summarizer {
        Some((provider, model)) => {
            match generate_title(provider, model, prompt, Some(&summary)).await {
                Ok(card) if !card.title.is_empty() => Some(card),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!(task_id, error = %e, "title post-pass failed");
                    None
                }
            }
        }
        None => None,
    };
    let title = card.as_ref().map(|c| c.title.clone());
    let tags = card.as_ref().map(|c| c.tags.clone()).filter(|t| !t.is_empty());

    if let Err(e) = state.store.update_task(
        task_id,
        &TaskPatch {
            status: Some(TaskStatus::Completed),
            title: title.clone(),
            tags: tags.clone(),
            summary: Some(summary.clone()),
            remediation: Some(remediation.clone()),
            ..Default::default()
        },
    ) {
        tracing::warn!(task_id, error = %e, "completion patch failed");
    }

    state.mux.emit(
        task_id,
        EventPayload::InvestigationCompleted {
            summary,
            remediation,
            title,
            tags,
        },
    );
    state.mux.emit(task_id, EventPayload::Done);
}

fn patch_status(state: &AppState, task_id: &str, status: TaskStatus) {
    if let Err(e) = state.store.update_task(
        task_id,
        &TaskPatch {
            status: Some(status),
            ..Default::default()
        },
    ) {
        tracing::warn!(task_id, error = %e, "status patch failed");
    }
}

/// Tear down everything session-scoped. The durable task row stays.
fn teardown(state: &AppState, task_id: &str, trace_id: &str) {
    state.aborts.remove(trace_id);
    state.approvals.clear_trace(trace_id);
    state.todos.forget(task_id);
    state.traces.unbind(task_id);
    state.mux.close(task_id);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Prompt assembly & report parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn supervisor_instructions() -> String {
    "You orchestrate a Kubernetes incident investigation. Plan with write_todos, keep it \
     current as you work, and delegate evidence gathering to your specialist tools: \
     log_analysis for logs and traces, resource_discovery for cluster state and events, \
     metrics_analysis for metrics and alerts. Consult get_past_investigations for \
     recurring issues. When the evidence is sufficient, stop calling tools and write \
     your final report as two markdown sections:\n\
     SUMMARY: the impact, affected resources, and root cause\n\
     REMEDIATION: concrete steps to fix and prevent the issue"
        .to_string()
}

fn build_user_message(req: &InvestigateRequest) -> String {
    let mut message = req.prompt.clone();
    if !req.resource_context.is_empty() {
        message.push_str("\n\nAttached resource manifests:");
        for blob in &req.resource_context {
            message.push_str(&format!("\n### {}\n```yaml\n{}\n```", blob.name, blob.content));
        }
    }
    if !req.log_context.is_empty() {
        message.push_str("\n\nAttached logs:");
        for blob in &req.log_context {
            message.push_str(&format!("\n### {}\n```\n{}\n```", blob.name, blob.content));
        }
    }
    message
}

/// Split the supervisor's final message into (summary, remediation).
///
/// Accepts both `SUMMARY:` / `REMEDIATION:` markers and `## Summary` /
/// `## Remediation` headings. Without any marker the whole text is the
/// summary.
pub fn parse_report(text: &str) -> (String, String) {
    #[derive(PartialEq, Clone, Copy)]
    enum Section {
        Preamble,
        Summary,
        Remediation,
    }

    let mut summary_lines: Vec<&str> = Vec::new();
    let mut remediation_lines: Vec<&str> = Vec::new();
    let mut section = Section::Preamble;
    let mut saw_marker = false;

    for line in text.lines() {
        let trimmed = line.trim();
        let lower = trimmed.to_ascii_lowercase();

        if let Some(rest) = marker_rest(&lower, trimmed, &["summary:", "## summary", "# summary"]) {
            section = Section::Summary;
            saw_marker = true;
            if !rest.is_empty() {
                summary_lines.push(rest);
            }
            continue;
        }
        if let Some(rest) = marker_rest(
            &lower,
            trimmed,
            &["remediation:", "## remediation", "# remediation"],
        ) {
            section = Section::Remediation;
            saw_marker = true;
            if !rest.is_empty() {
                remediation_lines.push(rest);
            }
            continue;
        }

        match section {
            Section::Summary | Section::Preamble => summary_lines.push(line),
            Section::Remediation => remediation_lines.push(line),
        }
    }

    if !saw_marker {
        return (text.trim().to_string(), String::new());
    }
    (
        summary_lines.join("\n").trim().to_string(),
        remediation_lines.join("\n").trim().to_string(),
    )
}

/// When `lower` starts with one of the markers, return the rest of the
/// original-case line after the marker.
fn marker_rest<'a>(lower: &str, original: &'a str, markers: &[&str]) -> Option<&'a str> {
    for marker in markers {
        if lower.starts_with(marker) {
            return Some(original[marker.len()..].trim());
        }
    }
    None
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_inline_markers() {
        let (summary, remediation) = parse_report("SUMMARY: 2 pods\nREMEDIATION: none");
        assert_eq!(summary, "2 pods");
        assert_eq!(remediation, "none");
    }

    #[test]
    fn parse_markdown_headings() {
        let text = "## Summary\nThe pod was OOM-killed.\n\n## Remediation\nRaise the limit.";
        let (summary, remediation) = parse_report(text);
        assert_eq!(summary, "The pod was OOM-killed.");
        assert_eq!(remediation, "Raise the limit.");
    }

    #[test]
    fn parse_without_markers_is_all_summary() {
        let (summary, remediation) = parse_report("everything looks healthy");
        assert_eq!(summary, "everything looks healthy");
        assert_eq!(remediation, "");
    }

    #[test]
    fn preamble_folds_into_summary() {
        let text = "Here is what I found.\nSUMMARY: broken ingress\nREMEDIATION: fix the class";
        let (summary, remediation) = parse_report(text);
        assert!(summary.contains("Here is what I found."));
        assert!(summary.contains("broken ingress"));
        assert_eq!(remediation, "fix the class");
    }

    #[test]
    fn user_message_includes_context_blobs() {
        let req = InvestigateRequest {
            prompt: "why failing?".into(),
            model: None,
            kubecontext: None,
            resource_context: vec![NamedBlob {
                name: "pod.yaml".into(),
                content: "kind: Pod".into(),
            }],
            log_context: vec![NamedBlob {
                name: "app.log".into(),
                content: "panic!".into(),
            }],
        };
        let message = build_user_message(&req);
        assert!(message.contains("pod.yaml"));
        assert!(message.contains("kind: Pod"));
        assert!(message.contains("app.log"));
    }
}
