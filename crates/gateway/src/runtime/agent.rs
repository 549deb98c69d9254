//! The generic agent loop — one LLM conversation that streams text, asks
//! for tools, runs them through the approval broker, and feeds results back
//! until the model produces a final message.
//!
//! The supervisor and every specialist run through this same loop; only the
//! instructions, tool set, and turn budget differ. Tool calls are dispatched
//! one at a time so the event stream stays deterministic, and the abort
//! signal is observed at every await point.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;

use ps_domain::config::Config;
use ps_domain::event::{ErrorKind, EventPayload, TextRole};
use ps_domain::stream::ChatChunk;
use ps_domain::task::PlanStep;
use ps_domain::tool::{Message, ToolCall};
use ps_providers::{ChatRequest, LlmProvider};

use super::approval::{await_decision, ApprovalBroker, DecisionOutcome};
use super::cancel::AbortSignal;
use super::mux::EventMux;
use super::registry::{SafetyClass, ToolContext, ToolOutcome, ToolRegistry, ToolSpec};
use super::{excerpt, truncate_str};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inputs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Loop parameters derived from config once per investigation.
#[derive(Clone)]
pub struct RunLimits {
    pub tool_timeout: Duration,
    pub approval_timeout: Duration,
    pub output_limit_bytes: usize,
    pub retry_budget: u32,
    pub duplicate_call_limit: usize,
    /// Config-level auto-approve set, on top of descriptor safety classes.
    pub auto_approve: HashSet<String>,
}

impl RunLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tool_timeout: Duration::from_secs(config.tools.call_timeout_secs),
            approval_timeout: Duration::from_secs(config.tools.approval_timeout_secs),
            output_limit_bytes: config.tools.output_limit_bytes,
            retry_budget: config.llm.retry_budget,
            duplicate_call_limit: config.investigation.duplicate_call_limit,
            auto_approve: config.tools.auto_approve.iter().cloned().collect(),
        }
    }
}

/// Everything an agent run needs from its trace, shared between the
/// supervisor and the specialists it spawns.
#[derive(Clone)]
pub struct AgentEnv {
    pub provider: Arc<dyn LlmProvider>,
    pub model: Option<String>,
    pub mux: Arc<EventMux>,
    pub approvals: Arc<ApprovalBroker>,
    /// Global registry; also carries the compiled deny policy applied to
    /// session-scoped tools.
    pub registry: Arc<ToolRegistry>,
    pub signal: AbortSignal,
    pub ctx: ToolContext,
    pub limits: RunLimits,
}

/// One agent's run description.
pub struct AgentRun {
    pub agent_name: String,
    pub instructions: String,
    pub input: Vec<Message>,
    pub tools: Vec<Arc<ToolSpec>>,
    pub max_turns: usize,
    pub temperature: Option<f32>,
    /// Tools exempt from the per-call deadline. Sub-agent tools run whole
    /// LLM loops bounded by their own turn budget, not by a tool timeout.
    pub deadline_exempt: Vec<String>,
}

/// How the run ended.
#[derive(Debug)]
pub enum AgentOutcome {
    /// The model produced a final assistant message.
    Final(String),
    /// The turn budget ran out; carries whatever text the last turn left.
    MaxTurns(String),
    /// The abort signal fired.
    Cancelled,
    /// The LLM call failed beyond the retry budget.
    Failed(String),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// run_agent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum TurnResult {
    Completed { text: String, calls: Vec<ToolCall> },
    Cancelled,
    Failed { message: String, streamed_any: bool },
}

/// Run one agent to completion. Returns the outcome plus the log of tool
/// calls it made (the specialist's "plan").
pub async fn run_agent(env: &AgentEnv, run: AgentRun) -> (AgentOutcome, Vec<PlanStep>) {
    let started = Instant::now();
    let task_id = env.ctx.task_id.clone();
    env.mux.emit(
        &task_id,
        EventPayload::AgentStarted {
            agent_name: run.agent_name.clone(),
        },
    );

    let mut records: Vec<PlanStep> = Vec::new();
    let mut messages = Vec::with_capacity(run.input.len() + 1);
    messages.push(Message::system(&run.instructions));
    messages.extend(run.input.iter().cloned());

    let tool_defs: Vec<_> = run.tools.iter().map(|t| t.definition()).collect();

    // Duplicate-call guard state.
    let mut last_signature: Option<String> = None;
    let mut streak = 0usize;

    let mut last_text = String::new();

    let finish = |env: &AgentEnv, name: &str, outcome: AgentOutcome, records: Vec<PlanStep>| {
        env.mux.emit(
            &task_id,
            EventPayload::AgentCompleted {
                agent_name: name.to_owned(),
                duration_ms: started.elapsed().as_millis() as u64,
            },
        );
        (outcome, records)
    };

    for turn in 0..run.max_turns {
        if env.signal.is_fired() {
            return finish(env, &run.agent_name, AgentOutcome::Cancelled, records);
        }
        tracing::debug!(agent = %run.agent_name, turn, "agent turn");

        let req = ChatRequest {
            messages: messages.clone(),
            tools: tool_defs.clone(),
            temperature: run.temperature,
            max_tokens: None,
            model: env.model.clone(),
        };

        // ── LLM call with a bounded retry budget. Failures after content
        // has streamed are fatal: retrying would replay deltas the UI has
        // already rendered.
        let mut attempt = 0u32;
        let (text, calls) = loop {
            match stream_turn(env, &req).await {
                TurnResult::Completed { text, calls } => break (text, calls),
                TurnResult::Cancelled => {
                    return finish(env, &run.agent_name, AgentOutcome::Cancelled, records);
                }
                TurnResult::Failed {
                    message,
                    streamed_any,
                } => {
                    if !streamed_any && attempt < env.limits.retry_budget {
                        attempt += 1;
                        tracing::warn!(agent = %run.agent_name, attempt, error = %message, "LLM call failed, retrying");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        continue;
                    }
                    env.mux.emit(
                        &task_id,
                        EventPayload::Error {
                            error_kind: ErrorKind::LlmError,
                            message: message.clone(),
                            call_id: None,
                        },
                    );
                    return finish(env, &run.agent_name, AgentOutcome::Failed(message), records);
                }
            }
        };
        last_text = text.clone();

        // No tool calls: this is the final assistant message.
        if calls.is_empty() {
            return finish(env, &run.agent_name, AgentOutcome::Final(text), records);
        }

        messages.push(Message::assistant_with_calls(&text, &calls));

        for call in &calls {
            if env.signal.is_fired() {
                return finish(env, &run.agent_name, AgentOutcome::Cancelled, records);
            }

            // ── Resolve the descriptor.
            let Some(spec) = run.tools.iter().find(|t| t.name == call.tool_name) else {
                env.mux.emit(
                    &task_id,
                    EventPayload::Error {
                        error_kind: ErrorKind::ToolNotFound,
                        message: format!("unknown tool: {}", call.tool_name),
                        call_id: Some(call.call_id.clone()),
                    },
                );
                messages.push(Message::tool_error(
                    &call.call_id,
                    format!(
                        "tool '{}' does not exist; pick one of your listed tools",
                        call.tool_name
                    ),
                ));
                continue;
            };

            // ── Loop guard: the same call repeated without new information.
            let signature = call.signature();
            if last_signature.as_deref() == Some(signature.as_str()) {
                streak += 1;
            } else {
                last_signature = Some(signature);
                streak = 1;
            }
            if streak >= env.limits.duplicate_call_limit {
                let note = format!(
                    "Stopped after {streak} consecutive identical calls to `{}`. \
                     The target likely does not exist or has no new data; \
                     continuing would not change the outcome.",
                    call.tool_name
                );
                return finish(env, &run.agent_name, AgentOutcome::Final(note), records);
            }

            // ── Approval gate.
            let title = spec.describe(&call.arguments);
            let gated = spec.safety == SafetyClass::Gated
                && !env.limits.auto_approve.contains(&call.tool_name)
                && !env
                    .approvals
                    .is_session_approved(&env.ctx.trace_id, &call.tool_name);

            env.mux.emit(
                &task_id,
                EventPayload::ToolCallRequested {
                    call_id: call.call_id.clone(),
                    tool_name: call.tool_name.clone(),
                    arguments: call.arguments.clone(),
                    title,
                    approval_required: gated,
                },
            );

            if gated {
                let rx = env.approvals.register(
                    &call.call_id,
                    &env.ctx.trace_id,
                    &call.tool_name,
                    &spec.describe(&call.arguments),
                );
                match await_decision(rx, &env.signal, env.limits.approval_timeout).await {
                    DecisionOutcome::Approved { note, .. } => {
                        env.mux.emit(
                            &task_id,
                            EventPayload::ToolCallApproved {
                                call_id: call.call_id.clone(),
                                user_note: note,
                            },
                        );
                    }
                    DecisionOutcome::Rejected { note } => {
                        reject_call(env, &task_id, call, note, &mut messages, &mut records);
                        continue;
                    }
                    DecisionOutcome::TimedOut => {
                        env.approvals.remove_expired(&call.call_id);
                        reject_call(
                            env,
                            &task_id,
                            call,
                            Some("approval timed out".into()),
                            &mut messages,
                            &mut records,
                        );
                        continue;
                    }
                    DecisionOutcome::Cancelled => {
                        return finish(env, &run.agent_name, AgentOutcome::Cancelled, records);
                    }
                }
            }

            // ── Execute with validation, deny policy, and a deadline.
            let call_started = Instant::now();
            let exempt = run.deadline_exempt.iter().any(|t| t == &call.tool_name);
            let outcome = execute_call(env, spec, call, exempt).await;
            let duration_ms = call_started.elapsed().as_millis() as u64;

            env.mux.emit(
                &task_id,
                EventMux::tool_output_payload(
                    spec.ui_component.as_deref(),
                    &call.call_id,
                    &outcome,
                    duration_ms,
                ),
            );

            records.push(PlanStep {
                tool_name: call.tool_name.clone(),
                arguments: call.arguments.clone(),
                output_excerpt: excerpt(&outcome.model_text(), 200),
                call_id: Some(call.call_id.clone()),
            });

            let fed_back = truncate_str(&outcome.model_text(), env.limits.output_limit_bytes);
            messages.push(if outcome.success {
                Message::tool_result(&call.call_id, fed_back)
            } else {
                Message::tool_error(&call.call_id, fed_back)
            });
        }
    }

    env.mux.emit(
        &task_id,
        EventPayload::Error {
            error_kind: ErrorKind::MaxTurnsExceeded,
            message: format!(
                "{} used its entire budget of {} turns",
                run.agent_name, run.max_turns
            ),
            call_id: None,
        },
    );
    finish(env, &run.agent_name, AgentOutcome::MaxTurns(last_text), records)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Stream one LLM turn, forwarding deltas as events.
async fn stream_turn(env: &AgentEnv, req: &ChatRequest) -> TurnResult {
    let mut stream = match env.provider.chat_stream(req).await {
        Ok(s) => s,
        Err(e) => {
            return TurnResult::Failed {
                message: e.to_string(),
                streamed_any: false,
            }
        }
    };

    let task_id = &env.ctx.task_id;
    let mut text = String::new();
    let mut calls: Vec<ToolCall> = Vec::new();
    let mut streamed_any = false;

    while let Some(chunk) = stream.next().await {
        if env.signal.is_fired() {
            return TurnResult::Cancelled;
        }
        match chunk {
            Ok(ChatChunk::TextDelta { text: delta }) => {
                streamed_any = true;
                text.push_str(&delta);
                env.mux.emit(
                    task_id,
                    EventPayload::TextDelta {
                        text: delta,
                        role: TextRole::Assistant,
                    },
                );
            }
            Ok(ChatChunk::Reasoning { text: delta }) => {
                streamed_any = true;
                env.mux.emit(
                    task_id,
                    EventPayload::TextDelta {
                        text: delta,
                        role: TextRole::Reasoning,
                    },
                );
            }
            Ok(ChatChunk::ToolCall(call)) => {
                streamed_any = true;
                calls.push(call);
            }
            Ok(ChatChunk::Completed { .. }) => {}
            Ok(ChatChunk::Error { message }) => {
                return TurnResult::Failed {
                    message,
                    streamed_any,
                }
            }
            Err(e) => {
                return TurnResult::Failed {
                    message: e.to_string(),
                    streamed_any,
                }
            }
        }
    }

    TurnResult::Completed { text, calls }
}

/// Emit the rejection pair and feed a synthetic response to the model so it
/// can replan.
fn reject_call(
    env: &AgentEnv,
    task_id: &str,
    call: &ToolCall,
    note: Option<String>,
    messages: &mut Vec<Message>,
    records: &mut Vec<PlanStep>,
) {
    env.mux.emit(
        task_id,
        EventPayload::ToolCallRejected {
            call_id: call.call_id.clone(),
            user_note: note.clone(),
        },
    );
    let reason = match &note {
        Some(n) => format!("user rejected execution: {n}"),
        None => "user rejected execution".to_string(),
    };
    let outcome = ToolOutcome::failure(reason.clone());
    env.mux.emit(
        task_id,
        EventMux::tool_output_payload(None, &call.call_id, &outcome, 0),
    );
    records.push(PlanStep {
        tool_name: call.tool_name.clone(),
        arguments: call.arguments.clone(),
        output_excerpt: excerpt(&reason, 200),
        call_id: Some(call.call_id.clone()),
    });
    messages.push(Message::tool_error(
        &call.call_id,
        format!("{reason} — adjust your approach or pick a different tool"),
    ));
}

/// Validate, check the deny policy, and invoke with a deadline.
async fn execute_call(
    env: &AgentEnv,
    spec: &ToolSpec,
    call: &ToolCall,
    deadline_exempt: bool,
) -> ToolOutcome {
    if let Err(msg) = spec.validate_arguments(&call.arguments) {
        return ToolOutcome::failure(msg);
    }
    if let Some(msg) = env.registry.check_denied(&call.arguments) {
        return ToolOutcome::failure(msg);
    }

    if deadline_exempt {
        return spec.invoker.invoke(&call.arguments, &env.ctx).await;
    }
    match tokio::time::timeout(
        env.limits.tool_timeout,
        spec.invoker.invoke(&call.arguments, &env.ctx),
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(_) => ToolOutcome::failure("timeout"),
    }
}

