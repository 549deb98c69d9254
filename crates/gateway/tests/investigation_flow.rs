//! End-to-end orchestrator scenarios driven by a scripted LLM and a fake
//! cluster backend: happy path, gated approvals, rejection replans, abort
//! convergence, reconnect replay, and the loop guard.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use ps_domain::config::Config;
use ps_domain::error::Result as DomainResult;
use ps_domain::event::{EventPayload, TaskEvent};
use ps_domain::stream::{BoxStream, ChatChunk};
use ps_domain::task::TaskStatus;
use ps_domain::tool::ToolCall;
use ps_providers::registry::ProviderRegistry;
use ps_providers::{ChatRequest, ChatResponse, LlmProvider};
use ps_store::EventStore;

use ps_gateway::runtime::approval::ApprovalDecision;
use ps_gateway::runtime::kube::{ClusterBackend, PodLogsRequest};
use ps_gateway::runtime::supervisor::{start_investigation, InvestigateRequest};
use ps_gateway::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted LLM
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One streaming turn the fake model will produce.
enum Turn {
    Calls(Vec<(&'static str, Value)>),
    Final(&'static str),
}

/// Pops one scripted turn per `chat_stream` call. `chat` (used by the title
/// summarizer) never touches the script.
struct ScriptedLlm {
    turns: Mutex<VecDeque<Turn>>,
    calls_issued: AtomicUsize,
}

impl ScriptedLlm {
    fn new(turns: Vec<Turn>) -> Arc<Self> {
        Arc::new(Self {
            turns: Mutex::new(turns.into()),
            calls_issued: AtomicUsize::new(0),
        })
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedLlm {
    async fn chat(&self, _req: &ChatRequest) -> DomainResult<ChatResponse> {
        Ok(ChatResponse {
            content: "Test Investigation\ntags: test".into(),
            tool_calls: Vec::new(),
            usage: None,
            finish_reason: Some("stop".into()),
        })
    }

    async fn chat_stream(
        &self,
        _req: &ChatRequest,
    ) -> DomainResult<BoxStream<'static, DomainResult<ChatChunk>>> {
        let turn = self
            .turns
            .lock()
            .pop_front()
            .unwrap_or(Turn::Final("SUMMARY: script exhausted\nREMEDIATION: none"));

        let chunks: Vec<ChatChunk> = match turn {
            Turn::Calls(calls) => calls
                .into_iter()
                .map(|(name, arguments)| {
                    let n = self.calls_issued.fetch_add(1, Ordering::SeqCst);
                    ChatChunk::ToolCall(ToolCall {
                        call_id: format!("call-{n}"),
                        tool_name: name.to_string(),
                        arguments,
                    })
                })
                .chain(std::iter::once(ChatChunk::Completed {
                    usage: None,
                    finish_reason: Some("tool_calls".into()),
                }))
                .collect(),
            Turn::Final(text) => text
                .split_inclusive(' ')
                .map(|piece| ChatChunk::TextDelta { text: piece.into() })
                .chain(std::iter::once(ChatChunk::Completed {
                    usage: None,
                    finish_reason: Some("stop".into()),
                }))
                .collect(),
        };

        Ok(Box::pin(async_stream::stream! {
            for chunk in chunks {
                yield Ok(chunk);
            }
        }))
    }

    fn provider_id(&self) -> &str {
        "scripted"
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fake cluster backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct FakeBackend {
    delay: Option<Duration>,
    commands_run: AtomicUsize,
}

impl FakeBackend {
    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait::async_trait]
impl ClusterBackend for FakeBackend {
    async fn list_resources(
        &self,
        _kind: &str,
        _namespace: Option<&str>,
        _kubecontext: Option<&str>,
    ) -> DomainResult<Value> {
        self.pause().await;
        Ok(serde_json::json!({ "items": ["a", "b"] }))
    }

    async fn resource_yaml(
        &self,
        kind: &str,
        name: &str,
        _namespace: Option<&str>,
        _kubecontext: Option<&str>,
    ) -> DomainResult<String> {
        self.pause().await;
        Ok(format!("kind: {kind}\nmetadata:\n  name: {name}\n"))
    }

    async fn resource_dependency(
        &self,
        _kind: &str,
        _name: &str,
        _namespace: Option<&str>,
        _kubecontext: Option<&str>,
    ) -> DomainResult<Value> {
        Ok(serde_json::json!({ "owners": [], "dependents": [] }))
    }

    async fn recent_events(
        &self,
        _namespace: Option<&str>,
        _kubecontext: Option<&str>,
    ) -> DomainResult<Value> {
        Ok(serde_json::json!({ "events": [] }))
    }

    async fn pod_logs(
        &self,
        _req: &PodLogsRequest,
        _kubecontext: Option<&str>,
    ) -> DomainResult<String> {
        Ok("log line".into())
    }

    async fn search_logs(
        &self,
        _query: &str,
        _range_minutes: u32,
        _kubecontext: Option<&str>,
    ) -> DomainResult<Value> {
        Ok(serde_json::json!({ "streams": [] }))
    }

    async fn query_metrics(
        &self,
        _query: &str,
        _range_minutes: u32,
        _kubecontext: Option<&str>,
    ) -> DomainResult<Value> {
        Ok(serde_json::json!({ "series": [] }))
    }

    async fn active_alerts(&self, _kubecontext: Option<&str>) -> DomainResult<Value> {
        Ok(serde_json::json!({ "alerts": [] }))
    }

    async fn run_command(
        &self,
        _command: &str,
        _kubecontext: Option<&str>,
    ) -> DomainResult<String> {
        self.pause().await;
        self.commands_run.fetch_add(1, Ordering::SeqCst);
        Ok("ok".into())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Harness {
    state: AppState,
    backend: Arc<FakeBackend>,
    _dir: tempfile::TempDir,
}

fn harness_with(turns: Vec<Turn>, backend: FakeBackend, tune: impl FnOnce(&mut Config)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.storage.data_dir = dir.path().to_path_buf();
    tune(&mut config);

    let store = Arc::new(EventStore::open_in_memory().unwrap());
    let backend = Arc::new(backend);
    let llm = Arc::new(ProviderRegistry::single("scripted", ScriptedLlm::new(turns)));
    let state = AppState::with_providers(Arc::new(config), store, backend.clone(), llm);
    Harness {
        state,
        backend,
        _dir: dir,
    }
}

fn harness(turns: Vec<Turn>) -> Harness {
    harness_with(turns, FakeBackend::default(), |_| {})
}

fn request(prompt: &str) -> InvestigateRequest {
    InvestigateRequest {
        prompt: prompt.into(),
        model: None,
        kubecontext: None,
        resource_context: Vec::new(),
        log_context: Vec::new(),
    }
}

/// Drain the live channel until `done`, with a hard deadline.
async fn collect_until_done(
    rx: &mut tokio::sync::broadcast::Receiver<TaskEvent>,
) -> Vec<TaskEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for events")
            .expect("channel closed before done");
        let done = event.payload.is_done();
        events.push(event);
        if done {
            return events;
        }
    }
}

/// Wait for an event matching the predicate, buffering everything seen.
async fn wait_for(
    rx: &mut tokio::sync::broadcast::Receiver<TaskEvent>,
    seen: &mut Vec<TaskEvent>,
    pred: impl Fn(&EventPayload) -> bool,
) -> TaskEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed");
        seen.push(event.clone());
        if pred(&event.payload) {
            return event;
        }
    }
}

fn kinds(events: &[TaskEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.payload.kind()).collect()
}

fn assert_dense_indices(events: &[TaskEvent]) {
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.step_index, i as u64, "gap at position {i}");
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenarios
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn happy_path_auto_tool_only() {
    let h = harness(vec![
        Turn::Calls(vec![(
            "get_resource_yaml",
            serde_json::json!({ "kind": "pod", "name": "a", "namespace": "default" }),
        )]),
        Turn::Final("SUMMARY: 2 pods\nREMEDIATION: none"),
    ]);

    let mut started = start_investigation(&h.state, request("list pods in default")).unwrap();
    let events = collect_until_done(&mut started.events).await;

    assert_dense_indices(&events);
    let ks = kinds(&events);
    assert_eq!(ks[0], "trace_started");
    assert_eq!(ks[1], "agent_started");
    assert_eq!(ks[2], "tool_call_requested");
    assert_eq!(ks[3], "tool_call_output");
    assert!(ks[4..].starts_with(&["text_delta"]));
    let tail: Vec<&str> = ks.iter().rev().take(3).rev().cloned().collect();
    assert_eq!(tail, vec!["agent_completed", "investigation_completed", "done"]);

    // Auto tool: no approval events anywhere.
    assert!(!ks.contains(&"tool_call_approved"));
    assert!(!ks.contains(&"tool_call_rejected"));

    // The requested event is marked auto.
    match &events[2].payload {
        EventPayload::ToolCallRequested {
            approval_required,
            title,
            ..
        } => {
            assert!(!approval_required);
            assert_eq!(title, "Analyzing pod/a");
        }
        other => panic!("unexpected payload {other:?}"),
    }

    let task = h.state.store.read_task(&started.task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.summary.as_deref(), Some("2 pods"));
    assert_eq!(task.remediation.as_deref(), Some("none"));
    assert_eq!(task.title, "Test Investigation");
    assert_eq!(task.tags, vec!["test"]);

    // Replay faithfulness: the persisted log equals everything streamed.
    let persisted = h.state.store.read_events_since(&started.task_id, None).unwrap();
    assert_eq!(kinds(&persisted), ks);

    // Session state is torn down after done.
    assert!(h.state.traces.resolve(&started.task_id).is_none());
    assert!(!h.state.mux.is_open(&started.task_id));
}

#[tokio::test]
async fn gated_tool_approved_runs_once() {
    let h = harness(vec![
        Turn::Calls(vec![("run_command", serde_json::json!({ "command": "ls" }))]),
        Turn::Final("SUMMARY: done\nREMEDIATION: none"),
    ]);

    let mut started = start_investigation(&h.state, request("check the node")).unwrap();
    let mut seen = Vec::new();

    let requested = wait_for(&mut started.events, &mut seen, |p| {
        matches!(p, EventPayload::ToolCallRequested { .. })
    })
    .await;
    let call_id = match &requested.payload {
        EventPayload::ToolCallRequested {
            call_id,
            approval_required,
            ..
        } => {
            assert!(approval_required);
            call_id.clone()
        }
        _ => unreachable!(),
    };

    // Nothing runs while the decision is pending.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.backend.commands_run.load(Ordering::SeqCst), 0);

    assert!(h
        .state
        .approvals
        .resolve(&call_id, ApprovalDecision::Approve { note: None }));

    let rest = collect_until_done(&mut started.events).await;
    seen.extend(rest);
    let ks = kinds(&seen);

    let approved_at = ks.iter().position(|k| *k == "tool_call_approved").unwrap();
    let output_at = ks.iter().position(|k| *k == "tool_call_output").unwrap();
    let requested_at = ks.iter().position(|k| *k == "tool_call_requested").unwrap();
    assert!(requested_at < approved_at && approved_at < output_at);

    assert_eq!(h.backend.commands_run.load(Ordering::SeqCst), 1);
    let task = h.state.store.read_task(&started.task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn gated_tool_rejected_agent_replans() {
    let h = harness(vec![
        Turn::Calls(vec![(
            "run_command",
            serde_json::json!({ "command": "kubectl get ns" }),
        )]),
        Turn::Calls(vec![(
            "get_resource_yaml",
            serde_json::json!({ "kind": "namespace", "name": "prod" }),
        )]),
        Turn::Final("SUMMARY: fell back to reads\nREMEDIATION: none"),
    ]);

    let mut started = start_investigation(&h.state, request("inspect namespaces")).unwrap();
    let mut seen = Vec::new();

    let requested = wait_for(&mut started.events, &mut seen, |p| {
        matches!(p, EventPayload::ToolCallRequested { approval_required: true, .. })
    })
    .await;
    let call_id = match &requested.payload {
        EventPayload::ToolCallRequested { call_id, .. } => call_id.clone(),
        _ => unreachable!(),
    };

    h.state.approvals.resolve(
        &call_id,
        ApprovalDecision::Reject {
            note: Some("reads only please".into()),
        },
    );

    let rest = collect_until_done(&mut started.events).await;
    seen.extend(rest);
    let ks = kinds(&seen);

    // Rejection pair, then the replanned auto call and its output.
    let rejected_at = ks.iter().position(|k| *k == "tool_call_rejected").unwrap();
    match &seen[rejected_at + 1].payload {
        EventPayload::ToolCallOutput { success, .. } => assert!(!success),
        other => panic!("expected synthetic output after rejection, got {other:?}"),
    }

    // The gated command never ran; the agent replanned and finished.
    assert_eq!(h.backend.commands_run.load(Ordering::SeqCst), 0);
    assert_eq!(
        ks.iter().filter(|k| **k == "tool_call_requested").count(),
        2
    );
    let task = h.state.store.read_task(&started.task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.summary.as_deref(), Some("fell back to reads"));
}

#[tokio::test]
async fn session_approval_is_memoized() {
    let h = harness(vec![
        Turn::Calls(vec![("run_command", serde_json::json!({ "command": "ls" }))]),
        Turn::Calls(vec![("run_command", serde_json::json!({ "command": "ps" }))]),
        Turn::Final("SUMMARY: ran both\nREMEDIATION: none"),
    ]);

    let mut started = start_investigation(&h.state, request("poke around")).unwrap();
    let mut seen = Vec::new();

    let requested = wait_for(&mut started.events, &mut seen, |p| {
        matches!(p, EventPayload::ToolCallRequested { approval_required: true, .. })
    })
    .await;
    let call_id = match &requested.payload {
        EventPayload::ToolCallRequested { call_id, .. } => call_id.clone(),
        _ => unreachable!(),
    };
    h.state
        .approvals
        .resolve(&call_id, ApprovalDecision::ApproveForSession { note: None });

    let rest = collect_until_done(&mut started.events).await;
    seen.extend(rest);

    // The second call to the same tool sails through without approval.
    let requested_flags: Vec<bool> = seen
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::ToolCallRequested {
                approval_required, ..
            } => Some(*approval_required),
            _ => None,
        })
        .collect();
    assert_eq!(requested_flags, vec![true, false]);
    assert_eq!(
        kinds(&seen)
            .iter()
            .filter(|k| **k == "tool_call_approved")
            .count(),
        1
    );
    assert_eq!(h.backend.commands_run.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn abort_mid_stream_converges_to_cancelled() {
    let h = harness_with(
        vec![
            Turn::Calls(vec![(
                "get_resource_yaml",
                serde_json::json!({ "kind": "pod", "name": "slow" }),
            )]),
            Turn::Final("SUMMARY: should never be reached\nREMEDIATION: none"),
        ],
        FakeBackend {
            delay: Some(Duration::from_millis(300)),
            ..Default::default()
        },
        |_| {},
    );

    let mut started = start_investigation(&h.state, request("slow investigation")).unwrap();
    let mut seen = Vec::new();

    wait_for(&mut started.events, &mut seen, |p| {
        matches!(p, EventPayload::ToolCallRequested { .. })
    })
    .await;

    // Abort while the tool call is in flight.
    let trace_id = h.state.traces.resolve(&started.task_id).unwrap();
    assert!(h.state.aborts.fire(&trace_id));
    h.state.approvals.cancel_trace(&trace_id);

    let rest = collect_until_done(&mut started.events).await;
    seen.extend(rest);
    let ks = kinds(&seen);

    // Bounded convergence: error(cancelled) then done close the stream.
    assert_eq!(ks[ks.len() - 1], "done");
    let error_at = ks.iter().rposition(|k| *k == "error").unwrap();
    match &seen[error_at].payload {
        EventPayload::Error { error_kind, .. } => {
            assert_eq!(*error_kind, ps_domain::event::ErrorKind::Cancelled);
        }
        _ => unreachable!(),
    }

    let task = h.state.store.read_task(&started.task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    // The partial event log is intact and dense.
    assert_dense_indices(&task.events);
    assert!(!task.events.is_empty());
}

#[tokio::test]
async fn reconnect_replay_matches_live_sequence() {
    let h = harness(vec![
        Turn::Calls(vec![(
            "get_resource_yaml",
            serde_json::json!({ "kind": "pod", "name": "a" }),
        )]),
        Turn::Final("SUMMARY: fine\nREMEDIATION: none"),
    ]);

    let mut started = start_investigation(&h.state, request("replay me")).unwrap();
    let live = collect_until_done(&mut started.events).await;

    // A client that saw the first 3 events reconnects with after=2.
    let head: Vec<&str> = kinds(&live[..3]).to_vec();
    let tail = h
        .state
        .store
        .read_events_since(&started.task_id, Some(2))
        .unwrap();
    assert_eq!(tail[0].step_index, 3);

    let mut recombined = head;
    recombined.extend(kinds(&tail));
    assert_eq!(recombined, kinds(&live));

    // Terminal task: the full log ends with exactly one done.
    let done_count = live
        .iter()
        .filter(|e| e.payload.is_done())
        .count();
    assert_eq!(done_count, 1);
}

#[tokio::test]
async fn duplicate_calls_short_circuit_the_loop() {
    let same = ("get_resource_yaml", serde_json::json!({ "kind": "pod", "name": "ghost" }));
    let h = harness(vec![
        Turn::Calls(vec![same.clone()]),
        Turn::Calls(vec![same.clone()]),
        Turn::Calls(vec![same.clone()]),
        Turn::Calls(vec![same]),
    ]);

    let mut started = start_investigation(&h.state, request("find the ghost pod")).unwrap();
    let events = collect_until_done(&mut started.events).await;
    let ks = kinds(&events);

    // The third identical call is cut off before executing.
    assert_eq!(ks.iter().filter(|k| **k == "tool_call_output").count(), 2);
    let task = h.state.store.read_task(&started.task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.summary.unwrap().contains("identical calls"));
}

#[tokio::test]
async fn tool_deadline_becomes_failed_output() {
    let h = harness_with(
        vec![
            Turn::Calls(vec![(
                "get_resource_yaml",
                serde_json::json!({ "kind": "pod", "name": "slow" }),
            )]),
            Turn::Final("SUMMARY: timed out\nREMEDIATION: raise the deadline"),
        ],
        FakeBackend {
            delay: Some(Duration::from_secs(30)),
            ..Default::default()
        },
        |config| config.tools.call_timeout_secs = 0,
    );

    let mut started = start_investigation(&h.state, request("slow backend")).unwrap();
    let events = collect_until_done(&mut started.events).await;

    let output = events
        .iter()
        .find_map(|e| match &e.payload {
            EventPayload::ToolCallOutput {
                success, output, ..
            } => Some((*success, output.clone())),
            _ => None,
        })
        .unwrap();
    assert!(!output.0);
    assert_eq!(output.1, serde_json::json!("timeout"));

    let task = h.state.store.read_task(&started.task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn empty_prompt_is_rejected_before_any_event() {
    let h = harness(vec![]);
    match start_investigation(&h.state, request("   ")) {
        Err(ps_gateway::runtime::supervisor::StartError::InvalidRequest(_)) => {}
        Err(other) => panic!("unexpected error {other:?}"),
        Ok(_) => panic!("empty prompt must be rejected"),
    }
    // Nothing was created.
    assert!(h.state.store.list_tasks(10).unwrap().is_empty());
}
