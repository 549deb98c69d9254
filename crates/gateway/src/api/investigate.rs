//! Investigation endpoints — the SSE gateway.
//!
//! - `POST  /v1/investigate`                    — start, stream events (SSE)
//! - `GET   /v1/investigate`                    — list recent tasks
//! - `GET   /v1/investigate/:task_id`           — full task record
//! - `PATCH /v1/investigate/:task_id`           — user flags (resolved)
//! - `GET   /v1/investigate/:task_id/event`     — reconnect: replay + live tail
//! - `POST  /v1/investigate/:task_id/abort`     — fire the abort signal
//! - `POST  /v1/investigate/:task_id/approval`  — decide a gated tool call
//! - `GET   /v1/investigate/:task_id/approvals` — pending approvals snapshot
//!
//! Every streamed event is one SSE frame `data: <json>\n\n`; the frame id
//! carries the step index so `Last-Event-ID` reconnects line up.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use futures_util::stream::Stream;
use serde::Deserialize;
use tokio::sync::broadcast;

use ps_domain::event::TaskEvent;
use ps_domain::task::NamedBlob;
use ps_store::StoreError;

use crate::runtime::approval::ApprovalDecision;
use crate::runtime::supervisor::{start_investigation, InvestigateRequest, StartError};
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request shapes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct StartBody {
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub kubecontext: Option<String>,
    #[serde(default)]
    pub resource_context: Vec<NamedBlob>,
    #[serde(default)]
    pub log_context: Vec<NamedBlob>,
}

#[derive(Debug, Deserialize)]
pub struct ReconnectQuery {
    /// Last step index the client has seen; replay starts after it.
    #[serde(default)]
    pub after: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ApprovalBody {
    pub call_id: String,
    pub decision: String,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PatchBody {
    pub resolved: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "d_limit")]
    pub limit: usize,
}

fn d_limit() -> usize {
    50
}

/// Standardized JSON error response: `{ "error": "<message>" }`.
fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

fn store_error(e: StoreError) -> Response {
    match e {
        StoreError::TaskMissing(id) => api_error(StatusCode::NOT_FOUND, format!("task {id} not found")),
        StoreError::Conflict(id) => {
            api_error(StatusCode::CONFLICT, format!("task {id} already exists"))
        }
        other => api_error(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    }
}

fn sse_frame(event: &TaskEvent) -> Event {
    Event::default()
        .id(event.step_index.to_string())
        .data(serde_json::to_string(event).unwrap_or_default())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /v1/investigate (SSE)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn start(State(state): State<AppState>, Json(body): Json<StartBody>) -> Response {
    let req = InvestigateRequest {
        prompt: body.prompt,
        model: body.model,
        kubecontext: body.kubecontext,
        resource_context: body.resource_context,
        log_context: body.log_context,
    };

    let started = match start_investigation(&state, req) {
        Ok(s) => s,
        Err(StartError::InvalidRequest(msg)) => return api_error(StatusCode::BAD_REQUEST, msg),
        Err(StartError::NoProvider) => {
            return api_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "no LLM provider is configured",
            )
        }
        Err(StartError::Store(e)) => return store_error(e),
    };

    tracing::info!(
        task_id = %started.task_id,
        trace_id = %started.trace_id,
        "investigation started"
    );

    let stream = live_stream(state, started.task_id.clone(), started.events, None);
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/investigate/:task_id/event (SSE reconnect)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn reconnect(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Query(query): Query<ReconnectQuery>,
    headers: HeaderMap,
) -> Response {
    // The explicit query parameter is authoritative; Last-Event-ID is the
    // fallback for EventSource auto-reconnects.
    let after = query.after.or_else(|| {
        headers
            .get("last-event-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    });

    let status = match state.store.task_status(&task_id) {
        Ok(s) => s,
        Err(e) => return store_error(e),
    };

    // Attach to the live channel before reading the replay so nothing
    // emitted in between is lost; duplicates are dropped by index.
    let live = if status.is_terminal() {
        None
    } else {
        state.mux.subscribe(&task_id)
    };

    let replay = match state.store.read_events_since(&task_id, after) {
        Ok(events) => events,
        Err(e) => return store_error(e),
    };

    let stream = replay_then_tail(state, task_id, replay, live);
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}

// ── Stream builders ─────────────────────────────────────────────────

/// Yield replayed events, then follow the live channel until `done`.
fn replay_then_tail(
    state: AppState,
    task_id: String,
    replay: Vec<TaskEvent>,
    live: Option<broadcast::Receiver<TaskEvent>>,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    async_stream::stream! {
        let mut last: Option<u64> = None;
        for event in replay {
            last = Some(event.step_index);
            let done = event.payload.is_done();
            yield Ok(sse_frame(&event));
            if done {
                return;
            }
        }

        if let Some(rx) = live {
            let tail = live_stream(state, task_id, rx, last);
            for await frame in tail {
                yield frame;
            }
        }
    }
}

/// Follow a live subscription until `done`, skipping indices at or below
/// `last_seen` and recovering lagged gaps from the store.
fn live_stream(
    state: AppState,
    task_id: String,
    mut rx: broadcast::Receiver<TaskEvent>,
    last_seen: Option<u64>,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    async_stream::stream! {
        let mut last = last_seen;
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if last.is_some_and(|l| event.step_index <= l) {
                        continue;
                    }
                    last = Some(event.step_index);
                    let done = event.payload.is_done();
                    yield Ok(sse_frame(&event));
                    if done {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::debug!(task_id, missed, "subscriber lagged, recovering from store");
                    let catchup = state
                        .store
                        .read_events_since(&task_id, last)
                        .unwrap_or_default();
                    let mut finished = false;
                    for event in catchup {
                        last = Some(event.step_index);
                        finished = event.payload.is_done();
                        yield Ok(sse_frame(&event));
                        if finished {
                            break;
                        }
                    }
                    if finished {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task reads & patches
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_task(State(state): State<AppState>, Path(task_id): Path<String>) -> Response {
    match state.store.read_task(&task_id) {
        Ok(task) => Json(task).into_response(),
        Err(e) => store_error(e),
    }
}

pub async fn list_tasks(State(state): State<AppState>, Query(q): Query<ListQuery>) -> Response {
    match state.store.list_tasks(q.limit.min(200)) {
        Ok(tasks) => Json(serde_json::json!({ "tasks": tasks })).into_response(),
        Err(e) => store_error(e),
    }
}

pub async fn patch_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(body): Json<PatchBody>,
) -> Response {
    match state.store.set_resolved(&task_id, body.resolved) {
        Ok(()) => Json(serde_json::json!({ "ok": true })).into_response(),
        Err(e) => store_error(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Abort & approvals
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn abort(State(state): State<AppState>, Path(task_id): Path<String>) -> Response {
    let Some(trace_id) = state.traces.resolve(&task_id) else {
        return api_error(
            StatusCode::CONFLICT,
            "task is not processing (already finished or unknown)",
        );
    };

    state.aborts.fire(&trace_id);
    // Unblock anything parked on a human decision right away.
    state.approvals.cancel_trace(&trace_id);

    tracing::info!(task_id, trace_id, "abort requested");
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "aborting" })),
    )
        .into_response()
}

pub async fn approval(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(body): Json<ApprovalBody>,
) -> Response {
    if state.traces.resolve(&task_id).is_none() {
        return api_error(StatusCode::CONFLICT, "task is not processing");
    }

    let decision = match body.decision.as_str() {
        "approve" => ApprovalDecision::Approve { note: body.note },
        "approve_for_session" => ApprovalDecision::ApproveForSession { note: body.note },
        "reject" => ApprovalDecision::Reject { note: body.note },
        other => {
            return api_error(
                StatusCode::BAD_REQUEST,
                format!("unknown decision '{other}' (approve | approve_for_session | reject)"),
            )
        }
    };

    if state.approvals.resolve(&body.call_id, decision) {
        Json(serde_json::json!({ "ok": true })).into_response()
    } else {
        api_error(
            StatusCode::NOT_FOUND,
            format!("no pending approval for call {}", body.call_id),
        )
    }
}

pub async fn list_approvals(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Response {
    let pending = match state.traces.resolve(&task_id) {
        Some(trace_id) => state.approvals.list_pending(&trace_id),
        None => Vec::new(),
    };
    Json(serde_json::json!({ "pending": pending })).into_response()
}
