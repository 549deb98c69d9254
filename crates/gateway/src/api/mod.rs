pub mod investigate;

use axum::routing::{get, patch, post};
use axum::Router;

use crate::state::AppState;

/// Build the full API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/investigate", post(investigate::start))
        .route("/v1/investigate", get(investigate::list_tasks))
        .route("/v1/investigate/:task_id", get(investigate::get_task))
        .route("/v1/investigate/:task_id", patch(investigate::patch_task))
        .route(
            "/v1/investigate/:task_id/event",
            get(investigate::reconnect),
        )
        .route("/v1/investigate/:task_id/abort", post(investigate::abort))
        .route(
            "/v1/investigate/:task_id/approval",
            post(investigate::approval),
        )
        .route(
            "/v1/investigate/:task_id/approvals",
            get(investigate::list_approvals),
        )
        // The desktop client talks to the daemon from its own origin.
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
