// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. The liveness probe is public; every
// other endpoint requires a valid Bearer token checked via the `AuthBearer`
// extractor.
//
// The API is an operator surface: it reads the derived indices and toggles
// read-only mode. It never opens, closes or re-sizes positions.
//
// CORS is configured permissively for development; tighten `allowed_origins`
// in production.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::lifecycle::SignalState;
use crate::types::EngineMode;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/status", get(status))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/positions/closed", get(closed_positions))
        .route("/api/v1/signals", get(signals))
        .route("/api/v1/signals/:id", get(signal_by_id))
        .route("/api/v1/decisions", get(decisions))
        .route("/api/v1/gates", get(gates))
        .route("/api/v1/events", get(events))
        .route("/api/v1/control/halt", post(control_halt))
        .route("/api/v1/control/resume", post(control_resume))
        .route("/api/v1/control/snapshot", post(control_snapshot))
        .route("/api/v1/control/reconcile", post(control_reconcile))
        // ── WebSocket (handled in the ws module but mounted here) ───
        .route("/api/v1/events/ws", get(crate::api::ws::ws_handler))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Shared helpers
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    state: Option<SignalState>,
}

impl ListQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT)
    }
}

fn error_response(status: StatusCode, code: &str, message: impl std::fmt::Display) -> Response {
    let body = serde_json::json!({
        "error": code,
        "message": message.to_string(),
    });
    (status, Json(body)).into_response()
}

/// Lock timeouts on reads surface as 503, never as an empty list.
fn unavailable(message: impl std::fmt::Display) -> Response {
    warn!(error = %message, "API read failed");
    error_response(StatusCode::SERVICE_UNAVAILABLE, "unavailable", message)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    mode: EngineMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    uptime_secs: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mode = state.health.mode_status();
    let resp = HealthResponse {
        status: match mode.mode {
            EngineMode::Normal => "ok",
            EngineMode::ReadOnly => "read_only",
        },
        mode: mode.mode,
        reason: mode.reason,
        uptime_secs: state.start_time.elapsed().as_secs(),
        server_time: chrono::Utc::now().timestamp_millis(),
    };
    Json(resp)
}

// =============================================================================
// Status (authenticated)
// =============================================================================

async fn status(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.status())
}

// =============================================================================
// Positions (authenticated)
// =============================================================================

async fn positions(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> Response {
    match state.store.open_positions() {
        Ok(positions) => Json(positions).into_response(),
        Err(e) => unavailable(e),
    }
}

async fn closed_positions(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Response {
    match state.store.closed_positions(query.limit()) {
        Ok(positions) => Json(positions).into_response(),
        Err(e) => unavailable(e),
    }
}

// =============================================================================
// Signals (authenticated)
// =============================================================================

/// Newest first, optionally filtered by state.
async fn signals(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Response {
    let index = match state.lifecycle.index_snapshot() {
        Ok(index) => index,
        Err(e) => return unavailable(e),
    };
    let signals: Vec<_> = index
        .sorted()
        .into_iter()
        .rev()
        .filter(|s| query.state.map_or(true, |wanted| s.state == wanted))
        .take(query.limit())
        .collect();
    Json(signals).into_response()
}

async fn signal_by_id(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.lifecycle.get(&id) {
        Ok(Some(signal)) => Json(signal).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "unknown_signal", format!("no signal {id}")),
        Err(e) => unavailable(e),
    }
}

// =============================================================================
// Decisions, gates and health events (authenticated)
// =============================================================================

async fn decisions(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    Json(state.engine.recent_decisions(query.limit()))
}

async fn gates(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let config = state.config.current();
    Json(serde_json::json!({
        "stats": state.engine.gate_stats(),
        "params": config.gates,
    }))
}

async fn events(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    Json(state.health.recent(query.limit()))
}

// =============================================================================
// Control endpoints (authenticated)
// =============================================================================

#[derive(Serialize)]
struct ControlResponse {
    mode: EngineMode,
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct HaltRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn control_halt(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    body: Option<Json<HaltRequest>>,
) -> impl IntoResponse {
    let reason = body
        .and_then(|Json(req)| req.reason)
        .unwrap_or_else(|| "unspecified".to_string());
    state.halt(&reason);
    warn!(reason = %reason, "engine HALTED via API");

    Json(ControlResponse {
        mode: state.health.mode(),
        message: format!("Engine halted: {reason}"),
    })
}

async fn control_resume(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let resumed = state.resume();
    if resumed {
        info!("engine RESUMED via API");
    }

    Json(ControlResponse {
        mode: state.health.mode(),
        message: if resumed {
            "Engine resumed".to_string()
        } else {
            "Engine was not halted".to_string()
        },
    })
}

async fn control_snapshot(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> Response {
    let task_state = state.clone();
    match tokio::task::spawn_blocking(move || task_state.take_snapshot()).await {
        Ok(Ok(info)) => {
            info!(last_seq = info.last_seq, "snapshot taken via API");
            Json(info).into_response()
        }
        Ok(Err(e)) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "snapshot_failed", format!("{e:#}")),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "snapshot_failed", e),
    }
}

async fn control_reconcile(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> Response {
    let task_state = state.clone();
    match tokio::task::spawn_blocking(move || task_state.reconcile()).await {
        Ok(Ok(result)) => Json(result).into_response(),
        Ok(Err(e)) => error_response(StatusCode::SERVICE_UNAVAILABLE, "reconcile_failed", format!("{e:#}")),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "reconcile_failed", e),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::auth::ADMIN_TOKEN_ENV;
    use crate::execution::PaperAdapter;
    use crate::runtime_config::{ConfigStore, RuntimeConfig};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    const TOKEN: &str = "test-admin-token";

    fn state(dir: &tempfile::TempDir) -> Arc<AppState> {
        Arc::new(
            AppState::open(
                Arc::new(ConfigStore::fixed(RuntimeConfig::default())),
                dir.path(),
                Arc::new(PaperAdapter::default()),
            )
            .unwrap(),
        )
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_public() {
        let dir = tempfile::tempdir().unwrap();
        let response = router(state(&dir))
            .oneshot(Request::get("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["mode"], "Normal");
    }

    #[tokio::test]
    async fn protected_routes_reject_missing_token() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(&dir));
        for uri in ["/api/v1/positions", "/api/v1/signals", "/api/v1/status"] {
            let response = app
                .clone()
                .oneshot(Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::FORBIDDEN, "{uri}");
        }
    }

    #[tokio::test]
    async fn authorized_operator_can_halt_and_resume() {
        std::env::set_var(ADMIN_TOKEN_ENV, TOKEN);
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let app = router(state.clone());
        let authed = |method: &str, uri: &str| {
            Request::builder()
                .method(method)
                .uri(uri)
                .header("authorization", format!("Bearer {TOKEN}"))
                .body(Body::empty())
                .unwrap()
        };

        let response = app.clone().oneshot(authed("POST", "/api/v1/control/halt")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.health.mode(), EngineMode::ReadOnly);

        let health = app
            .clone()
            .oneshot(Request::get("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(health).await["status"], "read_only");

        let response = app.clone().oneshot(authed("POST", "/api/v1/control/resume")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.health.mode(), EngineMode::Normal);

        let missing = app.clone().oneshot(authed("GET", "/api/v1/signals/nope")).await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let positions = app.oneshot(authed("GET", "/api/v1/positions")).await.unwrap();
        assert_eq!(positions.status(), StatusCode::OK);
        assert_eq!(body_json(positions).await, serde_json::json!([]));
    }

    #[test]
    fn list_limit_is_clamped() {
        let q = ListQuery {
            limit: Some(10_000),
            state: None,
        };
        assert_eq!(q.limit(), MAX_LIMIT);
        assert_eq!(ListQuery::default().limit(), DEFAULT_LIMIT);
    }
}
