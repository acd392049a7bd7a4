//! HTTP surface.
//!
//! Thin JSON glue over the daemon's components. The two creation routes
//! differ only in their reporter: `/sessions/create` buffers progress and
//! answers once (first error wins), `/sessions/create-stream` emits
//! Server-Sent Events as the pipeline advances.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::{
    extract::{ConnectInfo, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post, put},
    Json, Router,
};
use companion_protocol::{EventPayload, PipelineStep, ProgressEvent, StepStatus};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::info;

use companion_connectors::codex::CONTAINER_APP_SERVER_PORT;
use companion_connectors::{spawn_adapter, LaunchSpec};

use crate::auth::is_loopback;
use crate::container::CONTAINER_CWD;
use crate::gateway::ws_handler;
use crate::pipeline::{self, CreateSessionRequest, ProgressReporter};
use crate::state::Daemon;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error taxonomy → status codes.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(what: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: format!("{what} not found"),
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub fn router(daemon: Arc<Daemon>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions/create", post(create_session))
        .route("/sessions/create-stream", post(create_session_stream))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}", delete(delete_session))
        .route("/sessions/{id}/kill", post(kill_session))
        .route("/sessions/{id}/archive", post(archive_session))
        .route("/sessions/{id}/unarchive", post(unarchive_session))
        .route("/sessions/{id}/relaunch", post(relaunch_session))
        .route("/sessions/{id}/name", post(rename_session))
        .route(
            "/sessions/{id}/processes/{task_id}/kill",
            post(kill_process),
        )
        .route("/sessions/{id}/processes/kill-all", post(kill_all_processes))
        .route("/processes/system", get(system_processes))
        .route("/auth/qr", get(auth_qr))
        .route("/auth/verify", post(auth_verify))
        .route("/auth/auto", get(auth_auto))
        .route("/plugins", get(list_plugins))
        .route("/plugins/{id}/enable", post(enable_plugin))
        .route("/plugins/{id}/disable", post(disable_plugin))
        .route("/plugins/{id}/config", put(set_plugin_config))
        .route("/plugins/{id}/grants", put(set_plugin_grants))
        .route("/plugins/{id}/dry-run", post(dry_run_plugin))
        .route("/ws/browser/{session_id}", get(ws_handler))
        .with_state(daemon)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "version": VERSION }))
}

// ---------------------------------------------------------------------------
// Session creation
// ---------------------------------------------------------------------------

/// Buffers progress and reports the first error as the whole response.
struct BufferedReporter {
    events: Mutex<Vec<ProgressEvent>>,
    error: Mutex<Option<(String, u16, Option<PipelineStep>)>>,
}

impl BufferedReporter {
    fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            error: Mutex::new(None),
        }
    }
}

impl ProgressReporter for BufferedReporter {
    fn progress(&self, step: PipelineStep, label: &str, status: StepStatus, detail: Option<String>) {
        self.events.lock().expect("reporter poisoned").push(ProgressEvent {
            step,
            label: label.to_string(),
            status,
            detail,
        });
    }

    fn error(&self, message: &str, http_status: u16, step: Option<PipelineStep>) {
        let mut slot = self.error.lock().expect("reporter poisoned");
        if slot.is_none() {
            *slot = Some((message.to_string(), http_status, step));
        }
    }
}

async fn create_session(
    State(daemon): State<Arc<Daemon>>,
    Json(request): Json<CreateSessionRequest>,
) -> Response {
    let reporter = BufferedReporter::new();
    match pipeline::run(&daemon, request, &reporter).await {
        Ok(descriptor) => Json(descriptor).into_response(),
        Err(_) => {
            let (message, status, step) = reporter
                .error
                .lock()
                .expect("reporter poisoned")
                .clone()
                .unwrap_or_else(|| ("creation failed".into(), 500, None));
            let status =
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(json!({ "error": message, "step": step }))).into_response()
        }
    }
}

/// Streams `progress`, then exactly one `done` or `error` event.
struct SseReporter {
    tx: mpsc::UnboundedSender<Event>,
}

impl ProgressReporter for SseReporter {
    fn progress(&self, step: PipelineStep, label: &str, status: StepStatus, detail: Option<String>) {
        let event = ProgressEvent {
            step,
            label: label.to_string(),
            status,
            detail,
        };
        if let Ok(data) = serde_json::to_string(&event) {
            let _ = self.tx.send(Event::default().event("progress").data(data));
        }
    }

    fn error(&self, message: &str, http_status: u16, step: Option<PipelineStep>) {
        let data = json!({ "error": message, "status": http_status, "step": step });
        let _ = self
            .tx
            .send(Event::default().event("error").data(data.to_string()));
    }
}

async fn create_session_stream(
    State(daemon): State<Arc<Daemon>>,
    Json(request): Json<CreateSessionRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::unbounded_channel::<Event>();
    let reporter = SseReporter { tx: tx.clone() };

    tokio::spawn(async move {
        if let Ok(descriptor) = pipeline::run(&daemon, request, &reporter).await {
            if let Ok(data) = serde_json::to_string(&descriptor) {
                let _ = tx.send(Event::default().event("done").data(data));
            }
        }
        // Channel closes when tx drops, ending the stream.
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok(event), rx))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ---------------------------------------------------------------------------
// Session management
// ---------------------------------------------------------------------------

async fn list_sessions(State(daemon): State<Arc<Daemon>>) -> impl IntoResponse {
    let sessions: Vec<_> = daemon
        .store
        .list()
        .iter()
        .map(|r| daemon.descriptor(r))
        .collect();
    Json(json!({ "sessions": sessions }))
}

async fn get_session(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = daemon.store.get(&id).ok_or(ApiError::not_found("session"))?;
    Ok(Json(daemon.descriptor(&record)))
}

async fn delete_session(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !daemon.delete_session(&id).await {
        return Err(ApiError::not_found("session"));
    }
    Ok(Json(json!({ "deleted": true })))
}

async fn kill_session(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if daemon.store.get(&id).is_none() {
        return Err(ApiError::not_found("session"));
    }
    let was_live = daemon.kill_session(&id).await;
    Ok(Json(json!({ "killed": was_live })))
}

async fn archive_session(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !daemon.archive_session(&id).await {
        return Err(ApiError::not_found("session"));
    }
    Ok(Json(json!({ "archived": true })))
}

async fn unarchive_session(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !daemon.store.update(&id, |r| r.archived = false) {
        return Err(ApiError::not_found("session"));
    }
    Ok(Json(json!({ "archived": false })))
}

/// Relaunch the backend CLI for a dormant (or crashed) session, resuming
/// the backend-native conversation when an id was recorded.
async fn relaunch_session(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = daemon.store.get(&id).ok_or(ApiError::not_found("session"))?;
    if record.archived {
        return Err(ApiError::invalid("session is archived; unarchive first"));
    }

    let mut spec = LaunchSpec {
        cwd: record.worktree_path.clone().unwrap_or_else(|| record.cwd.clone()),
        model: record.model.clone(),
        permission_mode: record.permission_mode.clone(),
        allowed_tools: Vec::new(),
        env: Vec::new(),
        resume: record.backend_session_id.clone(),
        fork_session: false,
        wrapper: Vec::new(),
        app_server_port: None,
    };

    let mut containerized = false;
    if let Some(handle) = daemon.containers.handle_for_session(&id) {
        if daemon.containers.alive(&handle.id).await == crate::container::Liveness::Running {
            let bin =
                std::env::var("COMPANION_CONTAINER_BIN").unwrap_or_else(|_| "docker".into());
            spec.wrapper = vec![
                bin,
                "exec".into(),
                "-i".into(),
                "-w".into(),
                CONTAINER_CWD.into(),
                handle.id.clone(),
            ];
            spec.cwd = record.cwd.clone();
            spec.app_server_port = handle.ports.get(&CONTAINER_APP_SERVER_PORT).copied();
            containerized = true;
        }
    }

    let adapter = spawn_adapter(record.backend, spec)
        .await
        .map_err(|e| ApiError::unavailable(e.to_string()))?;
    daemon.relaunch_session(&record, adapter, containerized).await;
    info!(
        component = "routes",
        event = "routes.session.relaunched",
        session_id = %id,
        "Session relaunched"
    );
    Ok(Json(daemon.descriptor(&record)))
}

#[derive(Deserialize)]
struct RenameBody {
    name: String,
}

async fn rename_session(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
    Json(body): Json<RenameBody>,
) -> Result<impl IntoResponse, ApiError> {
    if daemon.store.get(&id).is_none() {
        return Err(ApiError::not_found("session"));
    }
    let name = body.name.clone();
    daemon.store.update(&id, |r| r.name = Some(name));
    daemon
        .broadcast(&id, EventPayload::SessionNameUpdate { name: body.name })
        .await;
    Ok(Json(json!({ "renamed": true })))
}

// ---------------------------------------------------------------------------
// Processes
// ---------------------------------------------------------------------------

async fn kill_process(
    State(daemon): State<Arc<Daemon>>,
    Path((id, task_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    if !daemon.processes.kill(&id, &task_id).await {
        return Err(ApiError::not_found("task"));
    }
    Ok(Json(json!({ "killed": true })))
}

async fn kill_all_processes(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let count = daemon.processes.kill_all(&id).await;
    Json(json!({ "killed": count }))
}

async fn system_processes(State(daemon): State<Arc<Daemon>>) -> impl IntoResponse {
    Json(json!({ "processes": daemon.processes.system_processes().await }))
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

async fn auth_qr(State(daemon): State<Arc<Daemon>>) -> Result<impl IntoResponse, ApiError> {
    let svg = daemon
        .auth
        .pairing_qr_svg(&daemon.external_url)
        .map_err(|e| ApiError::invalid(e.to_string()))?;
    Ok(([(axum::http::header::CONTENT_TYPE, "image/svg+xml")], svg))
}

#[derive(Deserialize)]
struct VerifyBody {
    token: String,
}

async fn auth_verify(
    State(daemon): State<Arc<Daemon>>,
    Json(body): Json<VerifyBody>,
) -> impl IntoResponse {
    Json(json!({ "valid": daemon.auth.verify(&body.token) }))
}

/// Loopback-only token handout for same-machine browsers.
async fn auth_auto(
    State(daemon): State<Arc<Daemon>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Result<impl IntoResponse, StatusCode> {
    if !is_loopback(&addr) {
        return Err(StatusCode::FORBIDDEN);
    }
    Ok(Json(json!({ "token": daemon.auth.token() })))
}

// ---------------------------------------------------------------------------
// Plugins
// ---------------------------------------------------------------------------

async fn list_plugins(State(daemon): State<Arc<Daemon>>) -> impl IntoResponse {
    Json(json!({ "plugins": daemon.plugins.list() }))
}

async fn enable_plugin(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !daemon.plugins.set_enabled(&id, true) {
        return Err(ApiError::not_found("plugin"));
    }
    Ok(Json(json!({ "enabled": true })))
}

async fn disable_plugin(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    if !daemon.plugins.set_enabled(&id, false) {
        return Err(ApiError::not_found("plugin"));
    }
    Ok(Json(json!({ "enabled": false })))
}

async fn set_plugin_config(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
    Json(config): Json<serde_json::Value>,
) -> Result<impl IntoResponse, ApiError> {
    daemon
        .plugins
        .set_config(&id, config)
        .map_err(ApiError::invalid)?;
    Ok(Json(json!({ "updated": true })))
}

#[derive(Deserialize)]
struct GrantBody {
    capability: String,
    granted: bool,
}

async fn set_plugin_grants(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
    Json(body): Json<GrantBody>,
) -> Result<impl IntoResponse, ApiError> {
    if !daemon.plugins.set_grant(&id, &body.capability, body.granted) {
        return Err(ApiError::invalid("unknown plugin or capability"));
    }
    Ok(Json(json!({ "updated": true })))
}

async fn dry_run_plugin(
    State(daemon): State<Arc<Daemon>>,
    Path(id): Path<String>,
    Json(envelope): Json<companion_protocol::Envelope>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = daemon
        .plugins
        .dry_run(&id, envelope)
        .await
        .ok_or(ApiError::not_found("plugin"))?;
    Ok(Json(outcome))
}
