//! Route table and handlers.

use crate::SharedState;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::Json,
    routing::{delete, get, post, put},
    Router,
};
use base64::Engine;
use canopy_core::error::{Error, StoreError};
use canopy_core::model::{
    AgentParameters, AgentRecord, LinkRecord, RunInput, RunRecord, SessionRecord,
};
use canopy_orchestrator::{CacheStats, RunEvent};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

/// Total decoded image payload allowed per run.
const MAX_IMAGE_BYTES: usize = 20 * 1024 * 1024;

/// SSE keepalive comment interval.
const KEEPALIVE_SECS: u64 = 20;

/// Build the gateway router.
pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/sessions", post(create_session_handler))
        .route("/sessions", get(list_sessions_handler))
        .route("/sessions/{sid}", get(get_session_handler))
        .route("/sessions/{sid}", delete(delete_session_handler))
        .route("/sessions/{sid}/agents", post(create_agent_handler))
        .route("/sessions/{sid}/agents", get(list_agents_handler))
        .route("/sessions/{sid}/agents/{id}", get(get_agent_handler))
        .route("/sessions/{sid}/agents/{id}", put(update_agent_handler))
        .route("/sessions/{sid}/agents/{id}", delete(delete_agent_handler))
        .route("/sessions/{sid}/links", post(create_link_handler))
        .route("/sessions/{sid}/links", get(list_links_handler))
        .route("/sessions/{sid}/links/{id}", delete(delete_link_handler))
        .route("/sessions/{sid}/runs", post(create_run_handler))
        .route("/sessions/{sid}/runs/{id}", get(get_run_handler))
        .route("/sessions/{sid}/runs/{id}/stream", get(stream_run_handler))
        .route("/cache/stats", get(cache_stats_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

// ── Shared response types ─────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn store_error(e: StoreError) -> ApiError {
    let status = match &e {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::CrossSessionViolation { .. } => StatusCode::CONFLICT,
        StoreError::WouldCreateCycle { .. } => StatusCode::BAD_REQUEST,
        StoreError::RunAlreadyStartedOrFinished { .. } => StatusCode::CONFLICT,
        StoreError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

// ── Health ────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ── Sessions ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateSessionRequest {
    #[serde(default = "default_session_name")]
    name: String,
}

fn default_session_name() -> String {
    "Untitled Session".into()
}

async fn create_session_handler(
    State(state): State<SharedState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionRecord>), ApiError> {
    let session = state
        .store
        .create_session(&req.name)
        .await
        .map_err(store_error)?;
    info!(session_id = %session.session_id, "Session created");
    Ok((StatusCode::CREATED, Json(session)))
}

async fn list_sessions_handler(
    State(state): State<SharedState>,
) -> Result<Json<Vec<SessionRecord>>, ApiError> {
    Ok(Json(state.store.list_sessions().await.map_err(store_error)?))
}

async fn get_session_handler(
    State(state): State<SharedState>,
    Path(sid): Path<String>,
) -> Result<Json<SessionRecord>, ApiError> {
    let session = state.store.get_session(&sid).await.map_err(store_error)?;
    state.store.touch_session(&sid).await.ok();
    Ok(Json(session))
}

async fn delete_session_handler(
    State(state): State<SharedState>,
    Path(sid): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.store.delete_session(&sid).await.map_err(store_error)?;
    state.cache.clear_session(&sid).await;
    Ok(StatusCode::NO_CONTENT)
}

// ── Agents ────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateAgentRequest {
    name: String,
    role: String,
    #[serde(default)]
    system_prompt: String,
    #[serde(default)]
    parameters: Option<AgentParameters>,
    #[serde(default)]
    photo_injection_enabled: bool,
    #[serde(default)]
    photo_injection_features: Vec<String>,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    position: Option<(f64, f64)>,
}

async fn create_agent_handler(
    State(state): State<SharedState>,
    Path(sid): Path<String>,
    Json(req): Json<CreateAgentRequest>,
) -> Result<(StatusCode, Json<AgentRecord>), ApiError> {
    let mut agent = AgentRecord::new(&sid, &req.name, &req.role, &req.system_prompt);
    if let Some(parameters) = req.parameters {
        agent.parameters = parameters;
    }
    agent.photo_injection_enabled = req.photo_injection_enabled;
    agent.photo_injection_features = req.photo_injection_features;
    agent.parent_id = req.parent_id;
    agent.position = req.position;

    state.store.create_agent(&agent).await.map_err(store_error)?;
    info!(agent_id = %agent.agent_id, session_id = %sid, "Agent created");
    Ok((StatusCode::CREATED, Json(agent)))
}

async fn list_agents_handler(
    State(state): State<SharedState>,
    Path(sid): Path<String>,
) -> Result<Json<Vec<AgentRecord>>, ApiError> {
    Ok(Json(
        state.store.list_agents(&sid).await.map_err(store_error)?,
    ))
}

async fn get_agent_handler(
    State(state): State<SharedState>,
    Path((sid, id)): Path<(String, String)>,
) -> Result<Json<AgentRecord>, ApiError> {
    Ok(Json(
        state.store.get_agent(&sid, &id).await.map_err(store_error)?,
    ))
}

#[derive(Deserialize)]
struct UpdateAgentRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    parameters: Option<AgentParameters>,
    #[serde(default)]
    photo_injection_enabled: Option<bool>,
    #[serde(default)]
    photo_injection_features: Option<Vec<String>>,
    /// Double-optional: omitted = unchanged, `null` = detach.
    #[serde(default, with = "double_option")]
    parent_id: Option<Option<String>>,
    #[serde(default)]
    position: Option<(f64, f64)>,
}

mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(
        deserializer: D,
    ) -> Result<Option<Option<String>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(deserializer).map(Some)
    }
}

async fn update_agent_handler(
    State(state): State<SharedState>,
    Path((sid, id)): Path<(String, String)>,
    Json(req): Json<UpdateAgentRequest>,
) -> Result<Json<AgentRecord>, ApiError> {
    let mut agent = state.store.get_agent(&sid, &id).await.map_err(store_error)?;

    if let Some(name) = req.name {
        agent.name = name;
    }
    if let Some(role) = req.role {
        agent.role = role;
    }
    if let Some(system_prompt) = req.system_prompt {
        agent.system_prompt = system_prompt;
    }
    if let Some(parameters) = req.parameters {
        agent.parameters = parameters;
    }
    if let Some(enabled) = req.photo_injection_enabled {
        agent.photo_injection_enabled = enabled;
    }
    if let Some(features) = req.photo_injection_features {
        agent.photo_injection_features = features;
    }
    if let Some(parent_id) = req.parent_id {
        agent.parent_id = parent_id;
    }
    if let Some(position) = req.position {
        agent.position = Some(position);
    }

    state.store.update_agent(&agent).await.map_err(store_error)?;
    let agent = state.store.get_agent(&sid, &id).await.map_err(store_error)?;
    Ok(Json(agent))
}

async fn delete_agent_handler(
    State(state): State<SharedState>,
    Path((sid, id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state.store.delete_agent(&sid, &id).await.map_err(store_error)?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Links ─────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateLinkRequest {
    parent_agent_id: String,
    child_agent_id: String,
}

async fn create_link_handler(
    State(state): State<SharedState>,
    Path(sid): Path<String>,
    Json(req): Json<CreateLinkRequest>,
) -> Result<(StatusCode, Json<LinkRecord>), ApiError> {
    // parent_id is authoritative; the link row mirrors it for the editor.
    state
        .store
        .set_parent(&sid, &req.child_agent_id, Some(&req.parent_agent_id))
        .await
        .map_err(store_error)?;

    let link = LinkRecord::new(&sid, &req.parent_agent_id, &req.child_agent_id);
    state.store.create_link(&link).await.map_err(store_error)?;
    Ok((StatusCode::CREATED, Json(link)))
}

async fn list_links_handler(
    State(state): State<SharedState>,
    Path(sid): Path<String>,
) -> Result<Json<Vec<LinkRecord>>, ApiError> {
    Ok(Json(state.store.list_links(&sid).await.map_err(store_error)?))
}

async fn delete_link_handler(
    State(state): State<SharedState>,
    Path((sid, id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let links = state.store.list_links(&sid).await.map_err(store_error)?;
    let link = links
        .into_iter()
        .find(|l| l.link_id == id)
        .ok_or_else(|| store_error(StoreError::NotFound(format!("link {id}"))))?;

    state
        .store
        .set_parent(&sid, &link.child_agent_id, None)
        .await
        .map_err(store_error)?;
    state.store.delete_link(&sid, &id).await.map_err(store_error)?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Runs ──────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateRunRequest {
    root_agent_id: String,
    #[serde(default)]
    input: RunInput,
    #[serde(default)]
    images: Vec<String>,
}

async fn create_run_handler(
    State(state): State<SharedState>,
    Path(sid): Path<String>,
    Json(req): Json<CreateRunRequest>,
) -> Result<(StatusCode, Json<RunRecord>), ApiError> {
    let mut input = req.input;
    if !req.images.is_empty() {
        validate_images(&req.images)?;
        input.images = req.images;
    }

    let run = state
        .store
        .create_run(&sid, &req.root_agent_id, input)
        .await
        .map_err(store_error)?;
    info!(run_id = %run.run_id, session_id = %sid, "Run created");
    Ok((StatusCode::CREATED, Json(run)))
}

/// Reject undecodable payloads and bound the total decoded size.
fn validate_images(images: &[String]) -> Result<(), ApiError> {
    let engine = base64::engine::general_purpose::STANDARD;
    let mut total = 0usize;
    for (i, image) in images.iter().enumerate() {
        let payload = image
            .strip_prefix("data:")
            .and_then(|rest| rest.split_once(";base64,").map(|(_, data)| data))
            .unwrap_or(image);
        let decoded = engine
            .decode(payload.trim())
            .map_err(|_| bad_request(format!("image {i} is not valid base64")))?;
        total += decoded.len();
    }
    if total > MAX_IMAGE_BYTES {
        return Err(bad_request(format!(
            "images exceed the {} MB limit",
            MAX_IMAGE_BYTES / (1024 * 1024)
        )));
    }
    Ok(())
}

async fn get_run_handler(
    State(state): State<SharedState>,
    Path((sid, id)): Path<(String, String)>,
) -> Result<Json<RunRecord>, ApiError> {
    Ok(Json(
        state.store.get_run(&sid, &id).await.map_err(store_error)?,
    ))
}

// ── SSE run stream ────────────────────────────────────────────────────────

type SseStream = BoxStream<'static, Result<SseEvent, Infallible>>;

async fn stream_run_handler(
    State(state): State<SharedState>,
    Path((sid, run_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Sse<axum::response::sse::KeepAliveStream<SseStream>>, ApiError> {
    // Reconnection ids are accepted but not replayed; the client re-reads
    // current run state instead.
    if let Some(last) = headers.get("last-event-id") {
        debug!(last_event_id = ?last, run_id = %run_id, "Ignoring Last-Event-ID");
    }

    let api_key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| state.config.llm_default_key.clone())
        .unwrap_or_default();

    let connected = RunEvent::Connected {
        run_id: run_id.clone(),
    };

    let stream: SseStream = match state.coordinator.start_run(&sid, &run_id, &api_key).await {
        Ok(rx) => stream::iter(vec![connected])
            .chain(ReceiverStream::new(rx))
            .map(to_sse_frame)
            .boxed(),
        Err(Error::Store(e @ StoreError::NotFound(_))) => return Err(store_error(e)),
        Err(Error::Store(e @ StoreError::RunAlreadyStartedOrFinished { .. })) => {
            return Err(store_error(e))
        }
        Err(e) => {
            // The run is already marked failed; emit one terminal error frame.
            let error = RunEvent::Error {
                agent_id: String::new(),
                kind: e.kind().into(),
                message: e.to_string(),
            };
            stream::iter(vec![connected, error]).map(to_sse_frame).boxed()
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(KEEPALIVE_SECS))
            .text("keepalive"),
    ))
}

fn to_sse_frame(event: RunEvent) -> Result<SseEvent, Infallible> {
    let name = event.sse_event();
    let data = serde_json::to_string(&event).unwrap_or_default();
    Ok(SseEvent::default().event(name).data(data))
}

// ── Cache stats ───────────────────────────────────────────────────────────

async fn cache_stats_handler(State(state): State<SharedState>) -> Json<CacheStats> {
    Json(state.cache.stats().await)
}
