use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive};
use axum::response::Sse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::*;
use crate::models::{AgentRecord, ChatConfig, HistoryItem};
use crate::session::{DispatchOutcome, ReplayedSlot, SessionSnapshot};
use crate::state::AppState;

// ============================================================================
// REQUEST / RESPONSE TYPES
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default = "default_slot_count")]
    pub slot_count: usize,
}

fn default_slot_count() -> usize {
    2
}

#[derive(Debug, Deserialize)]
pub struct DispatchRequest {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct SwitchAgentRequest {
    pub agent_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SlotCreated {
    pub index: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub sessions: usize,
}

// ============================================================================
// ROUTER
// ============================================================================

pub fn create_app_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/sessions", post(create_session))
        .route(
            "/api/sessions/{session_id}",
            get(get_session).delete(delete_session),
        )
        .route("/api/sessions/{session_id}/events", get(session_events))
        .route(
            "/api/sessions/{session_id}/slots",
            post(add_slot).delete(remove_last_slot),
        )
        .route(
            "/api/sessions/{session_id}/slots/{index}",
            axum::routing::delete(remove_slot),
        )
        .route(
            "/api/sessions/{session_id}/slots/{index}/clone",
            post(clone_slot),
        )
        .route(
            "/api/sessions/{session_id}/slots/{index}/config",
            put(update_slot_config),
        )
        .route(
            "/api/sessions/{session_id}/slots/{index}/save",
            post(save_slot_config),
        )
        .route("/api/sessions/{session_id}/messages", post(dispatch_message))
        .route("/api/sessions/{session_id}/history", get(list_history))
        .route(
            "/api/sessions/{session_id}/history/prepare",
            post(prepare_new_message),
        )
        .route(
            "/api/sessions/{session_id}/history/exit",
            post(exit_history_mode),
        )
        .route(
            "/api/sessions/{session_id}/history/{item_id}/select",
            post(select_history),
        )
        .route("/api/sessions/{session_id}/agent", put(switch_agent))
        .route("/health", get(health_check))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

// ============================================================================
// SESSION HANDLERS
// ============================================================================

pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionSnapshot>)> {
    let handle = state
        .create_session(request.agent_id, request.slot_count)
        .await?;
    let snapshot = handle.snapshot().await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionSnapshot>> {
    let snapshot = state.session(&session_id).await?.snapshot().await?;
    Ok(Json(snapshot))
}

pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode> {
    state.destroy_session(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Server-Sent Events stream of session snapshots.
///
/// GET /api/sessions/{session_id}/events
///
/// The current snapshot is sent first, then one `snapshot` event per change.
pub async fn session_events(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let handle = state.session(&session_id).await?;
    let mut updates = BroadcastStream::new(handle.subscribe());
    let current = handle.snapshot().await?;

    let stream = async_stream::stream! {
        if let Some(event) = snapshot_event(&current) {
            yield Ok(event);
        }
        while let Some(update) = updates.next().await {
            match update {
                Ok(snapshot) => {
                    if let Some(event) = snapshot_event(&snapshot) {
                        yield Ok(event);
                    }
                }
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    log::debug!("SSE subscriber lagged by {} snapshot(s)", skipped);
                }
            }
        }

        yield Ok(Event::default().event("done").data("Session closed"));
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keep-alive"),
    ))
}

fn snapshot_event(snapshot: &SessionSnapshot) -> Option<Event> {
    match serde_json::to_string(snapshot) {
        Ok(json) => Some(Event::default().event("snapshot").data(json)),
        Err(e) => {
            log::error!("Failed to serialize snapshot: {}", e);
            None
        }
    }
}

// ============================================================================
// SLOT HANDLERS
// ============================================================================

pub async fn add_slot(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<(StatusCode, Json<SlotCreated>)> {
    let index = state.session(&session_id).await?.add_slot().await?;
    Ok((StatusCode::CREATED, Json(SlotCreated { index })))
}

pub async fn remove_slot(
    State(state): State<Arc<AppState>>,
    Path((session_id, index)): Path<(String, usize)>,
) -> Result<StatusCode> {
    state
        .session(&session_id)
        .await?
        .remove_slot(Some(index))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove_last_slot(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode> {
    state.session(&session_id).await?.remove_slot(None).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn clone_slot(
    State(state): State<Arc<AppState>>,
    Path((session_id, index)): Path<(String, usize)>,
) -> Result<(StatusCode, Json<SlotCreated>)> {
    let index = state
        .session(&session_id)
        .await?
        .clone_config(index)
        .await?;
    Ok((StatusCode::CREATED, Json(SlotCreated { index })))
}

pub async fn update_slot_config(
    State(state): State<Arc<AppState>>,
    Path((session_id, index)): Path<(String, usize)>,
    Json(config): Json<ChatConfig>,
) -> Result<StatusCode> {
    state
        .session(&session_id)
        .await?
        .update_config(index, config)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn save_slot_config(
    State(state): State<Arc<AppState>>,
    Path((session_id, index)): Path<(String, usize)>,
) -> Result<Json<AgentRecord>> {
    let agent = state
        .session(&session_id)
        .await?
        .save_config(index)
        .await?;
    Ok(Json(agent))
}

// ============================================================================
// DISPATCH & HISTORY HANDLERS
// ============================================================================

pub async fn dispatch_message(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<DispatchRequest>,
) -> Result<Json<DispatchOutcome>> {
    let outcome = state
        .session(&session_id)
        .await?
        .dispatch(request.text)
        .await?;
    Ok(Json(outcome))
}

pub async fn list_history(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<HistoryItem>>> {
    let history = state.session(&session_id).await?.history().await?;
    Ok(Json(history))
}

pub async fn select_history(
    State(state): State<Arc<AppState>>,
    Path((session_id, item_id)): Path<(String, Uuid)>,
) -> Result<Json<Vec<ReplayedSlot>>> {
    let replay = state
        .session(&session_id)
        .await?
        .select_history(item_id)
        .await?;
    Ok(Json(replay))
}

pub async fn prepare_new_message(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode> {
    state
        .session(&session_id)
        .await?
        .prepare_new_message()
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn exit_history_mode(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<StatusCode> {
    state
        .session(&session_id)
        .await?
        .exit_history_mode()
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn switch_agent(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<SwitchAgentRequest>,
) -> Result<StatusCode> {
    state
        .session(&session_id)
        .await?
        .switch_agent(request.agent_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        sessions: state.sessions.len().await,
    })
}
