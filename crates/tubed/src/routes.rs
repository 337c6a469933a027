//! API routes for tubed

use crate::server::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use tube_common::wire::{
    BatchRequest, BatchResponse, SaveUserStateRequest, SaveUserStateResponse, StitchResponse,
    UserStateResponse,
};

type AppStateArc = Arc<AppState>;

// ============================================================================
// User State Routes
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStateQuery {
    pub user_id: Option<String>,
}

pub fn user_state_routes() -> Router<AppStateArc> {
    Router::new().route("/user-state", get(get_user_state).post(save_user_state))
}

async fn get_user_state(
    State(state): State<AppStateArc>,
    Query(query): Query<UserStateQuery>,
) -> Result<Json<UserStateResponse>, (StatusCode, Json<UserStateResponse>)> {
    let user_id = match query.user_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(UserStateResponse {
                    success: false,
                    state: None,
                    error: Some("userId is required".to_string()),
                }),
            ))
        }
    };

    let users = state.users.read().await;
    match users.get(&user_id) {
        Some(stored) => Ok(Json(UserStateResponse {
            success: true,
            state: Some(stored.clone()),
            error: None,
        })),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(UserStateResponse {
                success: false,
                state: None,
                error: Some(format!("no state for {}", user_id)),
            }),
        )),
    }
}

/// Keeps whichever copy has the newer `lastUpdated`. An older write is
/// acknowledged but does not replace what is stored.
async fn save_user_state(
    State(state): State<AppStateArc>,
    Json(req): Json<SaveUserStateRequest>,
) -> Result<Json<SaveUserStateResponse>, (StatusCode, Json<SaveUserStateResponse>)> {
    let incoming = req.state;
    if incoming.user_id.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(SaveUserStateResponse {
                success: false,
                error: Some("state.userId is required".to_string()),
            }),
        ));
    }

    let mut users = state.users.write().await;
    let user_id = incoming.user_id.clone();
    let replace = users
        .get(&user_id)
        .map_or(true, |stored| incoming.last_updated > stored.last_updated);

    if replace {
        info!(
            user_id = %user_id,
            anonymous = req.id.is_some(),
            last_updated = incoming.last_updated,
            "Stored user state"
        );
        users.insert(user_id, incoming);
    } else {
        debug!(user_id = %user_id, "Ignored stale user state");
    }

    Ok(Json(SaveUserStateResponse {
        success: true,
        error: None,
    }))
}

// ============================================================================
// Content Routes
// ============================================================================

pub fn content_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/content/stitch/:id", get(get_stitch))
        .route("/content/batch", post(get_batch))
}

async fn get_stitch(
    State(state): State<AppStateArc>,
    Path(id): Path<String>,
) -> Result<Json<StitchResponse>, (StatusCode, Json<StitchResponse>)> {
    match state.catalog.get(&id) {
        Some(stitch) => Ok(Json(StitchResponse {
            success: true,
            stitch: Some(stitch),
            error: None,
        })),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(StitchResponse {
                success: false,
                stitch: None,
                error: Some(format!("unknown stitch {}", id)),
            }),
        )),
    }
}

/// Unknown ids are left out of the response
async fn get_batch(
    State(state): State<AppStateArc>,
    Json(req): Json<BatchRequest>,
) -> Json<BatchResponse> {
    let stitches: Vec<_> = req
        .stitch_ids
        .iter()
        .filter_map(|id| state.catalog.get(id))
        .collect();
    debug!(requested = req.stitch_ids.len(), served = stitches.len(), "Batch served");

    Json(BatchResponse {
        success: true,
        stitches,
    })
}

// ============================================================================
// Health Routes
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub users: usize,
    pub catalog_entries: usize,
}

pub fn health_routes() -> Router<AppStateArc> {
    Router::new().route("/health", get(health_check))
}

async fn health_check(State(state): State<AppStateArc>) -> Json<HealthResponse> {
    let users = state.users.read().await.len();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        users,
        catalog_entries: state.catalog.len(),
    })
}
