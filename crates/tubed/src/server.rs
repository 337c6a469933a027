//! HTTP server for tubed

use crate::catalog::Catalog;
use crate::routes;
use anyhow::Result;
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tube_common::LearningState;

pub const DEFAULT_BIND: &str = "127.0.0.1:7870";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Application state shared across handlers
pub struct AppState {
    /// Latest accepted state per user id
    pub users: RwLock<HashMap<String, LearningState>>,
    pub catalog: Catalog,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            catalog,
            start_time: Instant::now(),
        }
    }
}

/// Router with every endpoint mounted
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(routes::user_state_routes())
        .merge(routes::content_routes())
        .merge(routes::health_routes())
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serve on an already bound listener until the process stops
pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    let app = build_router(Arc::new(state));
    axum::serve(listener, app).await?;
    Ok(())
}

/// Bind and run the HTTP server
pub async fn run(addr: SocketAddr, state: AppState) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("  Listening on http://{}", listener.local_addr()?);
    serve(listener, state).await
}
