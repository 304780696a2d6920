//! Transport layer for the live-preview edit service.
//!
//! Provides:
//! - Client message parsing and reply envelopes
//! - `ConnectionHub` - Per-session delivery of envelopes
//! - WebSocket channel at `/ws/{session_id}` and the HTTP routes

pub mod http;
pub mod hub;
pub mod protocol;
pub mod websocket;

use std::sync::Arc;

use axum::{
    Router,
    routing::{delete, get, post},
};
use forge_core::ProjectStore;
use forge_session::{EditCoordinator, SessionRegistry};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use hub::{ConnectionHub, ConnectionId};
pub use protocol::{ClientMessage, ProtocolError};

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub coordinator: EditCoordinator,
    pub projects: Arc<dyn ProjectStore>,
    pub hub: Arc<ConnectionHub>,
}

impl AppState {
    #[must_use]
    pub fn new(coordinator: EditCoordinator, projects: Arc<dyn ProjectStore>) -> Self {
        Self {
            registry: coordinator.registry().clone(),
            coordinator,
            projects,
            hub: Arc::new(ConnectionHub::new()),
        }
    }
}

/// Build the service router.
///
/// # Example
/// ```ignore
/// let app = create_router(AppState::new(coordinator, projects));
/// axum::serve(listener, app).await?;
/// ```
#[must_use]
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(http::health))
        .route("/ws/{session_id}", get(websocket::ws_handler))
        .route("/sessions/{session_id}", delete(http::delete_session))
        .route("/sessions/{session_id}/status", get(http::session_status))
        .route("/sessions/{session_id}/projects", post(http::save_project))
        .route(
            "/sessions/{session_id}/projects/{project_id}/restore",
            post(http::restore_project),
        )
        .route("/projects", get(http::list_projects))
        .route("/projects/{project_id}", delete(http::delete_project))
        .route("/projects/{project_id}/export", get(http::export_project))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
