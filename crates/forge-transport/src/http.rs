//! HTTP routes: health, session status and teardown, project storage.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use forge_core::{ExportFormat, FileMap, ProjectStoreError};
use forge_sandbox::SandboxError;
use forge_session::{CoordinatorError, RegistryError};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::AppState;

const MANIFEST_FILE: &str = "package.json";

/// Error returned by HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error(transparent)]
    Projects(#[from] ProjectStoreError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("Invalid request: {0}")]
    BadRequest(String),
}

impl ApiError {
    const fn status(&self) -> StatusCode {
        match self {
            Self::SessionNotFound(_)
            | Self::Registry(RegistryError::NotFound(_))
            | Self::Projects(ProjectStoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Registry(RegistryError::NotBound(_))
            | Self::Coordinator(CoordinatorError::Registry(RegistryError::NotBound(_))) => {
                StatusCode::CONFLICT
            }
            Self::BadRequest(_)
            | Self::Projects(
                ProjectStoreError::InvalidPath(_) | ProjectStoreError::UnsupportedFormat(_),
            ) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy", "timestamp": Utc::now().to_rfc3339() }))
}

pub async fn session_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let status = state
        .registry
        .status(&session_id)
        .await
        .ok_or_else(|| ApiError::SessionNotFound(session_id.clone()))?;
    let mut body = json!(status);
    body["connected"] = state.hub.is_connected(&session_id).into();
    Ok(Json(body))
}

#[derive(Debug, Default, Deserialize)]
pub struct TeardownQuery {
    #[serde(default)]
    pub teardown: bool,
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<TeardownQuery>,
) -> Result<Json<Value>, ApiError> {
    let binding = state.registry.forget(&session_id).await?;
    state.hub.remove(&session_id);
    let sandbox_removed = match (query.teardown, binding) {
        (true, Some(binding)) => {
            state
                .registry
                .orchestrator()
                .cleanup(&binding.sandbox_id)
                .await?
        }
        _ => false,
    };
    if query.teardown {
        if let Err(e) = state.registry.store().delete_session(&session_id).await {
            warn!(%session_id, error = %e, "Failed to delete persisted session");
        }
    }
    info!(%session_id, sandbox_removed, "Session removed");
    Ok(Json(json!({ "session_id": session_id, "sandbox_removed": sandbox_removed })))
}

/// Project-relative form of a sandbox path.
fn project_path(working_dir: &str, path: &str) -> String {
    let base = working_dir.trim_end_matches('/');
    path.strip_prefix(base)
        .filter(|rest| rest.starts_with('/'))
        .unwrap_or(path)
        .trim_start_matches('/')
        .to_string()
}

pub async fn save_project(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let metadata = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };

    let snapshot = state.coordinator.load_code(&session_id).await?;
    let working_dir = &state.registry.orchestrator().config().working_dir;
    let mut files: FileMap = snapshot
        .files
        .iter()
        .map(|(path, content)| (project_path(working_dir, path), content.clone()))
        .collect();
    files.insert(MANIFEST_FILE.to_string(), snapshot.manifest);

    let project_id = state.projects.save(&session_id, &files, metadata).await?;
    Ok(Json(json!({ "project_id": project_id })))
}

pub async fn restore_project(
    State(state): State<AppState>,
    Path((session_id, project_id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let project = state.projects.load(&project_id).await?;
    state
        .coordinator
        .edit_code(&session_id, &project.files)
        .await?;
    info!(%session_id, %project_id, files = project.files.len(), "Restored project");
    Ok(Json(json!({ "restored": project.files.len() })))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

const fn default_limit() -> usize {
    100
}

pub async fn list_projects(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let projects = state.projects.list(query.limit).await?;
    Ok(Json(json!({ "projects": projects })))
}

pub async fn delete_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.projects.delete(&project_id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ProjectStoreError::NotFound(project_id).into())
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ExportQuery {
    pub format: Option<String>,
}

pub async fn export_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
    let format = match query.format.as_deref() {
        Some(format) => format.parse()?,
        None => ExportFormat::default(),
    };
    let archive = state.projects.export(&project_id, format).await?;
    let disposition = format!(
        "attachment; filename=\"{project_id}.{}\"",
        format.extension()
    );
    Ok((
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        archive,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use axum::{
        Router,
        body::{Body, to_bytes},
        http::{Method, Request},
    };
    use forge_core::{EditPartial, SessionStore};
    use forge_llm::{Script, ScriptedEditModel};
    use tower::ServiceExt;

    use super::*;
    use crate::{create_router, tests::state_with_model};

    async fn call(app: &Router, method: Method, uri: &str) -> (StatusCode, Bytes) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        (status, to_bytes(response.into_body(), usize::MAX).await.unwrap())
    }

    fn json_body(bytes: &Bytes) -> Value {
        serde_json::from_slice(bytes).unwrap()
    }

    #[test]
    fn test_project_path() {
        assert_eq!(project_path("/app", "/app/src/App.tsx"), "src/App.tsx");
        assert_eq!(project_path("/app/", "/app/package.json"), "package.json");
        assert_eq!(project_path("/app", "/application/x.ts"), "application/x.ts");
        assert_eq!(project_path("/app", "App.tsx"), "App.tsx");
    }

    #[tokio::test]
    async fn test_health() {
        let app = create_router(state_with_model(ScriptedEditModel::default()));
        let (status, body) = call(&app, Method::GET, "/health").await;
        assert_eq!(status, StatusCode::OK);
        let body = json_body(&body);
        assert_eq!(body["status"], "healthy");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_status_and_teardown() {
        let state = state_with_model(ScriptedEditModel::default());
        let app = create_router(state.clone());

        let (status, _) = call(&app, Method::GET, "/sessions/s1/status").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let binding = state.registry.init("s1").await.unwrap().binding;
        let (status, body) = call(&app, Method::GET, "/sessions/s1/status").await;
        assert_eq!(status, StatusCode::OK);
        let body = json_body(&body);
        assert_eq!(body["has_sandbox"], true);
        assert_eq!(body["connected"], false);
        assert_eq!(body["sandbox"]["sandbox_id"], binding.sandbox_id.as_str());

        let (status, body) =
            call(&app, Method::DELETE, "/sessions/s1?teardown=true").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body)["sandbox_removed"], true);
        assert!(state.registry.orchestrator().record(&binding.sandbox_id).is_none());
        assert!(state.registry.store().get_record("s1").await.unwrap().is_none());

        let (status, _) = call(&app, Method::DELETE, "/sessions/s1").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_project_save_restore_export() {
        let state = state_with_model(ScriptedEditModel::new([Script::partials([
            EditPartial::complete("Added a header")
                .with_file("/app/src/App.tsx", "<header/><empty/>"),
        ])]));
        let app = create_router(state.clone());

        let (status, _) = call(&app, Method::POST, "/sessions/s1/projects").await;
        assert_eq!(status, StatusCode::CONFLICT);

        state.registry.init("s1").await.unwrap();
        let collected: Vec<_> = futures::StreamExt::collect(
            state.coordinator.submit_feedback("s1", "add a header"),
        )
        .await;
        assert_eq!(collected.last().unwrap().kind, forge_core::MessageType::UpdateCompleted);

        let (status, body) = call(&app, Method::POST, "/sessions/s1/projects").await;
        assert_eq!(status, StatusCode::OK);
        let project_id = json_body(&body)["project_id"].as_str().unwrap().to_string();

        let (status, body) = call(&app, Method::GET, "/projects?limit=5").await;
        assert_eq!(status, StatusCode::OK);
        let listed = json_body(&body);
        assert_eq!(listed["projects"][0]["project_id"], project_id.as_str());
        assert_eq!(listed["projects"][0]["file_count"], 2);

        state.registry.init("s2").await.unwrap();
        let (status, body) = call(
            &app,
            Method::POST,
            &format!("/sessions/s2/projects/{project_id}/restore"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json_body(&body)["restored"], 2);
        let restored = state.coordinator.load_code("s2").await.unwrap();
        assert_eq!(restored.files["/app/src/App.tsx"], "<header/><empty/>");

        let (status, body) = call(
            &app,
            Method::GET,
            &format!("/projects/{project_id}/export?format=tar"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(!body.is_empty());

        let (status, _) = call(
            &app,
            Method::GET,
            &format!("/projects/{project_id}/export?format=zip"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let uri = format!("/projects/{project_id}");
        assert_eq!(call(&app, Method::DELETE, &uri).await.0, StatusCode::NO_CONTENT);
        assert_eq!(call(&app, Method::DELETE, &uri).await.0, StatusCode::NOT_FOUND);
    }
}
