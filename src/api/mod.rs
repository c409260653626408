// REST API endpoints for the orchestrator

use axum::{
    Router,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::OrchestratorError;
use crate::orchestrator::Orchestrator;

pub type AppState = Arc<Orchestrator>;

/// Failure body: `{success: false, kind, error}` with a status derived from
/// the error kind.
pub struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "success": false,
            "kind": self.0.kind(),
            "error": self.0.to_string(),
        }));
        (self.0.http_status(), body).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/services", get(list_services))
        .route("/catalog/reload", post(reload_catalog))
        .route("/services/{name}/status", get(service_status))
        .route("/services/{name}/environment", get(check_environment))
        .route("/services/{name}/provision", post(provision))
        .route("/services/{name}/install", post(install_dependencies))
        .route("/services/{name}/start", post(start_service))
        .route("/services/{name}/stop", post(stop_service))
        .route("/services/{name}/execute", post(execute_service))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn health_check() -> Result<Json<Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

async fn list_services(State(state): State<AppState>) -> Json<Value> {
    let services = state.summaries().await;
    Json(json!({
        "services": services,
        "count": services.len(),
    }))
}

async fn reload_catalog(State(state): State<AppState>) -> ApiResult {
    let count = state.reload_catalog()?;
    Ok(Json(json!({ "success": true, "count": count })))
}

async fn service_status(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    state.get_service(&name)?;
    Ok(Json(json!({
        "service": name,
        "state": state.lifecycle_state(&name).await,
        "instance": state.get_status(&name).await,
    })))
}

async fn check_environment(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    state.get_service(&name)?;
    Ok(Json(json!({
        "service": name,
        "status": state.check_environment(&name).await,
        "record": state.environment_record(&name).await,
    })))
}

async fn provision(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    state.get_service(&name)?;
    let handle = state.provision(&name).await?;
    Ok(Json(json!({
        "success": true,
        "runtime_path": handle.root,
    })))
}

async fn install_dependencies(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    state.get_service(&name)?;
    let installed = state.install_dependencies(&name).await;
    Ok(Json(json!({ "success": installed })))
}

async fn start_service(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> ApiResult {
    let overrides: Map<String, Value> = if body.iter().all(u8::is_ascii_whitespace) {
        Map::new()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            OrchestratorError::Configuration(format!("override body must be a JSON object: {}", e))
        })?
    };

    let report = state.start(&name, &overrides).await?;
    Ok(Json(json!(report)))
}

/// Stops whatever is registered under `name`, even if the service has since
/// left the catalog.
async fn stop_service(State(state): State<AppState>, Path(name): Path<String>) -> ApiResult {
    let stopped = state.stop(&name).await;
    Ok(Json(json!({ "success": stopped })))
}

async fn execute_service(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(params): Json<Value>,
) -> ApiResult {
    let result = state.execute(&name, &params).await?;
    Ok(Json(json!({ "success": true, "result": result })))
}
