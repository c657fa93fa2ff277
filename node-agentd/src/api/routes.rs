use std::collections::HashMap;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use localstate::{CheckState, LocalState, ServiceState, StateError};
use shared::protocol::{API_PREFIX, HEALTH_CRITICAL, HEALTH_MAINT, HEALTH_PASSING, HEALTH_WARNING};
use shared::types::{HealthCheck, NodeService};

#[derive(Clone)]
pub struct AppState {
    pub local: LocalState,
}

#[derive(Serialize)]
pub struct SelfResponse {
    pub node_name: String,
    pub node_id: String,
    pub datacenter: String,
    pub stats: HashMap<String, String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Deserialize)]
pub struct TokenQuery {
    #[serde(default)]
    pub token: String,
}

#[derive(Deserialize)]
pub struct CheckUpdate {
    pub status: String,
    #[serde(default)]
    pub output: String,
}

pub fn router(state: AppState) -> Router {
    let agent = Router::new()
        .route("/self", get(get_self))
        .route("/services", get(get_services))
        .route("/checks", get(get_checks))
        .route("/service/register", put(register_service))
        .route("/service/deregister/:id", put(deregister_service))
        .route("/check/register", put(register_check))
        .route("/check/deregister/:id", put(deregister_check))
        .route("/check/update/:id", put(update_check))
        .route("/sync", put(sync_now));

    Router::new().nest(API_PREFIX, agent).with_state(state)
}

async fn get_self(State(state): State<AppState>) -> Json<SelfResponse> {
    let config = state.local.config();
    Json(SelfResponse {
        node_name: config.node_name.clone(),
        node_id: config.node_id.clone(),
        datacenter: config.datacenter.clone(),
        stats: state.local.stats(),
        metadata: state.local.metadata(),
    })
}

async fn get_services(State(state): State<AppState>) -> Json<HashMap<String, ServiceState>> {
    Json(state.local.services())
}

async fn get_checks(State(state): State<AppState>) -> Json<HashMap<String, CheckState>> {
    Json(state.local.checks())
}

async fn register_service(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    Json(service): Json<NodeService>,
) -> StatusCode {
    if service.service.is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    tracing::debug!("Registering service '{}'", service.service);
    state.local.add_service(service, &query.token);
    StatusCode::OK
}

async fn deregister_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> StatusCode {
    match state.local.remove_service(&id) {
        Ok(()) => StatusCode::OK,
        Err(StateError::ServiceNotFound(_)) => StatusCode::NOT_FOUND,
        Err(e) => {
            tracing::error!("Failed to deregister service: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn register_check(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    Json(mut check): Json<HealthCheck>,
) -> StatusCode {
    if check.check_id.is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    // unproven checks start out critical
    if check.status.is_empty() {
        check.status = HEALTH_CRITICAL.to_string();
    }
    match state.local.add_check(check, &query.token) {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            tracing::warn!("Rejected check registration: {}", e);
            StatusCode::BAD_REQUEST
        }
    }
}

async fn deregister_check(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> StatusCode {
    if state.local.check(&id).is_none() {
        return StatusCode::NOT_FOUND;
    }
    state.local.remove_check(&id);
    StatusCode::OK
}

async fn update_check(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<CheckUpdate>,
) -> StatusCode {
    if ![HEALTH_PASSING, HEALTH_WARNING, HEALTH_CRITICAL, HEALTH_MAINT].contains(&update.status.as_str()) {
        return StatusCode::BAD_REQUEST;
    }
    if state.local.check(&id).is_none() {
        return StatusCode::NOT_FOUND;
    }
    state.local.update_check(&id, &update.status, &update.output);
    StatusCode::OK
}

async fn sync_now(State(state): State<AppState>) -> StatusCode {
    let local = state.local.clone();
    match tokio::task::spawn_blocking(move || local.sync_changes()).await {
        Ok(Ok(())) => StatusCode::OK,
        Ok(Err(e)) => {
            tracing::error!("Failed to sync changes: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
        Err(e) => {
            tracing::error!("Sync task failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
