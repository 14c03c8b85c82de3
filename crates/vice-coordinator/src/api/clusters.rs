//! Cluster-admin handlers.
//!
//! Registrations accept the client key in plaintext; the registry seals it
//! before persistence, and no response ever carries the sealed key back out.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use super::{AppState, error_body, report};
use crate::registry::{ClusterPatch, ClusterSpec, ClusterView};

fn default_enabled() -> bool {
    true
}

fn default_priority() -> i32 {
    100
}

#[derive(Debug, Deserialize)]
pub(super) struct RegisterClusterRequest {
    name: String,
    deployer_url: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default = "default_priority")]
    priority: i32,
    #[serde(default)]
    mtls_enabled: bool,
    ca_cert: Option<String>,
    client_cert: Option<String>,
    client_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct UpdateClusterRequest {
    name: Option<String>,
    deployer_url: Option<String>,
    enabled: Option<bool>,
    priority: Option<i32>,
    mtls_enabled: Option<bool>,
    ca_cert: Option<String>,
    client_cert: Option<String>,
    client_key: Option<String>,
}

pub(super) async fn list(State(state): State<AppState>) -> Response {
    let clusters: Vec<ClusterView> = state
        .registry
        .list_clusters()
        .await
        .iter()
        .map(ClusterView::from)
        .collect();
    Json(clusters).into_response()
}

pub(super) async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterClusterRequest>,
) -> Response {
    let spec = ClusterSpec {
        name: request.name,
        deployer_url: request.deployer_url,
        enabled: request.enabled,
        priority: request.priority,
        mtls_enabled: request.mtls_enabled,
        ca_cert: request.ca_cert,
        client_cert: request.client_cert,
        client_key: request.client_key,
    };

    match state.registry.register_cluster(spec).await {
        Ok(record) => (StatusCode::CREATED, Json(ClusterView::from(&record))).into_response(),
        Err(err) => err.into_response(),
    }
}

pub(super) async fn get_one(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.registry.get_cluster(&id).await {
        Some(record) => Json(ClusterView::from(&record)).into_response(),
        None => error_body(StatusCode::NOT_FOUND, format!("no cluster with id {id:?}")),
    }
}

pub(super) async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateClusterRequest>,
) -> Response {
    let patch = ClusterPatch {
        name: request.name,
        deployer_url: request.deployer_url,
        enabled: request.enabled,
        priority: request.priority,
        mtls_enabled: request.mtls_enabled,
        ca_cert: request.ca_cert,
        client_cert: request.client_cert,
        client_key: request.client_key,
    };

    match state.registry.update_cluster(&id, patch).await {
        Ok(Some(record)) => Json(ClusterView::from(&record)).into_response(),
        Ok(None) => error_body(StatusCode::NOT_FOUND, format!("no cluster with id {id:?}")),
        Err(err) => err.into_response(),
    }
}

pub(super) async fn remove(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.registry.delete_cluster(&id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => error_body(StatusCode::NOT_FOUND, format!("no cluster with id {id:?}")),
        Err(err) => err.into_response(),
    }
}

pub(super) async fn enable(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    set_enabled(state, id, true).await
}

pub(super) async fn disable(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    set_enabled(state, id, false).await
}

async fn set_enabled(state: AppState, id: String, enabled: bool) -> Response {
    match state.registry.set_enabled(&id, enabled).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => error_body(StatusCode::NOT_FOUND, format!("no cluster with id {id:?}")),
        Err(err) => err.into_response(),
    }
}

/// Forces a registry reload and returns the resulting catalog.
pub(super) async fn reload(State(state): State<AppState>) -> Response {
    match state.registry.reload().await {
        Ok(()) => list(State(state)).await,
        Err(err) => error_body(StatusCode::INTERNAL_SERVER_ERROR, report(&err)),
    }
}
