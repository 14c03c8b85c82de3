//! The deployer HTTP API.
//!
//! Thin axum handlers over [`DeploymentEngine`]; every response body is one
//! of the shared envelopes from [`vice_spec::model::responses`].

use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::error;
use vice_spec::model::{
    DeploymentSpec,
    responses::{CreateResponse, DeleteResponse, ErrorBody, LogsResponse, TransferResponse},
};

use crate::engine::{DeploymentEngine, TransferKind, status::LogOptions};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<DeploymentEngine>,
    pub default_namespace: String,
    pub transfer_timeout: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/deployments", post(create_deployment))
        .route("/api/v1/deployments/{id}", delete(delete_deployment))
        .route("/api/v1/deployments/{id}/status", get(deployment_status))
        .route("/api/v1/deployments/{id}/url-ready", get(url_ready))
        .route("/api/v1/deployments/{id}/logs", get(deployment_logs))
        .route("/api/v1/deployments/{id}/transfers", post(trigger_transfer))
        .route("/api/v1/health", get(health))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct NamespaceQuery {
    namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    namespace: Option<String>,
    container: Option<String>,
    since: Option<i64>,
    tail: Option<i64>,
    previous: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct TransferQuery {
    namespace: Option<String>,
    kind: String,
    #[serde(rename = "async", default)]
    async_mode: bool,
}

impl AppState {
    fn namespace(&self, requested: Option<String>) -> String {
        requested
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| self.default_namespace.clone())
    }
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

async fn create_deployment(
    State(state): State<AppState>,
    Json(mut spec): Json<DeploymentSpec>,
) -> Response {
    if spec.metadata.external_id.is_empty() {
        return error_body(StatusCode::BAD_REQUEST, "missing external_id");
    }
    if spec.metadata.namespace.is_empty() {
        spec.metadata.namespace = state.default_namespace.clone();
    }

    match state.engine.apply(&spec).await {
        Ok(resources_created) => (
            StatusCode::CREATED,
            Json(CreateResponse {
                status: "created".to_string(),
                external_id: spec.metadata.external_id,
                resources_created,
                error: None,
            }),
        )
            .into_response(),
        Err(err) => {
            error!(external_id = %spec.metadata.external_id, %err, "create failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(CreateResponse {
                    status: "error".to_string(),
                    external_id: spec.metadata.external_id,
                    resources_created: err.resources_created().to_vec(),
                    error: Some(err.to_string()),
                }),
            )
                .into_response()
        }
    }
}

async fn delete_deployment(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
    Query(query): Query<NamespaceQuery>,
) -> Response {
    let ns = state.namespace(query.namespace);
    let resources_deleted = state.engine.delete(&external_id, &ns).await;

    Json(DeleteResponse {
        status: "deleted".to_string(),
        external_id,
        resources_deleted,
    })
    .into_response()
}

async fn deployment_status(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
    Query(query): Query<NamespaceQuery>,
) -> Response {
    let ns = state.namespace(query.namespace);
    match state.engine.status(&external_id, &ns).await {
        Ok(status) => Json(status).into_response(),
        Err(err) => error_body(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn url_ready(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
    Query(query): Query<NamespaceQuery>,
) -> Response {
    let ns = state.namespace(query.namespace);
    match state.engine.url_ready(&external_id, &ns).await {
        Ok(ready) => Json(ready).into_response(),
        Err(err) => error_body(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn deployment_logs(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Response {
    let ns = state.namespace(query.namespace);
    let opts = LogOptions {
        container: query.container,
        since_seconds: query.since,
        tail_lines: query.tail,
        previous: query.previous.unwrap_or(false),
    };

    match state.engine.logs(&external_id, &ns, &opts).await {
        Ok(logs) => Json(LogsResponse {
            logs: Some(logs),
            error: None,
        })
        .into_response(),
        Err(err) => Json(LogsResponse {
            logs: None,
            error: Some(err.to_string()),
        })
        .into_response(),
    }
}

async fn trigger_transfer(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
    Query(query): Query<TransferQuery>,
) -> Response {
    let Some(kind) = TransferKind::parse(&query.kind) else {
        return error_body(
            StatusCode::BAD_REQUEST,
            format!("unknown transfer kind {:?}", query.kind),
        );
    };
    let ns = state.namespace(query.namespace);

    let transfer = state
        .engine
        .trigger_transfer(&external_id, &ns, kind, query.async_mode);

    let result = if query.async_mode {
        transfer.await
    } else {
        match tokio::time::timeout(state.transfer_timeout, transfer).await {
            Ok(result) => result,
            Err(_) => {
                return Json(TransferResponse {
                    status: "error".to_string(),
                    kind: kind.as_str().to_string(),
                    uuid: None,
                    error: Some("context cancelled".to_string()),
                })
                .into_response();
            }
        }
    };

    match result {
        Ok(response) => Json(response).into_response(),
        Err(err) => error_body(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn health(State(state): State<AppState>) -> Response {
    let health = state.engine.health().await;
    let status = if health.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health)).into_response()
}
