//! Analysis lifecycle handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use vice_spec::analysis::Analysis;

use super::AppState;
use crate::client::LogsRequest;

#[derive(Debug, Deserialize)]
pub(super) struct LaunchQuery {
    /// Force the launch onto this cluster instead of running selection.
    cluster: Option<String>,
}

pub(super) async fn launch(
    State(state): State<AppState>,
    Query(query): Query<LaunchQuery>,
    Json(analysis): Json<Analysis>,
) -> Response {
    let result = match &query.cluster {
        Some(cluster_name) => {
            state
                .coordinator
                .launch_to_cluster(&analysis, cluster_name)
                .await
        }
        None => state.coordinator.launch(&analysis).await,
    };

    match result {
        Ok(response) => Json(response).into_response(),
        Err(err) => err.into_response(),
    }
}

pub(super) async fn exit(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
) -> Response {
    match state.coordinator.exit(&external_id).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => err.into_response(),
    }
}

pub(super) async fn status(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
) -> Response {
    match state.coordinator.status(&external_id).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => err.into_response(),
    }
}

pub(super) async fn url_ready(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
) -> Response {
    match state.coordinator.url_ready(&external_id).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct LogsQuery {
    container: Option<String>,
    since: Option<i64>,
    tail: Option<i64>,
    previous: Option<bool>,
}

pub(super) async fn logs(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Response {
    let request = LogsRequest {
        container: query.container,
        since: query.since,
        tail: query.tail,
        previous: query.previous.unwrap_or(false),
    };

    match state.coordinator.logs(&external_id, &request).await {
        Ok(response) => Json(response).into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct TransferQuery {
    kind: String,
    #[serde(rename = "async", default)]
    async_mode: bool,
}

pub(super) async fn transfer(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
    Query(query): Query<TransferQuery>,
) -> Response {
    match state
        .coordinator
        .trigger_transfer(&external_id, &query.kind, query.async_mode)
        .await
    {
        Ok(response) => Json(response).into_response(),
        Err(err) => err.into_response(),
    }
}

#[derive(Debug, Serialize)]
struct ClusterLocation {
    external_id: String,
    cluster_id: Option<String>,
    cluster_name: Option<String>,
}

pub(super) async fn cluster(
    State(state): State<AppState>,
    Path(external_id): Path<String>,
) -> Response {
    match state.coordinator.deployment_cluster(&external_id).await {
        Ok(cluster) => Json(ClusterLocation {
            external_id,
            cluster_id: cluster.as_ref().map(|c| c.id.clone()),
            cluster_name: cluster.map(|c| c.name),
        })
        .into_response(),
        Err(err) => err.into_response(),
    }
}
