//! The coordinator's public HTTP surface: analysis lifecycle plus the
//! cluster-admin API.

use std::sync::Arc;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use tower_http::trace::TraceLayer;
use vice_spec::model::responses::ErrorBody;

use crate::{coordinator::Coordinator, registry::ClusterRegistry};

mod analyses;
mod clusters;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub registry: Arc<ClusterRegistry>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/analyses/launch", post(analyses::launch))
        .route("/api/v1/analyses/{id}/exit", post(analyses::exit))
        .route("/api/v1/analyses/{id}/status", get(analyses::status))
        .route("/api/v1/analyses/{id}/url-ready", get(analyses::url_ready))
        .route("/api/v1/analyses/{id}/logs", get(analyses::logs))
        .route("/api/v1/analyses/{id}/transfers", post(analyses::transfer))
        .route("/api/v1/analyses/{id}/cluster", get(analyses::cluster))
        .route(
            "/api/v1/clusters",
            get(clusters::list).post(clusters::register),
        )
        .route(
            "/api/v1/clusters/{id}",
            get(clusters::get_one)
                .put(clusters::update)
                .delete(clusters::remove),
        )
        .route("/api/v1/clusters/{id}/enable", post(clusters::enable))
        .route("/api/v1/clusters/{id}/disable", post(clusters::disable))
        .route("/api/v1/clusters/reload", post(clusters::reload))
        .route("/health", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub(crate) fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

impl IntoResponse for crate::coordinator::Error {
    fn into_response(self) -> Response {
        use crate::coordinator::Error;

        let status = match &self {
            Error::UnknownClusterName { .. } | Error::NotDeployed { .. } => StatusCode::NOT_FOUND,
            Error::ClusterDisabled { .. } | Error::BuildSpec { .. } => StatusCode::BAD_REQUEST,
            Error::Selection { source } => match source {
                crate::selector::Error::NoClusters => StatusCode::SERVICE_UNAVAILABLE,
                crate::selector::Error::NotDeployed { .. } => StatusCode::NOT_FOUND,
            },
            Error::Deployer { .. } => StatusCode::BAD_GATEWAY,
            Error::Ownership { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        error_body(status, report(&self))
    }
}

impl IntoResponse for crate::registry::Error {
    fn into_response(self) -> Response {
        use crate::registry::Error;

        let status = match &self {
            Error::MtlsRequiresCerts => StatusCode::BAD_REQUEST,
            Error::Store { source } => match source {
                crate::store::Error::NameTaken { .. } => StatusCode::CONFLICT,
                crate::store::Error::Database { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::EncryptKey { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };

        error_body(status, report(&self))
    }
}

/// Renders an error with its source chain, so a deployer's own message is
/// not lost behind "deployer call failed".
pub(crate) fn report(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
