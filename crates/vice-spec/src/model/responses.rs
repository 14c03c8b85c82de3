//! JSON response envelopes of the deployer HTTP API.
//!
//! Shared between the deployer server and the coordinator's typed client so
//! the two ends decode exactly what the other encodes.

use serde::{Deserialize, Serialize};

/// Body of a successful or failed `POST /api/v1/deployments`.
///
/// On failure `resources_created` still lists everything that was applied
/// before the first error, so the caller can clean up with a delete.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct CreateResponse {
    pub status: String,
    pub external_id: String,
    #[serde(default)]
    pub resources_created: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of `DELETE /api/v1/deployments/{id}`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct DeleteResponse {
    pub status: String,
    pub external_id: String,
    #[serde(default)]
    pub resources_deleted: Vec<String>,
}

/// Aggregated state of one analysis on one cluster.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct DeploymentStatus {
    /// True iff at least one workload matches the external-id selector.
    pub exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_status: Option<WorkloadStatus>,
    #[serde(default)]
    pub pods: Vec<PodSummary>,
    pub service_exists: bool,
    pub ingress_exists: bool,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct WorkloadStatus {
    pub ready_replicas: i32,
    pub available_replicas: i32,
    pub replicas: i32,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct PodSummary {
    pub name: String,
    pub phase: String,
    #[serde(default)]
    pub container_statuses: Vec<ContainerStatusSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ContainerStatusSummary {
    pub name: String,
    pub ready: bool,
    pub restart_count: i32,
}

/// Body of `GET /api/v1/deployments/{id}/url-ready`.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct UrlReadyResponse {
    pub ready: bool,
    pub ingress_exists: bool,
    pub service_exists: bool,
    pub pod_ready: bool,
}

/// Body of `GET /api/v1/deployments/{id}/logs`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct LogsResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of the file-transfer trigger endpoint.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct TransferResponse {
    pub status: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Body of `GET /api/v1/health`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub kubernetes: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthResponse {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

/// The structured error body every API returns alongside a non-2xx status.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct ErrorBody {
    pub error: String,
}
