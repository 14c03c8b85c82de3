//! Typed HTTP client for the deployer API, keyed by cluster id.
//!
//! Every call looks the cluster and its cached (possibly mTLS) HTTP client
//! up in the registry, so TLS rotation is picked up request-to-request
//! without any client-side bookkeeping.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::{debug, info};
use vice_spec::model::{
    DeploymentSpec,
    responses::{
        CreateResponse, DeleteResponse, DeploymentStatus, ErrorBody, HealthResponse,
        LogsResponse, TransferResponse, UrlReadyResponse,
    },
};

use crate::registry::ClusterRegistry;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("cluster {cluster_id:?} is not in the registry"))]
    UnknownCluster { cluster_id: String },

    #[snafu(display("request to {url} failed"))]
    Request { source: reqwest::Error, url: String },

    #[snafu(display("failed to decode the response from {url}"))]
    Decode { source: reqwest::Error, url: String },

    /// The deployer answered with a non-2xx status; its own error string and
    /// any partially-created resources are preserved.
    #[snafu(display("deployer returned {status}: {message}"))]
    Deployer {
        status: u16,
        message: String,
        resources_created: Vec<String>,
    },
}

/// Log retrieval options forwarded to the deployer.
#[derive(Clone, Debug, Default)]
pub struct LogsRequest {
    pub container: Option<String>,
    pub since: Option<i64>,
    pub tail: Option<i64>,
    pub previous: bool,
}

#[derive(Clone)]
pub struct DeployerClient {
    registry: Arc<ClusterRegistry>,
}

impl DeployerClient {
    pub fn new(registry: Arc<ClusterRegistry>) -> Self {
        Self { registry }
    }

    /// Resolves a cluster to its deployer base URL and cached HTTP client.
    async fn route(&self, cluster_id: &str) -> Result<(String, reqwest::Client)> {
        let cluster = self
            .registry
            .get_cluster(cluster_id)
            .await
            .context(UnknownClusterSnafu { cluster_id })?;
        let http = self
            .registry
            .get_http_client(cluster_id)
            .await
            .context(UnknownClusterSnafu { cluster_id })?;

        Ok((cluster.deployer_url, http))
    }

    fn url(base: &str, path: &str) -> String {
        format!("{}/api/v1{path}", base.trim_end_matches('/'))
    }

    /// Decodes a success body, or maps an error status to [`Error::Deployer`]
    /// with the deployer's own error string.
    async fn decode<T: DeserializeOwned>(response: reqwest::Response, url: &str) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return response.json().await.context(DecodeSnafu { url });
        }

        let message = response
            .json::<ErrorBody>()
            .await
            .map(|body| body.error)
            .unwrap_or_else(|_| format!("status {status}"));

        DeployerSnafu {
            status: status.as_u16(),
            message,
            resources_created: Vec::new(),
        }
        .fail()
    }

    pub async fn create_deployment(
        &self,
        cluster_id: &str,
        spec: &DeploymentSpec,
    ) -> Result<CreateResponse> {
        let (base, http) = self.route(cluster_id).await?;
        let url = Self::url(&base, "/deployments");

        let response = http
            .post(&url)
            .json(spec)
            .send()
            .await
            .context(RequestSnafu { url: &url })?;

        let status = response.status();
        if status.is_success() {
            return response.json().await.context(DecodeSnafu { url });
        }

        // The failure envelope still lists what was created before the
        // error, so the caller can clean up.
        let envelope = response.json::<CreateResponse>().await.unwrap_or_default();
        DeployerSnafu {
            status: status.as_u16(),
            message: envelope
                .error
                .unwrap_or_else(|| format!("status {status}")),
            resources_created: envelope.resources_created,
        }
        .fail()
    }

    pub async fn delete_deployment(
        &self,
        cluster_id: &str,
        external_id: &str,
    ) -> Result<DeleteResponse> {
        let (base, http) = self.route(cluster_id).await?;
        let url = Self::url(&base, &format!("/deployments/{external_id}"));

        let response = http
            .delete(&url)
            .send()
            .await
            .context(RequestSnafu { url: &url })?;
        Self::decode(response, &url).await
    }

    pub async fn get_status(
        &self,
        cluster_id: &str,
        external_id: &str,
    ) -> Result<DeploymentStatus> {
        let (base, http) = self.route(cluster_id).await?;
        let url = Self::url(&base, &format!("/deployments/{external_id}/status"));

        let response = http.get(&url).send().await.context(RequestSnafu { url: &url })?;
        Self::decode(response, &url).await
    }

    pub async fn check_url_ready(
        &self,
        cluster_id: &str,
        external_id: &str,
    ) -> Result<UrlReadyResponse> {
        let (base, http) = self.route(cluster_id).await?;
        let url = Self::url(&base, &format!("/deployments/{external_id}/url-ready"));

        let response = http.get(&url).send().await.context(RequestSnafu { url: &url })?;
        Self::decode(response, &url).await
    }

    pub async fn get_logs(
        &self,
        cluster_id: &str,
        external_id: &str,
        request: &LogsRequest,
    ) -> Result<LogsResponse> {
        let (base, http) = self.route(cluster_id).await?;
        let url = Self::url(&base, &format!("/deployments/{external_id}/logs"));

        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(container) = &request.container {
            query.push(("container", container.clone()));
        }
        if let Some(since) = request.since {
            query.push(("since", since.to_string()));
        }
        if let Some(tail) = request.tail {
            query.push(("tail", tail.to_string()));
        }
        if request.previous {
            query.push(("previous", "true".to_string()));
        }

        let response = http
            .get(&url)
            .query(&query)
            .send()
            .await
            .context(RequestSnafu { url: &url })?;
        Self::decode(response, &url).await
    }

    pub async fn trigger_transfer(
        &self,
        cluster_id: &str,
        external_id: &str,
        kind: &str,
        async_mode: bool,
    ) -> Result<TransferResponse> {
        let (base, http) = self.route(cluster_id).await?;
        let url = Self::url(&base, &format!("/deployments/{external_id}/transfers"));

        let response = http
            .post(&url)
            .query(&[("kind", kind), ("async", if async_mode { "true" } else { "false" })])
            .send()
            .await
            .context(RequestSnafu { url: &url })?;
        Self::decode(response, &url).await
    }

    /// Health of one cluster's deployer. A 503 still carries a decodable
    /// health body, so decode it regardless of status.
    pub async fn check_health(&self, cluster_id: &str) -> Result<HealthResponse> {
        let (base, http) = self.route(cluster_id).await?;
        let url = Self::url(&base, "/health");

        let response = http.get(&url).send().await.context(RequestSnafu { url: &url })?;
        response.json().await.context(DecodeSnafu { url })
    }

    /// Probes the enabled clusters in priority order and returns the id of
    /// the first one that reports the deployment as existing. Clusters that
    /// error are skipped; this is the fallback for when local ownership
    /// tracking is empty or stale.
    pub async fn is_deployed(&self, external_id: &str) -> Option<String> {
        for cluster in self.registry.list_enabled_clusters().await {
            match self.get_status(&cluster.id, external_id).await {
                Ok(status) if status.exists => {
                    info!(external_id, cluster = %cluster.name, "found deployment");
                    return Some(cluster.id);
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(external_id, cluster = %cluster.name, %err, "probe failed, skipping cluster");
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use vice_crypto::{Encryptor, generate_key};
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;
    use crate::{
        registry::ClusterSpec,
        store::MemClusterStore,
    };

    async fn registry_with_cluster(name: &str, url: &str, priority: i32) -> Arc<ClusterRegistry> {
        let registry = Arc::new(ClusterRegistry::new(
            Arc::new(MemClusterStore::new()),
            Arc::new(Encryptor::new(&generate_key()).expect("fixed key size")),
            Duration::from_secs(30),
        ));
        add_cluster(&registry, name, url, priority).await;
        registry
    }

    async fn add_cluster(registry: &Arc<ClusterRegistry>, name: &str, url: &str, priority: i32) {
        registry
            .register_cluster(ClusterSpec {
                name: name.to_string(),
                deployer_url: url.to_string(),
                enabled: true,
                priority,
                ..ClusterSpec::default()
            })
            .await
            .expect("cluster registration");
    }

    #[tokio::test]
    async fn create_decodes_the_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/deployments"))
            .respond_with(ResponseTemplate::new(201).set_body_json(CreateResponse {
                status: "created".to_string(),
                external_id: "inv-1".to_string(),
                resources_created: vec!["deployment:inv-1".to_string()],
                error: None,
            }))
            .mount(&server)
            .await;

        let registry = registry_with_cluster("alpha", &server.uri(), 10).await;
        let cluster_id = registry.get_cluster_by_name("alpha").await.unwrap().id;
        let client = DeployerClient::new(registry);

        let response = client
            .create_deployment(&cluster_id, &DeploymentSpec::default())
            .await
            .unwrap();
        assert_eq!(response.status, "created");
        assert_eq!(response.resources_created, ["deployment:inv-1"]);
    }

    #[tokio::test]
    async fn create_failure_preserves_partial_resources() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/deployments"))
            .respond_with(ResponseTemplate::new(500).set_body_json(CreateResponse {
                status: "error".to_string(),
                external_id: "inv-1".to_string(),
                resources_created: vec!["configmap:excludes-file-inv-1".to_string()],
                error: Some("failed to apply service:vice-inv-1".to_string()),
            }))
            .mount(&server)
            .await;

        let registry = registry_with_cluster("alpha", &server.uri(), 10).await;
        let cluster_id = registry.get_cluster_by_name("alpha").await.unwrap().id;
        let client = DeployerClient::new(registry);

        let err = client
            .create_deployment(&cluster_id, &DeploymentSpec::default())
            .await
            .unwrap_err();
        match err {
            Error::Deployer {
                status,
                message,
                resources_created,
            } => {
                assert_eq!(status, 500);
                assert!(message.contains("service:vice-inv-1"));
                assert_eq!(resources_created, ["configmap:excludes-file-inv-1"]);
            }
            other => unreachable!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn is_deployed_probes_in_priority_order_and_skips_errors() {
        let broken = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/deployments/inv-1/status"))
            .respond_with(ResponseTemplate::new(500).set_body_json(ErrorBody {
                error: "boom".to_string(),
            }))
            .mount(&broken)
            .await;

        let owning = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/deployments/inv-1/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(DeploymentStatus {
                exists: true,
                ..DeploymentStatus::default()
            }))
            .mount(&owning)
            .await;

        // The broken cluster has the better priority and is probed first.
        let registry = registry_with_cluster("broken", &broken.uri(), 1).await;
        add_cluster(&registry, "owning", &owning.uri(), 10).await;
        let owning_id = registry.get_cluster_by_name("owning").await.unwrap().id;
        let client = DeployerClient::new(registry);

        assert_eq!(client.is_deployed("inv-1").await, Some(owning_id));
    }

    #[tokio::test]
    async fn is_deployed_returns_none_when_nowhere() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/deployments/inv-9/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(DeploymentStatus::default()))
            .mount(&server)
            .await;

        let registry = registry_with_cluster("alpha", &server.uri(), 10).await;
        let client = DeployerClient::new(registry);

        assert_eq!(client.is_deployed("inv-9").await, None);
    }

    #[tokio::test]
    async fn unhealthy_health_bodies_still_decode() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/health"))
            .respond_with(ResponseTemplate::new(503).set_body_json(HealthResponse {
                status: "unhealthy".to_string(),
                version: String::new(),
                kubernetes: false,
                message: Some("apiserver unreachable".to_string()),
            }))
            .mount(&server)
            .await;

        let registry = registry_with_cluster("alpha", &server.uri(), 10).await;
        let cluster_id = registry.get_cluster_by_name("alpha").await.unwrap().id;
        let client = DeployerClient::new(registry);

        let health = client.check_health(&cluster_id).await.unwrap();
        assert!(!health.is_healthy());
    }
}
