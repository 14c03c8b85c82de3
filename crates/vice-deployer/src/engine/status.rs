//! Status aggregation, URL readiness, log retrieval and the health probe.

use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Namespace, Pod, Service},
    networking::v1::Ingress,
};
use kube::{
    Api, ResourceExt,
    api::{ListParams, LogParams},
};
use snafu::{OptionExt, ResultExt};
use vice_spec::model::responses::{
    ContainerStatusSummary, DeploymentStatus, HealthResponse, PodSummary, UrlReadyResponse,
    WorkloadStatus,
};

use super::{
    DeploymentEngine, FetchLogsSnafu, ListSnafu, NoPodsSnafu, Result,
};

/// Logs are capped so the endpoint stays synchronous and bounded.
pub const MAX_LOG_BYTES: usize = 1024 * 1024;

/// Options accepted by the log endpoint.
#[derive(Clone, Debug, Default)]
pub struct LogOptions {
    pub container: Option<String>,
    pub since_seconds: Option<i64>,
    pub tail_lines: Option<i64>,
    pub previous: bool,
}

impl DeploymentEngine {
    /// Aggregates workload, pod, service and ingress state for one analysis.
    pub async fn status(&self, external_id: &str, ns: &str) -> Result<DeploymentStatus> {
        let selector = Self::selector(external_id);
        let params = ListParams::default().labels(&selector);

        let deployments = Api::<Deployment>::namespaced(self.client.clone(), ns)
            .list(&params)
            .await
            .context(ListSnafu {
                kind: "deployments",
                external_id,
            })?;

        let pods = Api::<Pod>::namespaced(self.client.clone(), ns)
            .list(&params)
            .await
            .context(ListSnafu {
                kind: "pods",
                external_id,
            })?;

        let services = Api::<Service>::namespaced(self.client.clone(), ns)
            .list(&params)
            .await
            .context(ListSnafu {
                kind: "services",
                external_id,
            })?;

        let ingresses = Api::<Ingress>::namespaced(self.client.clone(), ns)
            .list(&params)
            .await
            .context(ListSnafu {
                kind: "ingresses",
                external_id,
            })?;

        let workload_status = deployments.items.first().map(|deployment| {
            let status = deployment.status.clone().unwrap_or_default();
            WorkloadStatus {
                ready_replicas: status.ready_replicas.unwrap_or_default(),
                available_replicas: status.available_replicas.unwrap_or_default(),
                replicas: status.replicas.unwrap_or_default(),
            }
        });

        Ok(DeploymentStatus {
            exists: !deployments.items.is_empty(),
            workload_status,
            pods: pods.items.iter().map(pod_summary).collect(),
            service_exists: !services.items.is_empty(),
            ingress_exists: !ingresses.items.is_empty(),
        })
    }

    /// An analysis URL is ready once the ingress and service exist and one
    /// pod is running with every container ready.
    pub async fn url_ready(&self, external_id: &str, ns: &str) -> Result<UrlReadyResponse> {
        let status = self.status(external_id, ns).await?;
        let pod_ready = any_pod_ready(&status.pods);

        Ok(UrlReadyResponse {
            ready: status.ingress_exists && status.service_exists && pod_ready,
            ingress_exists: status.ingress_exists,
            service_exists: status.service_exists,
            pod_ready,
        })
    }

    /// Fetches logs from the first pod of the analysis, capped at
    /// [`MAX_LOG_BYTES`].
    pub async fn logs(&self, external_id: &str, ns: &str, opts: &LogOptions) -> Result<String> {
        let api = Api::<Pod>::namespaced(self.client.clone(), ns);
        let params = ListParams::default().labels(&Self::selector(external_id));

        let pods = api.list(&params).await.context(ListSnafu {
            kind: "pods",
            external_id,
        })?;
        let pod = pods.items.first().context(NoPodsSnafu { external_id })?;

        let log_params = LogParams {
            container: opts.container.clone(),
            since_seconds: opts.since_seconds,
            tail_lines: opts.tail_lines,
            previous: opts.previous,
            ..LogParams::default()
        };

        let logs = api
            .logs(&pod.name_any(), &log_params)
            .await
            .context(FetchLogsSnafu { external_id })?;
        Ok(truncate_logs(logs))
    }

    /// Probes the cluster API with the cheapest possible call.
    pub async fn health(&self) -> HealthResponse {
        let version = match self.client.apiserver_version().await {
            Ok(info) => info.git_version,
            Err(error) => {
                return HealthResponse {
                    status: "unhealthy".to_string(),
                    version: String::new(),
                    kubernetes: false,
                    message: Some(error.to_string()),
                };
            }
        };

        let reachable = Api::<Namespace>::all(self.client.clone())
            .list(&ListParams::default().limit(1))
            .await;

        match reachable {
            Ok(_) => HealthResponse {
                status: "healthy".to_string(),
                version,
                kubernetes: true,
                message: None,
            },
            Err(error) => HealthResponse {
                status: "unhealthy".to_string(),
                version,
                kubernetes: false,
                message: Some(error.to_string()),
            },
        }
    }
}

fn pod_summary(pod: &Pod) -> PodSummary {
    let status = pod.status.clone().unwrap_or_default();

    PodSummary {
        name: pod.name_any(),
        phase: status.phase.unwrap_or_default(),
        container_statuses: status
            .container_statuses
            .unwrap_or_default()
            .iter()
            .map(|cs| ContainerStatusSummary {
                name: cs.name.clone(),
                ready: cs.ready,
                restart_count: cs.restart_count,
            })
            .collect(),
        message: status.message,
        reason: status.reason,
    }
}

/// True when some pod is `Running` with every container ready.
pub(crate) fn any_pod_ready(pods: &[PodSummary]) -> bool {
    pods.iter().any(|pod| {
        pod.phase == "Running"
            && !pod.container_statuses.is_empty()
            && pod.container_statuses.iter().all(|cs| cs.ready)
    })
}

/// Truncates to [`MAX_LOG_BYTES`] without splitting a UTF-8 sequence.
pub(crate) fn truncate_logs(mut logs: String) -> String {
    if logs.len() <= MAX_LOG_BYTES {
        return logs;
    }

    let mut cut = MAX_LOG_BYTES;
    while cut > 0 && !logs.is_char_boundary(cut) {
        cut -= 1;
    }
    logs.truncate(cut);
    logs
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn pod(phase: &str, readiness: &[bool]) -> PodSummary {
        PodSummary {
            name: "pod-0".to_string(),
            phase: phase.to_string(),
            container_statuses: readiness
                .iter()
                .enumerate()
                .map(|(i, ready)| ContainerStatusSummary {
                    name: format!("c{i}"),
                    ready: *ready,
                    restart_count: 0,
                })
                .collect(),
            message: None,
            reason: None,
        }
    }

    #[rstest]
    #[case(&[], false)]
    #[case(&[pod("Pending", &[false, false])], false)]
    #[case(&[pod("Running", &[true, false])], false)]
    #[case(&[pod("Running", &[])], false)]
    #[case(&[pod("Running", &[true, true, true])], true)]
    #[case(&[pod("Failed", &[true]), pod("Running", &[true])], true)]
    fn pod_readiness(#[case] pods: &[PodSummary], #[case] expected: bool) {
        assert_eq!(any_pod_ready(pods), expected);
    }

    #[test]
    fn short_logs_pass_through() {
        let logs = "a".repeat(100);
        assert_eq!(truncate_logs(logs.clone()), logs);
    }

    #[test]
    fn long_logs_are_capped() {
        let logs = "a".repeat(MAX_LOG_BYTES + 500);
        assert_eq!(truncate_logs(logs).len(), MAX_LOG_BYTES);
    }

    #[test]
    fn truncation_respects_utf8_boundaries() {
        // Fill up to one byte below the cap, then add multi-byte characters
        // straddling it.
        let mut logs = "a".repeat(MAX_LOG_BYTES - 1);
        logs.push_str("äää");

        let truncated = truncate_logs(logs);
        assert!(truncated.len() <= MAX_LOG_BYTES);
        assert!(truncated.is_char_boundary(truncated.len()));
    }
}
