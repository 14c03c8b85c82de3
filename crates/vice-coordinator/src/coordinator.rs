//! The public orchestration facade.
//!
//! Holds the deployers only through their HTTP contract; nothing here keeps
//! an in-memory handle into a cluster, which keeps local and remote
//! deployers interchangeable.

use std::sync::Arc;

use snafu::{OptionExt, ResultExt, Snafu, ensure};
use tracing::{info, warn};
use vice_spec::{
    SpecBuilder, UserInfo,
    analysis::Analysis,
    model::responses::{
        CreateResponse, DeleteResponse, DeploymentStatus, LogsResponse, TransferResponse,
        UrlReadyResponse,
    },
};

use crate::{
    client::{DeployerClient, LogsRequest},
    registry::ClusterRegistry,
    selector::{self, ClusterSelector},
    store::{ClusterRecord, ClusterStore},
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("cluster selection failed"))]
    Selection { source: selector::Error },

    #[snafu(display("failed to build the deployment spec"))]
    BuildSpec { source: vice_spec::builder::Error },

    #[snafu(display("deployer call failed"))]
    Deployer { source: crate::client::Error },

    #[snafu(display("ownership lookup failed"))]
    Ownership { source: crate::store::Error },

    #[snafu(display("no cluster named {name:?} is registered"))]
    UnknownClusterName { name: String },

    #[snafu(display("cluster {name:?} is disabled"))]
    ClusterDisabled { name: String },

    #[snafu(display("analysis {external_id:?} was not found on any cluster"))]
    NotDeployed { external_id: String },
}

pub struct Coordinator {
    registry: Arc<ClusterRegistry>,
    client: DeployerClient,
    selector: ClusterSelector,
    builder: SpecBuilder<Arc<dyn UserInfo>>,
    store: Arc<dyn ClusterStore>,
}

impl Coordinator {
    pub fn new(
        registry: Arc<ClusterRegistry>,
        client: DeployerClient,
        selector: ClusterSelector,
        builder: SpecBuilder<Arc<dyn UserInfo>>,
        store: Arc<dyn ClusterStore>,
    ) -> Self {
        Self {
            registry,
            client,
            selector,
            builder,
            store,
        }
    }

    /// Launches an analysis on a selected cluster. Re-submitting an analysis
    /// that is already running anywhere is a no-op reported as success.
    pub async fn launch(&self, analysis: &Analysis) -> Result<CreateResponse> {
        let external_id = &analysis.invocation_id;

        if let Some(cluster_id) = self.client.is_deployed(external_id).await {
            info!(external_id, cluster_id, "analysis is already deployed, skipping launch");
            return Ok(CreateResponse {
                status: "exists".to_string(),
                external_id: external_id.clone(),
                resources_created: Vec::new(),
                error: None,
            });
        }

        let cluster = self.selector.select().await.context(SelectionSnafu)?;
        self.dispatch(analysis, &cluster).await
    }

    /// Launches onto a cluster picked by name instead of by strategy.
    pub async fn launch_to_cluster(
        &self,
        analysis: &Analysis,
        cluster_name: &str,
    ) -> Result<CreateResponse> {
        let cluster = self
            .registry
            .get_cluster_by_name(cluster_name)
            .await
            .context(UnknownClusterNameSnafu { name: cluster_name })?;
        ensure!(
            cluster.enabled,
            ClusterDisabledSnafu { name: cluster_name }
        );

        if let Some(cluster_id) = self.client.is_deployed(&analysis.invocation_id).await {
            info!(
                external_id = %analysis.invocation_id,
                cluster_id,
                "analysis is already deployed, skipping launch"
            );
            return Ok(CreateResponse {
                status: "exists".to_string(),
                external_id: analysis.invocation_id.clone(),
                resources_created: Vec::new(),
                error: None,
            });
        }

        self.dispatch(analysis, &cluster).await
    }

    async fn dispatch(
        &self,
        analysis: &Analysis,
        cluster: &ClusterRecord,
    ) -> Result<CreateResponse> {
        let spec = self.builder.build(analysis).await.context(BuildSpecSnafu)?;

        let response = self
            .client
            .create_deployment(&cluster.id, &spec)
            .await
            .context(DeployerSnafu)?;

        // The ownership row is a cache; losing this write costs one
        // cross-cluster probe later, not correctness.
        if let Err(err) = self
            .store
            .upsert_ownership(&spec.metadata.external_id, &cluster.id)
            .await
        {
            warn!(
                external_id = %spec.metadata.external_id,
                cluster = %cluster.name,
                %err,
                "failed to record deployment ownership"
            );
        }

        info!(
            external_id = %spec.metadata.external_id,
            cluster = %cluster.name,
            "launched analysis"
        );
        Ok(response)
    }

    /// Tears an analysis down wherever it runs. An analysis that is not
    /// found anywhere is treated as already gone.
    pub async fn exit(&self, external_id: &str) -> Result<DeleteResponse> {
        match self.selector.select_for_external_id(external_id).await {
            Ok(cluster) => {
                let response = self
                    .client
                    .delete_deployment(&cluster.id, external_id)
                    .await
                    .context(DeployerSnafu)?;
                self.forget_ownership(external_id).await;
                Ok(response)
            }
            Err(selector::Error::NotDeployed { .. }) => {
                info!(external_id, "analysis not found on any cluster, treating exit as done");
                self.forget_ownership(external_id).await;
                Ok(DeleteResponse {
                    status: "deleted".to_string(),
                    external_id: external_id.to_string(),
                    resources_deleted: Vec::new(),
                })
            }
            Err(source) => Err(Error::Selection { source }),
        }
    }

    pub async fn status(&self, external_id: &str) -> Result<DeploymentStatus> {
        match self.deployment_cluster(external_id).await? {
            Some(cluster) => self
                .client
                .get_status(&cluster.id, external_id)
                .await
                .context(DeployerSnafu),
            None => Ok(DeploymentStatus::default()),
        }
    }

    pub async fn url_ready(&self, external_id: &str) -> Result<UrlReadyResponse> {
        match self.deployment_cluster(external_id).await? {
            Some(cluster) => self
                .client
                .check_url_ready(&cluster.id, external_id)
                .await
                .context(DeployerSnafu),
            None => Ok(UrlReadyResponse::default()),
        }
    }

    pub async fn logs(&self, external_id: &str, request: &LogsRequest) -> Result<LogsResponse> {
        match self.deployment_cluster(external_id).await? {
            Some(cluster) => self
                .client
                .get_logs(&cluster.id, external_id, request)
                .await
                .context(DeployerSnafu),
            None => Ok(LogsResponse::default()),
        }
    }

    pub async fn trigger_transfer(
        &self,
        external_id: &str,
        kind: &str,
        async_mode: bool,
    ) -> Result<TransferResponse> {
        let cluster = self
            .deployment_cluster(external_id)
            .await?
            .context(NotDeployedSnafu { external_id })?;

        self.client
            .trigger_transfer(&cluster.id, external_id, kind, async_mode)
            .await
            .context(DeployerSnafu)
    }

    /// The cluster an analysis runs on: the local table first, then the
    /// cross-cluster probe, recording what the probe finds (lazy healing).
    pub async fn deployment_cluster(&self, external_id: &str) -> Result<Option<ClusterRecord>> {
        if let Some(cluster_id) = self
            .store
            .get_ownership(external_id)
            .await
            .context(OwnershipSnafu)?
        {
            if let Some(cluster) = self.registry.get_cluster(&cluster_id).await {
                return Ok(Some(cluster));
            }
            // Stale row pointing at a vanished cluster; fall through to the
            // probe.
        }

        let Some(cluster_id) = self.client.is_deployed(external_id).await else {
            return Ok(None);
        };

        if let Err(err) = self.store.upsert_ownership(external_id, &cluster_id).await {
            warn!(external_id, cluster_id, %err, "failed to heal ownership row");
        }
        Ok(self.registry.get_cluster(&cluster_id).await)
    }
}

#[cfg(test)]
mod tests;
