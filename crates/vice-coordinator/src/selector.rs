//! Strategy-driven cluster selection.

use std::sync::Arc;

use snafu::{OptionExt, Snafu, ensure};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{client::DeployerClient, registry::ClusterRegistry, store::ClusterRecord};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("no healthy enabled clusters are available"))]
    NoClusters,

    #[snafu(display("analysis {external_id:?} was not found on any cluster"))]
    NotDeployed { external_id: String },
}

/// How [`ClusterSelector::select`] picks among the healthy candidates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum SelectionStrategy {
    /// First cluster in registry order (priority ascending, name tie-break).
    #[default]
    Priority,
    /// Rotate through the healthy candidates.
    RoundRobin,
    /// Reserved; falls back to [`SelectionStrategy::Priority`] until a load
    /// metric exists.
    LeastLoaded,
}

pub struct ClusterSelector {
    registry: Arc<ClusterRegistry>,
    client: DeployerClient,
    strategy: SelectionStrategy,
    cursor: Mutex<usize>,
}

impl ClusterSelector {
    pub fn new(
        registry: Arc<ClusterRegistry>,
        client: DeployerClient,
        strategy: SelectionStrategy,
    ) -> Self {
        Self {
            registry,
            client,
            strategy,
            cursor: Mutex::new(0),
        }
    }

    /// Picks a target cluster: filter the enabled clusters by deployer
    /// health, then apply the strategy. A deployer that errors counts as
    /// unhealthy for this call only.
    pub async fn select(&self) -> Result<ClusterRecord> {
        let mut healthy = Vec::new();
        for cluster in self.registry.list_enabled_clusters().await {
            match self.client.check_health(&cluster.id).await {
                Ok(health) if health.is_healthy() => healthy.push(cluster),
                Ok(health) => {
                    debug!(cluster = %cluster.name, status = %health.status, "skipping unhealthy cluster");
                }
                Err(err) => {
                    debug!(cluster = %cluster.name, %err, "health check failed, skipping cluster");
                }
            }
        }
        ensure!(!healthy.is_empty(), NoClustersSnafu);

        let picked = match self.strategy {
            SelectionStrategy::Priority => healthy.remove(0),
            SelectionStrategy::RoundRobin => {
                let mut cursor = self.cursor.lock().await;
                let index = *cursor % healthy.len();
                *cursor = cursor.wrapping_add(1);
                healthy.swap_remove(index)
            }
            SelectionStrategy::LeastLoaded => {
                debug!("least-loaded selection is not implemented, falling back to priority");
                healthy.remove(0)
            }
        };

        debug!(cluster = %picked.name, strategy = %self.strategy, "selected cluster");
        Ok(picked)
    }

    /// Finds the cluster that owns an existing deployment. Never applies a
    /// strategy; ownership is a fact, not a choice.
    pub async fn select_for_external_id(&self, external_id: &str) -> Result<ClusterRecord> {
        let cluster_id = self
            .client
            .is_deployed(external_id)
            .await
            .context(NotDeployedSnafu { external_id })?;

        self.registry
            .get_cluster(&cluster_id)
            .await
            .context(NotDeployedSnafu { external_id })
    }
}
