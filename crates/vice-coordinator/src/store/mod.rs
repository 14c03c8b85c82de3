//! Persistent cluster catalog and deployment-ownership tracking.
//!
//! The registry never mutates in-memory state without writing it here first;
//! the store is the single source of truth and the registry is a cache over
//! it. Two implementations exist: [`postgres::PgClusterStore`] for real
//! deployments and [`memory::MemClusterStore`] for development and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::Snafu;

pub mod memory;
pub mod postgres;

pub use memory::MemClusterStore;
pub use postgres::PgClusterStore;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("cluster name {name:?} is already registered"))]
    NameTaken { name: String },

    #[snafu(display("database operation failed"))]
    Database { source: sqlx::Error },
}

/// One row of `vice_clusters`.
///
/// `client_key_encrypted` holds the sealed client key and must never appear
/// in any external representation of the cluster.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct ClusterRecord {
    pub id: String,
    pub name: String,
    pub deployer_url: String,
    pub enabled: bool,
    pub priority: i32,
    pub mtls_enabled: bool,
    pub ca_cert: Option<String>,
    pub client_cert: Option<String>,
    pub client_key_encrypted: Option<Vec<u8>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A cluster to insert; the store assigns id and timestamps.
#[derive(Clone, Debug, Default)]
pub struct NewCluster {
    pub name: String,
    pub deployer_url: String,
    pub enabled: bool,
    pub priority: i32,
    pub mtls_enabled: bool,
    pub ca_cert: Option<String>,
    pub client_cert: Option<String>,
    pub client_key_encrypted: Option<Vec<u8>>,
}

/// Partial update; `None` leaves a field unchanged.
#[derive(Clone, Debug, Default)]
pub struct ClusterUpdate {
    pub name: Option<String>,
    pub deployer_url: Option<String>,
    pub enabled: Option<bool>,
    pub priority: Option<i32>,
    pub mtls_enabled: Option<bool>,
    pub ca_cert: Option<String>,
    pub client_cert: Option<String>,
    pub client_key_encrypted: Option<Vec<u8>>,
}

impl ClusterUpdate {
    /// Applies the update to a record, bumping `updated_at`.
    pub(crate) fn apply(self, record: &mut ClusterRecord) {
        if let Some(name) = self.name {
            record.name = name;
        }
        if let Some(deployer_url) = self.deployer_url {
            record.deployer_url = deployer_url;
        }
        if let Some(enabled) = self.enabled {
            record.enabled = enabled;
        }
        if let Some(priority) = self.priority {
            record.priority = priority;
        }
        if let Some(mtls_enabled) = self.mtls_enabled {
            record.mtls_enabled = mtls_enabled;
        }
        if let Some(ca_cert) = self.ca_cert {
            record.ca_cert = Some(ca_cert);
        }
        if let Some(client_cert) = self.client_cert {
            record.client_cert = Some(client_cert);
        }
        if let Some(key) = self.client_key_encrypted {
            record.client_key_encrypted = Some(key);
        }
        record.updated_at = Utc::now();
    }
}

/// Storage operations needed by the registry and the coordinator.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn list_clusters(&self) -> Result<Vec<ClusterRecord>>;
    async fn get_cluster(&self, id: &str) -> Result<Option<ClusterRecord>>;
    async fn get_cluster_by_name(&self, name: &str) -> Result<Option<ClusterRecord>>;
    async fn insert_cluster(&self, cluster: NewCluster) -> Result<ClusterRecord>;
    async fn update_cluster(
        &self,
        id: &str,
        update: ClusterUpdate,
    ) -> Result<Option<ClusterRecord>>;
    async fn delete_cluster(&self, id: &str) -> Result<bool>;
    async fn set_cluster_enabled(&self, id: &str, enabled: bool) -> Result<bool>;

    /// The cluster an analysis was dispatched to, if tracked.
    async fn get_ownership(&self, external_id: &str) -> Result<Option<String>>;
    async fn upsert_ownership(&self, external_id: &str, cluster_id: &str) -> Result<()>;
    async fn delete_ownership(&self, external_id: &str) -> Result<()>;
}
