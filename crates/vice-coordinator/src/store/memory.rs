//! In-memory store for development setups and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ClusterRecord, ClusterStore, ClusterUpdate, Error, NewCluster, Result};

#[derive(Default)]
struct Tables {
    clusters: HashMap<String, ClusterRecord>,
    ownership: HashMap<String, String>,
}

/// A [`ClusterStore`] living entirely in process memory.
#[derive(Default)]
pub struct MemClusterStore {
    tables: RwLock<Tables>,
}

impl MemClusterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClusterStore for MemClusterStore {
    async fn list_clusters(&self) -> Result<Vec<ClusterRecord>> {
        let tables = self.tables.read().await;
        let mut clusters: Vec<ClusterRecord> = tables.clusters.values().cloned().collect();
        clusters.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(clusters)
    }

    async fn get_cluster(&self, id: &str) -> Result<Option<ClusterRecord>> {
        Ok(self.tables.read().await.clusters.get(id).cloned())
    }

    async fn get_cluster_by_name(&self, name: &str) -> Result<Option<ClusterRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .clusters
            .values()
            .find(|cluster| cluster.name == name)
            .cloned())
    }

    async fn insert_cluster(&self, cluster: NewCluster) -> Result<ClusterRecord> {
        let mut tables = self.tables.write().await;

        if tables.clusters.values().any(|c| c.name == cluster.name) {
            return Err(Error::NameTaken { name: cluster.name });
        }

        let now = Utc::now();
        let record = ClusterRecord {
            id: Uuid::new_v4().to_string(),
            name: cluster.name,
            deployer_url: cluster.deployer_url,
            enabled: cluster.enabled,
            priority: cluster.priority,
            mtls_enabled: cluster.mtls_enabled,
            ca_cert: cluster.ca_cert,
            client_cert: cluster.client_cert,
            client_key_encrypted: cluster.client_key_encrypted,
            created_at: now,
            updated_at: now,
        };
        tables.clusters.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn update_cluster(
        &self,
        id: &str,
        update: ClusterUpdate,
    ) -> Result<Option<ClusterRecord>> {
        let mut tables = self.tables.write().await;

        if let Some(new_name) = &update.name {
            if tables
                .clusters
                .values()
                .any(|c| c.id != id && &c.name == new_name)
            {
                return Err(Error::NameTaken {
                    name: new_name.clone(),
                });
            }
        }

        Ok(tables.clusters.get_mut(id).map(|record| {
            update.apply(record);
            record.clone()
        }))
    }

    async fn delete_cluster(&self, id: &str) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let removed = tables.clusters.remove(id).is_some();
        if removed {
            tables.ownership.retain(|_, cluster_id| cluster_id != id);
        }
        Ok(removed)
    }

    async fn set_cluster_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        let mut tables = self.tables.write().await;
        Ok(match tables.clusters.get_mut(id) {
            Some(record) => {
                record.enabled = enabled;
                record.updated_at = Utc::now();
                true
            }
            None => false,
        })
    }

    async fn get_ownership(&self, external_id: &str) -> Result<Option<String>> {
        Ok(self.tables.read().await.ownership.get(external_id).cloned())
    }

    async fn upsert_ownership(&self, external_id: &str, cluster_id: &str) -> Result<()> {
        self.tables
            .write()
            .await
            .ownership
            .insert(external_id.to_string(), cluster_id.to_string());
        Ok(())
    }

    async fn delete_ownership(&self, external_id: &str) -> Result<()> {
        self.tables.write().await.ownership.remove(external_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(name: &str) -> NewCluster {
        NewCluster {
            name: name.to_string(),
            deployer_url: format!("http://{name}:8080"),
            enabled: true,
            priority: 100,
            ..NewCluster::default()
        }
    }

    #[tokio::test]
    async fn insert_get_delete() {
        let store = MemClusterStore::new();

        let alpha = store.insert_cluster(cluster("alpha")).await.unwrap();
        assert_eq!(
            store.get_cluster(&alpha.id).await.unwrap().unwrap().name,
            "alpha"
        );
        assert_eq!(
            store
                .get_cluster_by_name("alpha")
                .await
                .unwrap()
                .unwrap()
                .id,
            alpha.id
        );

        assert!(store.delete_cluster(&alpha.id).await.unwrap());
        assert!(store.get_cluster(&alpha.id).await.unwrap().is_none());
        assert!(!store.delete_cluster(&alpha.id).await.unwrap());
    }

    #[tokio::test]
    async fn names_are_unique() {
        let store = MemClusterStore::new();
        store.insert_cluster(cluster("alpha")).await.unwrap();

        let err = store.insert_cluster(cluster("alpha")).await.unwrap_err();
        assert!(matches!(err, Error::NameTaken { name } if name == "alpha"));
    }

    #[tokio::test]
    async fn partial_update_leaves_other_fields() {
        let store = MemClusterStore::new();
        let alpha = store.insert_cluster(cluster("alpha")).await.unwrap();

        let updated = store
            .update_cluster(&alpha.id, ClusterUpdate {
                priority: Some(5),
                ..ClusterUpdate::default()
            })
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.priority, 5);
        assert_eq!(updated.deployer_url, "http://alpha:8080");
        assert!(updated.updated_at >= alpha.updated_at);
    }

    #[tokio::test]
    async fn ownership_roundtrip() {
        let store = MemClusterStore::new();
        let alpha = store.insert_cluster(cluster("alpha")).await.unwrap();

        store.upsert_ownership("inv-1", &alpha.id).await.unwrap();
        assert_eq!(
            store.get_ownership("inv-1").await.unwrap(),
            Some(alpha.id.clone())
        );

        store.delete_ownership("inv-1").await.unwrap();
        assert_eq!(store.get_ownership("inv-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn deleting_a_cluster_drops_its_ownership_rows() {
        let store = MemClusterStore::new();
        let alpha = store.insert_cluster(cluster("alpha")).await.unwrap();
        store.upsert_ownership("inv-1", &alpha.id).await.unwrap();

        store.delete_cluster(&alpha.id).await.unwrap();
        assert_eq!(store.get_ownership("inv-1").await.unwrap(), None);
    }
}
