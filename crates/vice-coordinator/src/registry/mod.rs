//! The dynamic cluster registry.
//!
//! Authoritative in-memory view of the cluster catalog plus the derived
//! per-cluster HTTP client cache. State changes flow one way: writes go to
//! the persistent store first, then a reload republishes the in-memory view,
//! so readers can never observe a cluster the store does not have.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use snafu::{ResultExt, Snafu, ensure};
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, error, info, warn};
use vice_crypto::Encryptor;

use crate::store::{ClusterRecord, ClusterStore, ClusterUpdate, NewCluster};

pub mod client;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("cluster store operation failed"))]
    Store { source: crate::store::Error },

    #[snafu(display("mTLS requires ca_cert, client_cert and client_key to all be set"))]
    MtlsRequiresCerts,

    #[snafu(display("failed to encrypt the cluster client key"))]
    EncryptKey { source: vice_crypto::Error },
}

/// External representation of a cluster. Carries the public certificate
/// material but never the (encrypted) client key.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClusterView {
    pub id: String,
    pub name: String,
    pub deployer_url: String,
    pub enabled: bool,
    pub priority: i32,
    pub mtls_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_cert: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&ClusterRecord> for ClusterView {
    fn from(record: &ClusterRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            deployer_url: record.deployer_url.clone(),
            enabled: record.enabled,
            priority: record.priority,
            mtls_enabled: record.mtls_enabled,
            ca_cert: record.ca_cert.clone(),
            client_cert: record.client_cert.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// A cluster registration as accepted by the admin API; the client key
/// arrives in plaintext and is sealed before it touches the store.
#[derive(Clone, Debug, Default)]
pub struct ClusterSpec {
    pub name: String,
    pub deployer_url: String,
    pub enabled: bool,
    pub priority: i32,
    pub mtls_enabled: bool,
    pub ca_cert: Option<String>,
    pub client_cert: Option<String>,
    pub client_key: Option<String>,
}

/// Partial cluster update; `None` leaves a field unchanged.
#[derive(Clone, Debug, Default)]
pub struct ClusterPatch {
    pub name: Option<String>,
    pub deployer_url: Option<String>,
    pub enabled: Option<bool>,
    pub priority: Option<i32>,
    pub mtls_enabled: Option<bool>,
    pub ca_cert: Option<String>,
    pub client_cert: Option<String>,
    pub client_key: Option<String>,
}

#[derive(Default)]
struct Inner {
    clusters: HashMap<String, ClusterRecord>,
    clients: HashMap<String, reqwest::Client>,
}

pub struct ClusterRegistry {
    store: Arc<dyn ClusterStore>,
    encryptor: Arc<Encryptor>,
    reload_interval: Duration,
    inner: RwLock<Inner>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl ClusterRegistry {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        encryptor: Arc<Encryptor>,
        reload_interval: Duration,
    ) -> Self {
        Self {
            store,
            encryptor,
            reload_interval,
            inner: RwLock::new(Inner::default()),
            stop_tx: Mutex::new(None),
        }
    }

    /// Loads the catalog once, then keeps reloading it on the configured
    /// interval until [`ClusterRegistry::stop`] is called.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.reload().await?;

        let (tx, mut rx) = watch::channel(false);
        *self.stop_tx.lock().await = Some(tx);

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(registry.reload_interval);
            // The first tick fires immediately and the catalog was just
            // loaded; swallow it.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = registry.reload().await {
                            warn!(%err, "periodic registry reload failed, keeping previous state");
                        }
                    }
                    _ = rx.changed() => {
                        debug!("registry reloader stopping");
                        break;
                    }
                }
            }
        });

        info!(interval = ?self.reload_interval, "cluster registry started");
        Ok(())
    }

    /// Halts the background reloader.
    pub async fn stop(&self) {
        if let Some(tx) = self.stop_tx.lock().await.take() {
            let _ = tx.send(true);
        }
    }

    /// Reads the catalog through from the store and republishes the
    /// in-memory view. HTTP clients are rebuilt only for clusters whose
    /// connection config actually changed; clusters whose TLS material is
    /// unusable are dropped for this cycle without affecting the rest.
    pub async fn reload(&self) -> Result<()> {
        let records = self.store.list_clusters().await.context(StoreSnafu)?;

        // Snapshot the current view so client construction happens outside
        // any lock.
        let (previous_clusters, previous_clients) = {
            let inner = self.inner.read().await;
            (inner.clusters.clone(), inner.clients.clone())
        };

        let mut clusters = HashMap::with_capacity(records.len());
        let mut clients = HashMap::with_capacity(records.len());

        for record in records {
            let reusable = previous_clusters
                .get(&record.id)
                .is_some_and(|previous| configs_equal(previous, &record))
                .then(|| previous_clients.get(&record.id).cloned())
                .flatten();

            let http_client = match reusable {
                Some(client) => client,
                None => match client::build_client(&record, &self.encryptor) {
                    Ok(client) => {
                        debug!(cluster = %record.name, "built HTTP client");
                        client
                    }
                    Err(err) => {
                        error!(cluster = %record.name, %err, "rejecting cluster for this reload cycle");
                        continue;
                    }
                },
            };

            clients.insert(record.id.clone(), http_client);
            clusters.insert(record.id.clone(), record);
        }

        let mut inner = self.inner.write().await;
        inner.clusters = clusters;
        inner.clients = clients;
        Ok(())
    }

    pub async fn get_cluster(&self, id: &str) -> Option<ClusterRecord> {
        self.inner.read().await.clusters.get(id).cloned()
    }

    pub async fn get_cluster_by_name(&self, name: &str) -> Option<ClusterRecord> {
        self.inner
            .read()
            .await
            .clusters
            .values()
            .find(|cluster| cluster.name == name)
            .cloned()
    }

    pub async fn get_http_client(&self, id: &str) -> Option<reqwest::Client> {
        self.inner.read().await.clients.get(id).cloned()
    }

    pub async fn list_clusters(&self) -> Vec<ClusterRecord> {
        let mut clusters: Vec<ClusterRecord> =
            self.inner.read().await.clusters.values().cloned().collect();
        clusters.sort_by(|a, b| a.name.cmp(&b.name));
        clusters
    }

    /// Enabled clusters in selection order: priority ascending, name as the
    /// tie break.
    pub async fn list_enabled_clusters(&self) -> Vec<ClusterRecord> {
        let mut clusters: Vec<ClusterRecord> = self
            .inner
            .read()
            .await
            .clusters
            .values()
            .filter(|cluster| cluster.enabled)
            .cloned()
            .collect();
        clusters.sort_by(|a, b| (a.priority, &a.name).cmp(&(b.priority, &b.name)));
        clusters
    }

    /// Registers a cluster: validate, seal the client key, persist, reload.
    pub async fn register_cluster(&self, spec: ClusterSpec) -> Result<ClusterRecord> {
        ensure!(
            !spec.mtls_enabled
                || (spec.ca_cert.is_some()
                    && spec.client_cert.is_some()
                    && spec.client_key.is_some()),
            MtlsRequiresCertsSnafu
        );

        let client_key_encrypted = self.seal_key(spec.client_key.as_deref())?;

        let record = self
            .store
            .insert_cluster(NewCluster {
                name: spec.name,
                deployer_url: spec.deployer_url,
                enabled: spec.enabled,
                priority: spec.priority,
                mtls_enabled: spec.mtls_enabled,
                ca_cert: spec.ca_cert,
                client_cert: spec.client_cert,
                client_key_encrypted,
            })
            .await
            .context(StoreSnafu)?;

        self.reload().await?;
        Ok(record)
    }

    /// Applies a partial update and reloads. The merged state must still
    /// satisfy the mTLS material invariant.
    pub async fn update_cluster(
        &self,
        id: &str,
        patch: ClusterPatch,
    ) -> Result<Option<ClusterRecord>> {
        let Some(existing) = self.store.get_cluster(id).await.context(StoreSnafu)? else {
            return Ok(None);
        };

        let mtls_enabled = patch.mtls_enabled.unwrap_or(existing.mtls_enabled);
        let ca_cert = patch.ca_cert.clone().or(existing.ca_cert);
        let client_cert = patch.client_cert.clone().or(existing.client_cert);
        let has_key =
            patch.client_key.is_some() || existing.client_key_encrypted.is_some();
        ensure!(
            !mtls_enabled || (ca_cert.is_some() && client_cert.is_some() && has_key),
            MtlsRequiresCertsSnafu
        );

        let client_key_encrypted = self.seal_key(patch.client_key.as_deref())?;

        let updated = self
            .store
            .update_cluster(id, ClusterUpdate {
                name: patch.name,
                deployer_url: patch.deployer_url,
                enabled: patch.enabled,
                priority: patch.priority,
                mtls_enabled: patch.mtls_enabled,
                ca_cert: patch.ca_cert,
                client_cert: patch.client_cert,
                client_key_encrypted,
            })
            .await
            .context(StoreSnafu)?;

        self.reload().await?;
        Ok(updated)
    }

    pub async fn delete_cluster(&self, id: &str) -> Result<bool> {
        let deleted = self.store.delete_cluster(id).await.context(StoreSnafu)?;
        if deleted {
            self.reload().await?;
        }
        Ok(deleted)
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        let changed = self
            .store
            .set_cluster_enabled(id, enabled)
            .await
            .context(StoreSnafu)?;
        if changed {
            self.reload().await?;
        }
        Ok(changed)
    }

    fn seal_key(&self, client_key: Option<&str>) -> Result<Option<Vec<u8>>> {
        client_key
            .map(|key| self.encryptor.encrypt(key.as_bytes()))
            .transpose()
            .context(EncryptKeySnafu)
    }
}

/// Connection-relevant equality between two catalog entries.
///
/// The encrypted key is compared by presence only: sealing is randomized, so
/// its ciphertext differs even when the underlying key does not, and the key
/// is never rotated without also replacing the client certificate.
fn configs_equal(a: &ClusterRecord, b: &ClusterRecord) -> bool {
    a.deployer_url == b.deployer_url
        && a.mtls_enabled == b.mtls_enabled
        && a.enabled == b.enabled
        && a.priority == b.priority
        && a.ca_cert == b.ca_cert
        && a.client_cert == b.client_cert
        && a.client_key_encrypted.is_some() == b.client_key_encrypted.is_some()
}

#[cfg(test)]
mod tests {
    use vice_crypto::generate_key;

    use super::*;
    use crate::store::MemClusterStore;

    fn encryptor() -> Arc<Encryptor> {
        Arc::new(Encryptor::new(&generate_key()).expect("key size is fixed"))
    }

    fn registry_with_store() -> (Arc<ClusterRegistry>, Arc<MemClusterStore>) {
        let store = Arc::new(MemClusterStore::new());
        let registry = Arc::new(ClusterRegistry::new(
            store.clone(),
            encryptor(),
            Duration::from_secs(30),
        ));
        (registry, store)
    }

    fn spec(name: &str, priority: i32) -> ClusterSpec {
        ClusterSpec {
            name: name.to_string(),
            deployer_url: format!("http://{name}:8080"),
            enabled: true,
            priority,
            ..ClusterSpec::default()
        }
    }

    fn record(name: &str) -> ClusterRecord {
        ClusterRecord {
            id: format!("{name}-id"),
            name: name.to_string(),
            deployer_url: format!("http://{name}:8080"),
            enabled: true,
            priority: 100,
            mtls_enabled: false,
            ca_cert: None,
            client_cert: None,
            client_key_encrypted: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn reload_mirrors_the_store() {
        let (registry, store) = registry_with_store();

        let alpha = store
            .insert_cluster(NewCluster {
                name: "alpha".to_string(),
                deployer_url: "http://alpha:8080".to_string(),
                enabled: true,
                priority: 10,
                ..NewCluster::default()
            })
            .await
            .unwrap();

        registry.reload().await.unwrap();
        assert_eq!(registry.list_clusters().await.len(), 1);
        assert!(registry.get_http_client(&alpha.id).await.is_some());

        store.delete_cluster(&alpha.id).await.unwrap();
        registry.reload().await.unwrap();
        assert!(registry.list_clusters().await.is_empty());
        assert!(registry.get_http_client(&alpha.id).await.is_none());
    }

    #[tokio::test]
    async fn writes_are_visible_without_waiting_for_the_interval() {
        let (registry, _store) = registry_with_store();

        let alpha = registry.register_cluster(spec("alpha", 10)).await.unwrap();
        assert!(registry.get_cluster_by_name("alpha").await.is_some());

        registry.set_enabled(&alpha.id, false).await.unwrap();
        assert!(registry.list_enabled_clusters().await.is_empty());

        registry.delete_cluster(&alpha.id).await.unwrap();
        assert!(registry.get_cluster(&alpha.id).await.is_none());
    }

    #[tokio::test]
    async fn enabled_clusters_sort_by_priority_then_name() {
        let (registry, _store) = registry_with_store();

        registry.register_cluster(spec("charlie", 5)).await.unwrap();
        registry.register_cluster(spec("alpha", 10)).await.unwrap();
        registry.register_cluster(spec("beta", 5)).await.unwrap();

        let names: Vec<String> = registry
            .list_enabled_clusters()
            .await
            .into_iter()
            .map(|cluster| cluster.name)
            .collect();
        assert_eq!(names, ["beta", "charlie", "alpha"]);
    }

    #[tokio::test]
    async fn mtls_registration_requires_all_material() {
        let (registry, _store) = registry_with_store();

        let result = registry
            .register_cluster(ClusterSpec {
                mtls_enabled: true,
                ca_cert: Some("ca".to_string()),
                ..spec("gamma", 10)
            })
            .await;
        assert!(matches!(result, Err(Error::MtlsRequiresCerts)));
    }

    #[tokio::test]
    async fn client_key_is_sealed_before_persistence() {
        let (registry, store) = registry_with_store();

        let gamma = registry
            .register_cluster(ClusterSpec {
                mtls_enabled: true,
                ca_cert: Some("ca pem".to_string()),
                client_cert: Some("cert pem".to_string()),
                client_key: Some("key pem".to_string()),
                ..spec("gamma", 10)
            })
            .await
            .unwrap();

        let stored = store.get_cluster(&gamma.id).await.unwrap().unwrap();
        let sealed = stored.client_key_encrypted.unwrap();
        assert_ne!(sealed, b"key pem");
        assert_eq!(
            registry.encryptor.decrypt(&sealed).unwrap(),
            b"key pem"
        );
    }

    #[tokio::test]
    async fn unusable_tls_material_drops_only_that_cluster() {
        let (registry, store) = registry_with_store();
        registry.register_cluster(spec("alpha", 10)).await.unwrap();

        // Bypass registration validation: the store can always contain a
        // cluster whose PEM no longer parses.
        store
            .insert_cluster(NewCluster {
                name: "broken".to_string(),
                deployer_url: "https://broken:8080".to_string(),
                enabled: true,
                priority: 1,
                mtls_enabled: true,
                ca_cert: Some("not pem".to_string()),
                client_cert: Some("not pem".to_string()),
                client_key_encrypted: Some(b"garbage".to_vec()),
                ..NewCluster::default()
            })
            .await
            .unwrap();

        registry.reload().await.unwrap();

        let names: Vec<String> = registry
            .list_clusters()
            .await
            .into_iter()
            .map(|cluster| cluster.name)
            .collect();
        assert_eq!(names, ["alpha"]);
    }

    #[tokio::test]
    async fn update_cannot_strip_mtls_material() {
        let (registry, _store) = registry_with_store();
        let gamma = registry
            .register_cluster(ClusterSpec {
                mtls_enabled: false,
                ..spec("gamma", 10)
            })
            .await
            .unwrap();

        let result = registry
            .update_cluster(&gamma.id, ClusterPatch {
                mtls_enabled: Some(true),
                ..ClusterPatch::default()
            })
            .await;
        assert!(matches!(result, Err(Error::MtlsRequiresCerts)));
    }

    #[test]
    fn config_equality_ignores_key_ciphertext() {
        let mut a = record("alpha");
        let mut b = record("alpha");
        a.client_key_encrypted = Some(vec![1, 2, 3]);
        b.client_key_encrypted = Some(vec![9, 9, 9]);
        assert!(configs_equal(&a, &b));

        b.client_key_encrypted = None;
        assert!(!configs_equal(&a, &b));
    }

    #[test]
    fn config_equality_sees_connection_fields() {
        let a = record("alpha");

        for mutate in [
            |r: &mut ClusterRecord| r.deployer_url = "http://other:8080".to_string(),
            |r: &mut ClusterRecord| r.mtls_enabled = true,
            |r: &mut ClusterRecord| r.enabled = false,
            |r: &mut ClusterRecord| r.priority = 1,
            |r: &mut ClusterRecord| r.ca_cert = Some("ca".to_string()),
            |r: &mut ClusterRecord| r.client_cert = Some("cert".to_string()),
        ] {
            let mut b = record("alpha");
            mutate(&mut b);
            assert!(!configs_equal(&a, &b));
        }

        // Timestamps alone never force a client rebuild.
        let mut b = record("alpha");
        b.updated_at = Utc::now();
        assert!(configs_equal(&a, &b));
    }
}
