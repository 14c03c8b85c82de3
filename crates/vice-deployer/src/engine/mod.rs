//! Resource lifecycle engine: ordered apply, reverse-ordered delete.

use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{ConfigMap, PersistentVolume, PersistentVolumeClaim, Service},
    networking::v1::Ingress,
    policy::v1::PodDisruptionBudget,
};
use kube::{
    Api, Resource, ResourceExt,
    api::{DeleteParams, ListParams, PostParams},
};
use serde::{Serialize, de::DeserializeOwned};
use snafu::Snafu;
use tracing::{debug, info, warn};
use vice_spec::model::{DeploymentSpec, EXTERNAL_ID_LABEL};

pub mod status;
mod transfer;

pub use transfer::TransferKind;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to apply {resource}: {source}"))]
    Apply {
        resource: String,
        /// Everything that was already applied when the error hit, so the
        /// caller can clean up with a delete.
        created: Vec<String>,
        source: kube::Error,
    },

    #[snafu(display("failed to list {kind} for {external_id}"))]
    List {
        kind: &'static str,
        external_id: String,
        source: kube::Error,
    },

    #[snafu(display("no pods found for {external_id}"))]
    NoPods { external_id: String },

    #[snafu(display("failed to fetch logs for {external_id}"))]
    FetchLogs {
        external_id: String,
        source: kube::Error,
    },

    #[snafu(display("no service found for {external_id}"))]
    NoService { external_id: String },

    #[snafu(display("file-transfer request to {url} failed"))]
    TransferRequest { url: String, source: reqwest::Error },

    #[snafu(display("file-transfer sidecar returned an unusable response"))]
    TransferBody { source: reqwest::Error },
}

impl Error {
    /// The `kind:name` entries applied before a create aborted, if any.
    pub fn resources_created(&self) -> &[String] {
        match self {
            Self::Apply { created, .. } => created,
            _ => &[],
        }
    }
}

/// Applies and tears down analysis bundles against one cluster.
///
/// Stateless between requests; safe to share behind an `Arc`.
pub struct DeploymentEngine {
    client: kube::Client,
    file_transfer_port: u16,
    transfer_base_path: String,
    http: reqwest::Client,
}

impl DeploymentEngine {
    pub fn new(
        client: kube::Client,
        file_transfer_port: u16,
        transfer_base_path: impl Into<String>,
    ) -> Self {
        Self {
            client,
            file_transfer_port,
            transfer_base_path: transfer_base_path.into(),
            http: reqwest::Client::new(),
        }
    }

    pub(crate) fn selector(external_id: &str) -> String {
        format!("{EXTERNAL_ID_LABEL}={external_id}")
    }

    /// Applies every resource of the bundle in the fixed create order:
    /// config blobs, volumes, claims, workload, disruption budget, service,
    /// ingress. Each resource is created when absent and updated otherwise,
    /// so re-applying the same bundle is a no-op. The first failure aborts
    /// and reports everything applied so far.
    pub async fn apply(&self, spec: &DeploymentSpec) -> Result<Vec<String>> {
        let ns = &spec.metadata.namespace;
        let mut created = Vec::new();

        for config_map in &spec.config_maps {
            self.apply_one(
                &Api::<ConfigMap>::namespaced(self.client.clone(), ns),
                config_map,
                "configmap",
                &mut created,
                |_, _| {},
            )
            .await?;
        }

        for volume in &spec.persistent_volumes {
            self.apply_one(
                &Api::<PersistentVolume>::all(self.client.clone()),
                volume,
                "persistentvolume",
                &mut created,
                |_, _| {},
            )
            .await?;
        }

        for claim in &spec.persistent_volume_claims {
            self.apply_one(
                &Api::<PersistentVolumeClaim>::namespaced(self.client.clone(), ns),
                claim,
                "persistentvolumeclaim",
                &mut created,
                |_, _| {},
            )
            .await?;
        }

        self.apply_one(
            &Api::<Deployment>::namespaced(self.client.clone(), ns),
            &spec.deployment,
            "deployment",
            &mut created,
            |_, _| {},
        )
        .await?;

        self.apply_disruption_budget(spec, ns, &mut created).await?;

        // Service updates must not clobber the cluster IP the API server
        // assigned on create.
        self.apply_one(
            &Api::<Service>::namespaced(self.client.clone(), ns),
            &spec.service,
            "service",
            &mut created,
            |desired: &mut Service, existing: &Service| {
                if let (Some(desired_spec), Some(existing_spec)) =
                    (desired.spec.as_mut(), existing.spec.as_ref())
                {
                    desired_spec.cluster_ip = existing_spec.cluster_ip.clone();
                    desired_spec.cluster_ips = existing_spec.cluster_ips.clone();
                }
            },
        )
        .await?;

        self.apply_one(
            &Api::<Ingress>::namespaced(self.client.clone(), ns),
            &spec.ingress,
            "ingress",
            &mut created,
            |_, _| {},
        )
        .await?;

        info!(
            external_id = %spec.metadata.external_id,
            namespace = %ns,
            resources = created.len(),
            "applied deployment bundle"
        );
        Ok(created)
    }

    /// Create-or-update for one resource. The `merge` hook lets a caller
    /// carry server-assigned fields from the existing object into the
    /// replacement; the resource-version stamp is always carried.
    async fn apply_one<K, F>(
        &self,
        api: &Api<K>,
        desired: &K,
        kind: &str,
        created: &mut Vec<String>,
        merge: F,
    ) -> Result<()>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + std::fmt::Debug,
        F: FnOnce(&mut K, &K),
    {
        let name = desired.name_any();
        let resource = format!("{kind}:{name}");

        let outcome: Result<(), kube::Error> = async {
            match api.get_opt(&name).await? {
                None => {
                    api.create(&PostParams::default(), desired).await?;
                    debug!(%resource, "created");
                }
                Some(existing) => {
                    let mut replacement = desired.clone();
                    replacement.meta_mut().resource_version = existing.resource_version();
                    merge(&mut replacement, &existing);
                    api.replace(&name, &PostParams::default(), &replacement).await?;
                    debug!(%resource, "updated");
                }
            }
            Ok(())
        }
        .await;

        match outcome {
            Ok(()) => {
                created.push(resource);
                Ok(())
            }
            Err(source) => Err(Error::Apply {
                resource,
                created: created.clone(),
                source,
            }),
        }
    }

    /// Disruption budgets are not updatable under the assumed API contract,
    /// so an existing one is left alone.
    async fn apply_disruption_budget(
        &self,
        spec: &DeploymentSpec,
        ns: &str,
        created: &mut Vec<String>,
    ) -> Result<()> {
        let api = Api::<PodDisruptionBudget>::namespaced(self.client.clone(), ns);
        let name = spec.disruption_budget.name_any();
        let resource = format!("poddisruptionbudget:{name}");

        let outcome: Result<(), kube::Error> = async {
            if api.get_opt(&name).await?.is_none() {
                api.create(&PostParams::default(), &spec.disruption_budget)
                    .await?;
                debug!(%resource, "created");
            } else {
                debug!(%resource, "exists, skipping update");
            }
            Ok(())
        }
        .await;

        match outcome {
            Ok(()) => {
                created.push(resource);
                Ok(())
            }
            Err(source) => Err(Error::Apply {
                resource,
                created: created.clone(),
                source,
            }),
        }
    }

    /// Deletes everything labeled with the external id, in strict reverse
    /// create order. Per-item failures are logged and skipped so a stuck
    /// resource never strands the rest.
    pub async fn delete(&self, external_id: &str, ns: &str) -> Vec<String> {
        let selector = Self::selector(external_id);
        let mut deleted = Vec::new();

        self.delete_all(
            &Api::<Ingress>::namespaced(self.client.clone(), ns),
            "ingress",
            &selector,
            &mut deleted,
        )
        .await;
        self.delete_all(
            &Api::<Service>::namespaced(self.client.clone(), ns),
            "service",
            &selector,
            &mut deleted,
        )
        .await;
        self.delete_all(
            &Api::<PodDisruptionBudget>::namespaced(self.client.clone(), ns),
            "poddisruptionbudget",
            &selector,
            &mut deleted,
        )
        .await;
        self.delete_all(
            &Api::<Deployment>::namespaced(self.client.clone(), ns),
            "deployment",
            &selector,
            &mut deleted,
        )
        .await;
        self.delete_all(
            &Api::<PersistentVolumeClaim>::namespaced(self.client.clone(), ns),
            "persistentvolumeclaim",
            &selector,
            &mut deleted,
        )
        .await;
        self.delete_all(
            &Api::<PersistentVolume>::all(self.client.clone()),
            "persistentvolume",
            &selector,
            &mut deleted,
        )
        .await;
        self.delete_all(
            &Api::<ConfigMap>::namespaced(self.client.clone(), ns),
            "configmap",
            &selector,
            &mut deleted,
        )
        .await;

        info!(
            external_id,
            namespace = ns,
            resources = deleted.len(),
            "deleted deployment bundle"
        );
        deleted
    }

    async fn delete_all<K>(
        &self,
        api: &Api<K>,
        kind: &str,
        selector: &str,
        deleted: &mut Vec<String>,
    ) where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + std::fmt::Debug,
    {
        let params = ListParams::default().labels(selector);
        let items = match api.list(&params).await {
            Ok(list) => list.items,
            Err(error) => {
                warn!(kind, selector, %error, "failed to list for deletion, skipping kind");
                return;
            }
        };

        for item in items {
            let name = item.name_any();
            match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => deleted.push(format!("{kind}:{name}")),
                Err(error) => {
                    warn!(kind, name, %error, "failed to delete, skipping");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use vice_spec::model::SpecMetadata;

    use super::*;

    #[test]
    fn selector_uses_external_id_label() {
        assert_eq!(DeploymentEngine::selector("inv-1"), "external-id=inv-1");
    }

    #[test]
    fn apply_error_reports_partial_creates() {
        let error = Error::Apply {
            resource: "service:vice-inv-1".to_string(),
            created: vec![
                "configmap:excludes-file-inv-1".to_string(),
                "deployment:inv-1".to_string(),
            ],
            source: kube::Error::Api(Box::new(kube::core::Status {
                status: Some(kube::core::response::StatusSummary::Failure),
                message: "admission denied".to_string(),
                reason: "Forbidden".to_string(),
                code: 403,
                metadata: None,
                details: None,
            })),
        };

        assert_eq!(error.resources_created(), &[
            "configmap:excludes-file-inv-1".to_string(),
            "deployment:inv-1".to_string(),
        ]);
        assert!(error.to_string().contains("service:vice-inv-1"));
    }

    #[test]
    fn non_apply_errors_report_no_creates() {
        let error = Error::NoPods {
            external_id: "inv-1".to_string(),
        };
        assert!(error.resources_created().is_empty());
    }

    #[test]
    fn bundle_resource_names_match_create_order() {
        let named = |name: &str| k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        };

        // The engine walks the bundle in the same order resource_names()
        // reports, so a partial-create listing is always a prefix of it.
        let spec = DeploymentSpec {
            metadata: SpecMetadata {
                external_id: "inv-1".to_string(),
                ..SpecMetadata::default()
            },
            deployment: Deployment {
                metadata: named("inv-1"),
                ..Deployment::default()
            },
            service: Service {
                metadata: named("vice-inv-1"),
                ..Service::default()
            },
            ingress: Ingress {
                metadata: named("inv-1"),
                ..Ingress::default()
            },
            disruption_budget: PodDisruptionBudget {
                metadata: named("inv-1"),
                ..PodDisruptionBudget::default()
            },
            config_maps: vec![ConfigMap {
                metadata: named("excludes-file-inv-1"),
                ..ConfigMap::default()
            }],
            persistent_volumes: vec![PersistentVolume {
                metadata: named("csi-data-inv-1"),
                ..PersistentVolume::default()
            }],
            persistent_volume_claims: vec![PersistentVolumeClaim {
                metadata: named("csi-data-inv-1"),
                ..PersistentVolumeClaim::default()
            }],
        };

        assert_eq!(spec.resource_names(), vec![
            "configmap:excludes-file-inv-1",
            "persistentvolume:csi-data-inv-1",
            "persistentvolumeclaim:csi-data-inv-1",
            "deployment:inv-1",
            "poddisruptionbudget:inv-1",
            "service:vice-inv-1",
            "ingress:inv-1",
        ]);
    }
}
