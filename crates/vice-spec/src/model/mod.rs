//! The deployment bundle exchanged between the coordinator and a deployer.

use std::collections::BTreeMap;

use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{ConfigMap, PersistentVolume, PersistentVolumeClaim, Service},
    networking::v1::Ingress,
    policy::v1::PodDisruptionBudget,
};
use serde::{Deserialize, Serialize};

pub mod responses;

/// The label every resource of an analysis carries; its value is the
/// external id and it is the selector used for all bulk lookup and deletion.
pub const EXTERNAL_ID_LABEL: &str = "external-id";

/// A complete, internally consistent bundle of cluster resources for one
/// interactive analysis.
///
/// The resources are plain Kubernetes API objects so a deployer can apply
/// them without translation. Every resource in the bundle carries the
/// [`EXTERNAL_ID_LABEL`] with the value of [`SpecMetadata::external_id`].
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct DeploymentSpec {
    pub metadata: SpecMetadata,

    pub deployment: Deployment,
    pub service: Service,
    pub ingress: Ingress,
    pub disruption_budget: PodDisruptionBudget,

    #[serde(default)]
    pub config_maps: Vec<ConfigMap>,
    #[serde(default)]
    pub persistent_volumes: Vec<PersistentVolume>,
    #[serde(default)]
    pub persistent_volume_claims: Vec<PersistentVolumeClaim>,
}

/// Identifying information about the analysis a bundle belongs to.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct SpecMetadata {
    /// Stable opaque identifier for the analysis; required.
    pub external_id: String,

    pub analysis_id: String,
    pub user_id: String,
    pub username: String,
    pub app_id: String,
    pub app_name: String,
    pub analysis_name: String,

    /// Namespace every namespaced resource of the bundle lives in.
    pub namespace: String,

    /// Letter-prefixed hash of `(user_id, external_id)`; doubles as the
    /// ingress host and the pod hostname.
    pub subdomain: String,

    /// IP the user last logged in from, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login_ip: Option<String>,

    /// The label set shared by all resources in the bundle.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl DeploymentSpec {
    /// Names of all resources in the bundle in create order, in the
    /// `kind:name` form used by the deployer's response envelopes.
    pub fn resource_names(&self) -> Vec<String> {
        let mut names = Vec::new();

        let push = |names: &mut Vec<String>, kind: &str, name: Option<&String>| {
            if let Some(name) = name {
                names.push(format!("{kind}:{name}"));
            }
        };

        for cm in &self.config_maps {
            push(&mut names, "configmap", cm.metadata.name.as_ref());
        }
        for pv in &self.persistent_volumes {
            push(&mut names, "persistentvolume", pv.metadata.name.as_ref());
        }
        for pvc in &self.persistent_volume_claims {
            push(
                &mut names,
                "persistentvolumeclaim",
                pvc.metadata.name.as_ref(),
            );
        }
        push(&mut names, "deployment", self.deployment.metadata.name.as_ref());
        push(
            &mut names,
            "poddisruptionbudget",
            self.disruption_budget.metadata.name.as_ref(),
        );
        push(&mut names, "service", self.service.metadata.name.as_ref());
        push(&mut names, "ingress", self.ingress.metadata.name.as_ref());

        names
    }
}
