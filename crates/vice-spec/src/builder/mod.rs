//! Deterministic assembly of a [`DeploymentSpec`] from a submitted analysis.
//!
//! The builder is a pure function of the analysis description and the
//! implementation configuration, apart from one lookup against the `Apps`
//! collaborator for the user's login IP. Building the same analysis twice
//! yields byte-identical bundles.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use url::Url;

use crate::{
    analysis::{self, Analysis},
    labels::{self, LabelInputs},
    model::{DeploymentSpec, SpecMetadata},
};

mod config_blobs;
mod network;
mod storage;
mod workload;

pub use storage::PathMapping;

/// Port the authenticating proxy sidecar listens on.
pub const PROXY_PORT: i32 = 60000;

/// Port the file-transfer sidecar listens on.
pub const FILE_TRANSFER_PORT: i32 = 60001;

/// Named service port forwarded to the proxy.
pub const PROXY_PORT_NAME: &str = "tcp-proxy";

/// Named service port forwarded to the file-transfer sidecar.
pub const INPUT_PORT_NAME: &str = "tcp-input";

pub(crate) const ANALYSIS_CONTAINER: &str = "analysis";
pub(crate) const PROXY_CONTAINER: &str = "vice-proxy";
pub(crate) const TRANSFER_CONTAINER: &str = "input-files";
pub(crate) const TRANSFER_INIT_CONTAINER: &str = "input-files-init";
pub(crate) const WORKING_DIR_INIT_CONTAINER: &str = "working-dir-init";

pub(crate) const WORKING_DIR_VOLUME: &str = "working-dir";
pub(crate) const EXCLUDES_VOLUME: &str = "excludes-file";
pub(crate) const PATH_LIST_VOLUME: &str = "input-path-list";
pub(crate) const CSI_VOLUME: &str = "csi-data";
pub(crate) const SHM_VOLUME: &str = "shm";

pub(crate) const WORKING_DIR_MOUNT: &str = "/input-files";
pub(crate) const EXCLUDES_MOUNT: &str = "/excludes";
pub(crate) const PATH_LIST_MOUNT: &str = "/input-paths";
pub(crate) const CSI_MOUNT: &str = "/data-store";

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("analysis is missing an external id"))]
    MissingExternalId,

    #[snafu(display("invalid step input"))]
    Input { source: analysis::Error },

    #[snafu(display(
        "tried to mount input file {irods_path} at {mount_path} already used by {existing}"
    ))]
    DuplicateMount {
        irods_path: String,
        mount_path: String,
        existing: String,
    },

    #[snafu(display("failed to look up login IP for user {user_id:?}"))]
    UserLookup {
        source: Box<dyn std::error::Error + Send + Sync>,
        user_id: String,
    },

    #[snafu(display("frontend base URL {url:?} is invalid"))]
    FrontendUrl {
        source: url::ParseError,
        url: String,
    },

    #[snafu(display("frontend base URL {url:?} has no host"))]
    FrontendUrlHost { url: String },
}

/// The `Apps` collaborator, reduced to the one call the builder needs.
#[async_trait]
pub trait UserInfo: Send + Sync {
    /// Returns the IP the user last logged in from, if the user service
    /// knows one.
    async fn get_user_ip(
        &self,
        user_id: &str,
    ) -> Result<Option<String>, Box<dyn std::error::Error + Send + Sync>>;
}

#[async_trait]
impl<U: UserInfo + ?Sized> UserInfo for std::sync::Arc<U> {
    async fn get_user_ip(
        &self,
        user_id: &str,
    ) -> Result<Option<String>, Box<dyn std::error::Error + Send + Sync>> {
        (**self).get_user_ip(user_id).await
    }
}

/// Site configuration the builder folds into every bundle.
#[derive(Clone, Debug)]
pub struct BuilderConfig {
    /// Namespace analyses are launched into.
    pub namespace: String,

    /// Image of the authenticating proxy sidecar.
    pub proxy_image: String,
    /// Image of the file-transfer binary, used for both the staging init
    /// container and the long-running sidecar.
    pub staging_image: String,

    /// Base URL the per-analysis subdomain is grafted onto, e.g.
    /// `https://cyverse.run`.
    pub frontend_base_url: String,

    /// Endpoint the proxy uses to map a subdomain back to an analysis id.
    pub get_analysis_id_base: String,
    /// Endpoint the proxy uses to check a user's access to the analysis.
    pub check_resource_access_base: String,

    pub oidc_base_url: String,
    pub oidc_realm: String,
    pub oidc_client_id: String,

    pub irods_zone: String,
    pub ingress_class: String,
    /// Service absorbing requests for paths no analysis rule matches.
    pub default_backend_service: String,
    pub default_backend_port: i32,

    /// When true, data staging goes through the iRODS CSI driver instead of
    /// the file-transfer sidecar.
    pub use_csi_driver: bool,
    /// When true the proxy is launched with `--disable-auth`.
    pub disable_proxy_auth: bool,
    /// When true (and the CSI driver is on) the user's home collection is
    /// mapped into the container.
    pub mount_irods_home: bool,

    /// Installation username suffix stripped from submitters, e.g.
    /// `@iplantcollaborative.org`.
    pub user_suffix: String,

    /// Default CPU/memory limits can be individually disabled; requests are
    /// always set.
    pub apply_default_cpu_limit: bool,
    pub apply_default_memory_limit: bool,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            namespace: "vice-apps".to_string(),
            proxy_image: "harbor.cyverse.org/de/vice-proxy:latest".to_string(),
            staging_image: "harbor.cyverse.org/de/vice-file-transfers:latest".to_string(),
            frontend_base_url: "https://cyverse.run".to_string(),
            get_analysis_id_base: "http://get-analysis-id".to_string(),
            check_resource_access_base: "http://check-resource-access".to_string(),
            oidc_base_url: "https://kc.cyverse.org/auth".to_string(),
            oidc_realm: "CyVerse".to_string(),
            oidc_client_id: "de".to_string(),
            irods_zone: "iplant".to_string(),
            ingress_class: "nginx".to_string(),
            default_backend_service: "vice-default-backend".to_string(),
            default_backend_port: 80,
            use_csi_driver: false,
            disable_proxy_auth: false,
            mount_irods_home: true,
            user_suffix: "@iplantcollaborative.org".to_string(),
            apply_default_cpu_limit: true,
            apply_default_memory_limit: true,
        }
    }
}

impl BuilderConfig {
    /// The user-facing URL of an analysis: the subdomain grafted onto the
    /// frontend base URL's host.
    pub fn frontend_url(&self, subdomain: &str) -> Result<String> {
        let url = Url::parse(&self.frontend_base_url).context(FrontendUrlSnafu {
            url: &self.frontend_base_url,
        })?;
        let host = url.host_str().context(FrontendUrlHostSnafu {
            url: &self.frontend_base_url,
        })?;

        Ok(match url.port() {
            Some(port) => format!("{}://{subdomain}.{host}:{port}", url.scheme()),
            None => format!("{}://{subdomain}.{host}", url.scheme()),
        })
    }

    /// The submitter with the installation's username suffix stripped.
    pub(crate) fn short_username<'a>(&self, username: &'a str) -> &'a str {
        if self.user_suffix.is_empty() {
            username
        } else {
            username.trim_end_matches(self.user_suffix.as_str())
        }
    }
}

/// Everything the per-resource build functions need, computed once.
pub(crate) struct BuildContext<'a> {
    pub analysis: &'a Analysis,
    pub config: &'a BuilderConfig,
    pub external_id: &'a str,
    pub username: &'a str,
    pub subdomain: String,
    pub frontend_url: String,
    pub labels: BTreeMap<String, String>,
}

impl BuildContext<'_> {
    /// Selector labels matching exactly the pods of this analysis.
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(
            crate::model::EXTERNAL_ID_LABEL.to_string(),
            self.external_id.to_string(),
        )])
    }
}

/// Assembles [`DeploymentSpec`]s.
pub struct SpecBuilder<U> {
    config: BuilderConfig,
    apps: U,
}

impl<U: UserInfo> SpecBuilder<U> {
    pub fn new(config: BuilderConfig, apps: U) -> Self {
        Self { config, apps }
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// Builds the complete resource bundle for one analysis.
    pub async fn build(&self, analysis: &Analysis) -> Result<DeploymentSpec> {
        ensure!(!analysis.invocation_id.is_empty(), MissingExternalIdSnafu);

        let external_id = analysis.invocation_id.as_str();
        let username = self.config.short_username(&analysis.username);
        let subdomain = labels::subdomain(&analysis.user_id, external_id);

        let login_ip = self
            .apps
            .get_user_ip(&analysis.user_id)
            .await
            .context(UserLookupSnafu {
                user_id: &analysis.user_id,
            })?;

        let label_set = labels::label_set(&LabelInputs {
            external_id,
            app_id: &analysis.app_id,
            user_id: &analysis.user_id,
            username,
            app_name: &analysis.app_name,
            analysis_name: &analysis.analysis_name,
            subdomain: &subdomain,
            login_ip: login_ip.as_deref(),
        });

        let ctx = BuildContext {
            analysis,
            config: &self.config,
            external_id,
            username,
            frontend_url: self.config.frontend_url(&subdomain)?,
            subdomain,
            labels: label_set,
        };

        let (config_maps, has_path_list) = config_blobs::build(&ctx);
        let plan = storage::plan(&ctx, has_path_list)?;
        let deployment = workload::build(&ctx, &plan);
        let service = network::service(&ctx);
        let ingress = network::ingress(&ctx);
        let disruption_budget = network::disruption_budget(&ctx);

        Ok(DeploymentSpec {
            metadata: SpecMetadata {
                external_id: external_id.to_string(),
                analysis_id: analysis.analysis_id.clone(),
                user_id: analysis.user_id.clone(),
                username: username.to_string(),
                app_id: analysis.app_id.clone(),
                app_name: analysis.app_name.clone(),
                analysis_name: analysis.analysis_name.clone(),
                namespace: self.config.namespace.clone(),
                subdomain: ctx.subdomain.clone(),
                login_ip,
                labels: ctx.labels.clone(),
            },
            deployment,
            service,
            ingress,
            disruption_budget,
            config_maps,
            persistent_volumes: plan.persistent_volumes,
            persistent_volume_claims: plan.persistent_volume_claims,
        })
    }
}

/// Formats fractional cores as a millicore quantity.
pub(crate) fn cpu_quantity(cores: f64) -> Quantity {
    Quantity(format!("{}m", (cores * 1000.0).round() as i64))
}

/// Formats a byte count as a plain-number quantity.
pub(crate) fn byte_quantity(bytes: i64) -> Quantity {
    Quantity(bytes.to_string())
}
