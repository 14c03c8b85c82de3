//! Coordinator configuration, settable by flag or environment variable.

use std::net::SocketAddr;

use clap::Parser;
use vice_spec::BuilderConfig;

use crate::selector::SelectionStrategy;

#[derive(Clone, Debug, Parser)]
#[command(
    name = "vice-coordinator",
    version,
    about = "Launches and tracks interactive VICE analyses across clusters"
)]
pub struct CoordinatorConfig {
    /// Address the HTTP API listens on.
    #[arg(long, env = "VICE_COORDINATOR_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: SocketAddr,

    /// Postgres connection string.
    #[arg(long, env = "VICE_COORDINATOR_DATABASE_URL")]
    pub database_url: String,

    /// Base64-encoded 32-byte key protecting cluster client keys at rest.
    #[arg(long, env = "APP_EXPOSER_ENCRYPTION_KEY", hide_env_values = true)]
    pub encryption_key: Option<String>,

    /// Start without an encryption key and store secrets in plaintext.
    /// Development only.
    #[arg(long, env = "VICE_COORDINATOR_ALLOW_PLAINTEXT_SECRETS")]
    pub allow_plaintext_secrets: bool,

    /// Seconds between background registry reloads.
    #[arg(long, env = "VICE_COORDINATOR_RELOAD_INTERVAL_SECS", default_value_t = 30)]
    pub reload_interval_secs: u64,

    /// Cluster selection strategy.
    #[arg(long, env = "VICE_COORDINATOR_SELECTION_STRATEGY", value_enum, default_value_t = SelectionStrategy::Priority)]
    pub selection_strategy: SelectionStrategy,

    /// Base URL of the Apps user service.
    #[arg(long, env = "VICE_COORDINATOR_APPS_BASE_URL")]
    pub apps_base_url: String,

    // Everything below feeds the spec builder.
    /// Namespace analyses are launched into.
    #[arg(long, env = "VICE_COORDINATOR_NAMESPACE", default_value = "vice-apps")]
    pub namespace: String,

    #[arg(long, env = "VICE_COORDINATOR_PROXY_IMAGE", default_value = "harbor.cyverse.org/de/vice-proxy:latest")]
    pub proxy_image: String,

    #[arg(long, env = "VICE_COORDINATOR_STAGING_IMAGE", default_value = "harbor.cyverse.org/de/vice-file-transfers:latest")]
    pub staging_image: String,

    /// Base URL the per-analysis subdomain is grafted onto.
    #[arg(long, env = "VICE_COORDINATOR_FRONTEND_BASE_URL", default_value = "https://cyverse.run")]
    pub frontend_base_url: String,

    #[arg(long, env = "VICE_COORDINATOR_GET_ANALYSIS_ID_BASE")]
    pub get_analysis_id_base: String,

    #[arg(long, env = "VICE_COORDINATOR_CHECK_RESOURCE_ACCESS_BASE")]
    pub check_resource_access_base: String,

    #[arg(long, env = "VICE_COORDINATOR_OIDC_BASE_URL")]
    pub oidc_base_url: String,

    #[arg(long, env = "VICE_COORDINATOR_OIDC_REALM", default_value = "CyVerse")]
    pub oidc_realm: String,

    #[arg(long, env = "VICE_COORDINATOR_OIDC_CLIENT_ID", default_value = "de")]
    pub oidc_client_id: String,

    #[arg(long, env = "VICE_COORDINATOR_IRODS_ZONE", default_value = "iplant")]
    pub irods_zone: String,

    #[arg(long, env = "VICE_COORDINATOR_INGRESS_CLASS", default_value = "nginx")]
    pub ingress_class: String,

    #[arg(long, env = "VICE_COORDINATOR_DEFAULT_BACKEND_SERVICE", default_value = "vice-default-backend")]
    pub default_backend_service: String,

    #[arg(long, env = "VICE_COORDINATOR_DEFAULT_BACKEND_PORT", default_value_t = 80)]
    pub default_backend_port: i32,

    /// Stage data through the iRODS CSI driver instead of the file-transfer
    /// sidecar.
    #[arg(long, env = "VICE_COORDINATOR_USE_CSI_DRIVER")]
    pub use_csi_driver: bool,

    /// Launch the in-pod proxy with authentication disabled.
    #[arg(long, env = "VICE_COORDINATOR_DISABLE_PROXY_AUTH")]
    pub disable_proxy_auth: bool,

    /// Leave the user's home collection out of CSI-backed analyses.
    #[arg(long, env = "VICE_COORDINATOR_NO_MOUNT_IRODS_HOME")]
    pub no_mount_irods_home: bool,

    /// Username suffix stripped from submitters.
    #[arg(long, env = "VICE_COORDINATOR_USER_SUFFIX", default_value = "@iplantcollaborative.org")]
    pub user_suffix: String,

    /// Leave the default CPU limit off analyses that request none.
    #[arg(long, env = "VICE_COORDINATOR_NO_DEFAULT_CPU_LIMIT")]
    pub no_default_cpu_limit: bool,

    /// Leave the default memory limit off analyses that request none.
    #[arg(long, env = "VICE_COORDINATOR_NO_DEFAULT_MEMORY_LIMIT")]
    pub no_default_memory_limit: bool,
}

impl CoordinatorConfig {
    pub fn builder_config(&self) -> BuilderConfig {
        BuilderConfig {
            namespace: self.namespace.clone(),
            proxy_image: self.proxy_image.clone(),
            staging_image: self.staging_image.clone(),
            frontend_base_url: self.frontend_base_url.clone(),
            get_analysis_id_base: self.get_analysis_id_base.clone(),
            check_resource_access_base: self.check_resource_access_base.clone(),
            oidc_base_url: self.oidc_base_url.clone(),
            oidc_realm: self.oidc_realm.clone(),
            oidc_client_id: self.oidc_client_id.clone(),
            irods_zone: self.irods_zone.clone(),
            ingress_class: self.ingress_class.clone(),
            default_backend_service: self.default_backend_service.clone(),
            default_backend_port: self.default_backend_port,
            use_csi_driver: self.use_csi_driver,
            disable_proxy_auth: self.disable_proxy_auth,
            mount_irods_home: !self.no_mount_irods_home,
            user_suffix: self.user_suffix.clone(),
            apply_default_cpu_limit: !self.no_default_cpu_limit,
            apply_default_memory_limit: !self.no_default_memory_limit,
        }
    }
}
