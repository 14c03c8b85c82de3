//! Deployer configuration, settable by flag or environment variable.

use std::net::SocketAddr;

use clap::Parser;

#[derive(Clone, Debug, Parser)]
#[command(name = "vice-deployer", version, about = "Applies VICE analysis bundles to the local cluster")]
pub struct DeployerConfig {
    /// Address the HTTP API listens on.
    #[arg(long, env = "VICE_DEPLOYER_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: SocketAddr,

    /// Namespace used when a request names none.
    #[arg(long, env = "VICE_DEPLOYER_NAMESPACE", default_value = "vice-apps")]
    pub namespace: String,

    /// Port the in-pod file-transfer sidecar listens on.
    #[arg(long, env = "VICE_DEPLOYER_FILE_TRANSFER_PORT", default_value_t = 60001)]
    pub file_transfer_port: u16,

    /// Base path of the file-transfer sidecar's HTTP API.
    #[arg(long, env = "VICE_DEPLOYER_TRANSFER_BASE_PATH", default_value = "/")]
    pub transfer_base_path: String,

    /// Upper bound on a synchronous transfer before it is cancelled.
    #[arg(long, env = "VICE_DEPLOYER_TRANSFER_TIMEOUT_SECS", default_value_t = 3600)]
    pub transfer_timeout_secs: u64,
}
