//! Stateless deployer for VICE analyses.
//!
//! Receives complete [`vice_spec::DeploymentSpec`] bundles over HTTP and
//! applies them to the local cluster: idempotent ordered create, strict
//! reverse-ordered delete, status aggregation, log retrieval, and
//! file-transfer orchestration against the in-pod sidecar. The deployer
//! keeps no state of its own; everything it needs to find an analysis again
//! is in the `external-id` label.

pub mod config;
pub mod engine;
pub mod server;

pub use config::DeployerConfig;
pub use engine::DeploymentEngine;
