//! Multi-cluster coordinator for interactive VICE analyses.
//!
//! Receives launch requests, assembles the full resource bundle for an
//! analysis, picks a target cluster from the dynamic registry, and dispatches
//! the bundle to that cluster's deployer over HTTP. Keeps a persistent
//! deployment→cluster ownership table as a cache; everything in it is
//! recoverable by probing the clusters.

pub mod api;
pub mod apps;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod registry;
pub mod selector;
pub mod store;

pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
pub use registry::ClusterRegistry;
