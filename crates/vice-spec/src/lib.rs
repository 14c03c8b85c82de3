//! Wire contract and spec assembly for interactive VICE analyses.
//!
//! The coordinator turns a submitted [`analysis::Analysis`] into a complete
//! [`model::DeploymentSpec`], one bundle holding every cluster resource an
//! analysis needs, and ships it over HTTP to a deployer, which applies it to
//! its local cluster. Both halves of that exchange live here so the two
//! services cannot drift apart.

pub mod analysis;
pub mod builder;
pub mod labels;
pub mod model;

pub use builder::{BuilderConfig, SpecBuilder, UserInfo};
pub use model::DeploymentSpec;
