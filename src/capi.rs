//! Cluster API domain model: versions, topology, providers and addons.

pub mod addon;
pub mod provider;
pub mod topology;
pub mod version;
