//! Kubernetes access: object store seam, kinds table and client builders.

pub mod client;
#[cfg(test)]
pub mod fake;
pub mod kinds;
pub mod store;

pub use client::{build_management_client, build_workload_client};
pub use kinds::ResourceKind;
pub use store::{KubeStore, ObjectStore};
