//! Cluster Client Gateway
//!
//! A blocking, stateless view of the cluster control plane scoped to one
//! namespace. Consumers depend on [`ClusterGateway`] and never on a specific
//! transport, so the lifecycle manager can run against the real API server
//! ([`kubernetes::KubeGateway`]) or the simulated one ([`memory::InMemoryCluster`]).
//!
//! Contract shared by all implementations:
//! - `create_or_patch_*` is an upsert: create first, patch the same name on a
//!   conflict. Never creates a duplicate.
//! - Errors are classified into [`ClusterError`] variants.
//! - No retries. Retry policy belongs to the caller.

pub mod detection;
pub mod kubernetes;
pub mod memory;

use crate::error::ClusterError;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use detection::{ClusterSource, detect_cluster_source};

/// Kinds of object the adapter manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Deployment,
    HorizontalPodAutoscaler,
    Pod,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Deployment => "Deployment",
            ResourceKind::HorizontalPodAutoscaler => "HorizontalPodAutoscaler",
            ResourceKind::Pod => "Pod",
        };
        f.write_str(name)
    }
}

/// Reference to an object the gateway created or patched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
    /// `metadata.generation` as returned by the write
    pub generation: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentState {
    pub reference: ResourceRef,
    pub replicas: i32,
    pub ready_replicas: i32,
    pub observed_generation: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscalerState {
    pub reference: ResourceRef,
    pub min_replicas: i32,
    pub max_replicas: i32,
    /// Name of the Deployment the autoscaler drives
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodState {
    pub name: String,
    pub phase: String,
    /// `Ready` condition is `True`
    pub ready: bool,
}

/// Blocking control-plane operations used by the lifecycle manager.
///
/// Implementations must be safe to call concurrently from different
/// workloads; they hold no per-workload state.
pub trait ClusterGateway: Send + Sync + 'static {
    /// The one namespace every call is scoped to
    fn namespace(&self) -> &str;

    fn create_or_patch_deployment(&self, deployment: &Deployment) -> Result<ResourceRef, ClusterError>;

    fn get_deployment(&self, name: &str) -> Result<DeploymentState, ClusterError>;

    /// Fails with [`ClusterError::NotFound`] when already gone
    fn delete_deployment(&self, name: &str) -> Result<(), ClusterError>;

    /// Patch only the replica count through the scale subresource
    fn scale_deployment(&self, name: &str, replicas: i32) -> Result<(), ClusterError>;

    fn create_or_patch_autoscaler(
        &self,
        autoscaler: &HorizontalPodAutoscaler,
    ) -> Result<ResourceRef, ClusterError>;

    fn get_autoscaler(&self, name: &str) -> Result<AutoscalerState, ClusterError>;

    /// Fails with [`ClusterError::NotFound`] when already gone
    fn delete_autoscaler(&self, name: &str) -> Result<(), ClusterError>;

    /// Pods matching a `k=v,k=v` label selector, in server order
    fn list_pods(&self, selector: &str) -> Result<Vec<PodState>, ClusterError>;
}

/// Name of the object a manifest describes, or an empty string
pub(crate) fn object_name(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> String {
    meta.name.clone().unwrap_or_default()
}
