//! b00t-k8s: Kubernetes workload lifecycle adapter for b00t agents
//!
//! An agent hands a [`WorkloadSpec`] to a [`LifecycleManager`], which
//! provisions a Deployment (and optionally a HorizontalPodAutoscaler),
//! waits for the first ready pod, and releases or retains the workload on
//! shutdown.

pub mod commands;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod manifest;
pub mod poller;
pub mod report;
pub mod workload;

pub use config::AdapterConfig;
pub use dispatch::{Dispatcher, InlineDispatcher, OffloadDispatcher};
pub use error::{ClusterError, LifecycleError};
pub use gateway::ClusterGateway;
pub use gateway::kubernetes::KubeGateway;
pub use gateway::memory::InMemoryCluster;
pub use lifecycle::{
    LifecycleManager, LifecycleOptions, LifecycleState, WorkloadHandle, WorkloadLifecycle,
    WorkloadStatus,
};
pub use poller::{PollOutcome, ReadinessPoller};
pub use workload::{AutoscalePolicy, ResourceLimits, ScaleMetric, WorkloadSpec};
