//! Simulated cluster
//!
//! A complete in-process [`ClusterGateway`] used by the test suite and by
//! `b00t-k8s --simulate`. It keeps objects in memory, bumps generations on
//! patches, fabricates pods for Deployments whose template labels match a
//! selector and records every call in order.

use super::{
    AutoscalerState, ClusterGateway, DeploymentState, PodState, ResourceKind, ResourceRef,
    object_name,
};
use crate::error::ClusterError;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

/// Operations a failure can be injected into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateDeployment,
    PatchDeployment,
    GetDeployment,
    DeleteDeployment,
    ScaleDeployment,
    CreateAutoscaler,
    PatchAutoscaler,
    GetAutoscaler,
    DeleteAutoscaler,
    ListPods,
}

/// Failure modes that can be injected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Unavailable,
    Forbidden,
}

/// One recorded gateway call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub operation: Operation,
    /// Object name, or the selector for pod listings
    pub target: String,
}

/// When fabricated pods report `Ready`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodReadiness {
    /// Ready from the n-th listing of the workload onwards
    AfterPolls(u32),
    Never,
}

#[derive(Debug, Default)]
struct StoredDeployment {
    object: Deployment,
    generation: i64,
    polls: u32,
}

#[derive(Debug, Default)]
struct StoredAutoscaler {
    object: HorizontalPodAutoscaler,
    generation: i64,
}

#[derive(Debug, Default)]
struct ClusterState {
    deployments: BTreeMap<String, StoredDeployment>,
    autoscalers: BTreeMap<String, StoredAutoscaler>,
    faults: HashMap<Operation, Vec<Fault>>,
    calls: Vec<Call>,
}

/// In-memory cluster scoped to one namespace
#[derive(Debug)]
pub struct InMemoryCluster {
    namespace: String,
    readiness: PodReadiness,
    state: Mutex<ClusterState>,
}

impl InMemoryCluster {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            readiness: PodReadiness::AfterPolls(1),
            state: Mutex::new(ClusterState::default()),
        }
    }

    pub fn with_pod_readiness(mut self, readiness: PodReadiness) -> Self {
        self.readiness = readiness;
        self
    }

    /// Make the next call of `operation` fail once with `fault`.
    /// Repeated injections queue up.
    pub fn inject_fault(&self, operation: Operation, fault: Fault) {
        self.lock().faults.entry(operation).or_default().push(fault);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Recorded calls of one kind
    pub fn count(&self, operation: Operation) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    pub fn deployment_names(&self) -> Vec<String> {
        self.lock().deployments.keys().cloned().collect()
    }

    pub fn autoscaler_names(&self) -> Vec<String> {
        self.lock().autoscalers.keys().cloned().collect()
    }

    pub fn deployment(&self, name: &str) -> Option<Deployment> {
        self.lock().deployments.get(name).map(|d| d.object.clone())
    }

    pub fn autoscaler(&self, name: &str) -> Option<HorizontalPodAutoscaler> {
        self.lock().autoscalers.get(name).map(|a| a.object.clone())
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        // A panic while holding the lock cannot leave the maps half-written
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn reference(&self, kind: ResourceKind, name: &str, generation: i64) -> ResourceRef {
        ResourceRef {
            kind,
            namespace: self.namespace.clone(),
            name: name.to_string(),
            generation: Some(generation),
        }
    }

    /// Record the call and fire any injected fault
    fn enter(
        &self,
        state: &mut ClusterState,
        operation: Operation,
        target: &str,
    ) -> Result<(), ClusterError> {
        state.calls.push(Call {
            operation,
            target: target.to_string(),
        });
        let fault = state
            .faults
            .get_mut(&operation)
            .and_then(|queue| (!queue.is_empty()).then(|| queue.remove(0)));
        match fault {
            None => Ok(()),
            Some(Fault::Unavailable) => Err(ClusterError::ClusterUnavailable {
                operation: format!("{operation:?}"),
                message: "injected: connection refused".to_string(),
            }),
            Some(Fault::Forbidden) => Err(ClusterError::Forbidden {
                operation: format!("{operation:?}"),
                message: "injected: service account lacks permission".to_string(),
            }),
        }
    }
}

fn selector_pairs(selector: &str) -> Vec<(&str, &str)> {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .filter_map(|term| term.split_once('='))
        .collect()
}

fn template_matches(deployment: &Deployment, pairs: &[(&str, &str)]) -> bool {
    let labels = deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.labels.as_ref());
    match labels {
        Some(labels) => pairs
            .iter()
            .all(|(k, v)| labels.get(*k).is_some_and(|value| value == v)),
        None => false,
    }
}

fn desired_replicas(deployment: &Deployment) -> i32 {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1)
}

impl ClusterGateway for InMemoryCluster {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn create_or_patch_deployment(&self, deployment: &Deployment) -> Result<ResourceRef, ClusterError> {
        let name = object_name(&deployment.metadata);
        let mut state = self.lock();

        self.enter(&mut state, Operation::CreateDeployment, &name)?;
        if !state.deployments.contains_key(&name) {
            state.deployments.insert(
                name.clone(),
                StoredDeployment {
                    object: deployment.clone(),
                    generation: 1,
                    polls: 0,
                },
            );
            return Ok(self.reference(ResourceKind::Deployment, &name, 1));
        }

        // Conflict on create: patch the existing object instead
        self.enter(&mut state, Operation::PatchDeployment, &name)?;
        let stored = state.deployments.entry(name.clone()).or_default();
        stored.object = deployment.clone();
        stored.generation += 1;
        let generation = stored.generation;
        Ok(self.reference(ResourceKind::Deployment, &name, generation))
    }

    fn get_deployment(&self, name: &str) -> Result<DeploymentState, ClusterError> {
        let mut state = self.lock();
        self.enter(&mut state, Operation::GetDeployment, name)?;
        let readiness = self.readiness;
        let stored = state
            .deployments
            .get(name)
            .ok_or_else(|| ClusterError::NotFound {
                kind: ResourceKind::Deployment,
                name: name.to_string(),
            })?;
        let replicas = desired_replicas(&stored.object);
        let ready = match readiness {
            PodReadiness::AfterPolls(n) if stored.polls >= n => replicas,
            _ => 0,
        };
        Ok(DeploymentState {
            reference: self.reference(ResourceKind::Deployment, name, stored.generation),
            replicas,
            ready_replicas: ready,
            observed_generation: Some(stored.generation),
        })
    }

    fn delete_deployment(&self, name: &str) -> Result<(), ClusterError> {
        let mut state = self.lock();
        self.enter(&mut state, Operation::DeleteDeployment, name)?;
        state
            .deployments
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound {
                kind: ResourceKind::Deployment,
                name: name.to_string(),
            })
    }

    fn scale_deployment(&self, name: &str, replicas: i32) -> Result<(), ClusterError> {
        let mut state = self.lock();
        self.enter(&mut state, Operation::ScaleDeployment, name)?;
        let stored = state
            .deployments
            .get_mut(name)
            .ok_or_else(|| ClusterError::NotFound {
                kind: ResourceKind::Deployment,
                name: name.to_string(),
            })?;
        if let Some(spec) = stored.object.spec.as_mut() {
            spec.replicas = Some(replicas);
        }
        stored.generation += 1;
        Ok(())
    }

    fn create_or_patch_autoscaler(
        &self,
        autoscaler: &HorizontalPodAutoscaler,
    ) -> Result<ResourceRef, ClusterError> {
        let name = object_name(&autoscaler.metadata);
        let mut state = self.lock();

        self.enter(&mut state, Operation::CreateAutoscaler, &name)?;
        if !state.autoscalers.contains_key(&name) {
            state.autoscalers.insert(
                name.clone(),
                StoredAutoscaler {
                    object: autoscaler.clone(),
                    generation: 1,
                },
            );
            return Ok(self.reference(ResourceKind::HorizontalPodAutoscaler, &name, 1));
        }

        self.enter(&mut state, Operation::PatchAutoscaler, &name)?;
        let stored = state.autoscalers.entry(name.clone()).or_default();
        stored.object = autoscaler.clone();
        stored.generation += 1;
        let generation = stored.generation;
        Ok(self.reference(ResourceKind::HorizontalPodAutoscaler, &name, generation))
    }

    fn get_autoscaler(&self, name: &str) -> Result<AutoscalerState, ClusterError> {
        let mut state = self.lock();
        self.enter(&mut state, Operation::GetAutoscaler, name)?;
        let stored = state
            .autoscalers
            .get(name)
            .ok_or_else(|| ClusterError::NotFound {
                kind: ResourceKind::HorizontalPodAutoscaler,
                name: name.to_string(),
            })?;
        let spec = stored.object.spec.clone().unwrap_or_default();
        Ok(AutoscalerState {
            reference: self.reference(ResourceKind::HorizontalPodAutoscaler, name, stored.generation),
            min_replicas: spec.min_replicas.unwrap_or(1),
            max_replicas: spec.max_replicas,
            target: spec.scale_target_ref.name,
        })
    }

    fn delete_autoscaler(&self, name: &str) -> Result<(), ClusterError> {
        let mut state = self.lock();
        self.enter(&mut state, Operation::DeleteAutoscaler, name)?;
        state
            .autoscalers
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound {
                kind: ResourceKind::HorizontalPodAutoscaler,
                name: name.to_string(),
            })
    }

    fn list_pods(&self, selector: &str) -> Result<Vec<PodState>, ClusterError> {
        let mut state = self.lock();
        self.enter(&mut state, Operation::ListPods, selector)?;
        let pairs = selector_pairs(selector);
        let readiness = self.readiness;

        let mut pods = Vec::new();
        for (name, stored) in state.deployments.iter_mut() {
            if !template_matches(&stored.object, &pairs) {
                continue;
            }
            let replicas = desired_replicas(&stored.object);
            if replicas <= 0 {
                continue;
            }
            stored.polls += 1;
            let ready = matches!(readiness, PodReadiness::AfterPolls(n) if stored.polls >= n);
            for ordinal in 0..replicas {
                pods.push(PodState {
                    name: format!("{name}-{ordinal}"),
                    phase: if ready { "Running" } else { "Pending" }.to_string(),
                    ready,
                });
            }
        }
        Ok(pods)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest;
    use crate::workload::{AutoscalePolicy, WorkloadSpec};

    fn spec() -> WorkloadSpec {
        WorkloadSpec::new("demo", "app:v1").with_namespace("demo")
    }

    #[test]
    fn test_create_then_patch_keeps_one_deployment() {
        let cluster = InMemoryCluster::new("demo");
        let first = cluster
            .create_or_patch_deployment(&manifest::deployment(&spec()))
            .unwrap();
        let second = cluster
            .create_or_patch_deployment(&manifest::deployment(&spec().with_replicas(2)))
            .unwrap();

        assert_eq!(first.name, second.name);
        assert_eq!(first.generation, Some(1));
        assert_eq!(second.generation, Some(2));
        assert_eq!(cluster.deployment_names(), vec!["b00t-agent-demo".to_string()]);
        assert_eq!(cluster.count(Operation::PatchDeployment), 1);
        assert_eq!(cluster.get_deployment("b00t-agent-demo").unwrap().replicas, 2);
    }

    #[test]
    fn test_pods_become_ready_after_polls() {
        let cluster = InMemoryCluster::new("demo").with_pod_readiness(PodReadiness::AfterPolls(2));
        let spec = spec();
        cluster
            .create_or_patch_deployment(&manifest::deployment(&spec))
            .unwrap();

        let first = cluster.list_pods(&spec.selector()).unwrap();
        assert_eq!(first.len(), 1);
        assert!(!first[0].ready);

        let second = cluster.list_pods(&spec.selector()).unwrap();
        assert!(second[0].ready);
        assert_eq!(second[0].name, "b00t-agent-demo-0");
    }

    #[test]
    fn test_selector_isolates_workloads() {
        let cluster = InMemoryCluster::new("demo");
        let mine = spec();
        let theirs = WorkloadSpec::new("other", "app:v1").with_namespace("demo");
        cluster
            .create_or_patch_deployment(&manifest::deployment(&theirs))
            .unwrap();

        assert!(cluster.list_pods(&mine.selector()).unwrap().is_empty());
        assert_eq!(cluster.list_pods(&theirs.selector()).unwrap().len(), 1);
    }

    #[test]
    fn test_injected_fault_fires_once() {
        let cluster = InMemoryCluster::new("demo");
        cluster.inject_fault(Operation::CreateDeployment, Fault::Unavailable);

        let err = cluster
            .create_or_patch_deployment(&manifest::deployment(&spec()))
            .unwrap_err();
        assert!(err.is_transient());
        assert!(cluster
            .create_or_patch_deployment(&manifest::deployment(&spec()))
            .is_ok());
    }

    #[test]
    fn test_delete_reports_not_found() {
        let cluster = InMemoryCluster::new("demo");
        let spec = spec();
        cluster
            .create_or_patch_autoscaler(&manifest::autoscaler(&spec, &AutoscalePolicy::new(1, 3, 70)))
            .unwrap();

        assert!(cluster.delete_autoscaler("b00t-agent-demo").is_ok());
        assert!(cluster
            .delete_autoscaler("b00t-agent-demo")
            .unwrap_err()
            .is_not_found());
        assert!(cluster
            .delete_deployment("b00t-agent-demo")
            .unwrap_err()
            .is_not_found());
    }
}
