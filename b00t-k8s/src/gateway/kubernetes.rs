//! Gateway backed by the Kubernetes API server
//!
//! [`KubeGateway`] wraps a [`kube::Client`] and exposes the blocking
//! [`ClusterGateway`] contract by driving each request on a captured tokio
//! runtime handle. It must only be called from a thread that is not itself
//! running async tasks, i.e. through the offloading dispatcher.

use super::{
    AutoscalerState, ClusterGateway, DeploymentState, PodState, ResourceKind, ResourceRef,
    object_name,
};
use crate::error::ClusterError;
use crate::workload::MANAGER_NAME;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde::Serialize;
use serde::de::DeserializeOwned;
use snafu::{ResultExt, Snafu};
use std::fmt::Debug;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info};

/// Errors while building a client
#[derive(Debug, Snafu)]
pub enum ConnectError {
    #[snafu(display("failed to read kubeconfig {}", path.display()))]
    ReadKubeconfig {
        path: PathBuf,
        source: kube::config::KubeconfigError,
    },

    #[snafu(display("failed to load kubeconfig context"))]
    LoadKubeconfig {
        source: kube::config::KubeconfigError,
    },

    #[snafu(display("no in-cluster or kubeconfig credentials found"))]
    InferConfig {
        source: kube::config::InferConfigError,
    },

    #[snafu(display("failed to build Kubernetes client"))]
    BuildClient { source: kube::Error },

    #[snafu(display("a tokio runtime is required to build a Kubernetes client"))]
    NoRuntime {
        source: tokio::runtime::TryCurrentError,
    },
}

/// How to reach the cluster
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
}

async fn client_config(options: &ConnectOptions) -> Result<Config, ConnectError> {
    let kube_options = KubeConfigOptions {
        context: options.context.clone(),
        ..KubeConfigOptions::default()
    };

    if let Some(path) = &options.kubeconfig {
        let kubeconfig = Kubeconfig::read_from(path).context(ReadKubeconfigSnafu { path: path.clone() })?;
        return Config::from_custom_kubeconfig(kubeconfig, &kube_options)
            .await
            .context(LoadKubeconfigSnafu);
    }

    if options.context.is_some() {
        return Config::from_kubeconfig(&kube_options)
            .await
            .context(LoadKubeconfigSnafu);
    }

    // In-cluster first, then ~/.kube/config
    Config::infer().await.context(InferConfigSnafu)
}

/// Classify a kube error into the adapter's taxonomy
fn classify(operation: &str, kind: ResourceKind, name: &str, err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(response) => {
            classify_status(operation, kind, name, response.code, response.message.clone())
        }
        other => ClusterError::ClusterUnavailable {
            operation: operation.to_string(),
            message: other.to_string(),
        },
    }
}

fn classify_status(
    operation: &str,
    kind: ResourceKind,
    name: &str,
    code: u16,
    message: String,
) -> ClusterError {
    let operation = operation.to_string();
    match code {
        404 => ClusterError::NotFound {
            kind,
            name: name.to_string(),
        },
        409 => ClusterError::Conflict {
            kind,
            name: name.to_string(),
        },
        403 => ClusterError::Forbidden { operation, message },
        // Expired credentials, throttling, server faults
        401 | 429 | 500..=599 => ClusterError::ClusterUnavailable { operation, message },
        code => ClusterError::Rejected {
            operation,
            code,
            message,
        },
    }
}

/// Blocking gateway scoped to one namespace
#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
    namespace: String,
    runtime: Handle,
}

impl KubeGateway {
    /// Wrap an existing client. Must be called inside a tokio runtime.
    pub fn new(client: Client, namespace: impl Into<String>) -> Result<Self, ConnectError> {
        let runtime = Handle::try_current().context(NoRuntimeSnafu)?;
        Ok(Self {
            client,
            namespace: namespace.into(),
            runtime,
        })
    }

    /// Build a client from kubeconfig or in-cluster credentials
    pub async fn connect(
        options: &ConnectOptions,
        namespace: impl Into<String>,
    ) -> Result<Self, ConnectError> {
        let mut config = client_config(options).await?;
        if options.connect_timeout.is_some() {
            config.connect_timeout = options.connect_timeout;
        }
        if options.read_timeout.is_some() {
            config.read_timeout = options.read_timeout;
        }
        let client = Client::try_from(config).context(BuildClientSnafu)?;
        let gateway = Self::new(client, namespace)?;
        info!(namespace = %gateway.namespace, "connected to Kubernetes API server");
        Ok(gateway)
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn block<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    fn reference(&self, kind: ResourceKind, name: &str, generation: Option<i64>) -> ResourceRef {
        ResourceRef {
            kind,
            namespace: self.namespace.clone(),
            name: name.to_string(),
            generation,
        }
    }

    /// POST, falling back to a PATCH of the same name on 409
    fn upsert<K>(
        &self,
        object: &K,
        kind: ResourceKind,
        name: &str,
        patch: Patch<&K>,
    ) -> Result<K, ClusterError>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
        <K as kube::Resource>::DynamicType: Default,
    {
        let api = self.api::<K>();
        let created = self.block(api.create(&PostParams::default(), object));
        match created {
            Ok(object) => {
                info!(%kind, name, namespace = %self.namespace, "created");
                Ok(object)
            }
            Err(err) => match classify("create", kind, name, err) {
                ClusterError::Conflict { .. } => {
                    debug!(%kind, name, "already exists, patching");
                    let params = PatchParams {
                        field_manager: Some(MANAGER_NAME.to_string()),
                        ..PatchParams::default()
                    };
                    let patched = self
                        .block(api.patch(name, &params, &patch))
                        .map_err(|e| classify("patch", kind, name, e))?;
                    info!(%kind, name, namespace = %self.namespace, "patched");
                    Ok(patched)
                }
                other => Err(other),
            },
        }
    }

    fn delete<K>(&self, kind: ResourceKind, name: &str) -> Result<(), ClusterError>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Debug,
        <K as kube::Resource>::DynamicType: Default,
    {
        let api = self.api::<K>();
        self.block(api.delete(name, &delete_params()))
            .map(|_| ())
            .map_err(|e| classify("delete", kind, name, e))
    }
}

/// Background propagation: the object is gone once the call returns and
/// the garbage collector removes ReplicaSets and Pods afterwards
fn delete_params() -> DeleteParams {
    DeleteParams::background()
}

impl ClusterGateway for KubeGateway {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn create_or_patch_deployment(&self, deployment: &Deployment) -> Result<ResourceRef, ClusterError> {
        let name = object_name(&deployment.metadata);
        let stored = self.upsert(
            deployment,
            ResourceKind::Deployment,
            &name,
            Patch::Strategic(deployment),
        )?;
        Ok(self.reference(ResourceKind::Deployment, &name, stored.metadata.generation))
    }

    fn get_deployment(&self, name: &str) -> Result<DeploymentState, ClusterError> {
        let deployment = self
            .block(self.api::<Deployment>().get(name))
            .map_err(|e| classify("get", ResourceKind::Deployment, name, e))?;
        let status = deployment.status.unwrap_or_default();
        Ok(DeploymentState {
            reference: self.reference(ResourceKind::Deployment, name, deployment.metadata.generation),
            replicas: deployment.spec.and_then(|s| s.replicas).unwrap_or(1),
            ready_replicas: status.ready_replicas.unwrap_or(0),
            observed_generation: status.observed_generation,
        })
    }

    fn delete_deployment(&self, name: &str) -> Result<(), ClusterError> {
        self.delete::<Deployment>(ResourceKind::Deployment, name)
    }

    fn scale_deployment(&self, name: &str, replicas: i32) -> Result<(), ClusterError> {
        let patch = serde_json::json!({ "spec": { "replicas": replicas } });
        let params = PatchParams {
            field_manager: Some(MANAGER_NAME.to_string()),
            ..PatchParams::default()
        };
        self.block(
            self.api::<Deployment>()
                .patch_scale(name, &params, &Patch::Merge(&patch)),
        )
        .map(|_| ())
        .map_err(|e| classify("scale", ResourceKind::Deployment, name, e))
    }

    fn create_or_patch_autoscaler(
        &self,
        autoscaler: &HorizontalPodAutoscaler,
    ) -> Result<ResourceRef, ClusterError> {
        let name = object_name(&autoscaler.metadata);
        let stored = self.upsert(
            autoscaler,
            ResourceKind::HorizontalPodAutoscaler,
            &name,
            Patch::Merge(autoscaler),
        )?;
        Ok(self.reference(
            ResourceKind::HorizontalPodAutoscaler,
            &name,
            stored.metadata.generation,
        ))
    }

    fn get_autoscaler(&self, name: &str) -> Result<AutoscalerState, ClusterError> {
        let autoscaler = self
            .block(self.api::<HorizontalPodAutoscaler>().get(name))
            .map_err(|e| classify("get", ResourceKind::HorizontalPodAutoscaler, name, e))?;
        let generation = autoscaler.metadata.generation;
        let spec = autoscaler.spec.unwrap_or_default();
        Ok(AutoscalerState {
            reference: self.reference(ResourceKind::HorizontalPodAutoscaler, name, generation),
            min_replicas: spec.min_replicas.unwrap_or(1),
            max_replicas: spec.max_replicas,
            target: spec.scale_target_ref.name,
        })
    }

    fn delete_autoscaler(&self, name: &str) -> Result<(), ClusterError> {
        self.delete::<HorizontalPodAutoscaler>(ResourceKind::HorizontalPodAutoscaler, name)
    }

    fn list_pods(&self, selector: &str) -> Result<Vec<PodState>, ClusterError> {
        let pods = self
            .block(self.api::<Pod>().list(&ListParams::default().labels(selector)))
            .map_err(|e| classify("list", ResourceKind::Pod, selector, e))?;
        Ok(pods.items.into_iter().map(pod_state).collect())
    }
}

fn pod_state(pod: Pod) -> PodState {
    let status = pod.status.unwrap_or_default();
    let ready = status
        .conditions
        .unwrap_or_default()
        .iter()
        .any(|c| c.type_ == "Ready" && c.status == "True");
    PodState {
        name: pod.metadata.name.unwrap_or_default(),
        phase: status.phase.unwrap_or_else(|| "Unknown".to_string()),
        ready,
    }
}

/// Resolve `~` in a configured kubeconfig path
pub fn expand_kubeconfig(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(raw.as_ref()).as_ref())
}
