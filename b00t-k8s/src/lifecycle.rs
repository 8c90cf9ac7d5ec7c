//! Workload lifecycle manager
//!
//! Owns exactly one workload and drives it through
//! `Uninitialized → Provisioning → AwaitingReadiness → Ready → Running →
//! ShuttingDown → {Terminated | Detached | Failed}`.
//!
//! Every control-plane call goes through the [`Dispatcher`], so a blocking
//! gateway never stalls the agent's task loop. Operations on one manager
//! are serialized by an internal gate; `shutdown()` raises the cancel flag
//! before queueing on that gate so an in-flight readiness wait ends within
//! one poll interval instead of running to its deadline.

use crate::config::{AdapterConfig, RetryConfig};
use crate::dispatch::Dispatcher;
use crate::error::{
    CancelledSnafu, ClusterError, ClusterSnafu, InvalidSpecSnafu, InvalidStateSnafu,
    LifecycleError, ProvisionSnafu, ReadinessTimeoutSnafu, TeardownIncompleteSnafu,
};
use crate::gateway::{AutoscalerState, ClusterGateway, DeploymentState, PodState, ResourceRef};
use crate::manifest;
use crate::poller::{PollOutcome, ReadinessPoller, cancelled};
use crate::workload::{AutoscalePolicy, WorkloadSpec};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Uninitialized,
    Provisioning,
    AwaitingReadiness,
    Ready,
    Running,
    ShuttingDown,
    Terminated,
    Detached,
    Failed,
}

impl LifecycleState {
    /// The workload is up and may be scaled
    pub fn is_serving(self) -> bool {
        matches!(self, LifecycleState::Ready | LifecycleState::Running)
    }

    /// No further transitions happen from here
    pub fn is_final(self) -> bool {
        matches!(self, LifecycleState::Terminated | LifecycleState::Detached)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LifecycleState::Uninitialized => "Uninitialized",
            LifecycleState::Provisioning => "Provisioning",
            LifecycleState::AwaitingReadiness => "AwaitingReadiness",
            LifecycleState::Ready => "Ready",
            LifecycleState::Running => "Running",
            LifecycleState::ShuttingDown => "ShuttingDown",
            LifecycleState::Terminated => "Terminated",
            LifecycleState::Detached => "Detached",
            LifecycleState::Failed => "Failed",
        };
        f.write_str(label)
    }
}

/// What the adapter knows about the workload it manages.
///
/// Published through a watch channel; readers always get a consistent copy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkloadHandle {
    /// Unique per manager instance, not per workload
    pub instance_id: Uuid,
    pub workload_id: String,
    pub resource_name: String,
    pub namespace: String,
    pub state: LifecycleState,
    pub deployment: Option<ResourceRef>,
    pub observed_generation: Option<i64>,
    pub ready_pod: Option<PodState>,
    pub autoscaler: Option<ResourceRef>,
    /// Policy the live autoscaler was last written with
    pub autoscale: Option<AutoscalePolicy>,
    pub retain_on_shutdown: bool,
    /// Last failure, kept until the next successful transition out of `Failed`
    pub failure: Option<String>,
    pub teardown_failures: Vec<String>,
    pub provisioned_at: Option<DateTime<Utc>>,
    pub ready_at: Option<DateTime<Utc>>,
}

impl WorkloadHandle {
    fn new(spec: &WorkloadSpec) -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            workload_id: spec.workload_id(),
            resource_name: spec.resource_name(),
            namespace: spec.namespace.clone(),
            state: LifecycleState::Uninitialized,
            deployment: None,
            observed_generation: None,
            ready_pod: None,
            autoscaler: None,
            autoscale: None,
            retain_on_shutdown: spec.retain_on_shutdown,
            failure: None,
            teardown_failures: Vec::new(),
            provisioned_at: None,
            ready_at: None,
        }
    }
}

/// Handle plus what the cluster currently reports
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadStatus {
    pub handle: WorkloadHandle,
    pub deployment: Option<DeploymentState>,
    pub autoscaler: Option<AutoscalerState>,
}

/// Timing knobs shared by every manager built from one configuration
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    pub poller: ReadinessPoller,
    pub retry: RetryConfig,
}

impl LifecycleOptions {
    pub fn from_config(config: &AdapterConfig) -> Self {
        Self {
            poller: config.readiness.poller(),
            retry: config.retry.clone(),
        }
    }
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self::from_config(&AdapterConfig::default())
    }
}

/// The operations an agent drives its workload with
#[async_trait]
pub trait WorkloadLifecycle: Send + Sync {
    /// Provision the workload and block until one pod is ready
    async fn initialize(&self) -> Result<WorkloadHandle, LifecycleError>;

    /// Release (or retain) the workload; returns the final state
    async fn shutdown(&self) -> Result<LifecycleState, LifecycleError>;

    async fn scale(&self, replicas: u32) -> Result<(), LifecycleError>;

    async fn enable_autoscale(&self, policy: AutoscalePolicy) -> Result<(), LifecycleError>;

    fn state(&self) -> LifecycleState;
}

pub struct LifecycleManager<G, D> {
    spec: WorkloadSpec,
    gateway: Arc<G>,
    dispatcher: D,
    poller: ReadinessPoller,
    retry: RetryConfig,
    handle: watch::Sender<WorkloadHandle>,
    cancel: watch::Sender<bool>,
    gate: Mutex<()>,
}

impl<G, D> LifecycleManager<G, D>
where
    G: ClusterGateway,
    D: Dispatcher,
{
    pub fn new(
        spec: WorkloadSpec,
        gateway: Arc<G>,
        dispatcher: D,
        options: LifecycleOptions,
    ) -> Result<Self, LifecycleError> {
        spec.validate()?;
        Self::build(spec, gateway, dispatcher, options)
    }

    /// Manager for a workload that is only going to be reattached,
    /// observed, adjusted or released. Fields that only matter when
    /// rendering a Deployment (image, env) are not checked here;
    /// `initialize()` still checks them.
    pub fn for_existing(
        spec: WorkloadSpec,
        gateway: Arc<G>,
        dispatcher: D,
        options: LifecycleOptions,
    ) -> Result<Self, LifecycleError> {
        spec.validate_identity()?;
        Self::build(spec, gateway, dispatcher, options)
    }

    fn build(
        spec: WorkloadSpec,
        gateway: Arc<G>,
        dispatcher: D,
        options: LifecycleOptions,
    ) -> Result<Self, LifecycleError> {
        ensure!(
            spec.namespace == gateway.namespace(),
            InvalidSpecSnafu {
                reason: format!(
                    "workload namespace '{}' does not match the cluster gateway's namespace '{}'",
                    spec.namespace,
                    gateway.namespace()
                )
            }
        );
        let (handle, _) = watch::channel(WorkloadHandle::new(&spec));
        let (cancel, _) = watch::channel(false);
        Ok(Self {
            spec,
            gateway,
            dispatcher,
            poller: options.poller,
            retry: options.retry,
            handle,
            cancel,
            gate: Mutex::new(()),
        })
    }

    pub fn spec(&self) -> &WorkloadSpec {
        &self.spec
    }

    pub fn state(&self) -> LifecycleState {
        self.handle.borrow().state
    }

    /// Copy of the current handle
    pub fn snapshot(&self) -> WorkloadHandle {
        self.handle.borrow().clone()
    }

    /// Follow handle changes, e.g. to react to `Ready`
    pub fn subscribe(&self) -> watch::Receiver<WorkloadHandle> {
        self.handle.subscribe()
    }

    /// Create or adopt the Deployment (and autoscaler), then wait for the
    /// first ready pod.
    ///
    /// Returns immediately with the current handle when the workload is
    /// already `Ready` or `Running`. A reattached workload still waiting for
    /// its first ready pod is polled without provisioning again. A `Failed`
    /// workload is provisioned again.
    pub async fn initialize(&self) -> Result<WorkloadHandle, LifecycleError> {
        if let Some(handle) = self.already_initialized()? {
            return Ok(handle);
        }
        let _gate = self.gate.lock().await;
        // Another caller may have finished while this one queued
        if let Some(handle) = self.already_initialized()? {
            return Ok(handle);
        }

        // Polling only ever happens under the gate, so nobody owns this wait
        let outcome = if self.state() == LifecycleState::AwaitingReadiness {
            self.wait_until_ready().await
        } else {
            self.spec.validate()?;
            self.update(|h| {
                h.failure = None;
                h.ready_pod = None;
                h.teardown_failures.clear();
            });
            self.transition(LifecycleState::Provisioning);
            self.provision_and_wait().await
        };

        match outcome {
            Ok(handle) => Ok(handle),
            Err(err @ LifecycleError::Cancelled { .. }) => {
                // shutdown() owns the state from here
                info!(workload = %self.spec.resource_name(), "initialization cancelled");
                Err(err)
            }
            Err(err) => {
                warn!(workload = %self.spec.resource_name(), error = %err, "initialization failed");
                self.fail(&err);
                Err(err)
            }
        }
    }

    fn already_initialized(&self) -> Result<Option<WorkloadHandle>, LifecycleError> {
        let handle = self.snapshot();
        ensure!(
            !*self.cancel.borrow(),
            InvalidStateSnafu {
                operation: "initialize",
                state: handle.state
            }
        );
        match handle.state {
            LifecycleState::Ready | LifecycleState::Running => {
                debug!(workload = %handle.resource_name, state = %handle.state, "already initialized");
                Ok(Some(handle))
            }
            LifecycleState::Uninitialized
            | LifecycleState::Provisioning
            | LifecycleState::AwaitingReadiness
            | LifecycleState::Failed => Ok(None),
            state @ (LifecycleState::ShuttingDown
            | LifecycleState::Terminated
            | LifecycleState::Detached) => InvalidStateSnafu {
                operation: "initialize",
                state,
            }
            .fail(),
        }
    }

    async fn provision_and_wait(&self) -> Result<WorkloadHandle, LifecycleError> {
        let name = self.spec.resource_name();

        let deployment = manifest::deployment(&self.spec);
        let reference = self
            .provision_call("apply deployment", move |gw| {
                gw.create_or_patch_deployment(&deployment)
            })
            .await?;
        info!(workload = %name, generation = ?reference.generation, "deployment applied");
        self.update(|h| {
            h.observed_generation = reference.generation;
            h.deployment = Some(reference);
            h.provisioned_at = Some(Utc::now());
        });

        if let Some(policy) = self.spec.autoscale.clone() {
            let autoscaler = manifest::autoscaler(&self.spec, &policy);
            let reference = self
                .provision_call("apply autoscaler", move |gw| {
                    gw.create_or_patch_autoscaler(&autoscaler)
                })
                .await?;
            info!(workload = %name, min = policy.min_replicas, max = policy.max_replicas, "autoscaler applied");
            self.update(|h| {
                h.autoscaler = Some(reference);
                h.autoscale = Some(policy);
            });
        }

        self.transition(LifecycleState::AwaitingReadiness);
        self.wait_until_ready().await
    }

    async fn wait_until_ready(&self) -> Result<WorkloadHandle, LifecycleError> {
        let name = self.spec.resource_name();
        let outcome = self
            .poller
            .wait_for_ready(
                &self.gateway,
                &self.dispatcher,
                &self.spec.selector(),
                self.cancel.subscribe(),
            )
            .await
            .context(ProvisionSnafu {
                step: "wait for readiness",
                name: name.clone(),
            })?;

        match outcome {
            PollOutcome::Ready(pod) => {
                info!(workload = %name, pod = %pod.name, "workload ready");
                self.update(|h| {
                    h.ready_pod = Some(pod);
                    h.ready_at = Some(Utc::now());
                });
                self.transition(LifecycleState::Ready);
                Ok(self.snapshot())
            }
            PollOutcome::TimedOut { waited } => ReadinessTimeoutSnafu { name, waited }.fail(),
            PollOutcome::Cancelled => CancelledSnafu { name }.fail(),
        }
    }

    /// Release the workload.
    ///
    /// Cancels any in-flight initialization, then deletes the autoscaler and
    /// the Deployment in that order, unless `retain_on_shutdown` is set. Resources
    /// that are already gone count as released. Calling it again after it
    /// completed returns the same final state.
    pub async fn shutdown(&self) -> Result<LifecycleState, LifecycleError> {
        match self.state() {
            LifecycleState::Uninitialized => {
                return InvalidStateSnafu {
                    operation: "shut down",
                    state: LifecycleState::Uninitialized,
                }
                .fail();
            }
            state if state.is_final() => return Ok(state),
            _ => {}
        }

        self.cancel.send_replace(true);
        let _gate = self.gate.lock().await;
        let state = self.state();
        if state.is_final() {
            return Ok(state);
        }

        let name = self.spec.resource_name();
        self.transition(LifecycleState::ShuttingDown);

        if self.spec.retain_on_shutdown {
            info!(workload = %name, "retain_on_shutdown set, leaving workload in place");
            self.transition(LifecycleState::Detached);
            return Ok(LifecycleState::Detached);
        }

        let mut failures = Vec::new();

        // Autoscaler first so it cannot scale a Deployment that is going away
        let autoscaled = self.snapshot().autoscaler.is_some() || self.spec.autoscale.is_some();
        if autoscaled {
            let target = name.clone();
            if let Some(failure) = self
                .teardown_call("delete autoscaler", move |gw| gw.delete_autoscaler(&target))
                .await
            {
                failures.push(failure);
            }
        }

        let target = name.clone();
        if let Some(failure) = self
            .teardown_call("delete deployment", move |gw| gw.delete_deployment(&target))
            .await
        {
            failures.push(failure);
        }

        if failures.is_empty() {
            self.update(|h| {
                h.deployment = None;
                h.autoscaler = None;
                h.autoscale = None;
                h.ready_pod = None;
                h.teardown_failures.clear();
            });
            self.transition(LifecycleState::Terminated);
            return Ok(LifecycleState::Terminated);
        }

        let err = TeardownIncompleteSnafu {
            name,
            failures: failures.clone(),
        }
        .build();
        self.update(|h| h.teardown_failures = failures);
        self.fail(&err);
        Err(err)
    }

    /// Note that the agent has started using the workload
    pub fn mark_running(&self) -> Result<WorkloadHandle, LifecycleError> {
        let state = self.state();
        ensure!(
            state.is_serving(),
            InvalidStateSnafu {
                operation: "mark running",
                state
            }
        );
        if state == LifecycleState::Ready {
            self.transition(LifecycleState::Running);
        }
        Ok(self.snapshot())
    }

    /// Set the Deployment's replica count through the scale subresource.
    ///
    /// With an autoscaler attached the count only holds until the autoscaler
    /// next reconciles.
    pub async fn scale(&self, replicas: u32) -> Result<(), LifecycleError> {
        let _gate = self.gate.lock().await;
        self.require_serving("scale")?;
        let count = i32::try_from(replicas).map_err(|_| {
            InvalidSpecSnafu {
                reason: format!("replica count {replicas} is out of range"),
            }
            .build()
        })?;

        let name = self.spec.resource_name();
        if self.snapshot().autoscaler.is_some() {
            info!(workload = %name, replicas, "autoscaler attached, it may revise this replica count");
        }

        let target = name.clone();
        self.dispatch(move |gw| gw.scale_deployment(&target, count))
            .await
            .context(ClusterSnafu { operation: "scale" })?;
        info!(workload = %name, replicas, "deployment scaled");
        Ok(())
    }

    /// Attach (or update) a HorizontalPodAutoscaler targeting the Deployment
    pub async fn enable_autoscale(&self, policy: AutoscalePolicy) -> Result<(), LifecycleError> {
        policy.validate()?;
        let _gate = self.gate.lock().await;
        self.require_serving("enable autoscaling")?;

        let autoscaler = manifest::autoscaler(&self.spec, &policy);
        let reference = self
            .dispatch(move |gw| gw.create_or_patch_autoscaler(&autoscaler))
            .await
            .context(ClusterSnafu {
                operation: "enable autoscaling",
            })?;
        info!(
            workload = %self.spec.resource_name(),
            min = policy.min_replicas,
            max = policy.max_replicas,
            target = policy.target_utilization,
            "autoscaling enabled"
        );
        self.update(|h| {
            h.autoscaler = Some(reference);
            h.autoscale = Some(policy);
        });
        Ok(())
    }

    /// Remove the autoscaler, leaving the replica count where it is
    pub async fn disable_autoscale(&self) -> Result<(), LifecycleError> {
        let _gate = self.gate.lock().await;
        self.require_serving("disable autoscaling")?;

        let name = self.spec.resource_name();
        let target = name.clone();
        match self.dispatch(move |gw| gw.delete_autoscaler(&target)).await {
            Ok(()) => info!(workload = %name, "autoscaling disabled"),
            Err(err) if err.is_not_found() => debug!(workload = %name, "no autoscaler to remove"),
            Err(err) => {
                return Err(err).context(ClusterSnafu {
                    operation: "disable autoscaling",
                });
            }
        }
        self.update(|h| {
            h.autoscaler = None;
            h.autoscale = None;
        });
        Ok(())
    }

    /// Adopt a workload provisioned earlier, e.g. by a previous process.
    ///
    /// Only valid on a fresh manager. The Deployment must exist; the
    /// workload becomes `Ready` when a ready pod is listed right away and
    /// `AwaitingReadiness` otherwise.
    pub async fn reattach(&self) -> Result<WorkloadHandle, LifecycleError> {
        let _gate = self.gate.lock().await;
        let state = self.state();
        ensure!(
            state == LifecycleState::Uninitialized,
            InvalidStateSnafu {
                operation: "reattach",
                state
            }
        );

        let name = self.spec.resource_name();
        let target = name.clone();
        let deployment = self
            .dispatch(move |gw| gw.get_deployment(&target))
            .await
            .context(ClusterSnafu {
                operation: "reattach",
            })?;
        let target = name.clone();
        let autoscaler = found(self.dispatch(move |gw| gw.get_autoscaler(&target)).await)
            .context(ClusterSnafu {
                operation: "reattach",
            })?;
        let selector = self.spec.selector();
        let pods = self
            .dispatch(move |gw| gw.list_pods(&selector))
            .await
            .context(ClusterSnafu {
                operation: "reattach",
            })?;
        let ready_pod = pods.into_iter().find(|p| p.ready);

        let now = Utc::now();
        let is_ready = ready_pod.is_some();
        self.update(|h| {
            h.deployment = Some(deployment.reference);
            h.observed_generation = deployment.observed_generation;
            h.autoscaler = autoscaler.map(|a| a.reference);
            h.autoscale = self.spec.autoscale.clone().filter(|_| h.autoscaler.is_some());
            h.ready_at = ready_pod.as_ref().map(|_| now);
            h.ready_pod = ready_pod;
        });
        info!(workload = %name, ready = is_ready, "reattached to existing workload");
        self.transition(if is_ready {
            LifecycleState::Ready
        } else {
            LifecycleState::AwaitingReadiness
        });
        Ok(self.snapshot())
    }

    /// Read the live Deployment and autoscaler. Valid in any state.
    pub async fn observe(&self) -> Result<WorkloadStatus, LifecycleError> {
        let name = self.spec.resource_name();

        let target = name.clone();
        let deployment = found(self.dispatch(move |gw| gw.get_deployment(&target)).await)
            .context(ClusterSnafu {
                operation: "observe",
            })?;
        let target = name;
        let autoscaler = found(self.dispatch(move |gw| gw.get_autoscaler(&target)).await)
            .context(ClusterSnafu {
                operation: "observe",
            })?;

        if let Some(observed) = deployment.as_ref().and_then(|d| d.observed_generation) {
            self.update(|h| h.observed_generation = Some(observed));
        }
        Ok(WorkloadStatus {
            handle: self.snapshot(),
            deployment,
            autoscaler,
        })
    }

    fn require_serving(&self, operation: &'static str) -> Result<(), LifecycleError> {
        let state = self.state();
        ensure!(state.is_serving(), InvalidStateSnafu { operation, state });
        Ok(())
    }

    fn update(&self, change: impl FnOnce(&mut WorkloadHandle)) {
        self.handle.send_modify(change);
    }

    fn transition(&self, to: LifecycleState) {
        let mut from = to;
        self.handle.send_modify(|h| {
            from = h.state;
            h.state = to;
        });
        info!(workload = %self.spec.resource_name(), %from, %to, "lifecycle transition");
    }

    fn fail(&self, err: &LifecycleError) {
        let message = err.to_string();
        self.update(|h| h.failure = Some(message));
        self.transition(LifecycleState::Failed);
    }

    async fn dispatch<T, F>(&self, op: F) -> Result<T, ClusterError>
    where
        T: Send + 'static,
        F: FnOnce(&G) -> Result<T, ClusterError> + Send + 'static,
    {
        let gateway = Arc::clone(&self.gateway);
        self.dispatcher.run(move || op(&gateway)).await
    }

    /// One provisioning call with bounded retry of transient failures.
    /// The backoff pause ends early when shutdown starts.
    async fn provision_call<T, F>(&self, step: &'static str, op: F) -> Result<T, LifecycleError>
    where
        T: Send + 'static,
        F: Fn(&G) -> Result<T, ClusterError> + Send + Sync + 'static,
    {
        let op = Arc::new(op);
        let name = self.spec.resource_name();
        let mut attempt: u32 = 1;
        loop {
            let call = Arc::clone(&op);
            match self.dispatch(move |gw| (*call)(gw)).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(workload = %name, step, attempt, ?delay, error = %err, "transient failure, retrying");
                    tokio::select! {
                        () = cancelled(self.cancel.subscribe()) => {
                            return CancelledSnafu { name }.fail();
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err).context(ProvisionSnafu { step, name }),
            }
        }
    }

    /// `None` when the delete succeeded or the object was already gone
    async fn teardown_call<F>(&self, step: &'static str, op: F) -> Option<String>
    where
        F: FnOnce(&G) -> Result<(), ClusterError> + Send + 'static,
    {
        let name = self.spec.resource_name();
        match self.dispatch(op).await {
            Ok(()) => {
                info!(workload = %name, step, "released");
                None
            }
            Err(err) if err.is_not_found() => {
                debug!(workload = %name, step, "already gone");
                None
            }
            Err(err) => {
                warn!(workload = %name, step, error = %err, "teardown step failed");
                Some(format!("{step}: {err}"))
            }
        }
    }
}

#[async_trait]
impl<G, D> WorkloadLifecycle for LifecycleManager<G, D>
where
    G: ClusterGateway,
    D: Dispatcher,
{
    async fn initialize(&self) -> Result<WorkloadHandle, LifecycleError> {
        LifecycleManager::initialize(self).await
    }

    async fn shutdown(&self) -> Result<LifecycleState, LifecycleError> {
        LifecycleManager::shutdown(self).await
    }

    async fn scale(&self, replicas: u32) -> Result<(), LifecycleError> {
        LifecycleManager::scale(self, replicas).await
    }

    async fn enable_autoscale(&self, policy: AutoscalePolicy) -> Result<(), LifecycleError> {
        LifecycleManager::enable_autoscale(self, policy).await
    }

    fn state(&self) -> LifecycleState {
        LifecycleManager::state(self)
    }
}

/// Turn `NotFound` into `None`
fn found<T>(result: Result<T, ClusterError>) -> Result<Option<T>, ClusterError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}
