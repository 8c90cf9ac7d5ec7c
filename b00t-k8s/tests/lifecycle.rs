//! End-to-end lifecycle behaviour against the simulated cluster

use b00t_k8s::config::RetryConfig;
use b00t_k8s::gateway::ClusterGateway;
use b00t_k8s::gateway::memory::{Fault, Operation, PodReadiness};
use b00t_k8s::{
    AutoscalePolicy, ClusterError, InMemoryCluster, InlineDispatcher, LifecycleError,
    LifecycleManager, LifecycleOptions, LifecycleState, ReadinessPoller, WorkloadLifecycle,
    WorkloadSpec,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

type Manager = LifecycleManager<InMemoryCluster, InlineDispatcher>;

fn options(interval: Duration, timeout: Duration) -> LifecycleOptions {
    LifecycleOptions {
        poller: ReadinessPoller::new(interval, timeout),
        retry: RetryConfig {
            max_attempts: 4,
            initial_delay_ms: 5,
            max_delay_ms: 20,
            backoff_factor: 2.0,
        },
    }
}

fn fast() -> LifecycleOptions {
    options(Duration::from_millis(10), Duration::from_secs(5))
}

fn demo() -> WorkloadSpec {
    WorkloadSpec::new("demo", "app:v1")
        .with_namespace("demo")
        .with_replicas(1)
}

fn cluster(readiness: PodReadiness) -> Arc<InMemoryCluster> {
    Arc::new(InMemoryCluster::new("demo").with_pod_readiness(readiness))
}

fn manager(cluster: &Arc<InMemoryCluster>, spec: WorkloadSpec, options: LifecycleOptions) -> Manager {
    LifecycleManager::new(spec, Arc::clone(cluster), InlineDispatcher, options).unwrap()
}

fn position(cluster: &InMemoryCluster, operation: Operation) -> usize {
    cluster
        .calls()
        .iter()
        .position(|c| c.operation == operation)
        .unwrap_or_else(|| panic!("{operation:?} was never called"))
}

#[tokio::test]
async fn test_ready_after_two_polls_then_terminated() {
    let cluster = cluster(PodReadiness::AfterPolls(2));
    let mgr = manager(&cluster, demo(), fast());

    let handle = mgr.initialize().await.unwrap();

    assert_eq!(handle.state, LifecycleState::Ready);
    assert_eq!(handle.resource_name, "b00t-agent-demo");
    assert_eq!(handle.deployment.as_ref().unwrap().name, "b00t-agent-demo");
    assert_eq!(handle.ready_pod.as_ref().unwrap().name, "b00t-agent-demo-0");
    assert_eq!(cluster.count(Operation::ListPods), 2);
    assert_eq!(cluster.deployment_names(), vec!["b00t-agent-demo".to_string()]);

    assert_eq!(mgr.shutdown().await.unwrap(), LifecycleState::Terminated);
    assert!(cluster.deployment_names().is_empty());
    assert_eq!(mgr.state(), LifecycleState::Terminated);
}

#[tokio::test]
async fn test_autoscaler_created_and_deleted_first() {
    let cluster = cluster(PodReadiness::AfterPolls(2));
    let spec = demo().with_autoscale(AutoscalePolicy::new(1, 3, 70));
    let mgr = manager(&cluster, spec, fast());

    let handle = mgr.initialize().await.unwrap();
    assert_eq!(handle.state, LifecycleState::Ready);
    assert_eq!(cluster.autoscaler_names(), vec!["b00t-agent-demo".to_string()]);
    let hpa = cluster.autoscaler("b00t-agent-demo").unwrap();
    let hpa_spec = hpa.spec.unwrap();
    assert_eq!(hpa_spec.scale_target_ref.name, "b00t-agent-demo");
    assert_eq!(hpa_spec.scale_target_ref.kind, "Deployment");
    assert_eq!(hpa_spec.min_replicas, Some(1));
    assert_eq!(hpa_spec.max_replicas, 3);

    assert_eq!(mgr.shutdown().await.unwrap(), LifecycleState::Terminated);
    assert!(cluster.autoscaler_names().is_empty());
    assert!(cluster.deployment_names().is_empty());
    assert!(
        position(&cluster, Operation::DeleteAutoscaler)
            < position(&cluster, Operation::DeleteDeployment)
    );
}

#[tokio::test]
async fn test_retain_on_shutdown_detaches() {
    let cluster = cluster(PodReadiness::AfterPolls(1));
    let spec = demo()
        .with_autoscale(AutoscalePolicy::new(1, 3, 70))
        .with_retain_on_shutdown(true);
    let mgr = manager(&cluster, spec, fast());

    mgr.initialize().await.unwrap();
    assert_eq!(mgr.shutdown().await.unwrap(), LifecycleState::Detached);

    assert_eq!(mgr.state(), LifecycleState::Detached);
    assert_eq!(cluster.deployment_names().len(), 1);
    assert_eq!(cluster.autoscaler_names().len(), 1);
    assert_eq!(cluster.count(Operation::DeleteDeployment), 0);
    assert_eq!(cluster.count(Operation::DeleteAutoscaler), 0);
}

#[tokio::test]
async fn test_initialize_is_idempotent() {
    let cluster = cluster(PodReadiness::AfterPolls(1));
    let first = manager(&cluster, demo(), fast());

    let a = first.initialize().await.unwrap();
    let b = first.initialize().await.unwrap();
    assert_eq!(a, b);
    assert_eq!(cluster.count(Operation::CreateDeployment), 1);

    // A second manager for the same spec patches rather than duplicates
    let second = manager(&cluster, demo(), fast());
    let c = second.initialize().await.unwrap();
    assert_eq!(cluster.deployment_names().len(), 1);
    assert_eq!(cluster.count(Operation::PatchDeployment), 1);
    let (first_ref, second_ref) = (a.deployment.unwrap(), c.deployment.unwrap());
    assert_eq!(first_ref.name, second_ref.name);
    assert_eq!(first_ref.namespace, second_ref.namespace);
    assert_eq!(second_ref.generation, Some(2));
    assert_eq!(a.workload_id, c.workload_id);
}

#[tokio::test]
async fn test_readiness_timeout_fails_and_keeps_resources() {
    let cluster = cluster(PodReadiness::Never);
    let mgr = manager(
        &cluster,
        demo(),
        options(Duration::from_millis(10), Duration::from_millis(100)),
    );

    let err = mgr.initialize().await.unwrap_err();

    assert!(matches!(err, LifecycleError::ReadinessTimeout { .. }));
    let handle = mgr.snapshot();
    assert_eq!(handle.state, LifecycleState::Failed);
    assert!(handle.ready_pod.is_none());
    assert!(handle.ready_at.is_none());
    assert!(handle.failure.unwrap().contains("no ready pod"));
    assert_eq!(cluster.deployment_names().len(), 1);

    // A failed workload can still be released
    assert_eq!(mgr.shutdown().await.unwrap(), LifecycleState::Terminated);
    assert!(cluster.deployment_names().is_empty());
}

#[tokio::test]
async fn test_shutdown_cancels_readiness_wait() {
    let interval = Duration::from_millis(500);
    let cluster = cluster(PodReadiness::Never);
    let mgr = Arc::new(manager(&cluster, demo(), options(interval, Duration::from_secs(30))));

    let mut rx = mgr.subscribe();
    let init = tokio::spawn({
        let mgr = Arc::clone(&mgr);
        async move { mgr.initialize().await }
    });
    rx.wait_for(|h| h.state == LifecycleState::AwaitingReadiness)
        .await
        .unwrap();

    let started = Instant::now();
    assert_eq!(mgr.shutdown().await.unwrap(), LifecycleState::Terminated);
    assert!(started.elapsed() < interval);

    let result = init.await.unwrap();
    assert!(matches!(result, Err(LifecycleError::Cancelled { .. })));
    assert!(mgr.snapshot().ready_at.is_none());
    assert!(cluster.deployment_names().is_empty());
    // No listing happens after shutdown completes
    let listings = cluster.count(Operation::ListPods);
    tokio::time::sleep(interval * 2).await;
    assert_eq!(cluster.count(Operation::ListPods), listings);
}

#[tokio::test]
async fn test_shutdown_cancels_provisioning_backoff() {
    let cluster = cluster(PodReadiness::AfterPolls(1));
    for _ in 0..3 {
        cluster.inject_fault(Operation::CreateDeployment, Fault::Unavailable);
    }
    let mut slow = fast();
    slow.retry.initial_delay_ms = 10_000;
    slow.retry.max_delay_ms = 10_000;
    let mgr = Arc::new(manager(&cluster, demo(), slow));

    let mut rx = mgr.subscribe();
    let init = tokio::spawn({
        let mgr = Arc::clone(&mgr);
        async move { mgr.initialize().await }
    });
    rx.wait_for(|h| h.state == LifecycleState::Provisioning)
        .await
        .unwrap();

    let started = Instant::now();
    assert_eq!(mgr.shutdown().await.unwrap(), LifecycleState::Terminated);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(matches!(
        init.await.unwrap(),
        Err(LifecycleError::Cancelled { .. })
    ));
    assert_eq!(cluster.count(Operation::CreateDeployment), 1);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let cluster = cluster(PodReadiness::AfterPolls(1));
    cluster.inject_fault(Operation::CreateDeployment, Fault::Unavailable);
    cluster.inject_fault(Operation::CreateDeployment, Fault::Unavailable);
    let mgr = manager(&cluster, demo(), fast());

    let handle = mgr.initialize().await.unwrap();
    assert_eq!(handle.state, LifecycleState::Ready);
    assert_eq!(cluster.count(Operation::CreateDeployment), 3);
}

#[tokio::test]
async fn test_forbidden_is_not_retried() {
    let cluster = cluster(PodReadiness::AfterPolls(1));
    cluster.inject_fault(Operation::CreateDeployment, Fault::Forbidden);
    let mgr = manager(&cluster, demo(), fast());

    let err = mgr.initialize().await.unwrap_err();
    assert!(err.cluster_error().is_some_and(ClusterError::is_forbidden));
    assert_eq!(cluster.count(Operation::CreateDeployment), 1);
    assert_eq!(mgr.state(), LifecycleState::Failed);
}

#[tokio::test]
async fn test_forbidden_during_polling_fails() {
    let cluster = cluster(PodReadiness::Never);
    cluster.inject_fault(Operation::ListPods, Fault::Forbidden);
    let mgr = manager(&cluster, demo(), fast());

    let err = mgr.initialize().await.unwrap_err();
    assert!(err.cluster_error().is_some_and(ClusterError::is_forbidden));
    assert_eq!(mgr.state(), LifecycleState::Failed);
}

#[tokio::test]
async fn test_teardown_tolerates_missing_resources() {
    let cluster = cluster(PodReadiness::AfterPolls(1));
    let mgr = manager(&cluster, demo(), fast());
    mgr.initialize().await.unwrap();

    // Someone else removed it first
    cluster.delete_deployment("b00t-agent-demo").unwrap();

    assert_eq!(mgr.shutdown().await.unwrap(), LifecycleState::Terminated);
    assert!(mgr.snapshot().teardown_failures.is_empty());
}

#[tokio::test]
async fn test_teardown_failure_is_recorded_and_retryable() {
    let cluster = cluster(PodReadiness::AfterPolls(1));
    let mgr = manager(&cluster, demo(), fast());
    mgr.initialize().await.unwrap();
    cluster.inject_fault(Operation::DeleteDeployment, Fault::Unavailable);

    let err = mgr.shutdown().await.unwrap_err();
    assert!(matches!(err, LifecycleError::TeardownIncomplete { ref failures, .. } if failures.len() == 1));
    let handle = mgr.snapshot();
    assert_eq!(handle.state, LifecycleState::Failed);
    assert_eq!(handle.teardown_failures.len(), 1);
    assert_eq!(cluster.deployment_names().len(), 1);

    assert_eq!(mgr.shutdown().await.unwrap(), LifecycleState::Terminated);
    assert!(cluster.deployment_names().is_empty());
}

#[tokio::test]
async fn test_scale_and_autoscale_controls() {
    let cluster = cluster(PodReadiness::AfterPolls(1));
    let mgr = manager(&cluster, demo(), fast());
    mgr.initialize().await.unwrap();
    mgr.mark_running().unwrap();

    mgr.scale(3).await.unwrap();
    let replicas = cluster
        .deployment("b00t-agent-demo")
        .and_then(|d| d.spec)
        .and_then(|s| s.replicas);
    assert_eq!(replicas, Some(3));

    let invalid = mgr.enable_autoscale(AutoscalePolicy::new(3, 1, 70)).await;
    assert!(matches!(invalid, Err(LifecycleError::InvalidSpec { .. })));
    assert!(cluster.autoscaler_names().is_empty());

    mgr.enable_autoscale(AutoscalePolicy::new(2, 5, 60)).await.unwrap();
    assert_eq!(cluster.autoscaler_names().len(), 1);
    assert_eq!(mgr.snapshot().autoscale.unwrap().max_replicas, 5);
    // Manual scaling still goes through with an autoscaler attached
    mgr.scale(4).await.unwrap();

    mgr.disable_autoscale().await.unwrap();
    assert!(cluster.autoscaler_names().is_empty());
    assert!(mgr.snapshot().autoscaler.is_none());
    mgr.disable_autoscale().await.unwrap();

    assert_eq!(mgr.state(), LifecycleState::Running);
    assert_eq!(mgr.shutdown().await.unwrap(), LifecycleState::Terminated);
}

#[tokio::test]
async fn test_usable_through_capability_trait() {
    let cluster = cluster(PodReadiness::AfterPolls(2));
    let lifecycle: Arc<dyn WorkloadLifecycle> = Arc::new(manager(&cluster, demo(), fast()));

    assert_eq!(lifecycle.state(), LifecycleState::Uninitialized);
    lifecycle.initialize().await.unwrap();
    lifecycle.scale(2).await.unwrap();
    lifecycle
        .enable_autoscale(AutoscalePolicy::new(1, 3, 70))
        .await
        .unwrap();
    assert_eq!(lifecycle.shutdown().await.unwrap(), LifecycleState::Terminated);
    assert!(cluster.deployment_names().is_empty());
    assert!(cluster.autoscaler_names().is_empty());
}
