//! Renders cluster objects from a [`WorkloadSpec`]
//!
//! Both objects carry the same derived name, so re-rendering after a restart
//! targets the objects created before it.

use crate::workload::{AutoscalePolicy, ResourceLimits, WorkloadSpec};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec,
    MetricSpec, MetricTarget, ResourceMetricSource,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use std::collections::BTreeMap;

fn object_meta(spec: &WorkloadSpec) -> ObjectMeta {
    ObjectMeta {
        name: Some(spec.resource_name()),
        namespace: Some(spec.namespace.clone()),
        labels: Some(spec.selector_labels()),
        ..ObjectMeta::default()
    }
}

fn quantities(values: &BTreeMap<String, String>) -> Option<BTreeMap<String, Quantity>> {
    if values.is_empty() {
        return None;
    }
    Some(
        values
            .iter()
            .map(|(k, v)| (k.clone(), Quantity(v.clone())))
            .collect(),
    )
}

fn resource_requirements(resources: &ResourceLimits) -> Option<ResourceRequirements> {
    if resources.is_empty() {
        return None;
    }
    Some(ResourceRequirements {
        requests: quantities(&resources.requests),
        limits: quantities(&resources.limits),
        ..ResourceRequirements::default()
    })
}

/// Deployment running `spec.replicas` copies of the agent container
pub fn deployment(spec: &WorkloadSpec) -> Deployment {
    let env = spec
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..EnvVar::default()
        })
        .collect::<Vec<_>>();

    let container = Container {
        name: spec.resource_name(),
        image: Some(spec.image.clone()),
        env: (!env.is_empty()).then_some(env),
        ports: spec.container_port.map(|port| {
            vec![ContainerPort {
                container_port: i32::from(port),
                ..ContainerPort::default()
            }]
        }),
        resources: resource_requirements(&spec.resources),
        ..Container::default()
    };

    let template = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(spec.pod_labels()),
            ..ObjectMeta::default()
        }),
        spec: Some(PodSpec {
            containers: vec![container],
            restart_policy: Some("Always".to_string()),
            ..PodSpec::default()
        }),
    };

    Deployment {
        metadata: object_meta(spec),
        spec: Some(DeploymentSpec {
            // Validation keeps replicas within i32
            replicas: Some(i32::try_from(spec.replicas).unwrap_or(i32::MAX)),
            selector: LabelSelector {
                match_labels: Some(spec.selector_labels()),
                ..LabelSelector::default()
            },
            template,
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    }
}

/// Autoscaler bound to the workload's Deployment
pub fn autoscaler(spec: &WorkloadSpec, policy: &AutoscalePolicy) -> HorizontalPodAutoscaler {
    let metric = MetricSpec {
        type_: "Resource".to_string(),
        resource: Some(ResourceMetricSource {
            name: policy.metric.resource_name().to_string(),
            target: MetricTarget {
                type_: "Utilization".to_string(),
                average_utilization: i32::try_from(policy.target_utilization).ok(),
                ..MetricTarget::default()
            },
        }),
        ..MetricSpec::default()
    };

    HorizontalPodAutoscaler {
        metadata: object_meta(spec),
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".to_string()),
                kind: "Deployment".to_string(),
                name: spec.resource_name(),
            },
            min_replicas: i32::try_from(policy.min_replicas).ok(),
            max_replicas: i32::try_from(policy.max_replicas).unwrap_or(i32::MAX),
            metrics: Some(vec![metric]),
            ..HorizontalPodAutoscalerSpec::default()
        }),
        ..HorizontalPodAutoscaler::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::ScaleMetric;

    fn demo_spec() -> WorkloadSpec {
        WorkloadSpec::new("demo", "app:v1")
            .with_namespace("demo")
            .with_env("EXAMPLE_VAR", "value")
            .with_container_port(8080)
            .with_label("tier", "agent")
    }

    #[test]
    fn test_deployment_shape() {
        let spec = demo_spec();
        let deployment = deployment(&spec);

        assert_eq!(deployment.metadata.name.as_deref(), Some("b00t-agent-demo"));
        assert_eq!(deployment.metadata.namespace.as_deref(), Some("demo"));

        let dspec = deployment.spec.expect("deployment spec");
        assert_eq!(dspec.replicas, Some(1));
        assert_eq!(dspec.selector.match_labels, Some(spec.selector_labels()));

        let template_labels = dspec.template.metadata.and_then(|m| m.labels).unwrap();
        assert_eq!(template_labels.get("tier").map(String::as_str), Some("agent"));
        for (k, v) in spec.selector_labels() {
            assert_eq!(template_labels.get(&k), Some(&v));
        }

        let pod = dspec.template.spec.expect("pod spec");
        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some("app:v1"));
        assert_eq!(container.env.as_ref().map(Vec::len), Some(1));
        assert_eq!(
            container.ports.as_ref().map(|p| p[0].container_port),
            Some(8080)
        );
        assert!(container.resources.is_none());
    }

    #[test]
    fn test_deployment_resources() {
        let mut resources = ResourceLimits::default();
        resources.requests.insert("cpu".to_string(), "250m".to_string());
        resources.limits.insert("memory".to_string(), "512Mi".to_string());
        let spec = demo_spec().with_resources(resources);

        let pod = deployment(&spec).spec.unwrap().template.spec.unwrap();
        let requirements = pod.containers[0].resources.clone().expect("resources");
        assert_eq!(
            requirements.requests.unwrap().get("cpu"),
            Some(&Quantity("250m".to_string()))
        );
        assert_eq!(
            requirements.limits.unwrap().get("memory"),
            Some(&Quantity("512Mi".to_string()))
        );
    }

    #[test]
    fn test_autoscaler_targets_deployment() {
        let spec = demo_spec();
        let policy = AutoscalePolicy::new(1, 3, 70).with_metric(ScaleMetric::Memory);
        let hpa = autoscaler(&spec, &policy);

        assert_eq!(hpa.metadata.name.as_deref(), Some("b00t-agent-demo"));
        let hspec = hpa.spec.expect("hpa spec");
        assert_eq!(hspec.scale_target_ref.kind, "Deployment");
        assert_eq!(hspec.scale_target_ref.name, "b00t-agent-demo");
        assert_eq!(hspec.min_replicas, Some(1));
        assert_eq!(hspec.max_replicas, 3);

        let metric = &hspec.metrics.unwrap()[0];
        let resource = metric.resource.as_ref().unwrap();
        assert_eq!(resource.name, "memory");
        assert_eq!(resource.target.average_utilization, Some(70));
    }
}
