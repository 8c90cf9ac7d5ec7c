//! Workload descriptor supplied by the agent
//!
//! A [`WorkloadSpec`] is immutable once handed to the lifecycle manager. Every
//! cluster-facing name and label is derived from it deterministically, so a
//! restarted agent finds the same Deployment again.

use crate::error::{InvalidSpecSnafu, LifecycleError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snafu::ensure;
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Label carrying the derived resource name
pub const NAME_LABEL: &str = "app.kubernetes.io/name";
/// Label marking objects owned by this adapter
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Label carrying the stable workload identifier
pub const WORKLOAD_ID_LABEL: &str = "b00t.dev/workload-id";
/// Value of [`MANAGED_BY_LABEL`] and the server-side field manager name
pub const MANAGER_NAME: &str = "b00t-k8s";

pub const DEFAULT_NAME_PREFIX: &str = "b00t-agent";

// DNS-1123 label: what Kubernetes accepts for names and namespaces
static DNS_LABEL: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]{0,61}[a-z0-9])?$").ok());

static ENV_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok());

/// Check a string against the DNS-1123 label rules
pub fn is_dns_label(value: &str) -> bool {
    DNS_LABEL.as_ref().is_some_and(|re| re.is_match(value))
}

fn is_env_name(value: &str) -> bool {
    ENV_NAME.as_ref().is_some_and(|re| re.is_match(value))
}

/// Resource metric the autoscaler tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleMetric {
    #[default]
    Cpu,
    Memory,
}

impl ScaleMetric {
    /// Resource name as the autoscaling API spells it
    pub fn resource_name(self) -> &'static str {
        match self {
            ScaleMetric::Cpu => "cpu",
            ScaleMetric::Memory => "memory",
        }
    }
}

/// Horizontal autoscaling bounds and target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoscalePolicy {
    pub min_replicas: u32,
    pub max_replicas: u32,
    /// Average utilization percentage across pods (1-100)
    pub target_utilization: u32,
    #[serde(default)]
    pub metric: ScaleMetric,
}

impl AutoscalePolicy {
    pub fn new(min_replicas: u32, max_replicas: u32, target_utilization: u32) -> Self {
        Self {
            min_replicas,
            max_replicas,
            target_utilization,
            metric: ScaleMetric::Cpu,
        }
    }

    pub fn with_metric(mut self, metric: ScaleMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn validate(&self) -> Result<(), LifecycleError> {
        ensure!(
            self.min_replicas >= 1,
            InvalidSpecSnafu {
                reason: "autoscale min_replicas must be at least 1"
            }
        );
        ensure!(
            self.max_replicas >= self.min_replicas,
            InvalidSpecSnafu {
                reason: format!(
                    "autoscale max_replicas ({}) is below min_replicas ({})",
                    self.max_replicas, self.min_replicas
                )
            }
        );
        ensure!(
            i32::try_from(self.max_replicas).is_ok(),
            InvalidSpecSnafu {
                reason: "autoscale max_replicas is out of range"
            }
        );
        ensure!(
            (1..=100).contains(&self.target_utilization),
            InvalidSpecSnafu {
                reason: format!(
                    "autoscale target_utilization must be 1-100, got {}",
                    self.target_utilization
                )
            }
        );
        Ok(())
    }
}

/// Container resource requests and limits, as Kubernetes quantity strings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

impl ResourceLimits {
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.limits.is_empty()
    }
}

/// Explicit defaults applied when building a spec from configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadDefaults {
    pub image: Option<String>,
    pub replicas: u32,
    pub retain_on_shutdown: bool,
    pub container_port: Option<u16>,
    pub autoscale: Option<AutoscalePolicy>,
    pub resources: ResourceLimits,
    pub env: BTreeMap<String, String>,
}

impl Default for WorkloadDefaults {
    fn default() -> Self {
        Self {
            image: None,
            replicas: 1,
            retain_on_shutdown: false,
            container_port: None,
            autoscale: None,
            resources: ResourceLimits::default(),
            env: BTreeMap::new(),
        }
    }
}

/// Immutable description of one logical workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub replicas: u32,
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default)]
    pub autoscale: Option<AutoscalePolicy>,
    /// Leave cluster resources running when the adapter shuts down
    #[serde(default)]
    pub retain_on_shutdown: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub container_port: Option<u16>,
    /// Added to pod template labels; never part of the selector
    #[serde(default)]
    pub extra_labels: BTreeMap<String, String>,
    pub name_prefix: String,
}

impl WorkloadSpec {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: "default".to_string(),
            image: image.into(),
            replicas: 1,
            resources: ResourceLimits::default(),
            autoscale: None,
            retain_on_shutdown: false,
            env: BTreeMap::new(),
            container_port: None,
            extra_labels: BTreeMap::new(),
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
        }
    }

    /// Build a spec from configured defaults. The image must come from
    /// either the defaults or a later `with_image` call.
    pub fn from_defaults(
        name: impl Into<String>,
        namespace: impl Into<String>,
        defaults: &WorkloadDefaults,
    ) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            image: defaults.image.clone().unwrap_or_default(),
            replicas: defaults.replicas,
            resources: defaults.resources.clone(),
            autoscale: defaults.autoscale.clone(),
            retain_on_shutdown: defaults.retain_on_shutdown,
            env: defaults.env.clone(),
            container_port: defaults.container_port,
            extra_labels: BTreeMap::new(),
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn with_replicas(mut self, replicas: u32) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn with_resources(mut self, resources: ResourceLimits) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_autoscale(mut self, policy: AutoscalePolicy) -> Self {
        self.autoscale = Some(policy);
        self
    }

    pub fn with_retain_on_shutdown(mut self, retain: bool) -> Self {
        self.retain_on_shutdown = retain;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_container_port(mut self, port: u16) -> Self {
        self.container_port = Some(port);
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_labels.insert(key.into(), value.into());
        self
    }

    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Name shared by the Deployment, its container and its autoscaler
    pub fn resource_name(&self) -> String {
        if self.name_prefix.is_empty() {
            self.name.clone()
        } else {
            format!("{}-{}", self.name_prefix, self.name)
        }
    }

    /// Stable identifier derived from namespace and resource name
    pub fn workload_id(&self) -> String {
        let digest = Sha256::digest(format!("{}/{}", self.namespace, self.resource_name()));
        hex::encode(digest)[..12].to_string()
    }

    /// Labels that select exactly this workload's pods
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (NAME_LABEL.to_string(), self.resource_name()),
            (MANAGED_BY_LABEL.to_string(), MANAGER_NAME.to_string()),
            (WORKLOAD_ID_LABEL.to_string(), self.workload_id()),
        ])
    }

    /// Selector labels plus any extra labels
    pub fn pod_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.extra_labels.clone();
        labels.extend(self.selector_labels());
        labels
    }

    /// Selector in the `k=v,k=v` form list calls accept
    pub fn selector(&self) -> String {
        self.selector_labels()
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Full check before anything is rendered into a manifest
    pub fn validate(&self) -> Result<(), LifecycleError> {
        self.validate_identity()?;
        ensure!(
            !self.image.trim().is_empty(),
            InvalidSpecSnafu {
                reason: "container image is required"
            }
        );
        ensure!(
            i32::try_from(self.replicas).is_ok(),
            InvalidSpecSnafu {
                reason: format!("replicas {} is out of range", self.replicas)
            }
        );
        if let Some(bad) = self.env.keys().find(|k| !is_env_name(k)) {
            return InvalidSpecSnafu {
                reason: format!("environment variable name '{bad}' is invalid"),
            }
            .fail();
        }
        let reserved = self.selector_labels();
        if let Some(clash) = self.extra_labels.keys().find(|k| reserved.contains_key(*k)) {
            return InvalidSpecSnafu {
                reason: format!("label '{clash}' is reserved for the workload selector"),
            }
            .fail();
        }
        if let Some(policy) = &self.autoscale {
            policy.validate()?;
        }
        Ok(())
    }

    /// Only what is needed to find an existing workload: the names its
    /// objects and selector are derived from
    pub fn validate_identity(&self) -> Result<(), LifecycleError> {
        ensure!(
            is_dns_label(&self.name),
            InvalidSpecSnafu {
                reason: format!("name '{}' is not a valid DNS-1123 label", self.name)
            }
        );
        ensure!(
            is_dns_label(&self.namespace),
            InvalidSpecSnafu {
                reason: format!(
                    "namespace '{}' is not a valid DNS-1123 label",
                    self.namespace
                )
            }
        );
        let resource_name = self.resource_name();
        ensure!(
            is_dns_label(&resource_name),
            InvalidSpecSnafu {
                reason: format!("derived name '{resource_name}' exceeds 63 characters or is malformed")
            }
        );
        Ok(())
    }
}
