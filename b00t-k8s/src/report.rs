//! Human and machine readable renderings of a workload
//!
//! Text output follows the emoji-prefixed line style of the rest of the b00t
//! tooling; JSON and YAML carry the full serialized structures.

use crate::lifecycle::{LifecycleState, WorkloadHandle, WorkloadStatus};
use anyhow::{Context, Result};
use serde::Serialize;
use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Yaml,
}

fn state_icon(state: LifecycleState) -> &'static str {
    match state {
        LifecycleState::Uninitialized => "⚪",
        LifecycleState::Provisioning | LifecycleState::AwaitingReadiness => "⏳",
        LifecycleState::Ready | LifecycleState::Running => "✅",
        LifecycleState::ShuttingDown => "🛑",
        LifecycleState::Terminated => "🧹",
        LifecycleState::Detached => "📌",
        LifecycleState::Failed => "❌",
    }
}

fn serialize<T: Serialize>(value: &T, format: OutputFormat) -> Result<Option<String>> {
    match format {
        OutputFormat::Text => Ok(None),
        OutputFormat::Json => serde_json::to_string_pretty(value)
            .map(Some)
            .context("Failed to render JSON"),
        OutputFormat::Yaml => serde_yaml::to_string(value)
            .map(Some)
            .context("Failed to render YAML"),
    }
}

pub fn render_handle(handle: &WorkloadHandle, format: OutputFormat) -> Result<String> {
    if let Some(rendered) = serialize(handle, format)? {
        return Ok(rendered);
    }
    let mut out = String::new();
    write_handle(&mut out, handle);
    Ok(out)
}

pub fn render_status(status: &WorkloadStatus, format: OutputFormat) -> Result<String> {
    if let Some(rendered) = serialize(status, format)? {
        return Ok(rendered);
    }

    let mut out = String::new();
    write_handle(&mut out, &status.handle);
    match &status.deployment {
        Some(deployment) => {
            let _ = writeln!(
                out,
                "📦 deployment: {}/{} ready (generation {})",
                deployment.ready_replicas,
                deployment.replicas,
                deployment
                    .observed_generation
                    .map_or_else(|| "?".to_string(), |g| g.to_string())
            );
        }
        None => {
            let _ = writeln!(out, "📦 deployment: not found");
        }
    }
    if let Some(autoscaler) = &status.autoscaler {
        let _ = writeln!(
            out,
            "📈 autoscaler: {}..{} replicas, target {}",
            autoscaler.min_replicas, autoscaler.max_replicas, autoscaler.target
        );
    }
    Ok(out)
}

fn write_handle(out: &mut String, handle: &WorkloadHandle) {
    let _ = writeln!(
        out,
        "{} {} ({}) in {}: {}",
        state_icon(handle.state),
        handle.resource_name,
        handle.workload_id,
        handle.namespace,
        handle.state
    );
    if let Some(pod) = &handle.ready_pod {
        let _ = writeln!(out, "🟢 ready pod: {} ({})", pod.name, pod.phase);
    }
    if let Some(policy) = &handle.autoscale {
        let _ = writeln!(
            out,
            "📈 autoscale: {}..{} at {}% {}",
            policy.min_replicas,
            policy.max_replicas,
            policy.target_utilization,
            policy.metric.resource_name()
        );
    }
    if handle.retain_on_shutdown {
        let _ = writeln!(out, "📌 retained on shutdown");
    }
    if let Some(failure) = &handle.failure {
        let _ = writeln!(out, "⚠️  {failure}");
    }
    for failure in &handle.teardown_failures {
        let _ = writeln!(out, "   - {failure}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::InlineDispatcher;
    use crate::gateway::memory::InMemoryCluster;
    use crate::lifecycle::{LifecycleManager, LifecycleOptions};
    use crate::workload::{AutoscalePolicy, WorkloadSpec};
    use std::sync::Arc;

    fn manager() -> LifecycleManager<InMemoryCluster, InlineDispatcher> {
        let spec = WorkloadSpec::new("demo", "app:v1")
            .with_namespace("demo")
            .with_autoscale(AutoscalePolicy::new(1, 3, 70));
        LifecycleManager::new(
            spec,
            Arc::new(InMemoryCluster::new("demo")),
            InlineDispatcher,
            LifecycleOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_text_handle() {
        let text = render_handle(&manager().snapshot(), OutputFormat::Text).unwrap();
        assert!(text.starts_with("⚪ b00t-agent-demo"));
        assert!(text.contains("Uninitialized"));
    }

    #[tokio::test]
    async fn test_status_formats() {
        let mgr = manager();
        mgr.initialize().await.unwrap();
        let status = mgr.observe().await.unwrap();

        let text = render_status(&status, OutputFormat::Text).unwrap();
        assert!(text.contains("Ready"));
        assert!(text.contains("1/1 ready"));
        assert!(text.contains("autoscaler: 1..3"));

        let json: serde_json::Value =
            serde_json::from_str(&render_status(&status, OutputFormat::Json).unwrap()).unwrap();
        assert_eq!(json["handle"]["state"], "Ready");
        assert_eq!(json["deployment"]["replicas"], 1);

        let yaml = render_status(&status, OutputFormat::Yaml).unwrap();
        assert!(yaml.contains("state: Ready"));
    }
}
