//! Workload subcommands
//!
//! - `up`: provision and wait for readiness, optionally hold until Ctrl-C
//! - `down`: adopt an existing workload and release it
//! - `scale` / `autoscale`: adjust a running workload
//! - `status`: read what the cluster reports
//! - `detect`: show where cluster credentials would come from

use super::CommandContext;
use crate::dispatch::{Dispatcher, InlineDispatcher, OffloadDispatcher};
use crate::error::{ClusterError, LifecycleError};
use crate::gateway::kubernetes::KubeGateway;
use crate::gateway::memory::{InMemoryCluster, PodReadiness};
use crate::gateway::{ClusterGateway, detect_cluster_source, detection::list_cluster_sources};
use crate::lifecycle::{LifecycleManager, LifecycleState};
use crate::report::{OutputFormat, render_handle, render_status};
use crate::workload::{AutoscalePolicy, WorkloadSpec};
use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

#[derive(Debug, Parser, Clone)]
pub enum WorkloadCommands {
    /// Provision a workload and wait until one pod is ready
    Up {
        /// Workload name (prefixed to form the resource name)
        #[clap(long)]
        name: String,

        /// Container image (default: `defaults.image` from the config)
        #[clap(long)]
        image: Option<String>,

        #[clap(long)]
        replicas: Option<u32>,

        /// Container port to expose
        #[clap(long)]
        port: Option<u16>,

        /// Environment variable as KEY=VALUE (repeatable)
        #[clap(long = "env", value_parser = parse_key_value)]
        env: Vec<(String, String)>,

        #[clap(long, requires_all = ["autoscale_max", "autoscale_target"])]
        autoscale_min: Option<u32>,

        #[clap(long, requires = "autoscale_min")]
        autoscale_max: Option<u32>,

        /// Target average CPU utilization percentage
        #[clap(long, requires = "autoscale_min")]
        autoscale_target: Option<u32>,

        /// Leave the workload in place on shutdown
        #[clap(long)]
        retain: bool,

        /// Mark the workload running and hold until Ctrl-C, then shut down
        #[clap(long, conflicts_with = "teardown")]
        hold: bool,

        /// Shut down right after the readiness gate
        #[clap(long)]
        teardown: bool,

        #[clap(long, value_enum, default_value_t)]
        format: OutputFormat,
    },

    /// Release a workload provisioned earlier
    Down {
        #[clap(long)]
        name: String,

        /// Detach instead of deleting
        #[clap(long)]
        retain: bool,
    },

    /// Set the replica count of a ready workload
    Scale {
        #[clap(long)]
        name: String,

        #[clap(long)]
        replicas: u32,
    },

    /// Attach, update or remove the workload's autoscaler
    Autoscale {
        #[clap(long)]
        name: String,

        #[clap(long, required_unless_present = "disable")]
        min: Option<u32>,

        #[clap(long, required_unless_present = "disable")]
        max: Option<u32>,

        /// Target average CPU utilization percentage
        #[clap(long, required_unless_present = "disable")]
        target: Option<u32>,

        /// Remove the autoscaler instead
        #[clap(long, conflicts_with_all = ["min", "max", "target"])]
        disable: bool,
    },

    /// Show the live Deployment and autoscaler
    Status {
        #[clap(long)]
        name: String,

        #[clap(long, value_enum, default_value_t)]
        format: OutputFormat,
    },

    /// Show which cluster credentials would be used
    Detect,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

/// Handle workload commands
pub async fn handle_workload_command(cmd: WorkloadCommands, ctx: &CommandContext) -> Result<()> {
    if matches!(cmd, WorkloadCommands::Detect) {
        detect(ctx);
        return Ok(());
    }

    if ctx.simulate {
        println!("🧪 Simulated cluster (nothing leaves this process)");
        let cluster = InMemoryCluster::new(&ctx.config.namespace)
            .with_pod_readiness(PodReadiness::AfterPolls(2));
        return run(cmd, ctx, Arc::new(cluster), InlineDispatcher).await;
    }

    let gateway = KubeGateway::connect(&ctx.config.connect_options(), &ctx.config.namespace)
        .await
        .context("Failed to connect to the Kubernetes API server")?;
    run(cmd, ctx, Arc::new(gateway), OffloadDispatcher).await
}

async fn run<G, D>(cmd: WorkloadCommands, ctx: &CommandContext, gateway: Arc<G>, dispatcher: D) -> Result<()>
where
    G: ClusterGateway,
    D: Dispatcher,
{
    match cmd {
        WorkloadCommands::Up {
            name,
            image,
            replicas,
            port,
            env,
            autoscale_min,
            autoscale_max,
            autoscale_target,
            retain,
            hold,
            teardown,
            format,
        } => {
            let mut spec = ctx.spec(&name);
            if let Some(image) = image {
                spec = spec.with_image(image);
            }
            if let Some(replicas) = replicas {
                spec = spec.with_replicas(replicas);
            }
            if let Some(port) = port {
                spec = spec.with_container_port(port);
            }
            for (key, value) in env {
                spec = spec.with_env(key, value);
            }
            if let (Some(min), Some(max), Some(target)) = (autoscale_min, autoscale_max, autoscale_target) {
                spec = spec.with_autoscale(AutoscalePolicy::new(min, max, target));
            }
            if retain {
                spec = spec.with_retain_on_shutdown(true);
            }
            let manager = build_manager(ctx, spec, gateway, dispatcher)?;
            up(Arc::new(manager), hold, teardown, format).await
        }
        WorkloadCommands::Down { name, retain } => {
            let mut spec = ctx.spec(&name);
            if retain {
                spec = spec.with_retain_on_shutdown(true);
            }
            down(attach_manager(ctx, spec, gateway, dispatcher)?).await
        }
        WorkloadCommands::Scale { name, replicas } => {
            let manager = attach_manager(ctx, ctx.spec(&name), gateway, dispatcher)?;
            manager.reattach().await.context("Failed to find workload")?;
            manager
                .scale(replicas)
                .await
                .with_context(|| format!("Failed to scale {}", manager.spec().resource_name()))?;
            println!("✅ Scaled {} to {replicas} replica(s)", manager.spec().resource_name());
            if manager.snapshot().autoscaler.is_some() {
                println!("ℹ️  An autoscaler is attached and may revise this count");
            }
            Ok(())
        }
        WorkloadCommands::Autoscale {
            name,
            min,
            max,
            target,
            disable,
        } => {
            let manager = attach_manager(ctx, ctx.spec(&name), gateway, dispatcher)?;
            manager.reattach().await.context("Failed to find workload")?;
            let resource = manager.spec().resource_name();
            if disable {
                manager
                    .disable_autoscale()
                    .await
                    .with_context(|| format!("Failed to disable autoscaling for {resource}"))?;
                println!("✅ Autoscaling disabled for {resource}");
                return Ok(());
            }
            let (Some(min), Some(max), Some(target)) = (min, max, target) else {
                anyhow::bail!("--min, --max and --target are required unless --disable is given");
            };
            manager
                .enable_autoscale(AutoscalePolicy::new(min, max, target))
                .await
                .with_context(|| format!("Failed to enable autoscaling for {resource}"))?;
            println!("✅ Autoscaling {resource} between {min} and {max} replicas at {target}% CPU");
            Ok(())
        }
        WorkloadCommands::Status { name, format } => {
            let manager = attach_manager(ctx, ctx.spec(&name), gateway, dispatcher)?;
            let status = manager.observe().await.context("Failed to read workload status")?;
            print!("{}", render_status(&status, format)?);
            Ok(())
        }
        WorkloadCommands::Detect => {
            detect(ctx);
            Ok(())
        }
    }
}

fn build_manager<G, D>(
    ctx: &CommandContext,
    spec: WorkloadSpec,
    gateway: Arc<G>,
    dispatcher: D,
) -> Result<LifecycleManager<G, D>>
where
    G: ClusterGateway,
    D: Dispatcher,
{
    LifecycleManager::new(spec, gateway, dispatcher, ctx.options()).context("Invalid workload")
}

/// Manager for commands that act on a workload provisioned earlier; no image needed
fn attach_manager<G, D>(
    ctx: &CommandContext,
    spec: WorkloadSpec,
    gateway: Arc<G>,
    dispatcher: D,
) -> Result<LifecycleManager<G, D>>
where
    G: ClusterGateway,
    D: Dispatcher,
{
    LifecycleManager::for_existing(spec, gateway, dispatcher, ctx.options()).context("Invalid workload")
}

async fn up<G, D>(
    manager: Arc<LifecycleManager<G, D>>,
    hold: bool,
    teardown: bool,
    format: OutputFormat,
) -> Result<()>
where
    G: ClusterGateway,
    D: Dispatcher,
{
    let resource = manager.spec().resource_name();
    println!("🚀 Provisioning {resource} in {}", manager.spec().namespace);

    // Ctrl-C at any point shuts the workload down; shutdown() also cancels
    // an initialization that is still waiting for readiness
    let interrupt = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move {
            tokio::signal::ctrl_c().await.ok()?;
            println!("🛑 Interrupted, shutting down {}", manager.spec().resource_name());
            Some(manager.shutdown().await)
        }
    });

    match manager.initialize().await {
        Ok(handle) => print!("{}", render_handle(&handle, format)?),
        Err(LifecycleError::Cancelled { .. }) => {
            let outcome = interrupt.await.context("Shutdown task failed")?;
            return match outcome {
                Some(result) => report_shutdown(&resource, result),
                None => anyhow::bail!("Initialization of {resource} was cancelled"),
            };
        }
        Err(err) => {
            interrupt.abort();
            print!("{}", render_handle(&manager.snapshot(), format)?);
            return Err(err).with_context(|| format!("Failed to bring up {resource}"));
        }
    }

    if hold {
        manager.mark_running()?;
        println!("⏸️  Holding {resource}, press Ctrl-C to shut down");
        return match interrupt.await.context("Shutdown task failed")? {
            Some(result) => report_shutdown(&resource, result),
            None => anyhow::bail!("Failed to listen for Ctrl-C"),
        };
    }

    interrupt.abort();
    if teardown {
        return report_shutdown(&resource, manager.shutdown().await);
    }
    Ok(())
}

async fn down<G, D>(manager: LifecycleManager<G, D>) -> Result<()>
where
    G: ClusterGateway,
    D: Dispatcher,
{
    let resource = manager.spec().resource_name();
    match manager.reattach().await {
        Ok(_) => {}
        Err(err) if err.cluster_error().is_some_and(ClusterError::is_not_found) => {
            println!("ℹ️  {resource} not found, nothing to release");
            return Ok(());
        }
        Err(err) => return Err(err).with_context(|| format!("Failed to find {resource}")),
    }
    report_shutdown(&resource, manager.shutdown().await)
}

fn report_shutdown(resource: &str, result: Result<LifecycleState, LifecycleError>) -> Result<()> {
    match result {
        Ok(LifecycleState::Detached) => {
            println!("📌 {resource} Detached, left running (retain on shutdown)");
            Ok(())
        }
        Ok(state) => {
            println!("🧹 {resource} {state}");
            Ok(())
        }
        Err(err) => Err(err).with_context(|| format!("Failed to shut down {resource}")),
    }
}

fn detect(ctx: &CommandContext) {
    let explicit = ctx.config.kubeconfig.as_deref();
    println!("🔍 Cluster credentials: {}", detect_cluster_source(explicit));
    for (source, present) in list_cluster_sources() {
        let mark = if present { "✅" } else { "❌" };
        println!("   {mark} {source}");
    }
}
