use anyhow::{Context, Result};
use b00t_k8s::AdapterConfig;
use b00t_k8s::commands::{CommandContext, WorkloadCommands, handle_workload_command};
use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[clap(name = "b00t-k8s", version, about = "Kubernetes workload lifecycle adapter for b00t agents")]
struct Cli {
    /// Configuration file (default: b00t/k8s.toml in the user config directory)
    #[clap(long, global = true)]
    config: Option<PathBuf>,

    /// Namespace to manage workloads in
    #[clap(long, env = "B00T_K8S_NAMESPACE", global = true)]
    namespace: Option<String>,

    /// Kubeconfig file to use instead of the detected one
    #[clap(long, global = true)]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context
    #[clap(long, global = true)]
    context: Option<String>,

    /// Use an in-memory cluster instead of a real API server
    #[clap(long, global = true)]
    simulate: bool,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[clap(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[clap(subcommand)]
    command: WorkloadCommands,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    // RUST_LOG still wins when set
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config =
        AdapterConfig::load(cli.config.as_deref()).context("Failed to load b00t-k8s configuration")?;
    if let Some(namespace) = cli.namespace {
        config.namespace = namespace;
    }
    if let Some(kubeconfig) = cli.kubeconfig {
        config.kubeconfig = Some(kubeconfig);
    }
    if let Some(context) = cli.context {
        config.context = Some(context);
    }
    config.validate().context("Invalid configuration")?;

    let ctx = CommandContext {
        config,
        simulate: cli.simulate,
    };
    handle_workload_command(cli.command, &ctx).await
}
