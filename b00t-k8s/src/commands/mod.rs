pub mod workload;

pub use workload::{WorkloadCommands, handle_workload_command};

use crate::config::AdapterConfig;
use crate::lifecycle::LifecycleOptions;
use crate::workload::WorkloadSpec;

/// Settings shared by every subcommand
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub config: AdapterConfig,
    /// Run against the in-memory cluster instead of a real API server
    pub simulate: bool,
}

impl CommandContext {
    /// Spec for `name` with the configured namespace, prefix and defaults
    pub fn spec(&self, name: &str) -> WorkloadSpec {
        WorkloadSpec::from_defaults(name, &self.config.namespace, &self.config.defaults)
            .with_name_prefix(&self.config.name_prefix)
    }

    pub fn options(&self) -> LifecycleOptions {
        LifecycleOptions::from_config(&self.config)
    }
}
