// Cluster credential detection
// Works out where a kube client would get its credentials from

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// Where cluster credentials come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ClusterSource {
    /// Service account mounted into a pod
    InCluster,
    /// A kubeconfig file on disk
    Kubeconfig(PathBuf),
    /// Nothing usable found
    Unavailable,
}

impl fmt::Display for ClusterSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterSource::InCluster => write!(f, "in-cluster service account"),
            ClusterSource::Kubeconfig(path) => write!(f, "kubeconfig {}", path.display()),
            ClusterSource::Unavailable => write!(f, "no cluster credentials"),
        }
    }
}

/// Detect the credential source a connection would use
pub fn detect_cluster_source(explicit_kubeconfig: Option<&Path>) -> ClusterSource {
    // Priority order: explicit kubeconfig > in-cluster > $KUBECONFIG > ~/.kube/config

    // 1. Explicitly configured kubeconfig always wins
    if let Some(path) = explicit_kubeconfig {
        return ClusterSource::Kubeconfig(path.to_path_buf());
    }

    // 2. Running inside a pod
    if check_in_cluster() {
        return ClusterSource::InCluster;
    }

    // 3. Kubeconfig from the environment or the home directory
    match kubeconfig_candidates().into_iter().find(|p| p.is_file()) {
        Some(path) => ClusterSource::Kubeconfig(path),
        None => ClusterSource::Unavailable,
    }
}

/// List every credential source and whether it is present
pub fn list_cluster_sources() -> Vec<(ClusterSource, bool)> {
    let mut sources = vec![(ClusterSource::InCluster, check_in_cluster())];
    for path in kubeconfig_candidates() {
        let present = path.is_file();
        sources.push((ClusterSource::Kubeconfig(path), present));
    }
    sources
}

fn check_in_cluster() -> bool {
    // The kubelet injects these into every pod with a service account
    std::env::var_os("KUBERNETES_SERVICE_HOST").is_some()
        && std::env::var_os("KUBERNETES_SERVICE_PORT").is_some()
}

fn kubeconfig_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // $KUBECONFIG may hold several paths
    if let Some(value) = std::env::var_os("KUBECONFIG") {
        candidates.extend(std::env::split_paths(&value).filter(|p| !p.as_os_str().is_empty()));
    }

    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(".kube").join("config"));
    }

    candidates
}
