//! Blocking-call dispatcher
//!
//! Gateway calls are blocking. The dispatcher decides where they run so the
//! agent's task loop never stalls on cluster I/O:
//! - [`OffloadDispatcher`] moves each call onto tokio's blocking pool.
//! - [`InlineDispatcher`] runs it on the calling thread, for gateways that
//!   never block (the simulated cluster) or callers already on a thread of
//!   their own.
//!
//! Neither reorders calls: the caller awaits each result before issuing the
//! next one.

use crate::error::{ClusterError, DispatchSnafu};
use async_trait::async_trait;
use snafu::ResultExt;

#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    /// Run one blocking gateway operation and deliver its result
    async fn run<T, F>(&self, op: F) -> Result<T, ClusterError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, ClusterError> + Send + 'static;
}

/// Runs operations on tokio's blocking thread pool
#[derive(Debug, Clone, Copy, Default)]
pub struct OffloadDispatcher;

#[async_trait]
impl Dispatcher for OffloadDispatcher {
    async fn run<T, F>(&self, op: F) -> Result<T, ClusterError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, ClusterError> + Send + 'static,
    {
        tokio::task::spawn_blocking(op).await.context(DispatchSnafu)?
    }
}

/// Runs operations directly on the caller's thread
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineDispatcher;

#[async_trait]
impl Dispatcher for InlineDispatcher {
    async fn run<T, F>(&self, op: F) -> Result<T, ClusterError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, ClusterError> + Send + 'static,
    {
        op()
    }
}
