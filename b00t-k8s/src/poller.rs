//! Readiness poller
//!
//! Lists the workload's pods at a fixed interval until one reports the
//! `Ready` condition, the deadline passes, or shutdown cancels the wait.
//! Empty listings, non-ready pods, `NotFound` and transient availability
//! failures only mean "poll again". `Forbidden` (and other non-transient
//! failures) end the wait immediately.

use crate::dispatch::Dispatcher;
use crate::error::ClusterError;
use crate::gateway::{ClusterGateway, PodState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// How a readiness wait ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// First ready pod in listing order
    Ready(PodState),
    TimedOut { waited: Duration },
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadinessPoller {
    interval: Duration,
    timeout: Duration,
}

impl ReadinessPoller {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Poll until a pod matching `selector` is ready.
    ///
    /// `cancel` flips to `true` when shutdown starts; it is checked before
    /// every listing and wakes the wait between listings.
    pub async fn wait_for_ready<G, D>(
        &self,
        gateway: &Arc<G>,
        dispatcher: &D,
        selector: &str,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<PollOutcome, ClusterError>
    where
        G: ClusterGateway,
        D: Dispatcher,
    {
        let started = Instant::now();
        let deadline = started + self.timeout;
        let mut attempt: u32 = 0;

        loop {
            if *cancel.borrow_and_update() {
                debug!(selector, attempt, "readiness wait cancelled");
                return Ok(PollOutcome::Cancelled);
            }

            attempt += 1;
            let gw = Arc::clone(gateway);
            let owned = selector.to_string();
            match dispatcher.run(move || gw.list_pods(&owned)).await {
                Ok(pods) => {
                    if let Some(pod) = pods.into_iter().find(|p| p.ready) {
                        debug!(selector, attempt, pod = %pod.name, "ready pod observed");
                        return Ok(PollOutcome::Ready(pod));
                    }
                    debug!(selector, attempt, "no ready pod yet");
                }
                Err(err) if err.is_not_found() || err.is_transient() => {
                    debug!(selector, attempt, error = %err, "pod listing failed, will retry");
                }
                Err(err) => return Err(err),
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(PollOutcome::TimedOut {
                    waited: now - started,
                });
            }

            let pause = self.interval.min(deadline - now);
            tokio::select! {
                () = cancelled(cancel.clone()) => {}
                () = tokio::time::sleep(pause) => {}
            }
        }
    }
}

/// Resolves once the cancel flag reads `true`. Never resolves if the
/// sending side is gone without having cancelled.
pub(crate) async fn cancelled(mut cancel: watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
