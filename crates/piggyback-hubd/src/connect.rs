//! Connect-retry loop shared by all workers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use hub_core::RetryPolicy;
use hub_services::{BrokerError, Channel, Connector};

/// Consecutive broker failures of one worker.
///
/// The count covers failed connects as well as connections that broke
/// before doing useful work, so a broker that accepts connections but fails
/// every operation is still retried on the policy's schedule. Workers call
/// [`Backoff::reset`] once a message went through.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Delay the next [`pause`](Self::pause) will sleep.
    pub fn next_delay(&self) -> Duration {
        self.policy.delay(self.failures)
    }

    /// Record a failure and sleep the scheduled delay.
    ///
    /// Returns `false` if `shutdown` fired while waiting.
    pub async fn pause(&mut self, shutdown: &mut broadcast::Receiver<()>) -> bool {
        let delay = self.next_delay();
        self.failures = self.failures.saturating_add(1);
        tokio::select! {
            _ = shutdown.recv() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

/// Keep calling `connector` until it succeeds, pausing per `backoff` after
/// every failure. The failure count carries over between calls.
///
/// Returns `None` if `shutdown` fires while waiting.
pub async fn connect_with_retry(
    connector: &dyn Connector,
    backoff: &mut Backoff,
    worker: &str,
    shutdown: &mut broadcast::Receiver<()>,
) -> Option<Arc<dyn Channel>> {
    loop {
        let error = tokio::select! {
            _ = shutdown.recv() => return None,
            result = connector.connect() => match result {
                Ok(channel) => {
                    let failed_attempts = backoff.failures();
                    if failed_attempts > 0 {
                        tracing::info!(worker, failed_attempts, "connected to broker");
                    } else {
                        tracing::debug!(worker, "connected to broker");
                    }
                    return Some(channel);
                }
                Err(e) => e,
            },
        };

        let delay = backoff.next_delay();
        match &error {
            BrokerError::Certificate(_) => tracing::warn!(
                worker,
                error = %error,
                retry_in_secs = delay.as_secs_f32(),
                "broker certificates not usable, retrying"
            ),
            BrokerError::Connection(_) => tracing::warn!(
                worker,
                error = %error,
                retry_in_secs = delay.as_secs_f32(),
                "cannot connect to broker, retrying"
            ),
        }

        if !backoff.pause(shutdown).await {
            return None;
        }
    }
}
