//! Agent registration with the cluster controller.
//!
//! The controller announces itself once at startup. Failed attempts are
//! retried at a fixed delay up to `registration_max_attempts`; after that the
//! task gives up for the lifetime of the process.

use crate::config::Config;
use crate::errors::SfuError;
use crate::observability::metrics;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Registers this agent with whatever tracks the cluster's SFUs.
#[async_trait]
pub trait AgentRegistrar: Send + Sync {
    async fn register(&self, agent_id: &str) -> Result<(), SfuError>;
}

/// Retry policy for registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.registration_max_attempts,
            delay: config.registration_retry_delay,
        }
    }
}

/// Spawn the registration task. The join handle yields whether registration
/// succeeded; cancellation yields `false`.
#[must_use]
pub fn spawn_registration_task(
    registrar: Arc<dyn AgentRegistrar>,
    agent_id: String,
    policy: RetryPolicy,
    cancel_token: CancellationToken,
) -> JoinHandle<bool> {
    tokio::spawn(run_registration(registrar, agent_id, policy, cancel_token))
}

#[instrument(skip_all, name = "sfu.registration", fields(agent_id = %agent_id))]
async fn run_registration(
    registrar: Arc<dyn AgentRegistrar>,
    agent_id: String,
    policy: RetryPolicy,
    cancel_token: CancellationToken,
) -> bool {
    let mut attempt = 0;

    while attempt < policy.max_attempts {
        attempt += 1;

        let result = tokio::select! {
            () = cancel_token.cancelled() => {
                info!(target: "sfu.registration", "Registration cancelled");
                return false;
            }
            result = registrar.register(&agent_id) => result,
        };

        match result {
            Ok(()) => {
                metrics::record_registration_attempt("success");
                info!(
                    target: "sfu.registration",
                    agent_id = %agent_id,
                    attempt,
                    "Agent registered"
                );
                return true;
            }
            Err(e) => {
                metrics::record_registration_attempt("error");
                if attempt >= policy.max_attempts {
                    error!(
                        target: "sfu.registration",
                        agent_id = %agent_id,
                        error = %e,
                        attempts = attempt,
                        "Registration failed after max attempts, giving up"
                    );
                    break;
                }
                warn!(
                    target: "sfu.registration",
                    agent_id = %agent_id,
                    error = %e,
                    attempt,
                    delay_ms = policy.delay.as_millis() as u64,
                    "Registration failed, retrying"
                );
            }
        }

        tokio::select! {
            () = cancel_token.cancelled() => {
                info!(target: "sfu.registration", "Registration cancelled");
                return false;
            }
            () = tokio::time::sleep(policy.delay) => {}
        }
    }

    false
}

/// Scripted registrar for tests.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls, then succeeds.
    #[derive(Debug, Default)]
    pub struct MockRegistrar {
        failures: u32,
        calls: AtomicU32,
    }

    impl MockRegistrar {
        #[must_use]
        pub fn failing(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
            }
        }

        #[must_use]
        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AgentRegistrar for MockRegistrar {
        async fn register(&self, _agent_id: &str) -> Result<(), SfuError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(SfuError::NotAvailable("registry unreachable".to_string()));
            }
            Ok(())
        }
    }
}
