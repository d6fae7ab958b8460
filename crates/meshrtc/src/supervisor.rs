//! Negotiation supervisor
//!
//! Keeps exactly one self-initiated offer cycle running at a time. A cycle
//! that ends with a connected transport starts the next one immediately; a
//! cycle that fails is retried after an exponential backoff until the retry
//! budget runs out, at which point [`MeshEvent::NegotiationHalted`] is emitted.
//! Failures that a quick retry will not fix, such as rejected credentials,
//! wait the maximum backoff straight away.

use crate::context::MeshContext;
use crate::connection::ConnectionRecord;
use crate::events::MeshEvent;
use crate::negotiation;
use crate::types::TransportState;
use crate::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Retry policy for failed negotiation cycles
///
/// Controls how the supervisor backs off after a cycle fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Maximum consecutive retries, `None` for unlimited (default: None)
    pub max_retries: Option<u32>,
    /// Initial backoff delay in milliseconds (default: 1000ms)
    pub backoff_initial_ms: u64,
    /// Maximum backoff delay in milliseconds (default: 30000ms)
    pub backoff_max_ms: u64,
    /// Backoff multiplier (default: 2.0)
    pub backoff_multiplier: f64,
    /// Whether to add jitter to backoff (default: true)
    pub jitter_enabled: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: None,
            backoff_initial_ms: 1000,
            backoff_max_ms: 30000,
            backoff_multiplier: 2.0,
            jitter_enabled: true,
        }
    }
}

impl BackoffPolicy {
    /// Retry quickly, for low-latency meshes
    pub fn aggressive() -> Self {
        Self {
            max_retries: None,
            backoff_initial_ms: 100,
            backoff_max_ms: 5000,
            backoff_multiplier: 1.5,
            jitter_enabled: true,
        }
    }

    /// Give up after a few slow retries
    pub fn conservative() -> Self {
        Self {
            max_retries: Some(3),
            backoff_initial_ms: 2000,
            backoff_max_ms: 60000,
            backoff_multiplier: 2.5,
            jitter_enabled: true,
        }
    }

    /// Calculate backoff duration for a given retry number
    ///
    /// Uses exponential backoff with optional jitter of up to 25%.
    ///
    /// # Arguments
    /// * `attempt` - Retries already made (0-indexed)
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let backoff_ms = (self.backoff_initial_ms as f64) * self.backoff_multiplier.powi(exponent);

        // Clamp to maximum
        self.with_jitter(backoff_ms.min(self.backoff_max_ms as f64))
    }

    fn with_jitter(&self, backoff_ms: f64) -> Duration {
        let final_ms = if self.jitter_enabled && backoff_ms > 0.0 {
            backoff_ms + rand::thread_rng().gen_range(0.0..=backoff_ms * 0.25)
        } else {
            backoff_ms
        };

        Duration::from_millis(final_ms as u64)
    }

    /// Backoff after `attempt` retries, the last of which failed with `err`
    ///
    /// Transient signaling and peer failures follow the exponential curve.
    /// Anything else (rejected credentials, 4xx responses, malformed
    /// payloads) waits the full `backoff_max_ms`.
    pub fn backoff_for(&self, attempt: u32, err: &Error) -> Duration {
        if err.is_retryable() || err.is_peer_error() {
            self.calculate_backoff(attempt)
        } else {
            self.with_jitter(self.backoff_max_ms as f64)
        }
    }

    /// Check if more retries are allowed after `attempt` retries
    pub fn should_retry(&self, attempt: u32) -> bool {
        match self.max_retries {
            Some(max) => attempt < max,
            None => true,
        }
    }

    /// Validate the policy
    pub fn validate(&self) -> Result<()> {
        if self.backoff_multiplier < 1.0 || !self.backoff_multiplier.is_finite() {
            return Err(Error::InvalidConfig(format!(
                "backoff_multiplier must be a finite value >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }

        if self.backoff_max_ms < self.backoff_initial_ms {
            return Err(Error::InvalidConfig(format!(
                "backoff_max_ms ({}) must be >= backoff_initial_ms ({})",
                self.backoff_max_ms, self.backoff_initial_ms
            )));
        }

        Ok(())
    }
}

/// Drive offer cycles until shutdown or until the retry budget is spent
pub(crate) async fn run(ctx: Arc<MeshContext>) {
    let policy = ctx.config.supervisor.clone();
    let mut retries: u32 = 0;
    let mut cycles: u64 = 0;

    info!(role = %ctx.config.role, client_id = %ctx.signaling.client_id(), "Negotiation supervisor started");

    loop {
        if ctx.cancel.is_cancelled() {
            break;
        }

        cycles += 1;
        let outcome = match negotiation::run_cycle(&ctx).await {
            Ok(record) => wait_settled(&ctx, &record).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                debug!(cycle = cycles, "Offer cycle connected, starting the next one");
                retries = 0;
            }
            Err(Error::ShuttingDown) => break,
            Err(e) => {
                if !policy.should_retry(retries) {
                    error!(cycle = cycles, retries, "Offer cycle failed, giving up: {}", e);
                    ctx.emit(MeshEvent::NegotiationHalted {
                        reason: e.to_string(),
                    });
                    break;
                }

                let backoff = policy.backoff_for(retries, &e);
                retries += 1;
                warn!(
                    cycle = cycles,
                    retry = retries,
                    transient = e.is_retryable() || e.is_peer_error(),
                    backoff_ms = backoff.as_millis() as u64,
                    "Offer cycle failed: {}",
                    e
                );

                tokio::select! {
                    _ = ctx.cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }

    info!(cycles, "Negotiation supervisor stopped");
}

/// Wait for a self-initiated connection to connect or end
async fn wait_settled(ctx: &MeshContext, record: &Arc<ConnectionRecord>) -> Result<()> {
    let connect_timeout = ctx.config.negotiation.connect_timeout();
    let mut state = record.subscribe_state();

    let settled = tokio::select! {
        _ = ctx.cancel.cancelled() => return Err(Error::ShuttingDown),
        settled = tokio::time::timeout(
            connect_timeout,
            state.wait_for(|s| *s == TransportState::Connected || s.is_terminal()),
        ) => settled.map(|waited| waited.map(|s| *s)),
    };

    match settled {
        Ok(Ok(TransportState::Connected)) => Ok(()),
        Ok(Ok(other)) => Err(Error::PeerConnectionError(format!(
            "Connection {} ended in state {} before connecting",
            record.correlation_id(),
            other
        ))),
        Ok(Err(_)) => Err(Error::PeerConnectionError(format!(
            "Connection {} dropped its state channel",
            record.correlation_id()
        ))),
        Err(_) => {
            ctx.discard(record).await;
            Err(Error::OperationTimeout(format!(
                "Connection {} did not connect within {:?}",
                record.correlation_id(),
                connect_timeout
            )))
        }
    }
}
