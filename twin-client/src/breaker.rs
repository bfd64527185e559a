//! Per-endpoint circuit breaker.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::{ClientError, ClientResult};

/// Breaker thresholds and timings.
#[derive(Clone, Copy, Debug)]
pub struct BreakerConfig {
    failure_threshold: u32,
    recovery_timeout: Duration,
    half_open_max_calls: u32,
    required_successes: u32,
}

impl BreakerConfig {
    /// Creates a configuration with the supplied failure threshold and
    /// recovery timeout.
    #[must_use]
    pub const fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            half_open_max_calls: 1,
            required_successes: 1,
        }
    }

    /// Limits the number of concurrent half-open probes.
    #[must_use]
    pub const fn with_half_open_max_calls(mut self, max_calls: u32) -> Self {
        self.half_open_max_calls = max_calls;
        self
    }

    /// Sets the successes required to close from half-open.
    #[must_use]
    pub const fn with_required_successes(mut self, successes: u32) -> Self {
        self.required_successes = successes;
        self
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(30))
    }
}

#[derive(Debug)]
enum BreakerState {
    Closed { consecutive_failures: u32 },
    Open { until: Instant },
    HalfOpen { in_flight: u32, successes: u32 },
}

/// Fail-fast wrapper state for one downstream endpoint.
///
/// Callers bracket each request with [`try_acquire`](Self::try_acquire) and
/// one of [`record_success`](Self::record_success) /
/// [`record_failure`](Self::record_failure). Transitions happen under one
/// short-held mutex; nothing async runs inside it.
#[derive(Debug)]
pub struct CircuitBreaker {
    endpoint: String,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Creates a closed breaker for the named endpoint.
    #[must_use]
    pub fn new(endpoint: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            config,
            state: Mutex::new(BreakerState::Closed {
                consecutive_failures: 0,
            }),
        }
    }

    /// Admits a call or fails fast with [`ClientError::CircuitOpen`].
    ///
    /// An expired open interval flips the breaker to half-open and admits
    /// the call as a probe.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::CircuitOpen`] while the breaker rejects
    /// traffic.
    ///
    /// # Panics
    ///
    /// Panics if the internal state lock has been poisoned.
    pub fn try_acquire(&self) -> ClientResult<()> {
        let mut state = self.state.lock().expect("breaker state poisoned");
        match &mut *state {
            BreakerState::Closed { .. } => Ok(()),
            BreakerState::Open { until } => {
                if Instant::now() >= *until {
                    info!(endpoint = %self.endpoint, "breaker half-open; probing");
                    *state = BreakerState::HalfOpen {
                        in_flight: 1,
                        successes: 0,
                    };
                    Ok(())
                } else {
                    Err(ClientError::CircuitOpen {
                        endpoint: self.endpoint.clone(),
                    })
                }
            }
            BreakerState::HalfOpen { in_flight, .. } => {
                if *in_flight < self.config.half_open_max_calls {
                    *in_flight += 1;
                    Ok(())
                } else {
                    Err(ClientError::CircuitOpen {
                        endpoint: self.endpoint.clone(),
                    })
                }
            }
        }
    }

    /// Records a successful call.
    ///
    /// # Panics
    ///
    /// Panics if the internal state lock has been poisoned.
    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("breaker state poisoned");
        match &mut *state {
            BreakerState::Closed {
                consecutive_failures,
            } => *consecutive_failures = 0,
            BreakerState::HalfOpen {
                in_flight,
                successes,
            } => {
                *in_flight = in_flight.saturating_sub(1);
                *successes += 1;
                if *successes >= self.config.required_successes {
                    info!(endpoint = %self.endpoint, "breaker closed");
                    *state = BreakerState::Closed {
                        consecutive_failures: 0,
                    };
                }
            }
            BreakerState::Open { .. } => {}
        }
    }

    /// Records a failed call.
    ///
    /// # Panics
    ///
    /// Panics if the internal state lock has been poisoned.
    pub fn record_failure(&self) {
        let mut state = self.state.lock().expect("breaker state poisoned");
        match &mut *state {
            BreakerState::Closed {
                consecutive_failures,
            } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.config.failure_threshold {
                    warn!(endpoint = %self.endpoint, failures = *consecutive_failures, "breaker opened");
                    *state = BreakerState::Open {
                        until: Instant::now() + self.config.recovery_timeout,
                    };
                }
            }
            BreakerState::HalfOpen { .. } => {
                warn!(endpoint = %self.endpoint, "half-open probe failed; breaker reopened");
                *state = BreakerState::Open {
                    until: Instant::now() + self.config.recovery_timeout,
                };
            }
            BreakerState::Open { .. } => {}
        }
    }
}
