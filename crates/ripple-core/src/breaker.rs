//! Consecutive-failure circuit breaker.
//!
//! Guards the remote authorization call: after a run of failures the
//! breaker opens and calls short-circuit without reaching the dispatcher.
//! After a cool-down a single probe is admitted; its outcome decides
//! whether the breaker closes again.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Consecutive failures that trip the breaker.
pub const TRIP_THRESHOLD: u32 = 5;
/// How long the breaker stays open before admitting a probe.
pub const RESET_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a call was rejected without running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    /// The breaker is open and the cool-down has not elapsed.
    Open,
    /// The breaker is half-open and the probe slot is taken.
    ProbeInFlight,
}

#[derive(Debug)]
enum State {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen { probing: bool },
}

/// A minimal circuit breaker. Callers pair every successful
/// [`CircuitBreaker::acquire`] with exactly one `record_*` call.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: Mutex<State>,
    threshold: u32,
    reset_timeout: Duration,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(TRIP_THRESHOLD, RESET_TIMEOUT)
    }
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::Closed { failures: 0 }),
            threshold,
            reset_timeout,
        }
    }

    /// Ask permission to run a call.
    ///
    /// # Errors
    ///
    /// Returns the rejection kind when the call must short-circuit.
    pub fn acquire(&self) -> Result<(), Rejected> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            State::Closed { .. } => Ok(()),
            State::Open { until } => {
                if Instant::now() >= until {
                    *state = State::HalfOpen { probing: true };
                    Ok(())
                } else {
                    Err(Rejected::Open)
                }
            }
            State::HalfOpen { probing } => {
                if probing {
                    Err(Rejected::ProbeInFlight)
                } else {
                    *state = State::HalfOpen { probing: true };
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = State::Closed { failures: 0 };
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            State::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.threshold {
                    *state = State::Open {
                        until: Instant::now() + self.reset_timeout,
                    };
                } else {
                    *state = State::Closed { failures };
                }
            }
            State::HalfOpen { .. } => {
                // Failed probe: back to open for another cool-down.
                *state = State::Open {
                    until: Instant::now() + self.reset_timeout,
                };
            }
            State::Open { .. } => {}
        }
    }
}
