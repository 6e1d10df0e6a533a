//! Per-backend circuit breaker state machine (§4.3).

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Tracks consecutive failures/successes and transitions Closed -> Open ->
/// HalfOpen -> Closed (or back to Open on any HalfOpen failure).
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    half_open_permits_remaining: u32,
    failure_threshold: u32,
    success_threshold: u32,
    open_timeout: Duration,
    half_open_permits: u32,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, success_threshold: u32, open_timeout: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            half_open_permits_remaining: 0,
            failure_threshold: failure_threshold.max(1),
            success_threshold: success_threshold.max(1),
            open_timeout,
            half_open_permits: 3,
        }
    }

    /// Whether a request may currently be admitted; transitions Open ->
    /// HalfOpen on timeout expiry as a side effect.
    pub fn try_admit(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if self.opened_at.map(|t| t.elapsed() >= self.open_timeout).unwrap_or(false) {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_permits_remaining = self.half_open_permits;
                    self.consecutive_successes = 0;
                    self.try_admit()
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.half_open_permits_remaining > 0 {
                    self.half_open_permits_remaining -= 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                self.consecutive_successes += 1;
                if self.consecutive_successes >= self.success_threshold {
                    self.state = CircuitState::Closed;
                    self.consecutive_failures = 0;
                    self.consecutive_successes = 0;
                    self.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.failure_threshold {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.opened_at = Some(Instant::now());
                self.consecutive_successes = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }
}
