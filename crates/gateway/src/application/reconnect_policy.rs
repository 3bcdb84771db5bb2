use std::time::Duration;
use tokio::time::Instant;

/// Exponential backoff ladder: `min(base * 2^(attempt - 1), cap)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Backoff { base, cap }
    }

    /// Delay before retry number `attempt` (1-based; 0 is treated as 1)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 2u32.saturating_pow(exponent);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Breaker position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open { until: Instant },
    /// One trial attempt is in flight
    HalfOpen,
}

/// Consecutive-failure circuit breaker with a fixed cooldown
///
/// After `failure_threshold` consecutive failures the breaker opens. Once
/// the cooldown has elapsed exactly one trial is let through; its success
/// closes the breaker, its failure re-opens it for another cooldown.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    consecutive_failures: u32,
    state: BreakerState,
    trips: u64,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        CircuitBreaker {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            consecutive_failures: 0,
            state: BreakerState::Closed,
            trips: 0,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Number of times the breaker has opened
    pub fn trips(&self) -> u64 {
        self.trips
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, BreakerState::Open { .. })
    }

    /// Record a failed attempt. Returns true if the breaker opened.
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if self.state == BreakerState::HalfOpen
            || self.consecutive_failures >= self.failure_threshold
        {
            self.trip(now);
            return true;
        }
        false
    }

    /// Open immediately, regardless of the failure count
    pub fn trip(&mut self, now: Instant) {
        self.state = BreakerState::Open {
            until: now + self.cooldown,
        };
        self.trips += 1;
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = BreakerState::Closed;
    }

    pub fn reset(&mut self) {
        self.record_success();
    }

    /// Ask permission for an attempt.
    ///
    /// Closed always allows. Open allows once the cooldown has elapsed and
    /// moves to HalfOpen; HalfOpen refuses until the trial resolves.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open { until } if now >= until => {
                self.state = BreakerState::HalfOpen;
                true
            }
            BreakerState::Open { .. } | BreakerState::HalfOpen => false,
        }
    }

    /// Time left until a trial is allowed
    pub fn remaining_cooldown(&self, now: Instant) -> Option<Duration> {
        match self.state {
            BreakerState::Open { until } => Some(until.saturating_duration_since(now)),
            _ => None,
        }
    }
}
