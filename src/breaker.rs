//! Sliding-window circuit breaker
//!
//! One breaker guards each connection pool. It watches the outcome of the
//! last requests; when at least five were seen and 60% or more failed, the
//! breaker opens and every call is rejected without touching the device.
//! After `open_timeout` it moves to half-open and lets a small probe quota
//! through; a probe success closes it, a probe failure re-opens it.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Requests remembered in the sliding window
const WINDOW_SIZE: usize = 10;
/// Minimum observations before the failure ratio is meaningful
const MIN_REQUESTS: usize = 5;
/// Failure ratio at which the breaker trips
const FAILURE_RATIO: f64 = 0.6;
/// Probes admitted while half-open
const HALF_OPEN_PROBES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    /// true = failure
    window: VecDeque<bool>,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
    trips_total: u64,
}

pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    open_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(open_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                window: VecDeque::with_capacity(WINDOW_SIZE),
                opened_at: None,
                probes_in_flight: 0,
                trips_total: 0,
            }),
            open_timeout,
        }
    }

    /// Ask permission to make a request. Handles the open → half-open
    /// transition; callers must follow up with `record_success` or
    /// `record_failure` when permitted.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let expired = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.open_timeout)
                    .unwrap_or(true);
                if expired {
                    inner.state = BreakerState::HalfOpen;
                    inner.probes_in_flight = 1;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => {
                if inner.probes_in_flight < HALF_OPEN_PROBES {
                    inner.probes_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Closed;
                inner.window.clear();
                inner.opened_at = None;
                inner.probes_in_flight = 0;
            }
            _ => {
                push_outcome(&mut inner, false);
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probes_in_flight = 0;
                inner.trips_total += 1;
            }
            BreakerState::Closed => {
                push_outcome(&mut inner, true);
                let total = inner.window.len();
                let failures = inner.window.iter().filter(|f| **f).count();
                if total >= MIN_REQUESTS && failures as f64 / total as f64 >= FAILURE_RATIO {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.trips_total += 1;
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock poisoned").state
    }

    pub fn trips_total(&self) -> u64 {
        self.inner.lock().expect("breaker lock poisoned").trips_total
    }
}

fn push_outcome(inner: &mut BreakerInner, failed: bool) {
    if inner.window.len() == WINDOW_SIZE {
        inner.window.pop_front();
    }
    inner.window.push_back(failed);
}
