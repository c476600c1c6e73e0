use std::sync::Mutex;
use std::time::{
    Duration,
    Instant,
};

use log::{
    info,
    warn,
};

#[derive(Clone, Debug)]
pub struct BreakerOptions {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            cooldown: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: State,
    failure_count: u32,
    opened_at: Option<Instant>,
}

/// Observable breaker state, mirrored into health snapshots.
#[derive(Clone, Debug, PartialEq)]
pub struct CircuitSnapshot {
    pub state: &'static str,
    pub failure_count: u32,
    pub cooldown_remaining: Duration,
}

/// Three-state circuit breaker over a single failure counter and an
/// opened-at timestamp. Once open, calls stay blocked until the cooldown
/// elapses; the next observation then admits one half-open trial.
pub struct CircuitBreaker {
    name: &'static str,
    options: BreakerOptions,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, options: BreakerOptions) -> Self {
        Self {
            name,
            options,
            inner: Mutex::new(Inner {
                state: State::Closed,
                failure_count: 0,
                opened_at: None,
            }),
        }
    }

    /// True while the breaker blocks calls. An open breaker whose cooldown
    /// has elapsed flips to half-open here and lets one trial through.
    pub fn is_open(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            State::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.options.cooldown {
                    info!("{} circuit cooldown elapsed, entering half-open", self.name);
                    inner.state = State::HalfOpen;
                    false
                } else {
                    true
                }
            }
            State::Closed | State::HalfOpen => false,
        }
    }

    pub fn cooldown_remaining(&self) -> Duration {
        let inner = self.lock();
        match (inner.state, inner.opened_at) {
            (State::Open, Some(at)) => self.options.cooldown.saturating_sub(at.elapsed()),
            _ => Duration::ZERO,
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state == State::HalfOpen {
            info!("{} circuit closed after successful trial", self.name);
        }
        inner.state = State::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
    }

    /// Returns true when this failure tripped the breaker open (either
    /// from closed at the threshold, or a failed half-open trial).
    pub fn record_failure(&self) -> bool {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);

        match inner.state {
            State::HalfOpen => {
                warn!("{} circuit trial failed, reopening", self.name);
                inner.state = State::Open;
                inner.opened_at = Some(Instant::now());
                true
            }
            State::Closed if inner.failure_count >= self.options.failure_threshold => {
                warn!(
                    "{} circuit opened after {} consecutive failures",
                    self.name, inner.failure_count
                );
                inner.state = State::Open;
                inner.opened_at = Some(Instant::now());
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        let state = match inner.state {
            State::Closed => "closed",
            State::Open => "open",
            State::HalfOpen => "half-open",
        };
        let cooldown_remaining = match (inner.state, inner.opened_at) {
            (State::Open, Some(at)) => self.options.cooldown.saturating_sub(at.elapsed()),
            _ => Duration::ZERO,
        };
        CircuitSnapshot {
            state,
            failure_count: inner.failure_count,
            cooldown_remaining,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerOptions {
                failure_threshold: threshold,
                cooldown,
            },
        )
    }

    #[test]
    fn test_trips_at_threshold() {
        let breaker = breaker(3, Duration::from_secs(60));

        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert!(breaker.record_failure(), "third failure trips");
        assert!(breaker.is_open());
        assert!(breaker.cooldown_remaining() > Duration::ZERO);
    }

    #[test]
    fn test_success_resets_counter() {
        let breaker = breaker(3, Duration::from_secs(60));

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);

        breaker.record_failure();
        assert!(!breaker.is_open(), "counter restarted after success");
    }

    #[test]
    fn test_half_open_trial_closes_on_success() {
        let breaker = breaker(1, Duration::from_millis(20));

        assert!(breaker.record_failure());
        assert!(breaker.is_open());

        std::thread::sleep(Duration::from_millis(30));
        assert!(!breaker.is_open(), "cooldown elapsed admits a trial");
        assert_eq!(breaker.snapshot().state, "half-open");

        breaker.record_success();
        assert_eq!(breaker.snapshot().state, "closed");
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_half_open_trial_failure_reopens() {
        let breaker = breaker(1, Duration::from_millis(20));

        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(30));
        assert!(!breaker.is_open());

        assert!(breaker.record_failure(), "failed trial reopens");
        assert!(breaker.is_open());
        assert!(breaker.cooldown_remaining() > Duration::ZERO, "openedAt refreshed");
    }
}
