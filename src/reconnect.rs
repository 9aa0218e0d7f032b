//! Reconnect scheduling and the callers waiting for the next open.

use std::fmt;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use tokio::time::Instant;

use crate::config::{BackoffPolicy, ReconnectConfig};

/// Linear growth: every call adds `step` to the previous delay, starting from `base`.
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    base: Duration,
    step: Duration,
    max: Option<Duration>,
    current: Duration,
}

impl LinearBackoff {
    #[must_use]
    pub fn new(base: Duration, step: Duration, max: Option<Duration>) -> Self {
        Self {
            base,
            step,
            max,
            current: base,
        }
    }
}

impl Backoff for LinearBackoff {
    fn reset(&mut self) {
        self.current = self.base;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        let next = self.current.saturating_add(self.step);
        self.current = match self.max {
            Some(max) => next.min(max),
            None => next,
        };
        Some(self.current)
    }
}

impl From<&BackoffPolicy> for Box<dyn Backoff + Send> {
    fn from(policy: &BackoffPolicy) -> Self {
        match *policy {
            BackoffPolicy::Linear { base, step, max } => {
                Box::new(LinearBackoff::new(base, step, max))
            }
            BackoffPolicy::Exponential {
                initial,
                multiplier,
                max,
            } => {
                // A shrinking multiplier or a first delay above the cap would step down
                let multiplier = if multiplier.is_finite() && multiplier >= 1.0 {
                    multiplier
                } else {
                    1.0
                };
                let backoff: ExponentialBackoff = ExponentialBackoffBuilder::default()
                    .with_initial_interval(initial.min(max))
                    .with_max_interval(max)
                    .with_multiplier(multiplier)
                    // Jitter could make a delay shorter than the previous one
                    .with_randomization_factor(0.0)
                    .with_max_elapsed_time(None) // We handle max attempts separately
                    .build();
                Box::new(backoff)
            }
        }
    }
}

/// Owns the single pending retry deadline of one connection manager.
pub struct ReconnectScheduler {
    backoff: Box<dyn Backoff + Send>,
    max_attempts: Option<u32>,
    attempts: u32,
    pending: Option<Instant>,
}

impl ReconnectScheduler {
    #[must_use]
    pub fn new(config: &ReconnectConfig) -> Self {
        Self {
            backoff: (&config.policy).into(),
            max_attempts: config.max_attempts,
            attempts: 0,
            pending: None,
        }
    }

    /// Arm the next retry, replacing any pending one, and return its delay.
    ///
    /// Returns `None` once `max_attempts` consecutive attempts have been scheduled.
    pub fn schedule(&mut self, now: Instant) -> Option<Duration> {
        self.pending = None;

        if let Some(max) = self.max_attempts
            && self.attempts >= max
        {
            return None;
        }

        let delay = self.backoff.next_backoff()?;
        self.attempts = self.attempts.saturating_add(1);
        self.pending = Some(now + delay);
        Some(delay)
    }

    /// Arm a retry for right now without touching the backoff state.
    pub fn schedule_now(&mut self, now: Instant) {
        self.pending = Some(now);
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }

    /// Back to the base delay; called after every successful open.
    pub fn reset(&mut self) {
        self.backoff.reset();
        self.attempts = 0;
        self.pending = None;
    }

    /// Consume the pending deadline if it has passed.
    pub fn take_due(&mut self, now: Instant) -> bool {
        if self.pending.is_some_and(|deadline| now >= deadline) {
            self.pending = None;
            return true;
        }
        false
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.pending
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Attempts scheduled since the last reset.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl fmt::Debug for ReconnectScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectScheduler")
            .field("max_attempts", &self.max_attempts)
            .field("attempts", &self.attempts)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

/// Callback run once the next open has completed.
pub type ReadyCallback = Box<dyn FnOnce() + Send + 'static>;

/// Callbacks registered while connecting, drained in registration order on open.
#[derive(Default)]
pub struct OpenWaiters {
    callbacks: Vec<ReadyCallback>,
}

impl OpenWaiters {
    pub fn push(&mut self, callback: ReadyCallback) {
        self.callbacks.push(callback);
    }

    /// Take every waiter, leaving the list empty.
    pub fn drain(&mut self) -> Vec<ReadyCallback> {
        std::mem::take(&mut self.callbacks)
    }

    pub fn clear(&mut self) {
        self.callbacks.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

impl fmt::Debug for OpenWaiters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenWaiters")
            .field("len", &self.callbacks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    const STEP: Duration = Duration::from_secs(10);

    fn linear() -> ReconnectScheduler {
        ReconnectScheduler::new(&ReconnectConfig::linear(Duration::ZERO, STEP))
    }

    #[test]
    fn linear_delays_grow_then_reset() {
        let now = Instant::now();
        let mut scheduler = linear();

        let delays: Vec<_> = (0..3).filter_map(|_| scheduler.schedule(now)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(10),
                Duration::from_secs(20),
                Duration::from_secs(30)
            ]
        );
        assert_eq!(scheduler.attempts(), 3);

        scheduler.reset();
        assert_eq!(scheduler.schedule(now), Some(Duration::from_secs(10)));
        assert_eq!(scheduler.attempts(), 1);
    }

    #[test]
    fn linear_respects_cap() {
        let mut backoff = LinearBackoff::new(
            Duration::from_secs(1),
            Duration::from_secs(2),
            Some(Duration::from_secs(4)),
        );

        let delays: Vec<_> = (0..4).filter_map(|_| backoff.next_backoff()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(3),
                Duration::from_secs(4),
                Duration::from_secs(4),
                Duration::from_secs(4)
            ]
        );
    }

    #[test]
    fn exponential_never_decreases_and_respects_max() {
        let config = ReconnectConfig::exponential(
            Duration::from_secs(1),
            3.0,
            Duration::from_secs(20),
        );
        let mut scheduler = ReconnectScheduler::new(&config);
        let now = Instant::now();

        let delays: Vec<_> = (0..8).filter_map(|_| scheduler.schedule(now)).collect();
        assert_eq!(delays.len(), 8);
        assert_eq!(delays.first(), Some(&Duration::from_secs(1)));
        assert!(
            delays.windows(2).all(|pair| pair[0] <= pair[1]),
            "delays must be non-decreasing: {delays:?}"
        );
        assert!(delays.iter().all(|delay| *delay <= Duration::from_secs(20)));
    }

    fn exponential_delays(initial: u64, multiplier: f64, max: u64) -> Vec<Duration> {
        let config = ReconnectConfig::exponential(
            Duration::from_secs(initial),
            multiplier,
            Duration::from_secs(max),
        );
        let mut scheduler = ReconnectScheduler::new(&config);
        let now = Instant::now();

        (0..4).filter_map(|_| scheduler.schedule(now)).collect()
    }

    #[test]
    fn exponential_with_shrinking_multiplier_holds_steady() {
        let delays = exponential_delays(8, 0.5, 60);

        assert_eq!(delays, vec![Duration::from_secs(8); 4]);
    }

    #[test]
    fn exponential_initial_above_max_starts_at_max() {
        let delays = exponential_delays(30, 2.0, 10);

        assert_eq!(delays, vec![Duration::from_secs(10); 4]);
    }

    #[test]
    fn max_attempts_exhausts() {
        let config = ReconnectConfig::linear(Duration::ZERO, STEP).with_max_attempts(2);
        let mut scheduler = ReconnectScheduler::new(&config);
        let now = Instant::now();

        assert!(scheduler.schedule(now).is_some());
        assert!(scheduler.schedule(now).is_some());
        assert_eq!(scheduler.schedule(now), None);
        assert!(!scheduler.is_pending());
    }

    #[test]
    fn only_latest_deadline_is_pending() {
        let now = Instant::now();
        let mut scheduler = linear();

        scheduler.schedule(now);
        scheduler.schedule(now);

        assert_eq!(scheduler.deadline(), Some(now + Duration::from_secs(20)));
        assert!(!scheduler.take_due(now + Duration::from_secs(10)));
        assert!(scheduler.take_due(now + Duration::from_secs(20)));
        assert!(!scheduler.take_due(now + Duration::from_secs(30)));
    }

    #[test]
    fn cancel_clears_pending() {
        let now = Instant::now();
        let mut scheduler = linear();
        scheduler.schedule(now);

        scheduler.cancel();

        assert_eq!(scheduler.deadline(), None);
        assert!(!scheduler.take_due(now + Duration::from_secs(60)));
    }

    #[test]
    fn waiters_drain_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut waiters = OpenWaiters::default();
        for index in 0..3 {
            let order = Arc::clone(&order);
            waiters.push(Box::new(move || order.lock().unwrap().push(index)));
        }
        assert_eq!(waiters.len(), 3);

        for callback in waiters.drain() {
            callback();
        }

        assert!(waiters.is_empty());
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }
}
