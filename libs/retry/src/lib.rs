//! Bounded-attempt retry for eventually consistent cloud APIs.
//!
//! Cloud backends routinely report "resource not found" for a short window
//! after creating it. Callers at that boundary wrap the lookup in an
//! [`AttemptStrategy`]: a fixed total wall-clock budget with a fixed delay
//! between attempts. This is deliberately not a general backoff library;
//! transient provisioning failures are handled elsewhere by an explicit
//! status flag, never by retrying harder at the edge.
//!
//! # Invariants
//!
//! - At least one attempt is always allowed, even with a zero budget
//! - The delay is only taken between attempts, never before the first
//! - The budget is wall-clock: a slow call burns budget just like a sleep

use std::time::{Duration, Instant};

/// A retry strategy: total budget plus inter-attempt delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptStrategy {
    /// Total wall-clock time attempts may span.
    pub total: Duration,

    /// Delay between consecutive attempts.
    pub delay: Duration,
}

impl AttemptStrategy {
    /// Creates a strategy with the given budget and delay.
    #[must_use]
    pub const fn new(total: Duration, delay: Duration) -> Self {
        Self { total, delay }
    }

    /// Begins a new run of attempts, starting the clock now.
    #[must_use]
    pub fn start(&self) -> Attempt {
        Attempt {
            end: Instant::now() + self.total,
            delay: self.delay,
            count: 0,
        }
    }
}

/// One run of attempts under a strategy.
///
/// ```
/// use std::time::Duration;
/// use convoy_retry::AttemptStrategy;
///
/// let strategy = AttemptStrategy::new(Duration::from_millis(50), Duration::from_millis(10));
/// let mut attempt = strategy.start();
/// while attempt.next() {
///     // try the flaky call; break on success
///     break;
/// }
/// ```
#[derive(Debug)]
pub struct Attempt {
    end: Instant,
    delay: Duration,
    count: u32,
}

impl Attempt {
    /// Waits for the inter-attempt delay and reports whether another
    /// attempt is allowed. The first call returns `true` immediately.
    ///
    /// Blocks the thread; use [`Attempt::next_async`] from async code.
    pub fn next(&mut self) -> bool {
        if self.count == 0 {
            self.count = 1;
            return true;
        }
        if !self.has_next() {
            return false;
        }
        std::thread::sleep(self.delay);
        self.count += 1;
        true
    }

    /// Async variant of [`Attempt::next`], sleeping on the tokio timer.
    pub async fn next_async(&mut self) -> bool {
        if self.count == 0 {
            self.count = 1;
            return true;
        }
        if !self.has_next() {
            return false;
        }
        tokio::time::sleep(self.delay).await;
        self.count += 1;
        true
    }

    /// Reports whether a further attempt would fit in the budget after
    /// the delay, without consuming one.
    #[must_use]
    pub fn has_next(&self) -> bool {
        self.count == 0 || Instant::now() + self.delay < self.end
    }

    /// Number of attempts handed out so far.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_budget_allows_exactly_one_attempt() {
        let strategy = AttemptStrategy::new(Duration::ZERO, Duration::ZERO);
        let mut attempt = strategy.start();
        assert!(attempt.next());
        assert!(!attempt.next());
        assert_eq!(attempt.count(), 1);
    }

    #[test]
    fn attempts_stay_within_budget() {
        let strategy =
            AttemptStrategy::new(Duration::from_millis(80), Duration::from_millis(20));
        let started = Instant::now();
        let mut attempt = strategy.start();
        let mut n = 0;
        while attempt.next() {
            n += 1;
            assert!(n < 50, "attempt loop did not terminate");
        }
        assert!(n >= 2, "expected at least two attempts, got {n}");
        // The final delay is not taken once the budget is exhausted.
        assert!(started.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn first_attempt_is_immediate() {
        let strategy = AttemptStrategy::new(Duration::from_secs(10), Duration::from_secs(10));
        let started = Instant::now();
        let mut attempt = strategy.start();
        assert!(attempt.next());
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn async_attempts_respect_budget() {
        let strategy =
            AttemptStrategy::new(Duration::from_millis(40), Duration::from_millis(10));
        let mut attempt = strategy.start();
        let mut n = 0;
        while attempt.next_async().await {
            n += 1;
        }
        assert!((2..=6).contains(&n), "unexpected attempt count {n}");
    }
}
