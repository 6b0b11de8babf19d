//! Retry and wait policy shared by the watcher and the display loop.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

/// Doubling delay, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Fixed delay that never grows.
    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay)
    }

    /// Returns the delay to wait now and doubles the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Sleeps the current thread for `total`, checking `cancel` every `tick`.
///
/// Returns `false` if cancelled before the time was up.
pub fn blocking_pause(cancel: &CancellationToken, total: Duration, tick: Duration) -> bool {
    let deadline = Instant::now() + total;
    let tick = if tick.is_zero() {
        Duration::from_millis(10)
    } else {
        tick
    };
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(tick.min(deadline - now));
    }
}

/// Time left before `last + dwell`, or zero if nothing was shown yet.
pub fn remaining_dwell(last: Option<Instant>, dwell: Duration, now: Instant) -> Duration {
    match last {
        Some(last) => (last + dwell).saturating_duration_since(now),
        None => Duration::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let delays: Vec<_> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn fixed_backoff_stays_put() {
        let mut backoff = Backoff::fixed(Duration::from_millis(250));
        backoff.next_delay();
        assert_eq!(backoff.next_delay(), Duration::from_millis(250));
    }

    #[test]
    fn pause_stops_early_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let started = Instant::now();
        assert!(!blocking_pause(
            &cancel,
            Duration::from_secs(10),
            Duration::from_millis(5)
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn pause_runs_to_completion() {
        let cancel = CancellationToken::new();
        assert!(blocking_pause(
            &cancel,
            Duration::from_millis(20),
            Duration::from_millis(5)
        ));
    }

    #[test]
    fn first_image_has_no_dwell() {
        let now = Instant::now();
        assert_eq!(
            remaining_dwell(None, Duration::from_secs(30), now),
            Duration::ZERO
        );
        let remaining = remaining_dwell(Some(now), Duration::from_secs(30), now);
        assert_eq!(remaining, Duration::from_secs(30));
    }
}
