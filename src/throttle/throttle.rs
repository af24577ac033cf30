// SPDX-License-Identifier: PMPL-1.0-or-later

//! Strict minimum-interval gate with no burst allowance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::sync::atomics::saturating_nanos;

/// Allows at most one call per `interval`, decided by a single CAS on the
/// last-allowed timestamp. Used for alert and log frequency limits.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    epoch: Instant,
    /// Nanoseconds since `epoch` of the last allowed call, plus one; 0 = never.
    last_allowed: AtomicU64,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            epoch: Instant::now(),
            last_allowed: AtomicU64::new(0),
        }
    }

    fn now_mark(&self) -> u64 {
        saturating_nanos(self.epoch.elapsed()).saturating_add(1)
    }

    pub fn allow(&self) -> bool {
        let last = self.last_allowed.load(Ordering::Acquire);
        let now = self.now_mark();
        if last != 0 && now.saturating_sub(last) < saturating_nanos(self.interval) {
            return false;
        }
        self.last_allowed
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Time until the next call could be allowed.
    pub fn remaining(&self) -> Duration {
        let last = self.last_allowed.load(Ordering::Acquire);
        if last == 0 {
            return Duration::ZERO;
        }
        let since = Duration::from_nanos(self.now_mark().saturating_sub(last));
        self.interval.saturating_sub(since)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn first_call_passes_then_blocks() {
        let throttle = Throttle::new(Duration::from_secs(60));
        assert!(throttle.allow());
        assert!(!throttle.allow());
        assert!(throttle.remaining() > Duration::from_secs(59));
    }

    #[test]
    fn passes_again_after_interval() {
        let throttle = Throttle::new(Duration::from_millis(10));
        assert!(throttle.allow());
        thread::sleep(Duration::from_millis(15));
        assert!(throttle.allow());
    }

    #[test]
    fn only_one_racer_wins() {
        let throttle = Arc::new(Throttle::new(Duration::from_secs(60)));
        let winners: usize = (0..8)
            .map(|_| {
                let throttle = throttle.clone();
                thread::spawn(move || throttle.allow())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().expect("join") as usize)
            .sum();
        assert_eq!(winners, 1);
    }
}
