//! Per-listener throttle and debounce windows.
//!
//! Throttle is leading-edge: the first call in a window passes, the rest of
//! the window is dropped. Debounce is trailing-edge: each call re-arms the
//! timer and only the last payload is delivered once the window stays quiet.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::value::Value;

/// Rate-limit options for a single subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Minimum spacing between deliveries; calls inside the window are dropped.
    pub throttle: Option<Duration>,
    /// Quiet period before delivering the most recent call.
    pub debounce: Option<Duration>,
}

impl ListenOptions {
    pub fn throttled(window: Duration) -> Self {
        Self {
            throttle: Some(window),
            ..Self::default()
        }
    }

    pub fn debounced(delay: Duration) -> Self {
        Self {
            debounce: Some(delay),
            ..Self::default()
        }
    }
}

/// Leading-edge throttle window.
#[derive(Debug)]
pub(crate) struct Throttle {
    window: Duration,
    last_pass: Mutex<Option<Instant>>,
}

impl Throttle {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            last_pass: Mutex::new(None),
        }
    }

    /// Record a call and report whether it may pass.
    pub(crate) fn admit(&self, now: Instant) -> bool {
        let mut last = self.last_pass.lock();
        match *last {
            Some(prev) if now.saturating_duration_since(prev) < self.window => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// Trailing-edge debounce timer state.
#[derive(Debug)]
pub(crate) struct Debounce {
    delay: Duration,
    generation: AtomicU64,
    pending: Mutex<Option<Value>>,
}

impl Debounce {
    pub(crate) fn new(delay: Duration) -> Self {
        Self {
            delay,
            generation: AtomicU64::new(0),
            pending: Mutex::new(None),
        }
    }

    pub(crate) fn delay(&self) -> Duration {
        self.delay
    }

    /// Store the latest payload and return the generation the timer must
    /// still match when it fires.
    pub(crate) fn arm(&self, data: Value) -> u64 {
        *self.pending.lock() = Some(data);
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Take the pending payload if no newer call re-armed the timer.
    pub(crate) fn fire(&self, generation: u64) -> Option<Value> {
        if self.generation.load(Ordering::Acquire) != generation {
            return None;
        }
        self.pending.lock().take()
    }

    /// Drop any pending payload.
    pub(crate) fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.pending.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_drops_calls_inside_window() {
        let throttle = Throttle::new(Duration::from_millis(100));
        let start = Instant::now();

        assert!(throttle.admit(start));
        assert!(!throttle.admit(start + Duration::from_millis(10)));
        assert!(!throttle.admit(start + Duration::from_millis(99)));
        assert!(throttle.admit(start + Duration::from_millis(100)));
    }

    #[test]
    fn test_debounce_only_latest_generation_fires() {
        let debounce = Debounce::new(Duration::from_millis(10));

        let first = debounce.arm(Value::Int(1));
        let second = debounce.arm(Value::Int(2));

        assert_eq!(debounce.fire(first), None);
        assert_eq!(debounce.fire(second), Some(Value::Int(2)));
        // Payload is consumed.
        assert_eq!(debounce.fire(second), None);
    }

    #[test]
    fn test_debounce_cancel_discards_pending() {
        let debounce = Debounce::new(Duration::from_millis(10));
        let gen = debounce.arm(Value::from("x"));
        debounce.cancel();
        assert_eq!(debounce.fire(gen), None);
    }

    #[test]
    fn test_listen_options_helpers() {
        assert_eq!(ListenOptions::default().throttle, None);
        assert_eq!(
            ListenOptions::throttled(Duration::from_millis(5)).throttle,
            Some(Duration::from_millis(5))
        );
        assert_eq!(
            ListenOptions::debounced(Duration::from_millis(5)).debounce,
            Some(Duration::from_millis(5))
        );
    }
}
