use core::cell::Cell;
use core::time::Duration;
use std::time::Instant;

/// Monotonic clock measured from an arbitrary reset point.
pub trait Timer {
    fn ticks_since_reset(&self) -> Duration;
}

impl<T: Timer + ?Sized> Timer for &T {
    fn ticks_since_reset(&self) -> Duration {
        <T as Timer>::ticks_since_reset(&**self)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StdTimer {
    start: Instant,
}

impl Default for StdTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl StdTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Timer for StdTimer {
    fn ticks_since_reset(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualTimer {
    now: Cell<Duration>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }

    pub fn set(&self, now: Duration) {
        self.now.set(now);
    }
}

impl Timer for ManualTimer {
    fn ticks_since_reset(&self) -> Duration {
        self.now.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_timer_advances() {
        let t = ManualTimer::new();
        assert_eq!(t.ticks_since_reset(), Duration::ZERO);
        t.advance(Duration::from_secs(30));
        t.advance(Duration::from_millis(5));
        assert_eq!((&t).ticks_since_reset(), Duration::from_millis(30_005));
    }

    #[test]
    fn std_timer_is_monotonic() {
        let t = StdTimer::new();
        let a = t.ticks_since_reset();
        let b = t.ticks_since_reset();
        assert!(b >= a);
    }
}
