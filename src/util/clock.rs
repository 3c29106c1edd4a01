use tokio::time::Instant;

/// Monotonic millisecond timestamps relative to a base instant. All components of a router share
///  one clock so that their timestamps are comparable.
///
/// NB: this is based on tokio's clock, so paused time in tests applies
#[derive(Clone, Copy, Debug)]
pub struct MonotonicClock {
    base: Instant,
}
impl Default for MonotonicClock {
    fn default() -> Self {
        MonotonicClock::new()
    }
}
impl MonotonicClock {
    pub fn new() -> MonotonicClock {
        MonotonicClock {
            base: Instant::now(),
        }
    }

    pub fn now_millis(&self) -> i64 {
        Instant::now().saturating_duration_since(self.base).as_millis() as i64
    }
}
