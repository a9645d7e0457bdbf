//! Monotonic time measurement shared by paced components.

use std::sync::Arc;
use std::time::Instant;

/// Monotonic clock handle. One per process; components take it by `Arc` so
/// their pacing and jitter measurements share the same origin.
#[derive(Debug, Clone)]
pub struct TimeMeter {
    start: Arc<Instant>,
}

impl TimeMeter {
    pub fn new() -> Self {
        Self { start: Arc::new(Instant::now()) }
    }

    /// Microseconds since the meter was created.
    pub fn measure(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    /// Milliseconds since the meter was created.
    pub fn measure_ms(&self) -> u32 {
        (self.measure() / 1000) as u32
    }
}

impl Default for TimeMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn measure_is_monotonic() {
        let meter = TimeMeter::new();
        let a = meter.measure();
        let b = meter.measure();
        assert!(b >= a);
    }
}
