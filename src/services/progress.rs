//! Sliding-window transfer speed.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::constants::{SPEED_EMIT_INTERVAL, SPEED_WINDOW};

/// Computes bytes/second over a trailing window and rate-limits reporting.
pub struct SpeedTracker {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
    emit_interval: Duration,
    last_emit: Option<Instant>,
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new(SPEED_WINDOW, SPEED_EMIT_INTERVAL)
    }
}

impl SpeedTracker {
    pub fn new(window: Duration, emit_interval: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
            emit_interval,
            last_emit: None,
        }
    }

    /// Record the cumulative byte count at `now`.
    ///
    /// Returns a speed once per emit interval, `None` otherwise.
    pub fn record(&mut self, bytes_done: u64, now: Instant) -> Option<f64> {
        self.samples.push_back((now, bytes_done));
        while let Some(&(at, _)) = self.samples.front() {
            if now.duration_since(at) > self.window && self.samples.len() > 2 {
                self.samples.pop_front();
            } else {
                break;
            }
        }

        let due = self
            .last_emit
            .is_none_or(|last| now.duration_since(last) >= self.emit_interval);
        if !due {
            return None;
        }
        let speed = self.bytes_per_sec()?;
        self.last_emit = Some(now);
        Some(speed)
    }

    /// Average speed across the retained samples.
    pub fn bytes_per_sec(&self) -> Option<f64> {
        let (first_at, first_bytes) = *self.samples.front()?;
        let (last_at, last_bytes) = *self.samples.back()?;
        let elapsed = last_at.duration_since(first_at).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }
        Some(last_bytes.saturating_sub(first_bytes) as f64 / elapsed)
    }

    /// Forget samples, e.g. after a pause.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.last_emit = None;
    }
}
