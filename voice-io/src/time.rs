//! Timing utilities
//!
//! Provides an interval timer for periodic work (spatial refresh, statistics)
//! and a pacer for emitting fixed-duration audio frames in real time.

use std::thread;
use std::time::{Duration, Instant};

/// Timer for periodic operations
pub struct Timer {
    interval: Duration,
    last_fire: Instant,
}

impl Timer {
    /// Create a new timer with the given interval
    pub fn new(interval: Duration) -> Self {
        Timer {
            interval,
            last_fire: Instant::now(),
        }
    }

    /// Get the timer interval
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Check if the timer has expired
    pub fn expired(&self) -> bool {
        self.last_fire.elapsed() >= self.interval
    }

    /// Reset the timer
    pub fn reset(&mut self) {
        self.last_fire = Instant::now();
    }

    /// Get time until next expiration
    pub fn time_until_expiration(&self) -> Duration {
        self.interval.saturating_sub(self.last_fire.elapsed())
    }

    /// Fire the timer if expired, returning the time since it last fired
    pub fn try_fire(&mut self) -> Option<Duration> {
        let elapsed = self.last_fire.elapsed();
        if elapsed >= self.interval {
            self.reset();
            Some(elapsed)
        } else {
            None
        }
    }
}

/// Real-time pacer for fixed-duration frames
///
/// Deadlines advance by exactly one frame per call so sleep jitter does not
/// accumulate into drift. If the caller falls more than one frame behind the
/// schedule is re-anchored to now.
pub struct FramePacer {
    frame: Duration,
    next_deadline: Instant,
}

impl FramePacer {
    pub fn new(frame: Duration) -> Self {
        FramePacer {
            frame,
            next_deadline: Instant::now(),
        }
    }

    /// Sleep until the next frame is due
    pub fn wait_next(&mut self) {
        let now = Instant::now();
        if self.next_deadline > now {
            thread::sleep(self.next_deadline - now);
            self.next_deadline += self.frame;
        } else if now - self.next_deadline > self.frame {
            self.next_deadline = now + self.frame;
        } else {
            self.next_deadline += self.frame;
        }
    }
}
