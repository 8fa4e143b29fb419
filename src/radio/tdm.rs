//! Radio co-existence scheduling.
//!
//! The BLE controller owns the antenna for 1–5 ms at the start of every
//! connection event. Low-latency bursts are therefore placed into a safe
//! window centered between BLE events: with the default 50 ms connection
//! interval, a 20 ms window centered at the 25 ms midpoint maximises
//! clearance on both sides.

use crate::time::{Delay, Duration, Instant, Timer};

/// BLE connection interval the pair is configured for.
pub const BLE_CONN_INTERVAL_MS: u64 = 50;

/// Offset of the safe-window center from the start of each BLE interval.
pub const TDM_OFFSET_MS: u64 = 25;

/// Width of the safe window.
pub const TDM_WINDOW_MS: u64 = 20;

/// Placement of radio bursts into the gaps between BLE connection events.
#[derive(Debug, Copy, Clone)]
pub struct TdmSchedule {
    interval_ms: u64,
    offset_ms: u64,
    window_ms: u64,
}

impl Default for TdmSchedule {
    fn default() -> Self {
        TdmSchedule::new(BLE_CONN_INTERVAL_MS, TDM_OFFSET_MS, TDM_WINDOW_MS)
    }
}

impl TdmSchedule {
    /// Creates a schedule for a BLE connection interval of `interval_ms`
    /// with a safe window of `window_ms` centered at `offset_ms`.
    pub const fn new(interval_ms: u64, offset_ms: u64, window_ms: u64) -> Self {
        TdmSchedule {
            interval_ms,
            offset_ms,
            window_ms,
        }
    }

    fn phase_ms(&self, now: Instant) -> u64 {
        (now.raw_micros() / 1_000) % self.interval_ms
    }

    /// Returns whether `now` falls inside the safe window.
    pub fn is_safe(&self, now: Instant) -> bool {
        let phase = self.phase_ms(now);
        let half = self.window_ms / 2;
        phase >= self.offset_ms - half && phase <= self.offset_ms + half
    }

    /// Computes the delay from `now` to the next window center.
    ///
    /// The delay always targets the *center* of the window, even when `now`
    /// already falls inside it: a burst started at the center tolerates the
    /// largest scheduling slip in either direction.
    pub fn delay_until_safe(&self, now: Instant) -> Duration {
        let phase = self.phase_ms(now);
        let delay_ms = if phase < self.offset_ms {
            self.offset_ms - phase
        } else {
            (self.interval_ms - phase) + self.offset_ms
        };
        Duration::from_micros(delay_ms * 1_000)
    }

    /// Sleeps until the next window center and returns the slept duration.
    pub fn wait_for_safe(&self, timer: &impl Timer, delay: &mut impl Delay) -> Duration {
        let d = self.delay_until_safe(timer.now());
        delay.delay(d);
        d
    }
}
