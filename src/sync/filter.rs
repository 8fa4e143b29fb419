//! Offset estimation filters.
//!
//! Two filters feed the sync engine:
//!
//! * [`HandshakeFilter`] collects the (offset, delay) pairs produced by the
//!   PTP four-message exchanges, rejects samples whose round-trip delay
//!   blows past the running median, and condenses the survivors into a
//!   trimmed-mean offset.
//! * [`OffsetWindow`] watches per-beacon offset observations in steady
//!   state and declares lock once their spread settles.

use crate::utils::isqrt;
use heapless::Vec;

/// Minimum accepted PTP exchanges before an offset is produced.
pub const MIN_HANDSHAKE_SAMPLES: usize = 4;

/// Upper bound on collected PTP exchanges per handshake.
pub const MAX_HANDSHAKE_SAMPLES: usize = 12;

/// Samples whose round-trip delay exceeds this multiple of the running
/// median are rejected as retransmission or co-existence artifacts.
pub const DELAY_REJECT_FACTOR: i64 = 3;

/// Sliding-window length for lock detection.
pub const LOCK_WINDOW: usize = 5;

/// Lock is declared when the offset standard deviation over a full window
/// drops below this many microseconds.
pub const LOCK_STDDEV_US: u64 = 300;

/// One completed PTP four-message exchange.
///
/// T1: client transmit, T2: server receive, T3: server transmit, T4: client
/// receive. T1/T4 are client-clock, T2/T3 server-clock.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PtpExchange {
    pub t1: u64,
    pub t2: u64,
    pub t3: u64,
    pub t4: u64,
}

impl PtpExchange {
    /// Clock offset estimate `θ = ((T2 − T1) − (T4 − T3)) / 2`, positive
    /// when the server clock is ahead.
    pub fn offset_us(&self) -> i64 {
        let fwd = self.t2 as i64 - self.t1 as i64;
        let rev = self.t4 as i64 - self.t3 as i64;
        (fwd - rev) / 2
    }

    /// Round-trip delay `δ = (T4 − T1) − (T3 − T2)`.
    pub fn delay_us(&self) -> i64 {
        (self.t4 as i64 - self.t1 as i64) - (self.t3 as i64 - self.t2 as i64)
    }
}

/// Collects PTP exchanges and produces a robust offset.
#[derive(Debug, Default)]
pub struct HandshakeFilter {
    samples: Vec<(i64, i64), MAX_HANDSHAKE_SAMPLES>,
}

impl HandshakeFilter {
    pub const fn new() -> Self {
        HandshakeFilter {
            samples: Vec::new(),
        }
    }

    /// Records one exchange. Returns `false` once the filter is full.
    pub fn push(&mut self, exchange: &PtpExchange) -> bool {
        self.samples
            .push((exchange.offset_us(), exchange.delay_us()))
            .is_ok()
    }

    /// Number of exchanges recorded (before rejection).
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    fn median_delay(&self) -> i64 {
        let mut delays: Vec<i64, MAX_HANDSHAKE_SAMPLES> =
            self.samples.iter().map(|&(_, d)| d).collect();
        delays.sort_unstable();
        delays[delays.len() / 2]
    }

    /// The final offset: trimmed mean over the delay-accepted samples, or
    /// `None` while fewer than [`MIN_HANDSHAKE_SAMPLES`] survive.
    pub fn offset_us(&self) -> Option<i64> {
        if self.samples.is_empty() {
            return None;
        }
        let cutoff = self.median_delay().saturating_mul(DELAY_REJECT_FACTOR);
        let mut accepted: Vec<i64, MAX_HANDSHAKE_SAMPLES> = self
            .samples
            .iter()
            .filter(|&&(_, d)| d <= cutoff)
            .map(|&(o, _)| o)
            .collect();
        if accepted.len() < MIN_HANDSHAKE_SAMPLES {
            return None;
        }

        accepted.sort_unstable();
        // Trim a quarter from each end, keeping at least half the samples.
        let trim = accepted.len() / 4;
        let kept = &accepted[trim..accepted.len() - trim];
        let sum: i64 = kept.iter().sum();
        Some(sum / kept.len() as i64)
    }
}

/// Sliding window over steady-state offset observations.
#[derive(Debug)]
pub struct OffsetWindow {
    window: [i64; LOCK_WINDOW],
    head: usize,
    count: usize,
}

impl Default for OffsetWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl OffsetWindow {
    pub const fn new() -> Self {
        OffsetWindow {
            window: [0; LOCK_WINDOW],
            head: 0,
            count: 0,
        }
    }

    pub fn push(&mut self, offset_us: i64) {
        self.window[self.head] = offset_us;
        self.head = (self.head + 1) % LOCK_WINDOW;
        if self.count < LOCK_WINDOW {
            self.count += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn clear(&mut self) {
        self.count = 0;
        self.head = 0;
    }

    /// Standard deviation over the window contents, `None` until the
    /// window has filled once.
    pub fn stddev_us(&self) -> Option<u64> {
        if self.count < LOCK_WINDOW {
            return None;
        }
        let n = self.count as i64;
        let sum: i64 = self.window[..self.count].iter().sum();
        let mean = sum / n;
        let var: i64 = self.window[..self.count]
            .iter()
            .map(|&s| (s - mean) * (s - mean))
            .sum::<i64>()
            / n;
        Some(isqrt(var as u64))
    }

    /// Whether the window is full and its spread is below the lock
    /// threshold.
    pub fn locked(&self) -> bool {
        self.stddev_us().map_or(false, |sd| sd < LOCK_STDDEV_US)
    }
}
