//! Time APIs for obtaining the current time and calculating with points in
//! time and durations.
//!
//! These APIs are made for the coordination core and are not meant to be
//! general-purpose. They have microsecond resolution and 64-bit range: the
//! sync protocol carries 64-bit timestamps on the wire, and a session can
//! outlive any 32-bit microsecond counter.

use core::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};

/// A duration with microsecond resolution.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Duration(u64);

impl Duration {
    /// The zero-length duration.
    pub const ZERO: Self = Duration(0);

    /// Creates a `Duration` from a number of microseconds.
    pub const fn from_micros(micros: u64) -> Self {
        Duration(micros)
    }

    /// Creates a `Duration` representing the given number of milliseconds.
    pub const fn from_millis(millis: u32) -> Self {
        Duration(millis as u64 * 1_000)
    }

    /// Creates a `Duration` representing a number of seconds.
    pub const fn from_secs(secs: u32) -> Self {
        Duration(secs as u64 * 1_000_000)
    }

    /// Returns the number of whole seconds that fit in `self`.
    pub const fn whole_secs(&self) -> u64 {
        self.0 / 1_000_000
    }

    /// Returns the number of whole milliseconds that fit in `self`.
    pub const fn whole_millis(&self) -> u64 {
        self.0 / 1_000
    }

    /// Returns the number of microseconds represented by `self`.
    pub const fn as_micros(&self) -> u64 {
        self.0
    }

    /// Returns the fractional part of microseconds in `self`.
    pub const fn subsec_micros(&self) -> u64 {
        self.0 % 1_000_000
    }

    /// Multiplies `self` by an integer factor.
    pub const fn mul(self, factor: u64) -> Self {
        Duration(self.0 * factor)
    }
}

impl Add for Duration {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Duration(self.0.checked_add(rhs.0).expect("duration overflow"))
    }
}

impl AddAssign for Duration {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for Duration {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Duration(self.0.checked_sub(rhs.0).expect("duration underflow"))
    }
}

impl SubAssign for Duration {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

fn fmt_micros(micros: u64, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if micros >= 1_000_000 {
        let (secs, subsec) = (micros / 1_000_000, micros % 1_000_000);
        if subsec == 0 {
            write!(f, "{}s", secs)
        } else {
            write!(f, "{}.{:06}s", secs, subsec)
        }
    } else if micros >= 1000 {
        let (millis, submilli) = (micros / 1000, micros % 1000);
        if submilli == 0 {
            write!(f, "{}ms", millis)
        } else {
            write!(f, "{}.{:03}ms", millis, submilli)
        }
    } else {
        write!(f, "{}µs", micros)
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_micros(self.0, f)
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Display>::fmt(self, f)
    }
}

/// A point in time, relative to an unspecified epoch.
///
/// `Instant`s are obtained from an implementation of [`Timer`]. `Instant`s
/// created from different [`Timer`] instances (even when using the same
/// implementation) are not compatible, and mixing them in operations causes
/// unspecified results. [`Duration`]s are independent of the [`Timer`]
/// implementation and thus can be mixed freely.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Instant(u64);

impl Instant {
    /// Creates an `Instant` from raw microseconds since an arbitrary
    /// implementation-defined reference point.
    ///
    /// This should only be called from a [`Timer`] implementation.
    pub const fn from_raw_micros(micros: u64) -> Self {
        Instant(micros)
    }

    /// Returns the raw value from which this `Instant` was created.
    pub const fn raw_micros(&self) -> u64 {
        self.0
    }

    /// Calculates the duration of time that has passed between `earlier` and
    /// `self`.
    ///
    /// Both `self` and `earlier` must have been created by the same
    /// [`Timer`], or the result of this function will be unspecified.
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        Duration(
            self.0
                .checked_sub(earlier.0)
                .expect("`earlier` is later than `self`"),
        )
    }

    /// Calculates `self - earlier` without panicking, saturating at zero
    /// when `earlier` lies in the future.
    pub fn saturating_duration_since(&self, earlier: Instant) -> Duration {
        Duration(self.0.saturating_sub(earlier.0))
    }
}

impl Sub<Instant> for Instant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.duration_since(rhs)
    }
}

impl Add<Duration> for Instant {
    type Output = Self;

    fn add(self, d: Duration) -> Self {
        Instant(self.0.checked_add(d.as_micros()).expect("instant overflow"))
    }
}

impl AddAssign<Duration> for Instant {
    fn add_assign(&mut self, d: Duration) {
        *self = *self + d;
    }
}

impl Sub<Duration> for Instant {
    type Output = Self;

    fn sub(self, d: Duration) -> Self {
        Instant(
            self.0
                .checked_sub(d.as_micros())
                .expect("instant underflow"),
        )
    }
}

impl SubAssign<Duration> for Instant {
    fn sub_assign(&mut self, d: Duration) {
        *self = *self - d;
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_micros(self.0, f)
    }
}

impl fmt::Debug for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Display>::fmt(self, f)
    }
}

/// Trait for time providers.
///
/// The hardware interface has to provide an implementation of `Timer` to the
/// core. The implementation must be monotonic and have microsecond accuracy.
///
/// This trait can also be implemented by a mock timer for testing.
pub trait Timer {
    /// Obtain the current time as an [`Instant`].
    ///
    /// The [`Instant`]s returned by this function must never move backwards
    /// in time.
    fn now(&self) -> Instant;
}

/// Trait for blocking delays.
///
/// Retry loops and the TDM scheduler need to sleep for bounded, short
/// durations. Implementations should suspend the calling task rather than
/// busy-wait where an RTOS is available.
pub trait Delay {
    /// Blocks for at least `d`.
    fn delay(&mut self, d: Duration);
}

/// Signed microsecond offset mapping the local [`Timer`] timeline onto the
/// shared session timeline.
///
/// The sync engine owns the policy for adjusting this register (slew
/// limiting, handshake results); the register itself only stores and
/// applies the offset. On the server the offset is zero and local time *is*
/// session time.
#[derive(Copy, Clone, Default)]
pub struct WallClock {
    offset_us: i64,
}

impl WallClock {
    /// A wall clock with zero offset.
    pub const fn new() -> Self {
        WallClock { offset_us: 0 }
    }

    /// Replaces the stored offset.
    pub fn set_offset_us(&mut self, offset_us: i64) {
        self.offset_us = offset_us;
    }

    /// Adds a (possibly negative) correction to the stored offset.
    pub fn adjust_us(&mut self, delta_us: i64) {
        self.offset_us += delta_us;
    }

    /// Returns the stored offset in microseconds.
    pub fn offset_us(&self) -> i64 {
        self.offset_us
    }

    /// Maps a local instant to session time in microseconds.
    pub fn session_time_us(&self, local: Instant) -> u64 {
        local.raw_micros().wrapping_add(self.offset_us as u64)
    }
}

impl fmt::Debug for WallClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WallClock({:+}µs)", self.offset_us)
    }
}
