//! Core configuration trait.

use crate::actuator::{Led, Motor};
use crate::power::Sleep;
use crate::radio::Phy;
use crate::settings::Storage;
use crate::time::{Delay, Timer};

/// Trait bundling the platform types the core runs on.
///
/// This defines the hardware interface types used throughout the firmware
/// core. Every platform defines one type implementing this trait and hands
/// the matching values to [`Core`].
///
/// [`Core`]: crate::device::Core
pub trait Config {
    /// Monotonic microsecond time source.
    type Timer: Timer;

    /// Blocking task delay.
    type Delay: Delay;

    /// The low-latency radio (vendor stack shim).
    type Phy: Phy;

    /// H-bridge motor driver.
    type Motor: Motor;

    /// Addressable RGB status LED.
    type Led: Led;

    /// Non-volatile key-value settings store.
    type Storage: Storage;

    /// Deep-sleep and wake-source shim.
    type Sleep: Sleep;
}
