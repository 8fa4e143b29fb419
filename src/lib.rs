//! Firmware core for a pair of wearable bilateral-stimulation devices.
//!
//! Each device drives an H-bridge vibration motor and an RGB indicator. Two
//! devices pair over BLE, then coordinate over a low-latency radio link so
//! that the left and right side alternate with sub-millisecond accuracy.
//! This crate implements the protocol and policy layers of that firmware:
//! time synchronization, role negotiation and fallback, radio co-existence
//! scheduling, session key derivation, pattern playback, and the button and
//! BLE task state machines.
//!
//! # Using the core
//!
//! The crate is runtime and hardware-agnostic: it does not need an RTOS
//! (although the reference platform runs one) and reaches all peripherals
//! through traits that need to be implemented once per MCU family:
//!
//! * A microsecond-precision [`time::Timer`] and a blocking [`time::Delay`].
//! * A [`radio::Phy`] wrapping the vendor low-latency radio stack.
//! * [`actuator::Motor`] and [`actuator::Led`] drivers.
//! * A [`settings::Storage`] key-value store and a [`power::Sleep`] hook.
//!
//! Bundle those types in an implementation of [`config::Config`] and hand it
//! to [`device::Core`], or drive the individual engines directly.

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod log;
#[macro_use]
mod utils;

pub mod actuator;
pub mod addr;
pub mod ble;
pub mod button;
pub mod bytes;
pub mod config;
pub mod crc;
pub mod device;
mod error;
pub mod kdf;
pub mod msg;
pub mod pattern;
pub mod power;
pub mod radio;
pub mod role;
pub mod settings;
pub mod sync;
pub mod time;

pub use self::error::Error;

/// Protocol version carried in beacon frames.
///
/// Devices with differing protocol versions refuse to coordinate and show
/// the version-mismatch status pattern instead.
pub const PROTOCOL_VERSION: u8 = 2;
