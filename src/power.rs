//! Deep-sleep entry and wake-source reporting.

use crate::radio::{Phy, Transport};
use crate::settings::{Settings, Storage};
use crate::Error;

/// Why the device woke up.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WakeSource {
    PowerOn,
    Button,
    Timer,
    Unknown,
}

/// Deep-sleep shim.
pub trait Sleep {
    /// Configures wake sources and enters deep sleep. On real hardware
    /// this does not return; mocks return `Ok` so the sequence is
    /// testable.
    fn enter_deep_sleep(&mut self) -> Result<(), Error>;

    /// Reports what ended the previous sleep.
    fn wake_source(&self) -> WakeSource;
}

/// Task watchdog shim. Subscription and unsubscription are platform
/// concerns; the core only needs to feed it during long-running button
/// countdowns.
pub trait Watchdog {
    fn feed(&mut self);
}

/// Orderly shutdown: persist settings, tear down the encrypted peer (which
/// zeroizes the session key), then enter deep sleep.
///
/// A settings-save failure is surfaced but does not block the sleep entry;
/// key zeroization always happens before power-down.
pub fn shutdown<P: Phy, S: Storage, Z: Sleep>(
    settings: &Settings,
    storage: &mut S,
    transport: &mut Transport,
    phy: &mut P,
    sleep: &mut Z,
) -> Result<(), Error> {
    let save_result = settings.store(storage);
    if let Err(e) = save_result {
        error!("settings save failed on shutdown: {}", e);
    }

    match transport.clear_peer(phy) {
        Ok(()) | Err(Error::InvalidState) => {} // no peer is fine
        Err(e) => warn!("peer teardown failed: {}", e),
    }

    info!("entering deep sleep");
    sleep.enter_deep_sleep()?;
    save_result
}
