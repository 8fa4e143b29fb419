//! Persisted user settings.
//!
//! Settings live in a key-value store (vendor NVS) under the
//! `ble_settings` namespace, one key per field, integers little-endian.
//! Loading tolerates missing keys (fresh device, or a firmware that added
//! fields) by falling back to per-field defaults; writes happen only on
//! the shutdown path, so there are never concurrent writers.

use crate::actuator::{palette, Rgb};
use crate::role::SessionParams;
use crate::Error;
use byteorder::{ByteOrder, LittleEndian};

/// NVS namespace holding all settings keys.
pub const NAMESPACE: &str = "ble_settings";

/// Key-value storage shim (vendor NVS).
pub trait Storage {
    /// Reads a key into `buf`, returning the stored length, or `None` when
    /// the key does not exist.
    fn get(&mut self, namespace: &str, key: &str, buf: &mut [u8]) -> Result<Option<usize>, Error>;

    /// Writes a key.
    fn set(&mut self, namespace: &str, key: &str, value: &[u8]) -> Result<(), Error>;

    /// Erases every key in the namespace. Must be atomic: on failure the
    /// previous contents remain.
    fn erase_all(&mut self, namespace: &str) -> Result<(), Error>;
}

/// User-adjustable settings.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Stimulation mode id (builtin pattern).
    pub mode: u8,
    /// Bilateral cycle frequency.
    pub freq_hz: u16,
    /// Active fraction of each half-cycle, percent.
    pub duty_pct: u8,
    /// Motor intensity, percent.
    pub pwm_pct: u8,
    pub led_enabled: bool,
    pub led_mode: u8,
    pub palette_idx: u8,
    pub custom_rgb: Rgb,
    pub brightness_pct: u8,
    /// Session length.
    pub session_ms: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            mode: 1, // alternating
            freq_hz: 2,
            duty_pct: 50,
            pwm_pct: 60,
            led_enabled: true,
            led_mode: 0,
            palette_idx: palette::GREEN,
            custom_rgb: Rgb::new(0, 255, 0),
            brightness_pct: 80,
            session_ms: 30 * 60 * 1_000,
        }
    }
}

fn get_u8<S: Storage>(storage: &mut S, key: &str, fallback: u8) -> u8 {
    let mut buf = [0u8; 1];
    match storage.get(NAMESPACE, key, &mut buf) {
        Ok(Some(1)) => buf[0],
        _ => fallback,
    }
}

fn get_u16<S: Storage>(storage: &mut S, key: &str, fallback: u16) -> u16 {
    let mut buf = [0u8; 2];
    match storage.get(NAMESPACE, key, &mut buf) {
        Ok(Some(2)) => LittleEndian::read_u16(&buf),
        _ => fallback,
    }
}

fn get_u32<S: Storage>(storage: &mut S, key: &str, fallback: u32) -> u32 {
    let mut buf = [0u8; 4];
    match storage.get(NAMESPACE, key, &mut buf) {
        Ok(Some(4)) => LittleEndian::read_u32(&buf),
        _ => fallback,
    }
}

impl Settings {
    /// Loads settings, falling back to defaults per missing key.
    pub fn load<S: Storage>(storage: &mut S) -> Self {
        let d = Settings::default();
        let mut rgb = [d.custom_rgb.r, d.custom_rgb.g, d.custom_rgb.b];
        let mut buf = [0u8; 3];
        if let Ok(Some(3)) = storage.get(NAMESPACE, "custom_rgb", &mut buf) {
            rgb = buf;
        }

        Settings {
            mode: get_u8(storage, "mode", d.mode),
            freq_hz: get_u16(storage, "freq_hz", d.freq_hz),
            duty_pct: get_u8(storage, "duty_pct", d.duty_pct),
            pwm_pct: get_u8(storage, "pwm_pct", d.pwm_pct),
            led_enabled: get_u8(storage, "led_enabled", d.led_enabled as u8) != 0,
            led_mode: get_u8(storage, "led_mode", d.led_mode),
            palette_idx: get_u8(storage, "palette_idx", d.palette_idx),
            custom_rgb: Rgb::new(rgb[0], rgb[1], rgb[2]),
            brightness_pct: get_u8(storage, "brightness_pct", d.brightness_pct),
            session_ms: get_u32(storage, "session_ms", d.session_ms),
        }
    }

    /// Persists all settings. Only called from the shutdown path.
    pub fn store<S: Storage>(&self, storage: &mut S) -> Result<(), Error> {
        let mut u16_buf = [0u8; 2];
        let mut u32_buf = [0u8; 4];

        storage.set(NAMESPACE, "mode", &[self.mode])?;
        LittleEndian::write_u16(&mut u16_buf, self.freq_hz);
        storage.set(NAMESPACE, "freq_hz", &u16_buf)?;
        storage.set(NAMESPACE, "duty_pct", &[self.duty_pct])?;
        storage.set(NAMESPACE, "pwm_pct", &[self.pwm_pct])?;
        storage.set(NAMESPACE, "led_enabled", &[self.led_enabled as u8])?;
        storage.set(NAMESPACE, "led_mode", &[self.led_mode])?;
        storage.set(NAMESPACE, "palette_idx", &[self.palette_idx])?;
        storage.set(
            NAMESPACE,
            "custom_rgb",
            &[self.custom_rgb.r, self.custom_rgb.g, self.custom_rgb.b],
        )?;
        storage.set(NAMESPACE, "brightness_pct", &[self.brightness_pct])?;
        LittleEndian::write_u32(&mut u32_buf, self.session_ms);
        storage.set(NAMESPACE, "session_ms", &u32_buf)?;
        Ok(())
    }

    /// Derives the shared operational parameters from the stored knobs.
    pub fn session_params(&self) -> SessionParams {
        let cycle_ms = if self.freq_hz == 0 {
            500
        } else {
            (1_000 / u32::from(self.freq_hz)) as u16
        };
        // Duty applies to one side's half of the cycle.
        let duty_ms = u16::try_from(
            u32::from(cycle_ms) / 2 * u32::from(self.duty_pct.min(100)) / 100,
        )
        .unwrap_or(u16::MAX);
        SessionParams {
            cycle_ms,
            duty_ms,
            intensity: self.pwm_pct,
            mode: self.mode,
        }
    }
}

/// Erases the whole namespace. On failure NVS is left untouched and the
/// error is surfaced to the caller (the button task shows the failure).
pub fn factory_reset<S: Storage>(storage: &mut S) -> Result<(), Error> {
    storage.erase_all(NAMESPACE)?;
    warn!("NVS factory reset");
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testutil::MemStorage;
    use super::*;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let mut storage = MemStorage::default();
        assert_eq!(Settings::load(&mut storage), Settings::default());
    }

    #[test]
    fn store_load_round_trip() {
        let mut storage = MemStorage::default();
        let s = Settings {
            mode: 3,
            freq_hz: 4,
            duty_pct: 30,
            pwm_pct: 70,
            led_enabled: false,
            led_mode: 2,
            palette_idx: palette::PURPLE,
            custom_rgb: Rgb::new(1, 2, 3),
            brightness_pct: 55,
            session_ms: 1_234_567,
        };
        s.store(&mut storage).unwrap();
        assert_eq!(Settings::load(&mut storage), s);

        // Integers are stored little-endian.
        let raw = &storage.map[&(NAMESPACE.to_string(), "session_ms".to_string())];
        assert_eq!(raw[..], 1_234_567u32.to_le_bytes());
    }

    #[test]
    fn partial_store_keeps_other_defaults() {
        let mut storage = MemStorage::default();
        storage.set(NAMESPACE, "pwm_pct", &[77]).unwrap();
        let s = Settings::load(&mut storage);
        assert_eq!(s.pwm_pct, 77);
        assert_eq!(s.freq_hz, Settings::default().freq_hz);
    }

    #[test]
    fn session_params_derivation() {
        let s = Settings::default();
        assert_eq!(
            s.session_params(),
            SessionParams {
                cycle_ms: 500,
                duty_ms: 125,
                intensity: 60,
                mode: 1
            }
        );
    }

    #[test]
    fn failed_factory_reset_preserves_contents() {
        let mut storage = MemStorage::default();
        Settings::default().store(&mut storage).unwrap();
        storage.fail_erase = true;
        assert_eq!(factory_reset(&mut storage), Err(Error::Fail));
        assert_eq!(Settings::load(&mut storage), Settings::default());

        storage.fail_erase = false;
        factory_reset(&mut storage).unwrap();
        assert!(storage.map.is_empty());
    }
}
