//! Motor and LED actuation policy.
//!
//! The PWM peripheral (25 kHz, 10-bit) and the timing-critical addressable
//! LED protocol live in platform shims behind the [`Motor`] and [`Led`]
//! traits. This module owns everything above them: intensity clamping and
//! H-bridge direction policy, the color palette, perceptual brightness via
//! a compiled-in CIE-1931 table, LED ownership arbitration, and the status
//! blink patterns.

use crate::pattern::zone::Zone;
use crate::Error;
use core::fmt;

/// Lowest non-zero motor intensity; weaker drive stalls the eccentric mass.
pub const MOTOR_INTENSITY_MIN: u8 = 20;

/// Default motor intensity.
pub const MOTOR_INTENSITY_DEFAULT: u8 = 60;

/// Hard intensity ceiling.
pub const MOTOR_INTENSITY_MAX: u8 = 80;

/// H-bridge motor driver shim.
///
/// `forward` drives PWM on channel A with B held low, `reverse` the
/// mirror image, `coast` floats both. Intensity is percent of full scale;
/// mapping onto the 10-bit duty register is the shim's concern.
pub trait Motor {
    fn forward(&mut self, intensity_pct: u8) -> Result<(), Error>;
    fn reverse(&mut self, intensity_pct: u8) -> Result<(), Error>;
    fn coast(&mut self) -> Result<(), Error>;
}

/// Addressable RGB LED shim. One call updates the single status LED.
pub trait Led {
    fn set_rgb(&mut self, rgb: Rgb) -> Result<(), Error>;
}

/// An RGB triple at full brightness.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const OFF: Rgb = Rgb::new(0, 0, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Rgb { r, g, b }
    }
}

impl fmt::Debug for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

/// Palette indices used by patterns and status codes.
pub mod palette {
    pub const OFF: u8 = 0;
    pub const WHITE: u8 = 1;
    pub const RED: u8 = 2;
    pub const GREEN: u8 = 3;
    pub const BLUE: u8 = 4;
    pub const PURPLE: u8 = 5;
    pub const YELLOW: u8 = 6;
    pub const CYAN: u8 = 7;
    pub const ORANGE: u8 = 8;
    pub const PINK: u8 = 9;
    pub const TEAL: u8 = 10;
    pub const LIME: u8 = 11;
    pub const INDIGO: u8 = 12;
    pub const AMBER: u8 = 13;
    pub const CRIMSON: u8 = 14;
    pub const WARM_WHITE: u8 = 15;
}

/// The 16-entry color palette.
pub const PALETTE: [Rgb; 16] = [
    Rgb::new(0, 0, 0),       // OFF
    Rgb::new(255, 255, 255), // WHITE
    Rgb::new(255, 0, 0),     // RED
    Rgb::new(0, 255, 0),     // GREEN
    Rgb::new(0, 0, 255),     // BLUE
    Rgb::new(160, 0, 255),   // PURPLE
    Rgb::new(255, 255, 0),   // YELLOW
    Rgb::new(0, 255, 255),   // CYAN
    Rgb::new(255, 96, 0),    // ORANGE
    Rgb::new(255, 64, 128),  // PINK
    Rgb::new(0, 128, 128),   // TEAL
    Rgb::new(128, 255, 0),   // LIME
    Rgb::new(64, 0, 255),    // INDIGO
    Rgb::new(255, 160, 0),   // AMBER
    Rgb::new(200, 16, 48),   // CRIMSON
    Rgb::new(255, 200, 120), // WARM_WHITE
];

/// CIE-1931 lightness table: perceived brightness percent → 8-bit duty.
///
/// `L ≤ 8 → Y = L/903.3`, else `Y = ((L+16)/116)³`, truncated to 8 bits.
/// Halfway perceived brightness comes out at 46/255.
pub const CIE_LUT: [u8; 101] = [
    0, 0, 0, 0, 1, 1, 1, 1, 2, 2, //
    2, 3, 3, 3, 4, 4, 5, 5, 6, 7, //
    7, 8, 8, 9, 10, 11, 12, 12, 13, 14, //
    15, 16, 18, 19, 20, 21, 22, 24, 25, 27, //
    28, 30, 31, 33, 35, 37, 38, 40, 42, 44, //
    46, 49, 51, 53, 56, 58, 60, 63, 66, 68, //
    71, 74, 77, 80, 83, 86, 90, 93, 96, 100, //
    103, 107, 111, 115, 119, 123, 127, 131, 135, 140, //
    144, 149, 153, 158, 163, 168, 173, 178, 183, 189, //
    194, 200, 205, 211, 217, 223, 229, 235, 242, 248, //
    255,
];

/// Maps perceived brightness percent (clamped to 100) to an 8-bit duty.
pub fn perceptual_duty(brightness_pct: u8) -> u8 {
    CIE_LUT[usize::from(brightness_pct.min(100))]
}

/// Scales an RGB color by perceived brightness.
pub fn scale_perceptual(rgb: Rgb, brightness_pct: u8) -> Rgb {
    let duty = u16::from(perceptual_duty(brightness_pct));
    Rgb {
        r: (u16::from(rgb.r) * duty / 255) as u8,
        g: (u16::from(rgb.g) * duty / 255) as u8,
        b: (u16::from(rgb.b) * duty / 255) as u8,
    }
}

/// Resolves a palette index (out-of-range indices fall back to OFF).
pub fn palette_color(index: u8) -> Rgb {
    PALETTE
        .get(usize::from(index))
        .copied()
        .unwrap_or(Rgb::OFF)
}

/// Writes a palette color at a perceived brightness to the LED.
pub fn set_palette_perceptual<L: Led>(
    led: &mut L,
    palette_idx: u8,
    brightness_pct: u8,
) -> Result<(), Error> {
    led.set_rgb(scale_perceptual(palette_color(palette_idx), brightness_pct))
}

/// Drives the motor for one zone at the given intensity.
///
/// Intensity 0 coasts (LED-only mode); anything else is clamped into
/// `[MOTOR_INTENSITY_MIN, MOTOR_INTENSITY_MAX]`. The LEFT zone runs the
/// motor forward, the RIGHT zone in reverse, so the eccentric mass spins
/// toward the wearer's midline on both wrists.
pub fn drive_zone<M: Motor>(motor: &mut M, zone: Zone, intensity_pct: u8) -> Result<(), Error> {
    if intensity_pct == 0 {
        return motor.coast();
    }
    let clamped = intensity_pct.clamp(MOTOR_INTENSITY_MIN, MOTOR_INTENSITY_MAX);
    match zone {
        Zone::Left => motor.forward(clamped),
        Zone::Right => motor.reverse(clamped),
    }
}

/// Ownership arbiter for the single status LED.
///
/// While the motor task owns the LED (during pattern playback), the status
/// subsystem must keep its hands off. The underlying mutex serializing raw
/// LED writes is a platform concern; this flag decides *who* may take it.
#[derive(Debug, Default)]
pub struct LedMux {
    motor_owns: bool,
}

impl LedMux {
    pub const fn new() -> Self {
        LedMux { motor_owns: false }
    }

    /// Delegates or returns LED ownership to/from the motor task.
    pub fn set_motor_ownership(&mut self, owned: bool) {
        self.motor_owns = owned;
    }

    pub fn motor_owns(&self) -> bool {
        self.motor_owns
    }

    /// Applies a status blink frame, unless the motor task owns the LED.
    pub fn apply_status<L: Led>(
        &self,
        led: &mut L,
        pattern: StatusPattern,
        frame_on: bool,
    ) -> Result<(), Error> {
        if self.motor_owns {
            return Err(Error::InvalidState);
        }
        let spec = pattern.blink();
        let rgb = if frame_on {
            scale_perceptual(palette_color(spec.color), spec.brightness_pct)
        } else {
            Rgb::OFF
        };
        led.set_rgb(rgb)
    }
}

/// User-visible status indications.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StatusPattern {
    PairingWait,
    PairingProgress,
    PairingSuccess,
    PairingFailed,
    LowBattery,
    NvsReset,
    ModeChange,
    Countdown,
    VersionMismatch,
}

/// Timing and color of one status indication.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BlinkSpec {
    /// Palette index.
    pub color: u8,
    pub brightness_pct: u8,
    pub on_ms: u16,
    pub off_ms: u16,
    /// `None` repeats until superseded.
    pub repeats: Option<u8>,
}

impl StatusPattern {
    /// Blink parameters for this indication.
    pub fn blink(self) -> BlinkSpec {
        use self::palette::*;
        match self {
            StatusPattern::PairingWait => BlinkSpec {
                color: BLUE,
                brightness_pct: 40,
                on_ms: 500,
                off_ms: 1500,
                repeats: None,
            },
            StatusPattern::PairingProgress => BlinkSpec {
                color: BLUE,
                brightness_pct: 60,
                on_ms: 150,
                off_ms: 150,
                repeats: None,
            },
            StatusPattern::PairingSuccess => BlinkSpec {
                color: GREEN,
                brightness_pct: 80,
                on_ms: 250,
                off_ms: 250,
                repeats: Some(3),
            },
            StatusPattern::PairingFailed => BlinkSpec {
                color: RED,
                brightness_pct: 80,
                on_ms: 250,
                off_ms: 250,
                repeats: Some(3),
            },
            StatusPattern::LowBattery => BlinkSpec {
                color: ORANGE,
                brightness_pct: 50,
                on_ms: 100,
                off_ms: 2900,
                repeats: None,
            },
            StatusPattern::NvsReset => BlinkSpec {
                color: YELLOW,
                brightness_pct: 80,
                on_ms: 100,
                off_ms: 100,
                repeats: Some(5),
            },
            StatusPattern::ModeChange => BlinkSpec {
                color: CYAN,
                brightness_pct: 60,
                on_ms: 120,
                off_ms: 80,
                repeats: Some(1),
            },
            StatusPattern::Countdown => BlinkSpec {
                color: PURPLE,
                brightness_pct: 80,
                on_ms: 100,
                off_ms: 100,
                repeats: Some(5),
            },
            StatusPattern::VersionMismatch => BlinkSpec {
                color: RED,
                brightness_pct: 60,
                on_ms: 500,
                off_ms: 500,
                repeats: None,
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// Records every motor command.
    #[derive(Debug, Default)]
    pub struct SpyMotor {
        pub commands: Vec<MotorCmd>,
    }

    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum MotorCmd {
        Forward(u8),
        Reverse(u8),
        Coast,
    }

    impl Motor for SpyMotor {
        fn forward(&mut self, intensity_pct: u8) -> Result<(), Error> {
            self.commands.push(MotorCmd::Forward(intensity_pct));
            Ok(())
        }
        fn reverse(&mut self, intensity_pct: u8) -> Result<(), Error> {
            self.commands.push(MotorCmd::Reverse(intensity_pct));
            Ok(())
        }
        fn coast(&mut self) -> Result<(), Error> {
            self.commands.push(MotorCmd::Coast);
            Ok(())
        }
    }

    impl SpyMotor {
        pub fn last(&self) -> Option<MotorCmd> {
            self.commands.last().copied()
        }
    }

    /// Records every LED write.
    #[derive(Debug, Default)]
    pub struct SpyLed {
        pub writes: Vec<Rgb>,
    }

    impl Led for SpyLed {
        fn set_rgb(&mut self, rgb: Rgb) -> Result<(), Error> {
            self.writes.push(rgb);
            Ok(())
        }
    }

    impl SpyLed {
        pub fn last(&self) -> Option<Rgb> {
            self.writes.last().copied()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn cie_anchor_points() {
        assert_eq!(perceptual_duty(0), 0);
        assert_eq!(perceptual_duty(50), 46);
        assert_eq!(perceptual_duty(100), 255);
        assert_eq!(perceptual_duty(255), 255); // clamped
        // Monotonic throughout.
        for pct in 1..=100u8 {
            assert!(perceptual_duty(pct) >= perceptual_duty(pct - 1));
        }
    }

    #[test]
    fn perceptual_scaling() {
        let full = scale_perceptual(Rgb::new(0, 255, 0), 100);
        assert_eq!(full, Rgb::new(0, 255, 0));
        let half = scale_perceptual(Rgb::new(255, 255, 255), 50);
        assert_eq!(half, Rgb::new(46, 46, 46));
        assert_eq!(scale_perceptual(Rgb::new(255, 0, 0), 0), Rgb::OFF);
    }

    #[test]
    fn palette_lookup_is_total() {
        assert_eq!(palette_color(palette::RED), Rgb::new(255, 0, 0));
        assert_eq!(palette_color(200), Rgb::OFF);
    }

    #[test]
    fn zone_decides_motor_direction() {
        let mut m = SpyMotor::default();
        drive_zone(&mut m, Zone::Left, 60).unwrap();
        drive_zone(&mut m, Zone::Right, 60).unwrap();
        assert_eq!(
            m.commands,
            vec![MotorCmd::Forward(60), MotorCmd::Reverse(60)]
        );
    }

    #[test]
    fn intensity_zero_coasts_and_bounds_clamp() {
        let mut m = SpyMotor::default();
        drive_zone(&mut m, Zone::Left, 0).unwrap();
        drive_zone(&mut m, Zone::Left, 5).unwrap();
        drive_zone(&mut m, Zone::Left, 100).unwrap();
        assert_eq!(
            m.commands,
            vec![
                MotorCmd::Coast,
                MotorCmd::Forward(MOTOR_INTENSITY_MIN),
                MotorCmd::Forward(MOTOR_INTENSITY_MAX),
            ]
        );
    }

    #[test]
    fn motor_ownership_blocks_status() {
        let mut led = SpyLed::default();
        let mut mux = LedMux::new();
        mux.apply_status(&mut led, StatusPattern::PairingWait, true)
            .unwrap();
        assert_eq!(led.writes.len(), 1);

        mux.set_motor_ownership(true);
        assert_eq!(
            mux.apply_status(&mut led, StatusPattern::PairingWait, true),
            Err(Error::InvalidState)
        );
        assert_eq!(led.writes.len(), 1);

        mux.set_motor_ownership(false);
        mux.apply_status(&mut led, StatusPattern::Countdown, false)
            .unwrap();
        assert_eq!(led.last(), Some(Rgb::OFF));
    }

    #[test]
    fn countdown_blinks_purple() {
        let spec = StatusPattern::Countdown.blink();
        assert_eq!(spec.color, palette::PURPLE);
        assert_eq!(spec.on_ms + spec.off_ms, 200);
        assert_eq!(spec.repeats, Some(5));
    }
}
