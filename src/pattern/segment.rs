//! Pattern headers, bilateral segments, and the compiled-in patterns.
//!
//! A pattern is a time-offset-indexed list of segments. Each segment
//! carries one output column per zone; the final segment's `t_offset_ms`
//! doubles as the pattern duration and repeats the first segment's outputs,
//! so it also serves as the loop-point sentinel.
//!
//! Segments are `zerocopy`-transmutable: the CRC protecting a pattern runs
//! over the exact in-memory byte image of the segment array, which on the
//! little-endian targets this firmware runs on equals the wire image.

use crate::actuator::palette;
use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::pattern::zone::Zone;
use crate::Error;
use bitflags::bitflags;
use zerocopy::AsBytes;

bitflags! {
    /// Pattern-level flags.
    pub struct PatternFlags: u8 {
        /// Restart from the top when the duration elapses.
        const LOOPING = 1 << 0;
        /// Segments drive the LED.
        const LED = 1 << 1;
        /// Segments drive the motor.
        const MOTOR = 1 << 2;
        /// While playing, the pattern may not be replaced.
        const LOCKED = 1 << 3;
    }
}

/// Pattern sheet header. 16 bytes on the wire, little-endian:
///
/// ```notrust
/// | born_at_us: u64 | segment_count: u16 | mode_id: u8 | flags: u8 | content_crc: u32 |
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PatternHeader {
    /// Synchronized time the pattern was created/loaded.
    pub born_at_us: u64,
    pub segment_count: u16,
    pub mode_id: u8,
    pub flags: PatternFlags,
    /// CRC-32 over the segment byte image.
    pub content_crc: u32,
}

impl PatternHeader {
    /// Wire size.
    pub const SIZE: usize = 16;
}

impl ToBytes for PatternHeader {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u64_le(self.born_at_us)?;
        writer.write_u16_le(self.segment_count)?;
        writer.write_u8(self.mode_id)?;
        writer.write_u8(self.flags.bits())?;
        writer.write_u32_le(self.content_crc)
    }
}

impl<'a> FromBytes<'a> for PatternHeader {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        Ok(PatternHeader {
            born_at_us: bytes.read_u64_le()?,
            segment_count: bytes.read_u16_le()?,
            mode_id: bytes.read_u8()?,
            flags: PatternFlags::from_bits_truncate(bytes.read_u8()?),
            content_crc: bytes.read_u32_le()?,
        })
    }
}

/// One step of a bilateral pattern. 16 bytes, no padding.
///
/// `transition_ms` is reserved for cross-fade interpolation into the next
/// segment (0 = instantaneous, the only behavior currently implemented),
/// and `waveform` is reserved for non-rectangular motor envelopes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, AsBytes)]
#[repr(C)]
pub struct BilateralSegment {
    /// Activation time relative to pattern start.
    pub t_offset_ms: u32,
    pub transition_ms: u16,
    /// Per-segment flags, reserved.
    pub flags: u8,
    /// Reserved motor waveform selector.
    pub waveform: u8,
    pub l_color: u8,
    pub l_bright: u8,
    pub l_motor: u8,
    pub r_color: u8,
    pub r_bright: u8,
    pub r_motor: u8,
    pub reserved: [u8; 2],
}

/// One zone's slice of a segment.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SegmentColumn {
    /// Palette index.
    pub color: u8,
    /// Perceived brightness percent.
    pub brightness: u8,
    /// Motor intensity percent; 0 keeps the motor coasted.
    pub motor: u8,
}

impl BilateralSegment {
    /// Wire size.
    pub const SIZE: usize = 16;

    /// Selects the output column for `zone`.
    pub fn column(&self, zone: Zone) -> SegmentColumn {
        match zone {
            Zone::Left => SegmentColumn {
                color: self.l_color,
                brightness: self.l_bright,
                motor: self.l_motor,
            },
            Zone::Right => SegmentColumn {
                color: self.r_color,
                brightness: self.r_bright,
                motor: self.r_motor,
            },
        }
    }
}

impl ToBytes for BilateralSegment {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u32_le(self.t_offset_ms)?;
        writer.write_u16_le(self.transition_ms)?;
        writer.write_u8(self.flags)?;
        writer.write_u8(self.waveform)?;
        writer.write_u8(self.l_color)?;
        writer.write_u8(self.l_bright)?;
        writer.write_u8(self.l_motor)?;
        writer.write_u8(self.r_color)?;
        writer.write_u8(self.r_bright)?;
        writer.write_u8(self.r_motor)?;
        writer.write_slice(&self.reserved)
    }
}

impl<'a> FromBytes<'a> for BilateralSegment {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        Ok(BilateralSegment {
            t_offset_ms: bytes.read_u32_le()?,
            transition_ms: bytes.read_u16_le()?,
            flags: bytes.read_u8()?,
            waveform: bytes.read_u8()?,
            l_color: bytes.read_u8()?,
            l_bright: bytes.read_u8()?,
            l_motor: bytes.read_u8()?,
            r_color: bytes.read_u8()?,
            r_bright: bytes.read_u8()?,
            r_motor: bytes.read_u8()?,
            reserved: bytes.read_array()?,
        })
    }
}

const fn seg(
    t_offset_ms: u32,
    l: (u8, u8, u8),
    r: (u8, u8, u8),
    transition_ms: u16,
) -> BilateralSegment {
    BilateralSegment {
        t_offset_ms,
        transition_ms,
        flags: 0,
        waveform: 0,
        l_color: l.0,
        l_bright: l.1,
        l_motor: l.2,
        r_color: r.0,
        r_bright: r.1,
        r_motor: r.2,
        reserved: [0; 2],
    }
}

/// Compiled-in patterns.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BuiltinPattern {
    /// Slow red flash on both sides.
    Emergency,
    /// The bread-and-butter bilateral alternation.
    Alternating,
    /// Calm blue fade, LED only.
    Breathe,
    /// Four fast red flashes, then a white hold.
    EmergencyQuad,
}

const GREEN_ON: (u8, u8, u8) = (palette::GREEN, 100, 60);
const GREEN_OFF: (u8, u8, u8) = (palette::GREEN, 0, 0);
const RED_ON: (u8, u8, u8) = (palette::RED, 100, 0);
const RED_OFF: (u8, u8, u8) = (palette::RED, 0, 0);
const WHITE_ON: (u8, u8, u8) = (palette::WHITE, 100, 0);
const WHITE_OFF: (u8, u8, u8) = (palette::WHITE, 0, 0);

const fn breathe(t: u32, brightness: u8) -> BilateralSegment {
    seg(
        t,
        (palette::BLUE, brightness, 0),
        (palette::BLUE, brightness, 0),
        250,
    )
}

static ALTERNATING: [BilateralSegment; 3] = [
    seg(0, GREEN_ON, GREEN_OFF, 0),
    seg(1_000, GREEN_OFF, GREEN_ON, 0),
    seg(2_000, GREEN_ON, GREEN_OFF, 0), // loop point
];

static EMERGENCY: [BilateralSegment; 3] = [
    seg(0, RED_ON, RED_ON, 0),
    seg(500, RED_OFF, RED_OFF, 0),
    seg(1_000, RED_ON, RED_ON, 0), // loop point
];

static EMERGENCY_QUAD: [BilateralSegment; 11] = [
    seg(0, RED_ON, RED_ON, 0),
    seg(50, RED_OFF, RED_OFF, 0),
    seg(100, RED_ON, RED_ON, 0),
    seg(150, RED_OFF, RED_OFF, 0),
    seg(200, RED_ON, RED_ON, 0),
    seg(250, RED_OFF, RED_OFF, 0),
    seg(300, RED_ON, RED_ON, 0),
    seg(350, RED_OFF, RED_OFF, 0),
    seg(1_000, WHITE_ON, WHITE_ON, 0),
    seg(1_500, WHITE_OFF, WHITE_OFF, 0),
    seg(2_000, RED_ON, RED_ON, 0), // loop point
];

static BREATHE: [BilateralSegment; 9] = [
    breathe(0, 10),
    breathe(250, 30),
    breathe(500, 60),
    breathe(750, 100),
    breathe(1_000, 100),
    breathe(1_250, 60),
    breathe(1_500, 30),
    breathe(1_750, 10),
    breathe(2_000, 10), // loop point
];

impl BuiltinPattern {
    /// The segment table of this pattern.
    pub fn segments(&self) -> &'static [BilateralSegment] {
        match self {
            BuiltinPattern::Emergency => &EMERGENCY,
            BuiltinPattern::Alternating => &ALTERNATING,
            BuiltinPattern::Breathe => &BREATHE,
            BuiltinPattern::EmergencyQuad => &EMERGENCY_QUAD,
        }
    }

    /// Pattern-level flags.
    pub fn flags(&self) -> PatternFlags {
        match self {
            BuiltinPattern::Alternating => {
                PatternFlags::LOOPING | PatternFlags::LED | PatternFlags::MOTOR
            }
            BuiltinPattern::Emergency | BuiltinPattern::EmergencyQuad => {
                PatternFlags::LOOPING | PatternFlags::LED | PatternFlags::LOCKED
            }
            BuiltinPattern::Breathe => PatternFlags::LOOPING | PatternFlags::LED,
        }
    }

    /// Stable mode id reported to the app.
    pub fn mode_id(&self) -> u8 {
        match self {
            BuiltinPattern::Emergency => 0,
            BuiltinPattern::Alternating => 1,
            BuiltinPattern::Breathe => 2,
            BuiltinPattern::EmergencyQuad => 3,
        }
    }
}
