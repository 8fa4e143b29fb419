//! Bilateral pattern playback.
//!
//! The engine owns one pattern buffer (header + segment table, CRC
//! validated on load) and the playback state. [`PatternEngine::execute_tick`]
//! is called on the motor task's 50 ms cadence with the current
//! synchronized time; it selects the active segment, picks the column for
//! the local zone, and drives the actuators. Ticks are idempotent modulo
//! the pattern duration: a missed tick is healed by the next one, because
//! segment selection depends only on elapsed time.

pub mod segment;
pub mod zone;

use crate::actuator::{self, Led, Motor};
use crate::crc::crc32;
use crate::time::Duration;
use crate::Error;
use heapless::Vec;
use zerocopy::AsBytes;

use self::segment::{BilateralSegment, BuiltinPattern, PatternFlags, PatternHeader};
use self::zone::Zone;
use crate::bytes::{ByteReader, FromBytes};

/// Capacity of the segment table.
pub const PATTERN_MAX_SEGMENTS: usize = 64;

/// Cadence at which [`PatternEngine::execute_tick`] is expected to run.
pub const TICK_INTERVAL: Duration = Duration::from_millis(50);

/// Live playback bookkeeping.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct PlaybackState {
    /// Session time the pattern is anchored to.
    pub start_time_us: u64,
    /// Index of the segment applied by the last tick.
    pub current_segment: u16,
    /// Completed loop count.
    pub loop_count: u32,
    pub playing: bool,
    pub paused: bool,
}

/// Result of one playback tick.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// Nothing playing (stopped or paused); outputs untouched.
    Inactive,
    /// Playback armed but the coordinated start lies in the future.
    Pending,
    /// A segment was applied to the actuators.
    Applied,
    /// A non-looping pattern ran out; playback stopped and the outputs
    /// were parked (motor coasting, LED dark).
    Completed,
}

/// The playback engine. See the module docs.
pub struct PatternEngine {
    header: PatternHeader,
    segments: Vec<BilateralSegment, PATTERN_MAX_SEGMENTS>,
    valid: bool,
    playback: PlaybackState,
}

impl Default for PatternEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternEngine {
    pub fn new() -> Self {
        PatternEngine {
            header: PatternHeader {
                born_at_us: 0,
                segment_count: 0,
                mode_id: 0,
                flags: PatternFlags::empty(),
                content_crc: 0,
            },
            segments: Vec::new(),
            valid: false,
            playback: PlaybackState::default(),
        }
    }

    pub fn header(&self) -> &PatternHeader {
        &self.header
    }

    pub fn playback(&self) -> &PlaybackState {
        &self.playback
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Pattern duration: the last segment's offset.
    pub fn duration_ms(&self) -> u32 {
        self.segments.last().map_or(0, |s| s.t_offset_ms)
    }

    fn reject_if_locked(&self) -> Result<(), Error> {
        if self.valid && self.playback.playing && self.header.flags.contains(PatternFlags::LOCKED)
        {
            warn!("pattern locked, load rejected");
            return Err(Error::InvalidState);
        }
        Ok(())
    }

    /// Loads a compiled-in pattern, recomputing its CRC and stamping
    /// `born_at_us` with the current synchronized time.
    pub fn load_builtin(&mut self, pattern: BuiltinPattern, now_us: u64) -> Result<(), Error> {
        self.reject_if_locked()?;
        let segs = pattern.segments();
        self.segments.clear();
        self.segments
            .extend_from_slice(segs)
            .map_err(|()| Error::InvalidSize)?;
        self.header = PatternHeader {
            born_at_us: now_us,
            segment_count: segs.len() as u16,
            mode_id: pattern.mode_id(),
            flags: pattern.flags(),
            content_crc: crc32(self.segments[..].as_bytes()),
        };
        self.valid = true;
        self.playback = PlaybackState::default();
        info!("builtin pattern {:?} loaded", pattern);
        Ok(())
    }

    /// Loads an externally supplied pattern sheet.
    ///
    /// `seg_bytes` is the raw wire image of `header.segment_count`
    /// segments. Rejection order follows the import contract: impossible
    /// sizes, then CRC, then the lock rule.
    pub fn load_external(
        &mut self,
        header: PatternHeader,
        seg_bytes: &[u8],
    ) -> Result<(), Error> {
        let count = usize::from(header.segment_count);
        if count == 0
            || count > PATTERN_MAX_SEGMENTS
            || seg_bytes.len() != count * BilateralSegment::SIZE
        {
            return Err(Error::InvalidSize);
        }
        if crc32(seg_bytes) != header.content_crc {
            return Err(Error::InvalidCrc);
        }
        self.reject_if_locked()?;

        let mut segments: Vec<BilateralSegment, PATTERN_MAX_SEGMENTS> = Vec::new();
        let mut reader = ByteReader::new(seg_bytes);
        for _ in 0..count {
            let seg = BilateralSegment::from_bytes(&mut reader)?;
            if let Some(prev) = segments.last() {
                if seg.t_offset_ms < prev.t_offset_ms {
                    return Err(Error::InvalidArg);
                }
            }
            segments.push(seg).map_err(|_| Error::InvalidSize)?;
        }
        if segments.last().map_or(0, |s| s.t_offset_ms) == 0 {
            // Zero-duration patterns cannot tick.
            return Err(Error::InvalidArg);
        }

        self.segments = segments;
        self.header = header;
        self.valid = true;
        self.playback = PlaybackState::default();
        info!(
            "external pattern loaded: {} segments, mode {}",
            count, header.mode_id
        );
        Ok(())
    }

    /// Arms playback at the given session time (typically the coordinated
    /// start epoch, which may lie in the future).
    pub fn start(&mut self, start_time_us: u64) -> Result<(), Error> {
        if !self.valid {
            return Err(Error::InvalidState);
        }
        self.playback = PlaybackState {
            start_time_us,
            current_segment: 0,
            loop_count: 0,
            playing: true,
            paused: false,
        };
        Ok(())
    }

    pub fn stop(&mut self) {
        self.playback.playing = false;
        self.playback.paused = false;
    }

    pub fn pause(&mut self) {
        if self.playback.playing {
            self.playback.paused = true;
        }
    }

    pub fn resume(&mut self) {
        self.playback.paused = false;
    }

    /// Largest index whose offset is ≤ `elapsed_ms`. Linear scan; segment
    /// counts are small.
    ///
    /// At exactly the pattern duration this lands on the loop-point
    /// sentinel (the last segment).
    fn find_segment(&self, elapsed_ms: u32) -> usize {
        let mut idx = 0;
        for (i, seg) in self.segments.iter().enumerate() {
            if seg.t_offset_ms <= elapsed_ms {
                idx = i;
            } else {
                break;
            }
        }
        idx
    }

    /// Runs one playback tick at synchronized time `now_us`.
    pub fn execute_tick<M: Motor, L: Led>(
        &mut self,
        now_us: u64,
        zone: Zone,
        motor: &mut M,
        led: &mut L,
    ) -> Result<PlaybackEvent, Error> {
        if !self.playback.playing || self.playback.paused {
            return Ok(PlaybackEvent::Inactive);
        }
        if now_us < self.playback.start_time_us {
            return Ok(PlaybackEvent::Pending);
        }

        let mut elapsed_ms = (now_us - self.playback.start_time_us) / 1_000;
        let duration = u64::from(self.duration_ms());
        debug_assert!(duration > 0, "valid patterns have nonzero duration");

        if elapsed_ms >= duration {
            if self.header.flags.contains(PatternFlags::LOOPING) {
                self.playback.loop_count = (elapsed_ms / duration) as u32;
                elapsed_ms %= duration;
            } else {
                self.stop();
                motor.coast()?;
                if let Err(e) = led.set_rgb(actuator::Rgb::OFF) {
                    warn!("LED park failed: {}", e);
                }
                debug!("pattern complete");
                return Ok(PlaybackEvent::Completed);
            }
        }

        let idx = self.find_segment(elapsed_ms as u32);
        self.playback.current_segment = idx as u16;
        let column = self.segments[idx].column(zone);

        if self.header.flags.contains(PatternFlags::LED) {
            if let Err(e) = actuator::set_palette_perceptual(led, column.color, column.brightness)
            {
                warn!("LED update failed: {}", e);
            }
        }

        if self.header.flags.contains(PatternFlags::MOTOR) && column.motor > 0 {
            actuator::drive_zone(motor, zone, column.motor)?;
        } else {
            motor.coast()?;
        }

        Ok(PlaybackEvent::Applied)
    }
}
