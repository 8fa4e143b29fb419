//! Over-the-air frame formats for the low-latency link.
//!
//! Two frame classes share the link:
//!
//! * **Beacons** — unidirectional, fire-and-forget time messages, broadcast
//!   by the server. Fixed 25-byte layout with a CRC-16 footer; the receiver
//!   parses by offset, so the layout is bit-stable across firmware builds.
//! * **Coordination messages** — bidirectional, retried, unicast frames
//!   carrying the PTP handshake, asymmetry probes, and role negotiation.
//!   Tagged variable-length layout behind a `0xC0` prefix byte.

use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::crc::crc16;
use crate::role::{Role, SessionParams};
use crate::Error;
use bitflags::bitflags;

/// First byte of every coordination frame on the wire.
pub const COORD_PREFIX: u8 = 0xC0;

bitflags! {
    /// Beacon header flags.
    pub struct BeaconFlags: u8 {
        /// `epoch_us` carries a valid coordinated-start epoch.
        const EPOCH_VALID = 1 << 0;
        /// Part of a fast-lock burst; the client should weight this beacon
        /// into its filter immediately.
        const FAST_LOCK = 1 << 1;
    }
}

/// Periodic time beacon.
///
/// Wire layout (little-endian), 25 bytes total:
///
/// ```notrust
/// | server_time_us: u64 | sequence: u32 | epoch_us: u64 | flags: u8 | version: u8 | reserved: u8 | crc16: u16 |
/// ```
///
/// The CRC-16 (see [`crate::crc`]) covers the preceding 23 bytes.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Beacon {
    /// Server session time at transmission.
    pub server_time_us: u64,
    /// Monotonically increasing per session; receivers discard stale
    /// sequences.
    pub sequence: u32,
    /// Coordinated-start epoch, valid iff `EPOCH_VALID` is set.
    pub epoch_us: u64,
    pub flags: BeaconFlags,
    /// Protocol version of the sender; mismatches refuse coordination.
    pub version: u8,
}

impl Beacon {
    /// Total frame size on the wire.
    pub const SIZE: usize = 25;
    /// Bytes covered by the CRC footer.
    const BODY: usize = 23;

    /// Encodes `self` into a 25-byte frame, computing the CRC footer.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        let mut w = ByteWriter::new(&mut buf);
        self.to_bytes(&mut w).expect("beacon buffer sized exactly");
        buf
    }

    /// Parses and CRC-checks a received frame.
    ///
    /// `frame` must be exactly [`Beacon::SIZE`] bytes; the transport has
    /// already routed by length, so anything else is `InvalidSize`.
    pub fn parse(frame: &[u8]) -> Result<Self, Error> {
        if frame.len() != Self::SIZE {
            return Err(Error::InvalidSize);
        }
        let mut r = ByteReader::new(frame);
        Self::from_bytes(&mut r)
    }
}

impl ToBytes for Beacon {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        let mut body = [0u8; Self::BODY];
        {
            let mut w = ByteWriter::new(&mut body);
            w.write_u64_le(self.server_time_us)?;
            w.write_u32_le(self.sequence)?;
            w.write_u64_le(self.epoch_us)?;
            w.write_u8(self.flags.bits())?;
            w.write_u8(self.version)?;
            w.write_u8(0)?; // reserved
        }
        writer.write_slice(&body)?;
        writer.write_u16_le(crc16(&body))
    }
}

impl<'a> FromBytes<'a> for Beacon {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let body = bytes.read_slice(Self::BODY)?;
        let footer = bytes.read_u16_le()?;
        if crc16(body) != footer {
            return Err(Error::InvalidCrc);
        }

        let mut r = ByteReader::new(body);
        let server_time_us = r.read_u64_le()?;
        let sequence = r.read_u32_le()?;
        let epoch_us = r.read_u64_le()?;
        let flags = BeaconFlags::from_bits_truncate(r.read_u8()?);
        let version = r.read_u8()?;
        r.skip(1)?; // reserved

        Ok(Beacon {
            server_time_us,
            sequence,
            epoch_us,
            flags,
            version,
        })
    }
}

enum_with_unknown! {
    /// Tag byte selecting the coordination payload.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum CoordTag(u8) {
        PtpSample = 0x01,
        AsymmetryProbe = 0x02,
        RoleParams = 0x03,
    }
}

/// Payload of a coordination frame (without the `0xC0` prefix, which the
/// transport adds and strips).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CoordinationMsg {
    /// One PTP exchange in flight. The four-message handshake reuses this
    /// layout with unfilled timestamps zeroed: the request carries T1 only,
    /// the response T1..T3, and T4 exists only on the initiator side.
    PtpSample { t1: u64, t2: u64, t3: u64, t4: u64 },
    /// Path-asymmetry probe; the receiver echoes the id with its own
    /// transmit time.
    AsymmetryProbe { probe_id: u16, tx_time_us: u64 },
    /// Role announcement plus the operational parameters of the session.
    RoleParams { role: Role, params: SessionParams },
}

impl ToBytes for CoordinationMsg {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        match *self {
            CoordinationMsg::PtpSample { t1, t2, t3, t4 } => {
                writer.write_u8(CoordTag::PtpSample.into())?;
                writer.write_u64_le(t1)?;
                writer.write_u64_le(t2)?;
                writer.write_u64_le(t3)?;
                writer.write_u64_le(t4)
            }
            CoordinationMsg::AsymmetryProbe {
                probe_id,
                tx_time_us,
            } => {
                writer.write_u8(CoordTag::AsymmetryProbe.into())?;
                writer.write_u16_le(probe_id)?;
                writer.write_u64_le(tx_time_us)
            }
            CoordinationMsg::RoleParams { role, params } => {
                writer.write_u8(CoordTag::RoleParams.into())?;
                writer.write_u8(role.to_wire())?;
                writer.write_u16_le(params.cycle_ms)?;
                writer.write_u16_le(params.duty_ms)?;
                writer.write_u8(params.intensity)?;
                writer.write_u8(params.mode)
            }
        }
    }
}

impl<'a> FromBytes<'a> for CoordinationMsg {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        match CoordTag::from(bytes.read_u8()?) {
            CoordTag::PtpSample => Ok(CoordinationMsg::PtpSample {
                t1: bytes.read_u64_le()?,
                t2: bytes.read_u64_le()?,
                t3: bytes.read_u64_le()?,
                t4: bytes.read_u64_le()?,
            }),
            CoordTag::AsymmetryProbe => Ok(CoordinationMsg::AsymmetryProbe {
                probe_id: bytes.read_u16_le()?,
                tx_time_us: bytes.read_u64_le()?,
            }),
            CoordTag::RoleParams => Ok(CoordinationMsg::RoleParams {
                role: Role::from_wire(bytes.read_u8()?)?,
                params: SessionParams {
                    cycle_ms: bytes.read_u16_le()?,
                    duty_ms: bytes.read_u16_le()?,
                    intensity: bytes.read_u8()?,
                    mode: bytes.read_u8()?,
                },
            }),
            CoordTag::Unknown(tag) => {
                debug!("unknown coordination tag 0x{:02x}", tag);
                Err(Error::InvalidArg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PROTOCOL_VERSION;

    #[test]
    fn beacon_byte_image_is_stable() {
        let b = Beacon {
            server_time_us: 0x0102_0304_0506_0708,
            sequence: 0xA1A2_A3A4,
            epoch_us: 0x1112_1314_1516_1718,
            flags: BeaconFlags::EPOCH_VALID,
            version: 2,
        };
        let frame = b.encode();
        assert_eq!(frame.len(), Beacon::SIZE);

        // Little-endian field placement, parsed by offset.
        assert_eq!(&frame[0..8], &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&frame[8..12], &[0xA4, 0xA3, 0xA2, 0xA1]);
        assert_eq!(&frame[12..20], &[0x18, 0x17, 0x16, 0x15, 0x14, 0x13, 0x12, 0x11]);
        assert_eq!(frame[20], 0x01);
        assert_eq!(frame[21], 2);
        assert_eq!(frame[22], 0);
        assert_eq!(
            u16::from_le_bytes([frame[23], frame[24]]),
            crc16(&frame[..23])
        );

        assert_eq!(Beacon::parse(&frame), Ok(b));
    }

    #[test]
    fn beacon_rejects_bad_crc_and_size() {
        let b = Beacon {
            server_time_us: 1,
            sequence: 2,
            epoch_us: 0,
            flags: BeaconFlags::empty(),
            version: PROTOCOL_VERSION,
        };
        let mut frame = b.encode();
        frame[5] ^= 0x40;
        assert_eq!(Beacon::parse(&frame), Err(Error::InvalidCrc));
        assert_eq!(Beacon::parse(&frame[..24]), Err(Error::InvalidSize));
    }

    fn round_trip(msg: CoordinationMsg) -> CoordinationMsg {
        let mut buf = [0u8; 64];
        let mut w = ByteWriter::new(&mut buf);
        msg.to_bytes(&mut w).unwrap();
        let used = 64 - w.space_left();
        CoordinationMsg::from_bytes(&mut ByteReader::new(&buf[..used])).unwrap()
    }

    #[test]
    fn ptp_sample_layout() {
        let msg = CoordinationMsg::PtpSample {
            t1: 100,
            t2: 200,
            t3: 300,
            t4: 0,
        };
        let mut buf = [0u8; 33];
        msg.to_bytes(&mut ByteWriter::new(&mut buf)).unwrap();
        assert_eq!(buf[0], 0x01);
        assert_eq!(u64::from_le_bytes(buf[1..9].try_into().unwrap()), 100);
        assert_eq!(u64::from_le_bytes(buf[9..17].try_into().unwrap()), 200);
        assert_eq!(round_trip(msg), msg);
    }

    #[test]
    fn role_params_round_trip() {
        let msg = CoordinationMsg::RoleParams {
            role: Role::Server,
            params: SessionParams {
                cycle_ms: 500,
                duty_ms: 125,
                intensity: 60,
                mode: 1,
            },
        };
        assert_eq!(round_trip(msg), msg);

        let probe = CoordinationMsg::AsymmetryProbe {
            probe_id: 7,
            tx_time_us: 123_456_789,
        };
        assert_eq!(round_trip(probe), probe);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let raw = [0x7F, 0, 0, 0];
        assert_eq!(
            CoordinationMsg::from_bytes(&mut ByteReader::new(&raw)),
            Err(Error::InvalidArg)
        );
    }
}
