//! Checksum algorithms used on the wire and for pattern validation.
//!
//! Two checksums are in play:
//!
//! * Pattern sheets are validated with IEEE CRC-32 (reflected, the
//!   ubiquitous `ISO-HDLC` parameterization) over the raw segment bytes.
//! * Beacon frames carry a CRC-16 footer. The parameterization is fixed
//!   here as **CRC-16/IBM-3740** (also known as CCITT-FALSE: polynomial
//!   `0x1021`, init `0xFFFF`, no reflection). Both endpoints must agree, so
//!   the test vectors below are normative.

use crc::{Crc, CRC_16_IBM_3740, CRC_32_ISO_HDLC};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Computes the CRC-32 over `bytes`, as used for pattern content validation.
pub fn crc32(bytes: &[u8]) -> u32 {
    CRC32.checksum(bytes)
}

/// Computes the beacon footer CRC-16 over `bytes`.
pub fn crc16(bytes: &[u8]) -> u16 {
    CRC16.checksum(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Standard check values for the chosen parameterizations. A peer
    // implementation that disagrees on either of these cannot interoperate.
    #[test]
    fn crc32_check_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0x29B1);
        assert_eq!(crc16(b""), 0xFFFF);
    }

    #[test]
    fn crc16_beacon_sized_input() {
        // 23 zero bytes, the size of the beacon body the footer covers.
        let body = [0u8; 23];
        let a = crc16(&body);
        let mut tweaked = body;
        tweaked[22] ^= 0x01;
        assert_ne!(a, crc16(&tweaked));
    }
}
