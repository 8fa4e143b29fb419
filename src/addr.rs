//! Device identities.

use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::Error;
use core::fmt;

/// A 6-byte radio MAC address identifying one device of a pair.
///
/// Stable across boots; both the BLE stack and the low-latency radio use the
/// same address. The byte order is the over-the-air order.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct DeviceId([u8; 6]);

impl DeviceId {
    /// The broadcast address. Beacons are sent here.
    pub const BROADCAST: Self = DeviceId([0xFF; 6]);

    /// Creates a device id from 6 raw bytes.
    pub const fn new(bytes: [u8; 6]) -> Self {
        DeviceId(bytes)
    }

    /// Returns the raw bytes making up this address.
    pub const fn raw(&self) -> &[u8; 6] {
        &self.0
    }

    /// Returns whether this is the broadcast address.
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i != 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl ToBytes for DeviceId {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_slice(&self.0)
    }
}

impl<'a> FromBytes<'a> for DeviceId {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        Ok(DeviceId(bytes.read_array()?))
    }
}
