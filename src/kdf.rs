//! Session key derivation for the low-latency link.
//!
//! After BLE pairing both devices hold the same Long-Term Key (LTK) and know
//! both MAC addresses. The 16-byte link-master key that encrypts the
//! low-latency transport is derived from those with HKDF-SHA256, so the key
//! never travels over the air and both endpoints compute the same value
//! independently.
//!
//! The canonical input ordering puts the SERVER address first; callers must
//! pass addresses by role, not by "self"/"peer", or the two sides derive
//! different keys.

use crate::addr::DeviceId;
use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::utils::KeyPreview;
use crate::Error;
use core::fmt;
use hkdf::Hkdf;
use rand_core::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

/// Info string for the current (v2, LTK-based) derivation.
pub const LMK_INFO_V2: &[u8] = b"EMDR-ESP-NOW-LMK-v2";

/// Info string for the legacy (v1, nonce-based) derivation.
pub const LMK_INFO_V1: &[u8] = b"EMDR-ESP-NOW-LMK-v1";

/// The Long-Term Key produced by BLE pairing.
///
/// Wrapped so it can travel through task messages without ever reaching a
/// formatter in full; zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct Ltk([u8; 16]);

impl Ltk {
    pub const fn new(bytes: [u8; 16]) -> Self {
        Ltk(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Drop for Ltk {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for Ltk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ltk({:?})", KeyPreview(&self.0))
    }
}

/// A 16-byte link-master key.
///
/// Ephemeral: lives exactly as long as the encrypted peer record and is
/// never persisted. The buffer is zeroized on drop, and `Debug` output only
/// shows the first and last two bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; 16]);

impl SessionKey {
    /// Returns the raw key bytes for handing to the PHY's peer table.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionKey({:?})", KeyPreview(&self.0))
    }
}

/// Runs HKDF-SHA256 and writes `okm.len()` bytes of output key material.
///
/// `okm` is not touched unless the whole expansion succeeds.
fn hkdf_sha256(salt: Option<&[u8]>, ikm: &[u8], info: &[u8], okm: &mut [u8]) -> Result<(), Error> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, okm).map_err(|_| Error::CryptoFailed)
}

/// Derives the link-master key from the BLE LTK and both device addresses.
///
/// IKM is `LTK || SERVER_MAC || CLIENT_MAC` (38 bytes, server first so both
/// endpoints produce identical output), expanded with info [`LMK_INFO_V2`]
/// and an empty salt. The IKM buffer is overwritten before this function
/// returns, success or failure.
pub fn derive_from_ltk(
    ltk: &[u8; 16],
    server_mac: &DeviceId,
    client_mac: &DeviceId,
) -> Result<SessionKey, Error> {
    let mut ikm = [0u8; 38];
    ikm[..16].copy_from_slice(ltk);
    ikm[16..22].copy_from_slice(server_mac.raw());
    ikm[22..28].copy_from_slice(client_mac.raw());

    let mut key = [0u8; 16];
    let result = hkdf_sha256(None, &ikm, LMK_INFO_V2, &mut key);
    ikm.zeroize();
    result?;

    trace!(
        "derived v2 link key {:?} for {:?}/{:?}",
        KeyPreview(&key),
        server_mac,
        client_mac
    );
    Ok(SessionKey(key))
}

/// Legacy (v1) derivation from an exchanged nonce instead of the LTK.
///
/// IKM is `SERVER_MAC || CLIENT_MAC || nonce` with info [`LMK_INFO_V1`].
/// Retained for compatibility with peers that predate the LTK-based scheme.
pub fn derive_from_nonce(
    server_mac: &DeviceId,
    client_mac: &DeviceId,
    nonce: &[u8; 8],
) -> Result<SessionKey, Error> {
    let mut ikm = [0u8; 20];
    ikm[..6].copy_from_slice(server_mac.raw());
    ikm[6..12].copy_from_slice(client_mac.raw());
    ikm[12..].copy_from_slice(nonce);

    let mut key = [0u8; 16];
    let result = hkdf_sha256(None, &ikm, LMK_INFO_V1, &mut key);
    ikm.zeroize();
    result?;

    Ok(SessionKey(key))
}

/// Bootstrap record for the legacy key exchange.
///
/// The pairing initiator generates a nonce and sends it (with its own
/// address) over the encrypted BLE link; both sides then call
/// [`derive_from_nonce`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KeyExchange {
    pub nonce: [u8; 8],
    pub initiator_mac: DeviceId,
}

impl KeyExchange {
    /// Wire size of a key exchange record.
    pub const SIZE: usize = 14;

    /// Generates a fresh exchange record with a random nonce.
    pub fn generate(rng: &mut impl RngCore, initiator_mac: DeviceId) -> Self {
        let mut nonce = [0u8; 8];
        rng.fill_bytes(&mut nonce);
        KeyExchange {
            nonce,
            initiator_mac,
        }
    }
}

impl ToBytes for KeyExchange {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_slice(&self.nonce)?;
        self.initiator_mac.to_bytes(writer)
    }
}

impl<'a> FromBytes<'a> for KeyExchange {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        Ok(KeyExchange {
            nonce: bytes.read_array()?,
            initiator_mac: DeviceId::from_bytes(bytes)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> DeviceId {
        DeviceId::new([0xAA, 0xBB, 0xCC, 0x01, 0x02, 0x03])
    }

    fn client() -> DeviceId {
        DeviceId::new([0xAA, 0xBB, 0xCC, 0x04, 0x05, 0x06])
    }

    /// RFC 5869 test case 1, pinning the underlying HKDF plumbing.
    #[test]
    fn hkdf_rfc5869_case_1() {
        let ikm = [0x0B; 22];
        let salt: [u8; 13] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        let info: [u8; 10] = [0xF0, 0xF1, 0xF2, 0xF3, 0xF4, 0xF5, 0xF6, 0xF7, 0xF8, 0xF9];
        let mut okm = [0u8; 42];
        hkdf_sha256(Some(&salt), &ikm, &info, &mut okm).unwrap();

        let expected: [u8; 42] = [
            0x3C, 0xB2, 0x5F, 0x25, 0xFA, 0xAC, 0xD5, 0x7A, 0x90, 0x43, 0x4F, 0x64, 0xD0, 0x36,
            0x2F, 0x2A, 0x2D, 0x2D, 0x0A, 0x90, 0xCF, 0x1A, 0x5A, 0x4C, 0x5D, 0xB0, 0x2D, 0x56,
            0xEC, 0xC4, 0xC5, 0xBF, 0x34, 0x00, 0x72, 0x08, 0xD5, 0xB8, 0x87, 0x18, 0x58, 0x65,
        ];
        assert_eq!(okm, expected);
    }

    /// Both endpoints pass addresses by role, so the derivations match.
    #[test]
    fn both_peers_derive_identical_keys() {
        let ltk = [0x01; 16];
        let on_server = derive_from_ltk(&ltk, &server(), &client()).unwrap();
        let on_client = derive_from_ltk(&ltk, &server(), &client()).unwrap();
        assert_eq!(on_server, on_client);
    }

    #[test]
    fn ordering_and_version_are_significant() {
        let ltk = [0x01; 16];
        let canonical = derive_from_ltk(&ltk, &server(), &client()).unwrap();
        let flipped = derive_from_ltk(&ltk, &client(), &server()).unwrap();
        assert_ne!(canonical, flipped);

        let nonce = [0u8; 8];
        let legacy = derive_from_nonce(&server(), &client(), &nonce).unwrap();
        assert_ne!(canonical, legacy);
    }

    #[test]
    fn expand_overflow_is_crypto_failed() {
        // HKDF-SHA256 can produce at most 255 * 32 bytes.
        let mut okm = vec![0u8; 255 * 32 + 1];
        assert_eq!(
            hkdf_sha256(None, &[0u8; 16], b"x", &mut okm),
            Err(Error::CryptoFailed)
        );
        assert!(okm.iter().all(|&b| b == 0));
    }

    #[test]
    fn key_debug_is_redacted() {
        let ltk = [0x01; 16];
        let key = derive_from_ltk(&ltk, &server(), &client()).unwrap();
        let rendered = format!("{:?}", key);
        // 4 visible bytes, 24 hex digits would mean a full dump.
        assert!(rendered.contains(".."));
        let hex_chars = rendered.chars().filter(|c| c.is_ascii_hexdigit()).count();
        assert!(hex_chars <= 10, "too much key material in {:?}", rendered);
    }

    #[test]
    fn key_is_zeroized_on_drop() {
        let key = derive_from_ltk(&[0x01; 16], &server(), &client()).unwrap();
        assert!(key.as_bytes().iter().any(|&b| b != 0));
        let mut key = core::mem::ManuallyDrop::new(key);
        let ptr = key.as_bytes().as_ptr();
        unsafe {
            core::mem::ManuallyDrop::drop(&mut key);
        }
        // The slot is still owned by `key`, so reading it back is sound; it
        // must contain only zeros now.
        let after = unsafe { core::slice::from_raw_parts(ptr, 16) };
        assert!(after.iter().all(|&b| b == 0));
    }

    #[test]
    fn key_exchange_round_trip() {
        struct FixedRng(u8);
        impl RngCore for FixedRng {
            fn next_u32(&mut self) -> u32 {
                u32::from(self.0)
            }
            fn next_u64(&mut self) -> u64 {
                u64::from(self.0)
            }
            fn fill_bytes(&mut self, dest: &mut [u8]) {
                dest.fill(self.0);
            }
            fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
                dest.fill(self.0);
                Ok(())
            }
        }

        let kx = KeyExchange::generate(&mut FixedRng(0x5A), server());
        let mut buf = [0u8; KeyExchange::SIZE];
        kx.to_bytes(&mut ByteWriter::new(&mut buf)).unwrap();
        let back = KeyExchange::from_bytes(&mut ByteReader::new(&buf)).unwrap();
        assert_eq!(kx, back);
        assert_eq!(back.nonce, [0x5A; 8]);
    }
}
