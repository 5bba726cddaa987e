//! The self-describing snapshot envelope.
//!
//! Every snapshot travels (and is stored) as a 36-byte little-endian header
//! followed by a DEFLATE payload:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0      | 4    | magic (`0x52424B53`, "RBKS") |
//! | 4      | 4    | version (currently 1) |
//! | 8      | 4    | frame captured, after execution |
//! | 12     | 4    | uncompressed size |
//! | 16     | 4    | compressed size |
//! | 20     | 4    | emulator RNG state at capture |
//! | 24     | 4    | last local input sequence at capture |
//! | 28     | 8    | reserved, zero on encode, ignored on decode |
//! | 36     | n    | DEFLATE payload |
//!
//! The codec only frames bytes; compression and checksumming live in the
//! [state store](crate::snapshot::store). Parsing never panics on malformed
//! input.

use crate::{FramelockError, FramelockResult};

/// Magic number identifying a snapshot envelope ("RBKS").
pub const SNAPSHOT_MAGIC: u32 = 0x5242_4B53;

/// The envelope version this build understands.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Size of the envelope header in bytes.
pub const HEADER_BYTES: usize = 36;

/// The parsed header of a snapshot envelope.
///
/// Round-trip law: for any header `h` and buffer large enough,
/// `SnapshotHeader::parse(&buf)` after `h.write_to(&mut buf)` yields `h`,
/// byte-for-byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    /// The frame this snapshot captures, after execution of that frame.
    pub frame: u32,
    /// Size of the emulator state before compression.
    pub uncompressed_size: u32,
    /// Size of the DEFLATE payload following the header.
    pub compressed_size: u32,
    /// Emulator RNG seed at capture time.
    pub rng_state: u32,
    /// Last local input sequence number at capture time.
    pub input_seq: u32,
}

impl SnapshotHeader {
    /// Packs this header into the first [`HEADER_BYTES`] of `out`,
    /// little-endian, reserved bytes zeroed.
    ///
    /// # Errors
    ///
    /// Returns [`FramelockError::Truncated`] if `out` is too small.
    pub fn write_to(&self, out: &mut [u8]) -> FramelockResult<()> {
        if out.len() < HEADER_BYTES {
            return Err(FramelockError::Truncated {
                needed: HEADER_BYTES,
                available: out.len(),
            });
        }
        out[0..4].copy_from_slice(&SNAPSHOT_MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        out[8..12].copy_from_slice(&self.frame.to_le_bytes());
        out[12..16].copy_from_slice(&self.uncompressed_size.to_le_bytes());
        out[16..20].copy_from_slice(&self.compressed_size.to_le_bytes());
        out[20..24].copy_from_slice(&self.rng_state.to_le_bytes());
        out[24..28].copy_from_slice(&self.input_seq.to_le_bytes());
        out[28..36].fill(0);
        Ok(())
    }

    /// Parses and validates an envelope header from the start of `bytes`.
    ///
    /// Reserved bytes are ignored. The total length is checked against the
    /// declared compressed size.
    ///
    /// # Errors
    ///
    /// - [`FramelockError::Truncated`] if `bytes` is shorter than the header
    ///   or shorter than `header + compressed_size`.
    /// - [`FramelockError::BadMagic`] if the magic number does not match.
    /// - [`FramelockError::UnsupportedVersion`] for any version other than
    ///   [`SNAPSHOT_VERSION`].
    pub fn parse(bytes: &[u8]) -> FramelockResult<Self> {
        if bytes.len() < HEADER_BYTES {
            return Err(FramelockError::Truncated {
                needed: HEADER_BYTES,
                available: bytes.len(),
            });
        }
        let field = |offset: usize| {
            u32::from_le_bytes([
                bytes[offset],
                bytes[offset + 1],
                bytes[offset + 2],
                bytes[offset + 3],
            ])
        };
        let magic = field(0);
        if magic != SNAPSHOT_MAGIC {
            return Err(FramelockError::BadMagic { found: magic });
        }
        let version = field(4);
        if version != SNAPSHOT_VERSION {
            return Err(FramelockError::UnsupportedVersion { found: version });
        }
        let header = Self {
            frame: field(8),
            uncompressed_size: field(12),
            compressed_size: field(16),
            rng_state: field(20),
            input_seq: field(24),
        };
        let needed = HEADER_BYTES + header.compressed_size as usize;
        if bytes.len() < needed {
            return Err(FramelockError::Truncated {
                needed,
                available: bytes.len(),
            });
        }
        Ok(header)
    }

    /// Parses an envelope and returns the header together with its payload
    /// slice.
    ///
    /// # Errors
    ///
    /// Same conditions as [`SnapshotHeader::parse`].
    pub fn parse_with_payload(bytes: &[u8]) -> FramelockResult<(Self, &[u8])> {
        let header = Self::parse(bytes)?;
        let payload = &bytes[HEADER_BYTES..HEADER_BYTES + header.compressed_size as usize];
        Ok((header, payload))
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_header() -> SnapshotHeader {
        SnapshotHeader {
            frame: 600,
            uncompressed_size: 4096,
            compressed_size: 0,
            rng_state: 0xDEAD_BEEF,
            input_seq: 601,
        }
    }

    #[test]
    fn test_header_round_trip() {
        let header = sample_header();
        let mut buf = [0u8; HEADER_BYTES];
        header.write_to(&mut buf).unwrap();
        assert_eq!(SnapshotHeader::parse(&buf).unwrap(), header);
    }

    #[test]
    fn test_magic_is_rbks_little_endian() {
        let mut buf = [0u8; HEADER_BYTES];
        sample_header().write_to(&mut buf).unwrap();
        assert_eq!(&buf[0..4], &[0x53, 0x4B, 0x42, 0x52]); // "SKBR" on the wire
    }

    #[test]
    fn test_reserved_bytes_zero_on_encode_ignored_on_decode() {
        let header = sample_header();
        let mut buf = [0xFFu8; HEADER_BYTES];
        header.write_to(&mut buf).unwrap();
        assert!(buf[28..36].iter().all(|&b| b == 0));

        // garbage in the reserved region must not affect parsing
        buf[28..36].fill(0xAB);
        assert_eq!(SnapshotHeader::parse(&buf).unwrap(), header);
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = [0u8; HEADER_BYTES];
        sample_header().write_to(&mut buf).unwrap();
        buf[0..4].fill(0);
        assert_eq!(
            SnapshotHeader::parse(&buf),
            Err(FramelockError::BadMagic { found: 0 })
        );
    }

    #[test]
    fn test_unsupported_version() {
        let mut buf = [0u8; HEADER_BYTES];
        sample_header().write_to(&mut buf).unwrap();
        buf[4..8].copy_from_slice(&2u32.to_le_bytes());
        assert_eq!(
            SnapshotHeader::parse(&buf),
            Err(FramelockError::UnsupportedVersion { found: 2 })
        );
    }

    #[test]
    fn test_truncated_header() {
        let err = SnapshotHeader::parse(&[0u8; 12]).unwrap_err();
        assert_eq!(
            err,
            FramelockError::Truncated {
                needed: HEADER_BYTES,
                available: 12
            }
        );
    }

    #[test]
    fn test_truncated_payload() {
        let header = SnapshotHeader {
            compressed_size: 100,
            ..sample_header()
        };
        let mut buf = vec![0u8; HEADER_BYTES + 50];
        header.write_to(&mut buf).unwrap();
        assert_eq!(
            SnapshotHeader::parse(&buf),
            Err(FramelockError::Truncated {
                needed: HEADER_BYTES + 100,
                available: HEADER_BYTES + 50
            })
        );
    }

    #[test]
    fn test_write_to_undersized_buffer() {
        let mut buf = [0u8; HEADER_BYTES - 1];
        assert!(sample_header().write_to(&mut buf).is_err());
    }

    #[test]
    fn test_payload_slice() {
        let payload = [7u8; 16];
        let header = SnapshotHeader {
            compressed_size: payload.len() as u32,
            ..sample_header()
        };
        let mut buf = vec![0u8; HEADER_BYTES + payload.len()];
        header.write_to(&mut buf).unwrap();
        buf[HEADER_BYTES..].copy_from_slice(&payload);

        let (parsed, body) = SnapshotHeader::parse_with_payload(&buf).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(body, payload);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        /// Any header survives a write/parse round trip.
        #[test]
        fn prop_header_round_trip(
            frame in any::<u32>(),
            uncompressed in any::<u32>(),
            rng in any::<u32>(),
            seq in any::<u32>(),
            payload in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let header = SnapshotHeader {
                frame,
                uncompressed_size: uncompressed,
                compressed_size: payload.len() as u32,
                rng_state: rng,
                input_seq: seq,
            };
            let mut buf = vec![0u8; HEADER_BYTES + payload.len()];
            header.write_to(&mut buf).unwrap();
            buf[HEADER_BYTES..].copy_from_slice(&payload);

            let (parsed, body) = SnapshotHeader::parse_with_payload(&buf).unwrap();
            prop_assert_eq!(parsed, header);
            prop_assert_eq!(body, &payload[..]);
        }

        /// Every strict prefix of a valid envelope is rejected as truncated
        /// or malformed; parsing never panics.
        #[test]
        fn prop_prefixes_never_parse(len in 0usize..HEADER_BYTES) {
            let mut buf = vec![0u8; HEADER_BYTES];
            sample_header().write_to(&mut buf).unwrap();
            prop_assert!(SnapshotHeader::parse(&buf[..len]).is_err());
        }
    }
}
