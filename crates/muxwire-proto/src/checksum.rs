//! Argument checksums.
//!
//! The checksum covers the concatenated bytes of all three arguments in
//! order, fed incrementally as chunks are produced or received. The sender
//! picks the algorithm; the receiver uses whatever the frames declare.

use std::fmt;

use xxhash_rust::xxh32::Xxh32;

use crate::errors::{ProtocolError, Result};

/// Checksum algorithm byte carried in every call frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChecksumType {
    /// No checksum; no trailer on the final frame.
    None = 0x00,
    /// CRC-32 (IEEE).
    Crc32 = 0x01,
    /// xxHash32 with seed 0.
    Xxh32 = 0x02,
    /// CRC-32C (Castagnoli).
    #[default]
    Crc32C = 0x03,
}

impl ChecksumType {
    /// Parse the wire byte.
    ///
    /// # Errors
    ///
    /// `UnknownCode` for unassigned values.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(Self::None),
            0x01 => Ok(Self::Crc32),
            0x02 => Ok(Self::Xxh32),
            0x03 => Ok(Self::Crc32C),
            _ => Err(ProtocolError::UnknownCode { field: "checksum type", value }),
        }
    }

    /// Wire byte.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Bytes appended to the final frame for the checksum value.
    pub fn trailer_len(self) -> usize {
        match self {
            Self::None => 0,
            Self::Crc32 | Self::Xxh32 | Self::Crc32C => 4,
        }
    }

    /// One-shot checksum of `data`.
    pub fn compute(self, data: &[u8]) -> u32 {
        let mut checksum = Checksum::new(self);
        checksum.update(data);
        checksum.finalize()
    }

    /// Whether `expected` is the checksum of `data`. Always true for
    /// [`ChecksumType::None`].
    pub fn verify(self, expected: u32, data: &[u8]) -> bool {
        self == Self::None || self.compute(data) == expected
    }
}

enum State {
    None,
    Crc32(crc32fast::Hasher),
    Xxh32(Box<Xxh32>),
    Crc32C(u32),
}

/// Running checksum over argument bytes.
pub struct Checksum {
    kind: ChecksumType,
    state: State,
}

impl Checksum {
    /// Fresh state for `kind`.
    pub fn new(kind: ChecksumType) -> Self {
        let state = match kind {
            ChecksumType::None => State::None,
            ChecksumType::Crc32 => State::Crc32(crc32fast::Hasher::new()),
            ChecksumType::Xxh32 => State::Xxh32(Box::new(Xxh32::new(0))),
            ChecksumType::Crc32C => State::Crc32C(0),
        };
        Self { kind, state }
    }

    /// Algorithm in use.
    pub fn kind(&self) -> ChecksumType {
        self.kind
    }

    /// Feed more argument bytes.
    pub fn update(&mut self, data: &[u8]) {
        match &mut self.state {
            State::None => {},
            State::Crc32(hasher) => hasher.update(data),
            State::Xxh32(hasher) => hasher.update(data),
            State::Crc32C(crc) => *crc = crc32c::crc32c_append(*crc, data),
        }
    }

    /// Checksum of everything fed so far. Zero for [`ChecksumType::None`].
    pub fn finalize(&self) -> u32 {
        match &self.state {
            State::None => 0,
            State::Crc32(hasher) => hasher.clone().finalize(),
            State::Xxh32(hasher) => hasher.digest(),
            State::Crc32C(crc) => *crc,
        }
    }
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Checksum").field("kind", &self.kind).field("value", &self.finalize()).finish()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const CHECK_INPUT: &[u8] = b"123456789";

    #[test]
    fn known_check_values() {
        assert_eq!(ChecksumType::Crc32.compute(CHECK_INPUT), 0xcbf4_3926);
        assert_eq!(ChecksumType::Crc32C.compute(CHECK_INPUT), 0xe306_9283);
        assert_eq!(ChecksumType::Xxh32.compute(b""), 0x02cc_5d05);
        assert_eq!(ChecksumType::None.compute(CHECK_INPUT), 0);
    }

    #[test]
    fn unknown_type_rejected() {
        assert_eq!(
            ChecksumType::from_u8(0x09).unwrap_err(),
            ProtocolError::UnknownCode { field: "checksum type", value: 0x09 }
        );
    }

    #[test]
    fn none_always_verifies() {
        assert!(ChecksumType::None.verify(0xdead_beef, b"anything"));
        assert!(!ChecksumType::Crc32C.verify(0xdead_beef, CHECK_INPUT));
    }

    #[test]
    fn trailer_lengths() {
        assert_eq!(ChecksumType::None.trailer_len(), 0);
        assert_eq!(ChecksumType::Crc32C.trailer_len(), 4);
    }

    proptest! {
        #[test]
        fn incremental_matches_one_shot(
            data in prop::collection::vec(any::<u8>(), 0..512),
            split in any::<prop::sample::Index>(),
            kind in prop_oneof![
                Just(ChecksumType::Crc32),
                Just(ChecksumType::Xxh32),
                Just(ChecksumType::Crc32C),
            ],
        ) {
            let at = split.index(data.len() + 1);
            let mut checksum = Checksum::new(kind);
            checksum.update(&data[..at]);
            checksum.update(&data[at..]);
            prop_assert_eq!(checksum.finalize(), kind.compute(&data));
            prop_assert!(kind.verify(kind.compute(&data), &data));
        }
    }
}
