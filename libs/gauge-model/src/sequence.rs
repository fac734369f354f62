//! Sequence counter widths
//!
//! Register-bank and byte-block formats carry a 16-bit counter; the
//! variable-node format carries the full 32 bits.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceWidth {
    Bits16,
    Bits32,
}

impl SequenceWidth {
    pub fn bits(self) -> u32 {
        match self {
            Self::Bits16 => 16,
            Self::Bits32 => 32,
        }
    }

    /// Last value before the counter wraps
    pub fn max(self) -> u32 {
        match self {
            Self::Bits16 => u32::from(u16::MAX),
            Self::Bits32 => u32::MAX,
        }
    }

    /// Apply the wraparound modulus
    pub fn truncate(self, sequence: u32) -> u32 {
        sequence & self.max()
    }

    /// Next producer sequence, skipping 0 after a wrap
    ///
    /// 0 means "no sample yet" to consumers, so a producer never publishes it
    /// once it has started counting.
    pub fn successor(self, sequence: u32) -> u32 {
        match self.truncate(sequence.wrapping_add(1)) {
            0 => 1,
            next => next,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(SequenceWidth::Bits16.truncate(65_536), 0);
        assert_eq!(SequenceWidth::Bits16.truncate(65_541), 5);
        assert_eq!(SequenceWidth::Bits32.truncate(65_541), 65_541);
    }

    #[test]
    fn test_max() {
        assert_eq!(SequenceWidth::Bits16.max(), 65_535);
        assert_eq!(SequenceWidth::Bits32.max(), u32::MAX);
    }

    #[test]
    fn test_successor_skips_zero() {
        assert_eq!(SequenceWidth::Bits16.successor(1), 2);
        assert_eq!(SequenceWidth::Bits16.successor(65_535), 1);
        assert_eq!(SequenceWidth::Bits32.successor(u32::MAX), 1);
        assert_eq!(SequenceWidth::Bits32.successor(65_535), 65_536);
    }
}
