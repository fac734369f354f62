//! Frame codecs
//!
//! Each protocol carries the same [`CanonicalReading`] in its own frame
//! layout. A codec converts between that layout and the canonical record;
//! decoding the three layouts of one reading must yield identical values.

use errors::GatewayResult;
use gauge_model::{CanonicalReading, SequenceWidth};

pub mod byte_block;
pub mod register_bank;
pub mod variable_node;

pub use byte_block::{ByteBlockCodec, BYTE_BLOCK_LEN};
pub use register_bank::{RegisterBankCodec, REGISTER_COUNT};
pub use variable_node::{GatewayVariable, NodeValue, VariableFrame, VariableNodeCodec};

/// Translation between a protocol-native frame and a canonical reading
pub trait Codec: Send + Sync {
    /// Raw frame as supplied by the transport session
    type Frame: Send;

    /// Short protocol label for logs
    fn name(&self) -> &'static str;

    /// Width of the sequence counter this layout carries
    fn sequence_width(&self) -> SequenceWidth;

    /// Decode a frame; short or invalid frames are `MalformedFrame` errors
    fn decode(&self, frame: &Self::Frame) -> GatewayResult<CanonicalReading>;

    /// Exact inverse of [`Codec::decode`], truncating the sequence to the
    /// layout's width
    fn encode(&self, reading: &CanonicalReading) -> Self::Frame;
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use gauge_model::Status;

    fn sample() -> CanonicalReading {
        CanonicalReading::new(12.345, 0x0000_0192_3AB0_1234, Status::from_bits(0x020E), 70_000)
            .unwrap()
    }

    #[test]
    fn test_all_layouts_agree_on_one_reading() {
        let reading = sample();

        let from_registers = RegisterBankCodec
            .decode(&RegisterBankCodec.encode(&reading))
            .unwrap();
        let from_block = ByteBlockCodec
            .decode(&ByteBlockCodec.encode(&reading))
            .unwrap();
        let from_nodes = VariableNodeCodec
            .decode(&VariableNodeCodec.encode(&reading))
            .unwrap();

        for decoded in [from_registers, from_block, from_nodes] {
            assert_eq!(decoded.thickness().to_bits(), reading.thickness().to_bits());
            assert_eq!(decoded.timestamp_ms(), reading.timestamp_ms());
            assert_eq!(decoded.status(), reading.status());
        }

        // 16-bit layouts wrap, the variable layout keeps the full counter
        assert_eq!(from_registers.sequence(), 70_000 % 65_536);
        assert_eq!(from_block.sequence(), 70_000 % 65_536);
        assert_eq!(from_nodes.sequence(), 70_000);
    }

    #[test]
    fn test_register_and_block_floats_match_bit_for_bit() {
        let mut words = vec![0u16; REGISTER_COUNT];
        words[0] = 0x4248;
        words[1] = 0x0000;
        words[7] = 1;

        let mut block = vec![0u8; BYTE_BLOCK_LEN];
        block[0..4].copy_from_slice(&[0x42, 0x48, 0x00, 0x00]);
        block[15] = 1;

        let a = RegisterBankCodec.decode(&words).unwrap();
        let b = ByteBlockCodec.decode(&block.into()).unwrap();
        assert_eq!(a.thickness().to_bits(), b.thickness().to_bits());
        assert_eq!(a.thickness(), 50.0);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn finite_thickness() -> impl Strategy<Value = f32> {
            any::<u32>()
                .prop_map(f32::from_bits)
                .prop_filter("finite", |v| v.is_finite())
        }

        proptest! {
            #[test]
            fn prop_every_layout_decodes_its_own_encoding(
                thickness in finite_thickness(),
                timestamp_ms in any::<u64>(),
                status in any::<u16>(),
                sequence in any::<u32>(),
            ) {
                let reading = CanonicalReading::new(
                    thickness,
                    timestamp_ms,
                    Status::from_bits(status),
                    sequence,
                )
                .unwrap();

                let decoded = [
                    (
                        RegisterBankCodec.decode(&RegisterBankCodec.encode(&reading)).unwrap(),
                        RegisterBankCodec.sequence_width(),
                    ),
                    (
                        ByteBlockCodec.decode(&ByteBlockCodec.encode(&reading)).unwrap(),
                        ByteBlockCodec.sequence_width(),
                    ),
                    (
                        VariableNodeCodec.decode(&VariableNodeCodec.encode(&reading)).unwrap(),
                        VariableNodeCodec.sequence_width(),
                    ),
                ];
                for (got, width) in decoded {
                    prop_assert_eq!(got.thickness().to_bits(), thickness.to_bits());
                    prop_assert_eq!(got.timestamp_ms(), timestamp_ms);
                    prop_assert_eq!(got.status().bits(), status);
                    prop_assert_eq!(got.sequence(), width.truncate(sequence));
                }
            }
        }
    }
}
