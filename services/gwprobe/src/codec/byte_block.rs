//! Byte-block layout (S7 data block, 16 bytes, big-endian)
//!
//! | Bytes | Field |
//! |-------|-------|
//! | 0-3 | thickness, f32 |
//! | 4-7 | timestamp low 32 bits |
//! | 8-11 | timestamp high 32 bits |
//! | 12-13 | status |
//! | 14-15 | sequence, 16-bit |

use bytes::{BufMut, Bytes, BytesMut};
use errors::{GatewayError, GatewayResult};
use gauge_model::{CanonicalReading, SequenceWidth, Status};

use super::Codec;

/// Size of one reading in the data block
pub const BYTE_BLOCK_LEN: usize = 16;

#[derive(Debug, Clone, Copy, Default)]
pub struct ByteBlockCodec;

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn be_u16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

impl Codec for ByteBlockCodec {
    type Frame = Bytes;

    fn name(&self) -> &'static str {
        "byte-block"
    }

    fn sequence_width(&self) -> SequenceWidth {
        SequenceWidth::Bits16
    }

    fn decode(&self, block: &Bytes) -> GatewayResult<CanonicalReading> {
        if block.len() < BYTE_BLOCK_LEN {
            return Err(GatewayError::short_frame(
                "bytes",
                BYTE_BLOCK_LEN,
                block.len(),
            ));
        }

        let thickness = f32::from_bits(be_u32(&block[0..4]));
        let low = u64::from(be_u32(&block[4..8]));
        let high = u64::from(be_u32(&block[8..12]));

        CanonicalReading::new(
            thickness,
            (high << 32) | low,
            Status::from_bits(be_u16(&block[12..14])),
            u32::from(be_u16(&block[14..16])),
        )
    }

    fn encode(&self, reading: &CanonicalReading) -> Bytes {
        let ts = reading.timestamp_ms();
        let sequence = self.sequence_width().truncate(reading.sequence());

        let mut buf = BytesMut::with_capacity(BYTE_BLOCK_LEN);
        buf.put_f32(reading.thickness());
        buf.put_u32(ts as u32);
        buf.put_u32((ts >> 32) as u32);
        buf.put_u16(reading.status().bits());
        buf.put_u16(sequence as u16);
        buf.freeze()
    }
}
