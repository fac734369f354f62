//! Register-bank layout (Modbus holding registers 0-7)
//!
//! | Words | Field |
//! |-------|-------|
//! | 0-1 | thickness, f32 big-endian word order |
//! | 2-5 | timestamp_ms, u64 big-endian word order |
//! | 6 | status |
//! | 7 | sequence, 16-bit |

use errors::{GatewayError, GatewayResult};
use gauge_model::{CanonicalReading, SequenceWidth, Status};

use super::Codec;

/// Number of registers one reading occupies
pub const REGISTER_COUNT: usize = 8;

#[derive(Debug, Clone, Copy, Default)]
pub struct RegisterBankCodec;

impl Codec for RegisterBankCodec {
    type Frame = Vec<u16>;

    fn name(&self) -> &'static str {
        "register-bank"
    }

    fn sequence_width(&self) -> SequenceWidth {
        SequenceWidth::Bits16
    }

    fn decode(&self, words: &Vec<u16>) -> GatewayResult<CanonicalReading> {
        if words.len() < REGISTER_COUNT {
            return Err(GatewayError::short_frame(
                "words",
                REGISTER_COUNT,
                words.len(),
            ));
        }

        let thickness = f32::from_bits((u32::from(words[0]) << 16) | u32::from(words[1]));
        let timestamp_ms = words[2..6]
            .iter()
            .fold(0u64, |acc, w| (acc << 16) | u64::from(*w));

        CanonicalReading::new(
            thickness,
            timestamp_ms,
            Status::from_bits(words[6]),
            u32::from(words[7]),
        )
    }

    fn encode(&self, reading: &CanonicalReading) -> Vec<u16> {
        let bits = reading.thickness().to_bits();
        let ts = reading.timestamp_ms();
        let sequence = self.sequence_width().truncate(reading.sequence());

        vec![
            (bits >> 16) as u16,
            bits as u16,
            (ts >> 48) as u16,
            (ts >> 32) as u16,
            (ts >> 16) as u16,
            ts as u16,
            reading.status().bits(),
            sequence as u16,
        ]
    }
}
