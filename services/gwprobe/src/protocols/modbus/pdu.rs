//! Modbus PDU and MBAP header
//!
//! Use a fixed-size stack array for the PDU; frames never exceed 253 bytes.

use bytes::BytesMut;
use errors::{GatewayError, GatewayResult};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::constants::{
    EXCEPTION_FLAG, MAX_MBAP_LENGTH, MAX_PDU_SIZE, MBAP_HEADER_LEN, MODBUS_PROTOCOL_ID,
};

/// PDU with stack-allocated fixed array
#[derive(Debug, Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    /// Create an empty PDU
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    /// Create a PDU from a byte slice
    pub fn from_slice(data: &[u8]) -> GatewayResult<Self> {
        if data.len() > MAX_PDU_SIZE {
            return Err(GatewayError::malformed(
                "PDU too large",
                format!("<= {} bytes", MAX_PDU_SIZE),
                format!("{} bytes", data.len()),
            ));
        }
        let mut pdu = Self::new();
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.len = data.len();
        Ok(pdu)
    }

    /// Push a single byte
    #[inline]
    pub fn push(&mut self, byte: u8) -> GatewayResult<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(GatewayError::malformed(
                "PDU buffer full",
                format!("<= {} bytes", MAX_PDU_SIZE),
                format!("{} bytes", self.len + 1),
            ));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push u16 in big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> GatewayResult<()> {
        self.push((value >> 8) as u8)?;
        self.push((value & 0xFF) as u8)?;
        Ok(())
    }

    /// Extend with a byte slice
    pub fn extend(&mut self, data: &[u8]) -> GatewayResult<()> {
        if self.len + data.len() > MAX_PDU_SIZE {
            return Err(GatewayError::malformed(
                "PDU would exceed max size",
                format!("<= {} bytes", MAX_PDU_SIZE),
                format!("{} bytes", self.len + data.len()),
            ));
        }
        self.data[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get function code (first byte)
    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        (self.len > 0).then(|| self.data[0])
    }

    /// Check if exception response
    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code()
            .map(|fc| fc & EXCEPTION_FLAG != 0)
            .unwrap_or(false)
    }

    /// Get exception code
    #[inline]
    pub fn exception_code(&self) -> Option<u8> {
        (self.is_exception() && self.len > 1).then(|| self.data[1])
    }

    /// Big-endian u16 at `offset`
    pub fn u16_at(&self, offset: usize) -> Option<u16> {
        let bytes = self.as_slice().get(offset..offset + 2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

/// PDU builder - fluent API
pub struct PduBuilder {
    pdu: ModbusPdu,
}

impl Default for PduBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PduBuilder {
    #[inline]
    pub fn new() -> Self {
        Self {
            pdu: ModbusPdu::new(),
        }
    }

    #[inline]
    pub fn function_code(mut self, fc: u8) -> GatewayResult<Self> {
        self.pdu.push(fc)?;
        Ok(self)
    }

    #[inline]
    pub fn address(mut self, addr: u16) -> GatewayResult<Self> {
        self.pdu.push_u16(addr)?;
        Ok(self)
    }

    #[inline]
    pub fn quantity(mut self, qty: u16) -> GatewayResult<Self> {
        self.pdu.push_u16(qty)?;
        Ok(self)
    }

    #[inline]
    pub fn byte(mut self, b: u8) -> GatewayResult<Self> {
        self.pdu.push(b)?;
        Ok(self)
    }

    /// Append registers in big-endian order
    pub fn registers(mut self, values: &[u16]) -> GatewayResult<Self> {
        for value in values {
            self.pdu.push_u16(*value)?;
        }
        Ok(self)
    }

    #[inline]
    pub fn build(self) -> ModbusPdu {
        self.pdu
    }
}

/// MBAP header (with Unit ID) preceding every Modbus TCP PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    /// Unit ID + PDU length
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn for_pdu(transaction_id: u16, unit_id: u8, pdu_len: usize) -> Self {
        Self {
            transaction_id,
            protocol_id: MODBUS_PROTOCOL_ID,
            length: (pdu_len + 1) as u16,
            unit_id,
        }
    }

    /// Parse the 6 fixed header bytes; the Unit ID follows in the body
    pub fn parse_prefix(header: &[u8; MBAP_HEADER_LEN]) -> GatewayResult<(u16, u16, usize)> {
        let transaction_id = u16::from_be_bytes([header[0], header[1]]);
        let protocol_id = u16::from_be_bytes([header[2], header[3]]);
        let length = usize::from(u16::from_be_bytes([header[4], header[5]]));

        // Unit ID plus at least a function code, at most 1 + 253
        if length < 2 || length > MAX_MBAP_LENGTH {
            return Err(GatewayError::malformed(
                "invalid MBAP length",
                format!("2..={}", MAX_MBAP_LENGTH),
                length.to_string(),
            ));
        }
        Ok((transaction_id, protocol_id, length))
    }

    /// Serialize header + PDU into one ADU
    pub fn frame(&self, pdu: &[u8]) -> Vec<u8> {
        let mut adu = Vec::with_capacity(MBAP_HEADER_LEN + 1 + pdu.len());
        adu.extend_from_slice(&self.transaction_id.to_be_bytes());
        adu.extend_from_slice(&self.protocol_id.to_be_bytes());
        adu.extend_from_slice(&self.length.to_be_bytes());
        adu.push(self.unit_id);
        adu.extend_from_slice(pdu);
        adu
    }
}

/// One complete Modbus TCP frame
#[derive(Debug, Clone)]
pub struct ModbusFrame {
    pub header: MbapHeader,
    pub pdu: ModbusPdu,
}

/// Read exactly one frame: the 6-byte header, then Unit ID + PDU
///
/// I/O failures (including EOF) surface as `Io`; a nonsensical length
/// field as `MalformedFrame`.
pub async fn read_frame<R>(reader: &mut R) -> GatewayResult<ModbusFrame>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; MBAP_HEADER_LEN];
    reader.read_exact(&mut prefix).await?;
    let (transaction_id, protocol_id, length) = MbapHeader::parse_prefix(&prefix)?;

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;

    assemble_frame(transaction_id, protocol_id, &body)
}

/// Split one complete ADU off the front of a receive buffer
///
/// Returns `Ok(None)` and leaves the buffer untouched until the whole frame
/// has arrived, so a read interrupted by a timeout loses no bytes.
pub fn decode_frame(buf: &mut BytesMut) -> GatewayResult<Option<ModbusFrame>> {
    let Some(prefix) = buf.get(..MBAP_HEADER_LEN) else {
        return Ok(None);
    };
    let mut header = [0u8; MBAP_HEADER_LEN];
    header.copy_from_slice(prefix);
    let (transaction_id, protocol_id, length) = MbapHeader::parse_prefix(&header)?;

    let total = MBAP_HEADER_LEN + length;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }
    let adu = buf.split_to(total);
    assemble_frame(transaction_id, protocol_id, &adu[MBAP_HEADER_LEN..]).map(Some)
}

/// `body` is Unit ID + PDU, already length-checked by `parse_prefix`
fn assemble_frame(
    transaction_id: u16,
    protocol_id: u16,
    body: &[u8],
) -> GatewayResult<ModbusFrame> {
    Ok(ModbusFrame {
        header: MbapHeader {
            transaction_id,
            protocol_id,
            length: body.len() as u16,
            unit_id: body[0],
        },
        pdu: ModbusPdu::from_slice(&body[1..])?,
    })
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_frame_from_stream() {
        let bytes: Vec<u8> = vec![
            0x00, 0x09, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x12, 0x34,
        ];
        let mut reader = bytes.as_slice();
        let frame = read_frame(&mut reader).await.unwrap();
        assert_eq!(frame.header.transaction_id, 9);
        assert_eq!(frame.header.unit_id, 1);
        assert_eq!(frame.pdu.as_slice(), &[0x03, 0x02, 0x12, 0x34]);
    }

    #[tokio::test]
    async fn test_read_frame_truncated_is_io_error() {
        let bytes: Vec<u8> = vec![0x00, 0x09, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03];
        let mut reader = bytes.as_slice();
        let err = read_frame(&mut reader).await.unwrap_err();
        assert_eq!(err.category(), errors::ErrorCategory::Connection);
    }

    #[test]
    fn test_decode_frame_waits_for_whole_adu() {
        let adu = [0x00, 0x09, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x12, 0x34];
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&adu[..4]);
        assert!(decode_frame(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&adu[4..9]);
        assert!(decode_frame(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 9);

        // Tail of this ADU plus the head of the next one
        buf.extend_from_slice(&adu[9..]);
        buf.extend_from_slice(&adu[..3]);
        let frame = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.header.transaction_id, 9);
        assert_eq!(frame.header.length, 5);
        assert_eq!(frame.pdu.as_slice(), &[0x03, 0x02, 0x12, 0x34]);
        assert_eq!(&buf[..], &adu[..3]);
    }

    #[test]
    fn test_decode_frame_rejects_bad_length() {
        let mut buf = BytesMut::from(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x01][..]);
        assert!(decode_frame(&mut buf).is_err());
    }

    #[test]
    fn test_pdu_push_until_full() {
        let mut pdu = ModbusPdu::new();
        for i in 0..MAX_PDU_SIZE {
            pdu.push(i as u8).unwrap();
        }
        let err = pdu.push(0xFF).unwrap_err();
        assert!(err.to_string().contains("buffer full"));
    }

    #[test]
    fn test_pdu_push_u16_big_endian() {
        let mut pdu = ModbusPdu::new();
        pdu.push_u16(0x1234).unwrap();
        assert_eq!(pdu.as_slice(), &[0x12, 0x34]);
        assert_eq!(pdu.u16_at(0), Some(0x1234));
        assert_eq!(pdu.u16_at(1), None);
    }

    #[test]
    fn test_pdu_extend_exceed_capacity() {
        let mut pdu = ModbusPdu::new();
        pdu.extend(&[0x01, 0x02]).unwrap();
        assert!(pdu.extend(&vec![0xFF; MAX_PDU_SIZE]).is_err());
        // Original data should remain unchanged
        assert_eq!(pdu.as_slice(), &[0x01, 0x02]);
    }

    #[test]
    fn test_pdu_exception_detection() {
        let pdu = ModbusPdu::from_slice(&[0x83, 0x02]).unwrap();
        assert!(pdu.is_exception());
        assert_eq!(pdu.exception_code(), Some(0x02));

        let pdu = ModbusPdu::from_slice(&[0x83]).unwrap();
        assert_eq!(pdu.exception_code(), None);

        let pdu = ModbusPdu::from_slice(&[0x03, 0x02, 0x00, 0x01]).unwrap();
        assert!(!pdu.is_exception());
    }

    #[test]
    fn test_builder_read_request() {
        let pdu = PduBuilder::new()
            .function_code(0x03)
            .unwrap()
            .address(0x0000)
            .unwrap()
            .quantity(8)
            .unwrap()
            .build();
        assert_eq!(pdu.as_slice(), &[0x03, 0x00, 0x00, 0x00, 0x08]);
    }

    #[test]
    fn test_builder_write_multiple() {
        let pdu = PduBuilder::new()
            .function_code(0x10)
            .and_then(|b| b.address(0x0006))
            .and_then(|b| b.quantity(2))
            .and_then(|b| b.byte(4))
            .and_then(|b| b.registers(&[0x000F, 0x0009]))
            .unwrap()
            .build();
        assert_eq!(
            pdu.as_slice(),
            &[0x10, 0x00, 0x06, 0x00, 0x02, 0x04, 0x00, 0x0F, 0x00, 0x09]
        );
    }

    #[test]
    fn test_mbap_frame() {
        let pdu = ModbusPdu::from_slice(&[0x03, 0x00, 0x00, 0x00, 0x08]).unwrap();
        let adu = MbapHeader::for_pdu(0x0102, 1, pdu.len()).frame(pdu.as_slice());
        assert_eq!(
            adu,
            vec![0x01, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x08]
        );
    }

    #[test]
    fn test_mbap_prefix_rejects_bad_length() {
        assert!(MbapHeader::parse_prefix(&[0, 1, 0, 0, 0x01, 0x00]).is_err());
        assert!(MbapHeader::parse_prefix(&[0, 1, 0, 0, 0x00, 0x01]).is_err());
        let (tid, proto, len) = MbapHeader::parse_prefix(&[0, 7, 0, 0, 0, 6]).unwrap();
        assert_eq!((tid, proto, len), (7, 0, 6));
    }
}
