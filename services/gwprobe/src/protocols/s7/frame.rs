//! TPKT, COTP and S7 message encoding
//!
//! ```text
//! TPKT  03 00 len16
//! COTP  CR/CC: li type dst-ref src-ref class params...
//!       DT:    02 F0 80
//! S7    32 rosctr 0000 pdu-ref param-len data-len [err-class err-code]
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use errors::{GatewayError, GatewayResult};
use tokio::io::{AsyncRead, AsyncReadExt};

// ============================================================================
// Constants
// ============================================================================

pub const DEFAULT_PORT: u16 = 102;
pub const DEFAULT_DB_NUMBER: u16 = 10;
/// PDU length offered during setup-communication
pub const DEFAULT_PDU_LENGTH: u16 = 480;

pub const TPKT_VERSION: u8 = 0x03;
pub const TPKT_HEADER_LEN: usize = 4;

pub const COTP_CONNECT_REQUEST: u8 = 0xE0;
pub const COTP_CONNECT_CONFIRM: u8 = 0xD0;
pub const COTP_DISCONNECT_REQUEST: u8 = 0x80;
pub const COTP_DATA: u8 = 0xF0;
/// Last-data-unit flag carried in the DT header
const COTP_EOT: u8 = 0x80;

pub const S7_PROTOCOL_ID: u8 = 0x32;
pub const ROSCTR_JOB: u8 = 0x01;
pub const ROSCTR_ACK_DATA: u8 = 0x03;

pub const FN_SETUP_COMMUNICATION: u8 = 0xF0;
pub const FN_READ_VAR: u8 = 0x04;
pub const FN_WRITE_VAR: u8 = 0x05;

pub const AREA_DB: u8 = 0x84;
const SYNTAX_ANY: u8 = 0x10;
const ITEM_SPEC: u8 = 0x12;
const ITEM_SPEC_LEN: u8 = 0x0A;
const TRANSPORT_BYTE: u8 = 0x02;
/// Data-item transport size: length counted in bits
pub const DATA_SIZE_BITS: u8 = 0x04;
/// Data-item transport size: length counted in bytes
pub const DATA_SIZE_OCTETS: u8 = 0x09;

pub const RETURN_SUCCESS: u8 = 0xFF;
pub const RETURN_ADDRESS_OUT_OF_RANGE: u8 = 0x05;
pub const RETURN_OBJECT_MISSING: u8 = 0x0A;

/// Header, read-var parameter and data-item header of a read response
pub const READ_RESPONSE_OVERHEAD: usize = 12 + 2 + 4;

/// Item return-code description
pub fn return_code_description(code: u8) -> &'static str {
    match code {
        RETURN_SUCCESS => "success",
        0x01 => "hardware fault",
        0x03 => "access denied",
        RETURN_ADDRESS_OUT_OF_RANGE => "address out of range",
        0x06 => "data type not supported",
        0x07 => "data type inconsistent",
        RETURN_OBJECT_MISSING => "object does not exist",
        _ => "unknown return code",
    }
}

fn be_u16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

// ============================================================================
// TPKT / COTP
// ============================================================================

/// Prefix `payload` with a TPKT header
pub fn tpkt(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(TPKT_HEADER_LEN + payload.len());
    buf.put_u8(TPKT_VERSION);
    buf.put_u8(0);
    buf.put_u16((TPKT_HEADER_LEN + payload.len()) as u16);
    buf.put_slice(payload);
    buf.freeze()
}

/// Validate a TPKT header and return the total packet length
fn tpkt_length(header: &[u8]) -> GatewayResult<usize> {
    if header[0] != TPKT_VERSION {
        return Err(GatewayError::malformed(
            "bad TPKT version",
            format!("0x{:02X}", TPKT_VERSION),
            format!("0x{:02X}", header[0]),
        ));
    }
    let total = usize::from(be_u16(&header[2..4]));
    // COTP needs at least li + type + one more byte
    if total < TPKT_HEADER_LEN + 3 {
        return Err(GatewayError::malformed(
            "TPKT length too small",
            format!(">= {}", TPKT_HEADER_LEN + 3),
            total.to_string(),
        ));
    }
    Ok(total)
}

/// Read one TPKT packet and return its payload
pub async fn read_tpkt<R>(reader: &mut R) -> GatewayResult<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; TPKT_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let total = tpkt_length(&header)?;
    let mut payload = vec![0u8; total - TPKT_HEADER_LEN];
    reader.read_exact(&mut payload).await?;
    Ok(Bytes::from(payload))
}

/// Split one whole TPKT packet off a receive buffer and return its payload
///
/// `Ok(None)` until the packet is complete; the buffer is left as is.
pub fn split_tpkt(buf: &mut BytesMut) -> GatewayResult<Option<Bytes>> {
    if buf.len() < TPKT_HEADER_LEN {
        return Ok(None);
    }
    let total = tpkt_length(&buf[..TPKT_HEADER_LEN])?;
    if buf.len() < total {
        buf.reserve(total - buf.len());
        return Ok(None);
    }
    let mut packet = buf.split_to(total);
    Ok(Some(packet.split_off(TPKT_HEADER_LEN).freeze()))
}

/// Remote TSAP for a CPU at rack/slot
pub fn remote_tsap(rack: u8, slot: u8) -> u16 {
    0x0100 | u16::from(rack.wrapping_mul(0x20).wrapping_add(slot))
}

/// COTP connection request, TPKT-framed
pub fn connection_request(rack: u8, slot: u8) -> Bytes {
    let tsap = remote_tsap(rack, slot).to_be_bytes();
    tpkt(&[
        0x11,
        COTP_CONNECT_REQUEST,
        0x00,
        0x00, // dst ref
        0x00,
        0x01, // src ref
        0x00, // class 0
        0xC0,
        0x01,
        0x0A, // TPDU size 1024
        0xC1,
        0x02,
        0x01,
        0x00, // local TSAP
        0xC2,
        0x02,
        tsap[0],
        tsap[1],
    ])
}

/// Connection confirm answering a request's COTP header
pub fn connection_confirm(request: &[u8]) -> Bytes {
    let mut cotp = request.to_vec();
    cotp[1] = COTP_CONNECT_CONFIRM;
    // Our dst ref is the requester's src ref
    cotp[2] = request[4];
    cotp[3] = request[5];
    cotp[4] = 0x00;
    cotp[5] = 0x01;
    tpkt(&cotp)
}

/// Wrap an S7 message in COTP DT and TPKT
pub fn data_frame(s7: &[u8]) -> Bytes {
    let mut payload = Vec::with_capacity(3 + s7.len());
    payload.extend_from_slice(&[0x02, COTP_DATA, COTP_EOT]);
    payload.extend_from_slice(s7);
    tpkt(&payload)
}

/// Decoded COTP header of one TPKT payload
#[derive(Debug, Clone, PartialEq)]
pub enum Cotp {
    ConnectRequest,
    ConnectConfirm,
    Disconnect,
    Data(Bytes),
    Other(u8),
}

pub fn parse_cotp(payload: &Bytes) -> GatewayResult<Cotp> {
    if payload.len() < 2 {
        return Err(GatewayError::malformed(
            "COTP header truncated",
            ">= 2 bytes",
            format!("{} bytes", payload.len()),
        ));
    }
    let header_len = usize::from(payload[0]) + 1;
    if payload.len() < header_len {
        return Err(GatewayError::malformed(
            "COTP length indicator exceeds packet",
            format!("{} bytes", header_len),
            format!("{} bytes", payload.len()),
        ));
    }
    let pdu_type = payload[1] & 0xF0;
    Ok(match pdu_type {
        COTP_CONNECT_REQUEST if header_len >= 7 => Cotp::ConnectRequest,
        COTP_CONNECT_CONFIRM => Cotp::ConnectConfirm,
        COTP_DISCONNECT_REQUEST => Cotp::Disconnect,
        COTP_DATA => Cotp::Data(payload.slice(header_len..)),
        other => Cotp::Other(other),
    })
}

// ============================================================================
// S7 messages
// ============================================================================

/// S7 message: header fields plus parameter and data sections
#[derive(Debug, Clone, PartialEq)]
pub struct S7Message {
    pub rosctr: u8,
    pub pdu_ref: u16,
    /// Error class and code, ack-data only
    pub error: Option<(u8, u8)>,
    pub param: Bytes,
    pub data: Bytes,
}

impl S7Message {
    pub fn job(pdu_ref: u16, param: impl Into<Bytes>, data: impl Into<Bytes>) -> Self {
        Self {
            rosctr: ROSCTR_JOB,
            pdu_ref,
            error: None,
            param: param.into(),
            data: data.into(),
        }
    }

    pub fn ack_data(pdu_ref: u16, param: impl Into<Bytes>, data: impl Into<Bytes>) -> Self {
        Self {
            rosctr: ROSCTR_ACK_DATA,
            pdu_ref,
            error: Some((0, 0)),
            param: param.into(),
            data: data.into(),
        }
    }

    /// Ack-data carrying a header error and nothing else
    pub fn ack_error(pdu_ref: u16, class: u8, code: u8) -> Self {
        Self {
            rosctr: ROSCTR_ACK_DATA,
            pdu_ref,
            error: Some((class, code)),
            param: Bytes::new(),
            data: Bytes::new(),
        }
    }

    /// Function code (first parameter byte)
    pub fn function(&self) -> Option<u8> {
        self.param.first().copied()
    }

    /// Header error as a single word, zero when clean
    pub fn error_word(&self) -> u16 {
        self.error
            .map(|(class, code)| u16::from_be_bytes([class, code]))
            .unwrap_or(0)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(12 + self.param.len() + self.data.len());
        buf.put_u8(S7_PROTOCOL_ID);
        buf.put_u8(self.rosctr);
        buf.put_u16(0);
        buf.put_u16(self.pdu_ref);
        buf.put_u16(self.param.len() as u16);
        buf.put_u16(self.data.len() as u16);
        if let Some((class, code)) = self.error {
            buf.put_u8(class);
            buf.put_u8(code);
        }
        buf.put_slice(&self.param);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    pub fn parse(bytes: &Bytes) -> GatewayResult<Self> {
        if bytes.len() < 10 {
            return Err(GatewayError::malformed(
                "S7 header truncated",
                ">= 10 bytes",
                format!("{} bytes", bytes.len()),
            ));
        }
        if bytes[0] != S7_PROTOCOL_ID {
            return Err(GatewayError::malformed(
                "not an S7 message",
                format!("0x{:02X}", S7_PROTOCOL_ID),
                format!("0x{:02X}", bytes[0]),
            ));
        }
        let rosctr = bytes[1];
        let pdu_ref = be_u16(&bytes[4..6]);
        let param_len = usize::from(be_u16(&bytes[6..8]));
        let data_len = usize::from(be_u16(&bytes[8..10]));

        // Ack and ack-data carry two extra error bytes
        let (header_len, error) = if rosctr == 0x02 || rosctr == ROSCTR_ACK_DATA {
            if bytes.len() < 12 {
                return Err(GatewayError::malformed(
                    "S7 ack header truncated",
                    ">= 12 bytes",
                    format!("{} bytes", bytes.len()),
                ));
            }
            (12, Some((bytes[10], bytes[11])))
        } else {
            (10, None)
        };

        let expected = header_len + param_len + data_len;
        if bytes.len() < expected {
            return Err(GatewayError::malformed(
                "S7 sections exceed packet",
                format!("{} bytes", expected),
                format!("{} bytes", bytes.len()),
            ));
        }

        Ok(Self {
            rosctr,
            pdu_ref,
            error,
            param: bytes.slice(header_len..header_len + param_len),
            data: bytes.slice(header_len + param_len..expected),
        })
    }
}

/// Setup-communication parameter
pub fn setup_param(pdu_length: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u8(FN_SETUP_COMMUNICATION);
    buf.put_u8(0);
    buf.put_u16(1); // max AmQ calling
    buf.put_u16(1); // max AmQ called
    buf.put_u16(pdu_length);
    buf.freeze()
}

/// PDU length carried in a setup-communication parameter
pub fn setup_pdu_length(param: &[u8]) -> GatewayResult<u16> {
    if param.len() < 8 || param[0] != FN_SETUP_COMMUNICATION {
        return Err(GatewayError::malformed(
            "bad setup-communication parameter",
            "F0 + 7 bytes",
            format!("{:02X?}", param),
        ));
    }
    Ok(be_u16(&param[6..8]))
}

/// Validate a setup response; negotiation failures are fatal
pub fn parse_setup_response(message: &S7Message) -> GatewayResult<u16> {
    if message.rosctr != ROSCTR_ACK_DATA || message.error_word() != 0 {
        return Err(GatewayError::fatal(format!(
            "S7 setup-communication refused (error 0x{:04X})",
            message.error_word()
        )));
    }
    let pdu_length = setup_pdu_length(&message.param)?;
    if usize::from(pdu_length) <= READ_RESPONSE_OVERHEAD {
        return Err(GatewayError::fatal(format!(
            "negotiated PDU length {} cannot carry data",
            pdu_length
        )));
    }
    Ok(pdu_length)
}

/// One any-pointer item addressing `length` bytes of a DB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DbItem {
    pub area: u8,
    pub db_number: u16,
    pub start: u32,
    pub length: u16,
}

impl DbItem {
    pub fn db(db_number: u16, start: u32, length: u16) -> Self {
        Self {
            area: AREA_DB,
            db_number,
            start,
            length,
        }
    }

    pub const ENCODED_LEN: usize = 12;

    fn put(&self, buf: &mut BytesMut) {
        let bit_address = self.start << 3;
        buf.put_u8(ITEM_SPEC);
        buf.put_u8(ITEM_SPEC_LEN);
        buf.put_u8(SYNTAX_ANY);
        buf.put_u8(TRANSPORT_BYTE);
        buf.put_u16(self.length);
        buf.put_u16(self.db_number);
        buf.put_u8(self.area);
        buf.put_u8((bit_address >> 16) as u8);
        buf.put_u8((bit_address >> 8) as u8);
        buf.put_u8(bit_address as u8);
    }

    /// Parse one item spec; `None` when it is not a byte-addressed any-pointer
    pub fn parse(item: &[u8]) -> Option<Self> {
        if item.len() < Self::ENCODED_LEN
            || item[0] != ITEM_SPEC
            || item[1] != ITEM_SPEC_LEN
            || item[2] != SYNTAX_ANY
        {
            return None;
        }
        let bit_address =
            (u32::from(item[9]) << 16) | (u32::from(item[10]) << 8) | u32::from(item[11]);
        Some(Self {
            area: item[8],
            db_number: be_u16(&item[6..8]),
            start: bit_address >> 3,
            length: be_u16(&item[4..6]),
        })
    }
}

/// Read-var parameter for a single item
pub fn read_var_param(item: &DbItem) -> Bytes {
    let mut buf = BytesMut::with_capacity(2 + DbItem::ENCODED_LEN);
    buf.put_u8(FN_READ_VAR);
    buf.put_u8(1);
    item.put(&mut buf);
    buf.freeze()
}

/// Write-var parameter and data sections for a single item
pub fn write_var_sections(item: &DbItem, payload: &[u8]) -> (Bytes, Bytes) {
    let mut param = BytesMut::with_capacity(2 + DbItem::ENCODED_LEN);
    param.put_u8(FN_WRITE_VAR);
    param.put_u8(1);
    item.put(&mut param);

    let mut data = BytesMut::with_capacity(4 + payload.len());
    data.put_u8(0);
    data.put_u8(DATA_SIZE_BITS);
    data.put_u16((payload.len() * 8) as u16);
    data.put_slice(payload);
    (param.freeze(), data.freeze())
}

/// Items of a read-var or write-var job parameter
pub fn parse_items(param: &[u8]) -> Vec<Option<DbItem>> {
    let count = param.get(1).copied().unwrap_or(0) as usize;
    (0..count)
        .map(|i| {
            let offset = 2 + i * DbItem::ENCODED_LEN;
            param
                .get(offset..offset + DbItem::ENCODED_LEN)
                .and_then(DbItem::parse)
        })
        .collect()
}

/// Data item header: return code, transport size, length
///
/// Returns the return code and the payload slice.
pub fn parse_data_item(data: &Bytes) -> GatewayResult<(u8, Bytes)> {
    if data.is_empty() {
        return Err(GatewayError::malformed(
            "missing data item",
            ">= 1 byte",
            "0 bytes",
        ));
    }
    let return_code = data[0];
    if return_code != RETURN_SUCCESS {
        return Ok((return_code, Bytes::new()));
    }
    if data.len() < 4 {
        return Err(GatewayError::malformed(
            "data item header truncated",
            ">= 4 bytes",
            format!("{} bytes", data.len()),
        ));
    }
    let length = match data[1] {
        DATA_SIZE_OCTETS | 0x07 => usize::from(be_u16(&data[2..4])),
        _ => usize::from(be_u16(&data[2..4])).div_ceil(8),
    };
    if data.len() < 4 + length {
        return Err(GatewayError::malformed(
            "data item shorter than its length field",
            format!("{} bytes", length),
            format!("{} bytes", data.len() - 4),
        ));
    }
    Ok((return_code, data.slice(4..4 + length)))
}

/// Payload of a read-var response
///
/// A header error or an item return code other than 0xFF fails this poll
/// only.
pub fn parse_read_response(message: &S7Message) -> GatewayResult<Bytes> {
    if message.error_word() != 0 {
        return Err(GatewayError::transient(format!(
            "S7 read rejected (error 0x{:04X})",
            message.error_word()
        )));
    }
    if message.function() != Some(FN_READ_VAR) {
        return Err(GatewayError::malformed(
            "unexpected S7 function",
            format!("0x{:02X}", FN_READ_VAR),
            format!("{:02X?}", message.function()),
        ));
    }
    let (return_code, payload) = parse_data_item(&message.data)?;
    if return_code != RETURN_SUCCESS {
        return Err(GatewayError::transient(format!(
            "S7 read item failed: 0x{:02X} ({})",
            return_code,
            return_code_description(return_code)
        )));
    }
    Ok(payload)
}

pub fn parse_write_response(message: &S7Message) -> GatewayResult<()> {
    if message.error_word() != 0 {
        return Err(GatewayError::transient(format!(
            "S7 write rejected (error 0x{:04X})",
            message.error_word()
        )));
    }
    match message.data.first() {
        Some(&RETURN_SUCCESS) => Ok(()),
        Some(&code) => Err(GatewayError::transient(format!(
            "S7 write item failed: 0x{:02X} ({})",
            code,
            return_code_description(code)
        ))),
        None => Err(GatewayError::malformed(
            "missing write return code",
            "1 byte",
            "0 bytes",
        )),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use errors::ErrorCategory;

    #[test]
    fn test_connection_request_layout() {
        let cr = connection_request(0, 1);
        assert_eq!(cr.len(), 22);
        assert_eq!(&cr[..4], &[0x03, 0x00, 0x00, 0x16]);
        assert_eq!(cr[5], COTP_CONNECT_REQUEST);
        assert_eq!(&cr[20..22], &[0x01, 0x01]);
        assert_eq!(remote_tsap(0, 2), 0x0102);
        assert_eq!(remote_tsap(1, 3), 0x0123);
    }

    #[test]
    fn test_confirm_swaps_references() {
        let cr = connection_request(0, 1);
        let cc = connection_confirm(&cr[4..]);
        assert_eq!(cc.len(), cr.len());
        assert_eq!(cc[5], COTP_CONNECT_CONFIRM);
        assert_eq!(&cc[6..8], &[0x00, 0x01]);
        assert_eq!(parse_cotp(&cc.slice(4..)).unwrap(), Cotp::ConnectConfirm);
    }

    #[test]
    fn test_data_frame_carries_s7_message() {
        let message = S7Message::job(7, setup_param(480), Bytes::new());
        let frame = data_frame(&message.encode());
        assert_eq!(&frame[4..7], &[0x02, 0xF0, 0x80]);

        let Cotp::Data(inner) = parse_cotp(&frame.slice(4..)).unwrap() else {
            panic!("expected DT");
        };
        let parsed = S7Message::parse(&inner).unwrap();
        assert_eq!(parsed, message);
        assert_eq!(setup_pdu_length(&parsed.param).unwrap(), 480);
    }

    #[test]
    fn test_item_address_is_bit_offset() {
        let param = read_var_param(&DbItem::db(10, 4, 16));
        assert_eq!(
            &param[..],
            &[0x04, 0x01, 0x12, 0x0A, 0x10, 0x02, 0x00, 0x10, 0x00, 0x0A, 0x84, 0x00, 0x00, 0x20]
        );
        let items = parse_items(&param);
        assert_eq!(items, vec![Some(DbItem::db(10, 4, 16))]);
    }

    #[test]
    fn test_read_response_payload() {
        let data = Bytes::from_static(&[0xFF, 0x04, 0x00, 0x20, 0xDE, 0xAD, 0xBE, 0xEF]);
        let message = S7Message::ack_data(1, Bytes::from_static(&[0x04, 0x01]), data);
        let reparsed = S7Message::parse(&message.encode()).unwrap();
        let payload = parse_read_response(&reparsed).unwrap();
        assert_eq!(&payload[..], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn test_item_error_is_transient() {
        let message = S7Message::ack_data(
            1,
            Bytes::from_static(&[0x04, 0x01]),
            Bytes::from_static(&[RETURN_OBJECT_MISSING, 0x00, 0x00, 0x00]),
        );
        let err = parse_read_response(&message).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Transient);
        assert!(err.to_string().contains("object does not exist"));
    }

    #[test]
    fn test_negative_setup_is_fatal() {
        let err = parse_setup_response(&S7Message::ack_error(1, 0x81, 0x04)).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Fatal);
        assert!(err.to_string().contains("0x8104"));
    }

    #[test]
    fn test_truncated_data_item_is_malformed() {
        let data = Bytes::from_static(&[0xFF, 0x04, 0x00, 0x80, 0x01, 0x02]);
        let err = parse_data_item(&data).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Decode);
    }

    #[tokio::test]
    async fn test_read_tpkt_rejects_bad_version() {
        let bytes: Vec<u8> = vec![0x04, 0x00, 0x00, 0x07, 0x02, 0xF0, 0x80];
        let mut reader = bytes.as_slice();
        let err = read_tpkt(&mut reader).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Decode);
    }

    #[test]
    fn test_split_tpkt_keeps_partial_packet() {
        let packet = data_frame(&[0x32, 0x01]);
        let mut buf = BytesMut::from(&packet[..5]);
        assert!(split_tpkt(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 5);

        buf.extend_from_slice(&packet[5..]);
        buf.extend_from_slice(&packet[..2]);
        let payload = split_tpkt(&mut buf).unwrap().unwrap();
        assert_eq!(&payload[..], &packet[TPKT_HEADER_LEN..]);
        assert_eq!(&buf[..], &packet[..2]);
    }

    #[test]
    fn test_split_tpkt_rejects_short_length() {
        let mut buf = BytesMut::from(&[0x03, 0x00, 0x00, 0x05, 0x02][..]);
        let err = split_tpkt(&mut buf).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Decode);
    }
}
