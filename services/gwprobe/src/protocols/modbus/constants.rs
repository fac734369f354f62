//! Modbus protocol constants based on official specification

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Modbus MBAP header length for TCP, not counting the Unit ID
/// Format: Transaction ID(2) + Protocol ID(2) + Length(2)
pub const MBAP_HEADER_LEN: usize = 6;

/// Maximum PDU (Protocol Data Unit) size per Modbus specification
/// RS485 ADU (256 bytes) - Slave Address (1 byte) - CRC (2 bytes) = 253 bytes
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (Unit ID + PDU)
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Modbus TCP always uses protocol id 0
pub const MODBUS_PROTOCOL_ID: u16 = 0;

// ============================================================================
// Register Operation Limits
// ============================================================================

/// Maximum number of registers for FC03 (Read Holding Registers)
/// 1 (FC) + 1 (byte count) + N × 2 ≤ 253 → N ≤ 125
pub const MODBUS_MAX_READ_REGISTERS: usize = 125;

/// Maximum number of registers for FC16 (Write Multiple Registers)
/// 1 + 2 + 2 + 1 + N × 2 ≤ 253 → N ≤ 123
pub const MODBUS_MAX_WRITE_REGISTERS: usize = 123;

// ============================================================================
// Function and Exception Codes
// ============================================================================

pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Exception flag OR-ed into the function code of an error response
pub const EXCEPTION_FLAG: u8 = 0x80;

pub const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;
pub const EXCEPTION_ILLEGAL_DATA_ADDRESS: u8 = 0x02;
pub const EXCEPTION_ILLEGAL_DATA_VALUE: u8 = 0x03;

// ============================================================================
// Gateway Defaults
// ============================================================================

/// Standard Modbus TCP port
pub const DEFAULT_PORT: u16 = 502;
/// Unit id the gateway answers on
pub const DEFAULT_UNIT_ID: u8 = 1;
/// Holding registers exposed by the gateway
pub const DEFAULT_REGISTER_COUNT: usize = 100;

/// Calculate total Modbus TCP frame size (MBAP header + Unit ID + PDU)
#[inline]
pub const fn mbap_frame_size(pdu_len: usize) -> usize {
    MBAP_HEADER_LEN + 1 + pdu_len
}

/// Human-readable exception code description
pub fn exception_description(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Server Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Server Device Busy",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Failed To Respond",
        _ => "Unknown Exception",
    }
}
