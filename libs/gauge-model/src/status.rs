//! Status bitfield carried with every reading
//!
//! Layout is identical on every protocol:
//!
//! | Bits | Meaning |
//! |------|---------|
//! | 0 | data valid |
//! | 1 | RS-485 link OK |
//! | 2 | CRC check OK |
//! | 3 | sensor OK |
//! | 8-15 | error code (0 = none) |

use serde::Serialize;
use std::fmt;

/// Status flag bits
pub const DATA_VALID: u16 = 0x0001;
pub const RS485_OK: u16 = 0x0002;
pub const CRC_OK: u16 = 0x0004;
pub const SENSOR_OK: u16 = 0x0008;
/// All four health flags
pub const HEALTH_FLAGS: u16 = DATA_VALID | RS485_OK | CRC_OK | SENSOR_OK;
pub const ERROR_MASK: u16 = 0xFF00;

/// Gateway error code from the status high byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Timeout,
    CrcFailed,
    InvalidFrame,
    DeviceOffline,
    /// Nonzero code the gateway does not document
    Unknown(u8),
}

impl ErrorCode {
    /// Decode a raw code; 0 means "no error"
    pub fn from_raw(code: u8) -> Option<Self> {
        match code {
            0 => None,
            1 => Some(Self::Timeout),
            2 => Some(Self::CrcFailed),
            3 => Some(Self::InvalidFrame),
            4 => Some(Self::DeviceOffline),
            other => Some(Self::Unknown(other)),
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            Self::Timeout => 1,
            Self::CrcFailed => 2,
            Self::InvalidFrame => 3,
            Self::DeviceOffline => 4,
            Self::Unknown(code) => code,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::CrcFailed => write!(f, "crc failed"),
            Self::InvalidFrame => write!(f, "invalid frame"),
            Self::DeviceOffline => write!(f, "device offline"),
            Self::Unknown(code) => write!(f, "unknown (0x{:02X})", code),
        }
    }
}

/// 16-bit status word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct Status(u16);

impl Status {
    /// All health flags set, no error
    pub const HEALTHY: Status = Status(HEALTH_FLAGS);

    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub fn data_valid(self) -> bool {
        self.0 & DATA_VALID != 0
    }

    pub fn rs485_ok(self) -> bool {
        self.0 & RS485_OK != 0
    }

    pub fn crc_ok(self) -> bool {
        self.0 & CRC_OK != 0
    }

    pub fn sensor_ok(self) -> bool {
        self.0 & SENSOR_OK != 0
    }

    /// Raw error code byte (bits 8-15)
    pub fn error_code_raw(self) -> u8 {
        ((self.0 & ERROR_MASK) >> 8) as u8
    }

    pub fn error_code(self) -> Option<ErrorCode> {
        ErrorCode::from_raw(self.error_code_raw())
    }

    /// All four flags set and no error code
    pub fn is_healthy(self) -> bool {
        self.0 & HEALTH_FLAGS == HEALTH_FLAGS && self.error_code_raw() == 0
    }

    /// Copy of this status with the error code replaced
    ///
    /// An error also clears the data-valid flag.
    pub fn with_error(self, code: Option<ErrorCode>) -> Self {
        let flags = self.0 & !ERROR_MASK;
        match code {
            Some(code) => Self((flags & !DATA_VALID) | (u16::from(code.raw()) << 8)),
            None => Self(flags),
        }
    }
}

impl From<u16> for Status {
    fn from(bits: u16) -> Self {
        Self(bits)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)?;
        if let Some(code) = self.error_code() {
            write!(f, " [{}]", code)?;
        }
        Ok(())
    }
}
