//! Modbus TCP client session
//!
//! Reads the reading registers with FC03. A reply whose transaction id does
//! not match the outstanding request is a stale answer to an earlier,
//! timed-out request and is discarded.
//!
//! Incoming bytes accumulate in a per-session receive buffer and whole ADUs
//! are split off it, so a reply that straddles a timeout is kept intact and
//! discarded by transaction id on the next exchange.

use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use errors::{GatewayError, GatewayResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::constants::{
    exception_description, DEFAULT_PORT, DEFAULT_UNIT_ID, EXCEPTION_ILLEGAL_FUNCTION,
    FC_READ_HOLDING_REGISTERS, FC_WRITE_MULTIPLE_REGISTERS, MODBUS_MAX_READ_REGISTERS,
    MODBUS_MAX_WRITE_REGISTERS, MODBUS_PROTOCOL_ID,
};
use super::pdu::{decode_frame, MbapHeader, ModbusPdu, PduBuilder};
use crate::codec::REGISTER_COUNT;
use crate::protocols::TransportSession;

const RX_CAPACITY: usize = 512;

#[derive(Debug, Clone)]
pub struct ModbusClientConfig {
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    /// First register of the reading
    pub start_address: u16,
    /// Registers per poll
    pub register_count: u16,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for ModbusClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            unit_id: DEFAULT_UNIT_ID,
            start_address: 0,
            register_count: REGISTER_COUNT as u16,
            connect_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(1),
        }
    }
}

pub struct ModbusTcpSession {
    config: ModbusClientConfig,
    stream: Option<TcpStream>,
    rx: BytesMut,
    next_transaction_id: u16,
}

impl ModbusTcpSession {
    pub fn new(config: ModbusClientConfig) -> Self {
        Self {
            config,
            stream: None,
            rx: BytesMut::with_capacity(RX_CAPACITY),
            next_transaction_id: 1,
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    fn lost(&mut self, reason: impl std::fmt::Display) -> GatewayError {
        self.stream = None;
        self.rx.clear();
        GatewayError::connection(self.addr(), reason)
    }

    /// Send one request and wait for its matching response PDU
    async fn transact(&mut self, pdu: &ModbusPdu) -> GatewayResult<ModbusPdu> {
        let transaction_id = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);

        let unit_id = self.config.unit_id;
        let read_timeout = self.config.read_timeout;
        let adu = MbapHeader::for_pdu(transaction_id, unit_id, pdu.len()).frame(pdu.as_slice());

        let Some(stream) = self.stream.as_mut() else {
            return Err(GatewayError::connection(self.addr(), "not connected"));
        };
        if let Err(e) = stream.write_all(&adu).await {
            return Err(self.lost(e));
        }

        let deadline = Instant::now() + read_timeout;
        loop {
            let frame = match decode_frame(&mut self.rx) {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let Some(stream) = self.stream.as_mut() else {
                        return Err(GatewayError::connection(self.addr(), "not connected"));
                    };
                    // read_buf is cancel-safe; partial bytes stay in `rx`
                    match timeout(remaining, stream.read_buf(&mut self.rx)).await {
                        Ok(Ok(0)) => return Err(self.lost("connection closed by peer")),
                        Ok(Ok(_)) => continue,
                        Ok(Err(e)) => return Err(self.lost(e)),
                        Err(_) => {
                            debug!(
                                "Modbus tid={} timed out with {} bytes buffered",
                                transaction_id,
                                self.rx.len()
                            );
                            return Err(GatewayError::transient(format!(
                                "no response within {:?}",
                                read_timeout
                            )));
                        },
                    }
                },
                // A bad length field loses framing as surely as EOF does
                Err(e) => return Err(self.lost(e)),
            };

            if frame.header.transaction_id != transaction_id
                || frame.header.protocol_id != MODBUS_PROTOCOL_ID
                || frame.header.unit_id != unit_id
            {
                debug!(
                    "Discarding stale Modbus reply tid={} (waiting for {})",
                    frame.header.transaction_id, transaction_id
                );
                continue;
            }
            return Ok(frame.pdu);
        }
    }

    /// Map an exception response to the error the consumer expects
    fn check_exception(response: &ModbusPdu) -> GatewayResult<()> {
        if let Some(code) = response.exception_code() {
            let detail = format!(
                "exception 0x{:02X} ({}) for FC{:02X}",
                code,
                exception_description(code),
                response.function_code().unwrap_or(0) & 0x7F
            );
            if code == EXCEPTION_ILLEGAL_FUNCTION {
                return Err(GatewayError::fatal(detail));
            }
            return Err(GatewayError::transient(detail));
        }
        if response.is_exception() {
            return Err(GatewayError::transient("exception response without code"));
        }
        Ok(())
    }

    /// FC03: read `count` holding registers starting at `start`
    pub async fn read_holding_registers(
        &mut self,
        start: u16,
        count: u16,
    ) -> GatewayResult<Vec<u16>> {
        if count == 0 || usize::from(count) > MODBUS_MAX_READ_REGISTERS {
            return Err(GatewayError::config(format!(
                "register count {} outside 1..={}",
                count, MODBUS_MAX_READ_REGISTERS
            )));
        }
        let request = PduBuilder::new()
            .function_code(FC_READ_HOLDING_REGISTERS)?
            .address(start)?
            .quantity(count)?
            .build();

        let response = self.transact(&request).await?;
        Self::check_exception(&response)?;

        if response.function_code() != Some(FC_READ_HOLDING_REGISTERS) {
            return Err(GatewayError::malformed(
                "unexpected function code",
                format!("0x{:02X}", FC_READ_HOLDING_REGISTERS),
                format!("0x{:02X}", response.function_code().unwrap_or(0)),
            ));
        }

        let byte_count = response.as_slice().get(1).copied().unwrap_or(0) as usize;
        let data = response.as_slice().get(2..).unwrap_or(&[]);
        if byte_count != data.len() || byte_count % 2 != 0 {
            return Err(GatewayError::malformed(
                "byte count does not match payload",
                format!("{} bytes", byte_count),
                format!("{} bytes", data.len()),
            ));
        }

        Ok(data
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }

    /// FC16: write consecutive holding registers starting at `start`
    pub async fn write_registers(&mut self, start: u16, values: &[u16]) -> GatewayResult<()> {
        if values.is_empty() || values.len() > MODBUS_MAX_WRITE_REGISTERS {
            return Err(GatewayError::config(format!(
                "register count {} outside 1..={}",
                values.len(),
                MODBUS_MAX_WRITE_REGISTERS
            )));
        }
        let request = PduBuilder::new()
            .function_code(FC_WRITE_MULTIPLE_REGISTERS)?
            .address(start)?
            .quantity(values.len() as u16)?
            .byte((values.len() * 2) as u8)?
            .registers(values)?
            .build();

        let response = self.transact(&request).await?;
        Self::check_exception(&response)?;

        if response.u16_at(1) != Some(start) || response.u16_at(3) != Some(values.len() as u16) {
            return Err(GatewayError::malformed(
                "write acknowledgement does not echo request",
                format!("addr={} qty={}", start, values.len()),
                format!("{:02X?}", response.as_slice()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl TransportSession for ModbusTcpSession {
    type Frame = Vec<u16>;

    fn endpoint(&self) -> String {
        format!("modbus://{}/unit{}", self.addr(), self.config.unit_id)
    }

    async fn connect(&mut self) -> GatewayResult<()> {
        let addr = self.addr();
        debug!("TCP connecting: {}", addr);

        match timeout(self.config.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("TCP_NODELAY: {}", e);
                }
                info!("Modbus connected: {}", addr);
                self.rx.clear();
                self.stream = Some(stream);
                Ok(())
            },
            Ok(Err(e)) => Err(GatewayError::connection(addr, e)),
            Err(_) => {
                warn!("TCP timeout: {}", addr);
                Err(GatewayError::connection(
                    addr,
                    format!("connect timed out after {:?}", self.config.connect_timeout),
                ))
            },
        }
    }

    async fn fetch(&mut self) -> GatewayResult<Vec<u16>> {
        self.read_holding_registers(self.config.start_address, self.config.register_count)
            .await
    }

    async fn close(&mut self) {
        self.rx.clear();
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!("Modbus session closed: {}", self.addr());
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use errors::ErrorCategory;

    #[test]
    fn test_illegal_function_is_fatal() {
        let response = ModbusPdu::from_slice(&[0x83, 0x01]).unwrap();
        let err = ModbusTcpSession::check_exception(&response).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Fatal);
    }

    #[test]
    fn test_other_exceptions_are_transient() {
        for code in [0x02u8, 0x03, 0x04, 0x06] {
            let response = ModbusPdu::from_slice(&[0x83, code]).unwrap();
            let err = ModbusTcpSession::check_exception(&response).unwrap_err();
            assert_eq!(err.category(), ErrorCategory::Transient);
        }
    }

    #[tokio::test]
    async fn test_fetch_without_connection_is_connection_error() {
        let mut session = ModbusTcpSession::new(ModbusClientConfig::default());
        let err = session.fetch().await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Connection);
        assert!(!session.is_connected());
    }

    #[tokio::test]
    async fn test_invalid_register_count_is_rejected() {
        let mut session = ModbusTcpSession::new(ModbusClientConfig::default());
        let err = session.read_holding_registers(0, 126).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }
}
