//! Modbus TCP mock server
//!
//! Serves a holding-register bank from a snapshot so a poll never sees a
//! half-written reading. Readings are published into registers 0-7.

use std::net::SocketAddr;
use std::sync::Arc;

use errors::{GatewayError, GatewayResult};
use gauge_model::CanonicalReading;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::constants::{
    DEFAULT_REGISTER_COUNT, EXCEPTION_FLAG, EXCEPTION_ILLEGAL_DATA_ADDRESS,
    EXCEPTION_ILLEGAL_DATA_VALUE, EXCEPTION_ILLEGAL_FUNCTION, FC_READ_HOLDING_REGISTERS,
    FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_REGISTER, MODBUS_MAX_READ_REGISTERS,
    MODBUS_MAX_WRITE_REGISTERS, MODBUS_PROTOCOL_ID,
};
use super::pdu::{read_frame, MbapHeader};
use crate::codec::{Codec, RegisterBankCodec};
use crate::protocols::ReadingPublisher;
use crate::snapshot::SnapshotCell;

/// Holding-register image
pub type RegisterBank = Vec<u16>;

/// In-memory Modbus TCP server
#[derive(Clone)]
pub struct ModbusServer {
    bank: Arc<SnapshotCell<RegisterBank>>,
    /// Answer only this unit id; `None` answers every unit
    unit_id: Option<u8>,
}

impl Default for ModbusServer {
    fn default() -> Self {
        Self::new(DEFAULT_REGISTER_COUNT)
    }
}

impl ModbusServer {
    pub fn new(register_count: usize) -> Self {
        Self {
            bank: Arc::new(SnapshotCell::new(vec![0; register_count])),
            unit_id: None,
        }
    }

    pub fn with_unit_id(mut self, unit_id: u8) -> Self {
        self.unit_id = Some(unit_id);
        self
    }

    /// Current register image
    pub fn registers(&self) -> Arc<RegisterBank> {
        self.bank.load()
    }

    /// Overwrite registers starting at `start`; out-of-range values are dropped
    pub fn write_registers(&self, start: usize, values: &[u16]) {
        self.bank.rcu(|regs| {
            let mut next = regs.clone();
            for (slot, value) in next.iter_mut().skip(start).zip(values) {
                *slot = *value;
            }
            next
        });
    }

    /// Bind and serve until `token` is cancelled
    ///
    /// Returns the bound address (useful with port 0) and the accept-loop task.
    pub async fn start(
        &self,
        addr: &str,
        token: CancellationToken,
    ) -> GatewayResult<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::connection(addr, e))?;
        let local_addr = listener.local_addr()?;
        info!("Modbus server listening on {}", local_addr);

        let server = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        debug!("New connection from {}", peer);
                        let server = server.clone();
                        let token = token.child_token();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = token.cancelled() => {},
                                result = server.handle_connection(stream) => {
                                    if let Err(e) = result {
                                        debug!("Connection {} ended: {}", peer, e);
                                    }
                                },
                            }
                        });
                    },
                    Err(e) => {
                        error!("Accept error: {}", e);
                        break;
                    },
                }
            }
            info!("Modbus server on {} stopped", local_addr);
        });

        Ok((local_addr, handle))
    }

    /// Serve one client until it disconnects
    async fn handle_connection(&self, mut stream: TcpStream) -> GatewayResult<()> {
        loop {
            let frame = read_frame(&mut stream).await?;
            if frame.header.protocol_id != MODBUS_PROTOCOL_ID {
                continue;
            }
            if let Some(unit_id) = self.unit_id {
                if frame.header.unit_id != unit_id {
                    debug!("Ignoring request for unit {}", frame.header.unit_id);
                    continue;
                }
            }

            let response = self.process_request(frame.pdu.as_slice());
            let adu = MbapHeader::for_pdu(
                frame.header.transaction_id,
                frame.header.unit_id,
                response.len(),
            )
            .frame(&response);
            stream.write_all(&adu).await?;
        }
    }

    /// Answer one request PDU with a response PDU
    pub fn process_request(&self, pdu: &[u8]) -> Vec<u8> {
        let Some(&function_code) = pdu.first() else {
            return exception(0, EXCEPTION_ILLEGAL_FUNCTION);
        };
        let word = |offset: usize| {
            pdu.get(offset..offset + 2)
                .map(|b| u16::from_be_bytes([b[0], b[1]]))
        };

        match function_code {
            FC_READ_HOLDING_REGISTERS => {
                let (Some(start), Some(count)) = (word(1), word(3)) else {
                    return exception(function_code, EXCEPTION_ILLEGAL_DATA_VALUE);
                };
                let (start, count) = (usize::from(start), usize::from(count));
                if count == 0 || count > MODBUS_MAX_READ_REGISTERS {
                    return exception(function_code, EXCEPTION_ILLEGAL_DATA_VALUE);
                }
                let regs = self.bank.load();
                let Some(values) = regs.get(start..start + count) else {
                    return exception(function_code, EXCEPTION_ILLEGAL_DATA_ADDRESS);
                };
                let mut response = Vec::with_capacity(2 + count * 2);
                response.push(function_code);
                response.push((count * 2) as u8);
                for value in values {
                    response.extend_from_slice(&value.to_be_bytes());
                }
                response
            },
            FC_WRITE_SINGLE_REGISTER => {
                let (Some(addr), Some(value)) = (word(1), word(3)) else {
                    return exception(function_code, EXCEPTION_ILLEGAL_DATA_VALUE);
                };
                if usize::from(addr) >= self.bank.load().len() {
                    return exception(function_code, EXCEPTION_ILLEGAL_DATA_ADDRESS);
                }
                self.write_registers(usize::from(addr), &[value]);
                // Echo back the request as response
                pdu[..5].to_vec()
            },
            FC_WRITE_MULTIPLE_REGISTERS => {
                let (Some(start), Some(count)) = (word(1), word(3)) else {
                    return exception(function_code, EXCEPTION_ILLEGAL_DATA_VALUE);
                };
                let (start, count) = (usize::from(start), usize::from(count));
                let byte_count = pdu.get(5).copied().map(usize::from);
                let data = pdu.get(6..).unwrap_or(&[]);
                if count == 0
                    || count > MODBUS_MAX_WRITE_REGISTERS
                    || byte_count != Some(count * 2)
                    || data.len() != count * 2
                {
                    return exception(function_code, EXCEPTION_ILLEGAL_DATA_VALUE);
                }
                if start + count > self.bank.load().len() {
                    return exception(function_code, EXCEPTION_ILLEGAL_DATA_ADDRESS);
                }
                let values: Vec<u16> = data
                    .chunks_exact(2)
                    .map(|b| u16::from_be_bytes([b[0], b[1]]))
                    .collect();
                self.write_registers(start, &values);
                pdu[..5].to_vec()
            },
            _ => exception(function_code, EXCEPTION_ILLEGAL_FUNCTION),
        }
    }
}

/// Build exception response PDU
fn exception(function_code: u8, code: u8) -> Vec<u8> {
    vec![function_code | EXCEPTION_FLAG, code]
}

impl ReadingPublisher for ModbusServer {
    fn publish(&self, reading: &CanonicalReading) {
        self.write_registers(0, &RegisterBankCodec.encode(reading));
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use gauge_model::Status;

    #[test]
    fn test_read_holding_registers() {
        let server = ModbusServer::new(100);
        server.write_registers(0, &[0x4248, 0x0000, 0, 0, 0, 0, 7, 5]);

        let response = server.process_request(&[0x03, 0x00, 0x00, 0x00, 0x08]);
        assert_eq!(response[0], 0x03);
        assert_eq!(response[1], 16);
        assert_eq!(&response[2..4], &[0x42, 0x48]);
        assert_eq!(&response[16..18], &[0x00, 0x05]);
    }

    #[test]
    fn test_out_of_range_read_is_illegal_address() {
        let server = ModbusServer::new(100);
        let response = server.process_request(&[0x03, 0x00, 0x60, 0x00, 0x08]);
        assert_eq!(response, vec![0x83, 0x02]);
    }

    #[test]
    fn test_unknown_function_is_illegal_function() {
        let server = ModbusServer::new(100);
        assert_eq!(
            server.process_request(&[0x04, 0x00, 0x00, 0x00, 0x01]),
            vec![0x84, 0x01]
        );
        assert_eq!(server.process_request(&[0x2B]), vec![0xAB, 0x01]);
    }

    #[test]
    fn test_write_single_register_echoes() {
        let server = ModbusServer::new(100);
        let request = [0x06, 0x00, 0x07, 0x12, 0x34];
        assert_eq!(server.process_request(&request), request.to_vec());
        assert_eq!(server.registers()[7], 0x1234);
    }

    #[test]
    fn test_write_multiple_registers() {
        let server = ModbusServer::new(100);
        let request = [0x10, 0x00, 0x06, 0x00, 0x02, 0x04, 0x00, 0x0F, 0x00, 0x09];
        assert_eq!(
            server.process_request(&request),
            vec![0x10, 0x00, 0x06, 0x00, 0x02]
        );
        assert_eq!(&server.registers()[6..8], &[0x000F, 0x0009]);
    }

    #[test]
    fn test_write_multiple_rejects_bad_byte_count() {
        let server = ModbusServer::new(100);
        let request = [0x10, 0x00, 0x06, 0x00, 0x02, 0x03, 0x00, 0x0F, 0x00];
        assert_eq!(server.process_request(&request), vec![0x90, 0x03]);
    }

    #[test]
    fn test_publish_places_reading_in_first_eight_registers() {
        let server = ModbusServer::new(100);
        let reading = CanonicalReading::new(50.0, 0x0000_0192_3AB0_1234, Status::from_bits(7), 5)
            .unwrap();
        server.publish(&reading);
        assert_eq!(
            &server.registers()[..8],
            &[0x4248, 0x0000, 0x0000, 0x0192, 0x3AB0, 0x1234, 0x0007, 0x0005]
        );
        assert!(server.registers()[8..].iter().all(|r| *r == 0));
    }
}
