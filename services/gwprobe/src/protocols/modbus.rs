//! Modbus TCP register-bank transport
//!
//! Hand-rolled MBAP framing: the client issues FC03 reads of the reading
//! registers; the mock server answers FC03/FC06/FC16 from a snapshot bank.

pub mod client;
pub mod constants;
pub mod pdu;
pub mod server;

pub use client::{ModbusClientConfig, ModbusTcpSession};
pub use server::ModbusServer;
