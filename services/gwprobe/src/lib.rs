//! Thickness gateway probe
//!
//! Consumes the thickness reading a gateway republishes over three industrial
//! protocols and checks that every protocol carries the same record:
//!
//! - `codec`: register-bank, variable-node and byte-block frame layouts
//! - `protocols`: Modbus TCP and S7 clients with mock servers, an in-process
//!   variable space, and (feature `opcua`) a network OPC UA client
//! - `runtime`: the polling consumer with change detection and reconnects
//! - `simulator`: synthetic producer feeding the mock endpoints

pub mod bootstrap;
pub mod codec;
pub mod commands;
pub mod config;
pub mod protocols;
pub mod runtime;
pub mod simulator;
pub mod snapshot;

pub use codec::{ByteBlockCodec, Codec, RegisterBankCodec, VariableNodeCodec};
pub use config::AppConfig;
pub use protocols::TransportSession;
pub use runtime::consumer::{ConsumerOptions, ConsumerState, ConsumerStats, PollingConsumer};
