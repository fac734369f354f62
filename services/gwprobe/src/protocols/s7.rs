//! S7 byte-block transport (ISO-on-TCP)
//!
//! Hand-rolled TPKT/COTP framing with the S7 job/ack-data messages needed to
//! read and write one data block: setup-communication, read-var and
//! write-var.

pub mod client;
pub mod frame;
pub mod server;

pub use client::{S7ClientConfig, S7Session};
pub use server::{DataBlock, S7Server};
