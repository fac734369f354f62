//! S7 client session
//!
//! Connects with COTP, negotiates a PDU length, then reads one DB range per
//! poll. Replies are matched on the PDU reference; anything else on the wire
//! is a late answer to a timed-out request. TPKT packets are split off a
//! per-session receive buffer, which survives a read timeout.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use errors::{GatewayError, GatewayResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use super::frame::{
    connection_request, data_frame, parse_cotp, parse_read_response, parse_setup_response,
    parse_write_response, read_var_param, setup_param, split_tpkt, write_var_sections, Cotp,
    DbItem, S7Message, DEFAULT_DB_NUMBER, DEFAULT_PDU_LENGTH, DEFAULT_PORT,
    READ_RESPONSE_OVERHEAD,
};
use crate::codec::BYTE_BLOCK_LEN;
use crate::protocols::TransportSession;

#[derive(Debug, Clone)]
pub struct S7ClientConfig {
    pub host: String,
    pub port: u16,
    pub rack: u8,
    pub slot: u8,
    pub db_number: u16,
    /// Byte offset of the reading inside the DB
    pub start: u32,
    /// Bytes per poll
    pub size: u16,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for S7ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            rack: 0,
            slot: 1,
            db_number: DEFAULT_DB_NUMBER,
            start: 0,
            size: BYTE_BLOCK_LEN as u16,
            connect_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_secs(1),
        }
    }
}

pub struct S7Session {
    config: S7ClientConfig,
    stream: Option<TcpStream>,
    rx: BytesMut,
    next_pdu_ref: u16,
    pdu_length: u16,
}

impl S7Session {
    pub fn new(config: S7ClientConfig) -> Self {
        Self {
            config,
            stream: None,
            rx: BytesMut::with_capacity(usize::from(DEFAULT_PDU_LENGTH)),
            next_pdu_ref: 1,
            pdu_length: 0,
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    /// PDU length agreed with the peer, zero before setup
    pub fn pdu_length(&self) -> u16 {
        self.pdu_length
    }

    fn lost(&mut self, reason: impl std::fmt::Display) -> GatewayError {
        self.stream = None;
        self.rx.clear();
        GatewayError::connection(self.addr(), reason)
    }

    fn take_pdu_ref(&mut self) -> u16 {
        let pdu_ref = self.next_pdu_ref;
        self.next_pdu_ref = self.next_pdu_ref.wrapping_add(1).max(1);
        pdu_ref
    }

    /// Next whole TPKT payload, or `None` once `deadline` passes
    async fn recv_tpkt(&mut self, deadline: Instant) -> GatewayResult<Option<Bytes>> {
        loop {
            match split_tpkt(&mut self.rx) {
                Ok(Some(payload)) => return Ok(Some(payload)),
                Ok(None) => {},
                Err(e) => return Err(self.lost(e)),
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(stream) = self.stream.as_mut() else {
                return Err(GatewayError::connection(self.addr(), "not connected"));
            };
            match timeout(remaining, stream.read_buf(&mut self.rx)).await {
                Ok(Ok(0)) => return Err(self.lost("connection closed by peer")),
                Ok(Ok(_)) => {},
                Ok(Err(e)) => return Err(self.lost(e)),
                Err(_) => return Ok(None),
            }
        }
    }

    /// Send one job and wait for the ack-data with the same PDU reference
    async fn exchange(&mut self, job: S7Message) -> GatewayResult<S7Message> {
        let read_timeout = self.config.read_timeout;
        let frame = data_frame(&job.encode());

        let Some(stream) = self.stream.as_mut() else {
            return Err(GatewayError::connection(self.addr(), "not connected"));
        };
        if let Err(e) = stream.write_all(&frame).await {
            return Err(self.lost(e));
        }

        let deadline = Instant::now() + read_timeout;
        loop {
            let Some(payload) = self.recv_tpkt(deadline).await? else {
                debug!(
                    "S7 pdu_ref={} timed out with {} bytes buffered",
                    job.pdu_ref,
                    self.rx.len()
                );
                return Err(GatewayError::transient(format!(
                    "no response within {:?}",
                    read_timeout
                )));
            };

            let inner = match parse_cotp(&payload) {
                Ok(Cotp::Data(inner)) => inner,
                Ok(Cotp::Disconnect) => return Err(self.lost("peer sent COTP disconnect")),
                Ok(other) => {
                    debug!("Ignoring COTP {:?} while waiting for data", other);
                    continue;
                },
                Err(e) => return Err(self.lost(e)),
            };
            let reply = S7Message::parse(&inner)?;
            if reply.pdu_ref != job.pdu_ref {
                debug!(
                    "Discarding stale S7 reply pdu_ref={} (waiting for {})",
                    reply.pdu_ref, job.pdu_ref
                );
                continue;
            }
            return Ok(reply);
        }
    }

    async fn handshake(&mut self) -> GatewayResult<()> {
        let request = connection_request(self.config.rack, self.config.slot);
        let addr = self.addr();
        let Some(stream) = self.stream.as_mut() else {
            return Err(GatewayError::connection(addr, "not connected"));
        };
        stream.write_all(&request).await?;

        let deadline = Instant::now() + self.config.connect_timeout;
        let Some(payload) = self.recv_tpkt(deadline).await? else {
            return Err(GatewayError::connection(addr, "no COTP connection confirm"));
        };
        match parse_cotp(&payload)? {
            Cotp::ConnectConfirm => {},
            other => {
                return Err(GatewayError::connection(
                    addr,
                    format!("COTP connection refused: {:?}", other),
                ));
            },
        }

        let pdu_ref = self.take_pdu_ref();
        let reply = self
            .exchange(S7Message::job(pdu_ref, setup_param(DEFAULT_PDU_LENGTH), Bytes::new()))
            .await?;
        self.pdu_length = parse_setup_response(&reply)?;
        debug!("S7 negotiated PDU length {}", self.pdu_length);

        let fits = usize::from(self.config.size) + READ_RESPONSE_OVERHEAD;
        if fits > usize::from(self.pdu_length) {
            return Err(GatewayError::fatal(format!(
                "{} byte read does not fit negotiated PDU length {}",
                self.config.size, self.pdu_length
            )));
        }
        Ok(())
    }

    /// Read-var of `length` bytes from a data block
    pub async fn read_block(
        &mut self,
        db_number: u16,
        start: u32,
        length: u16,
    ) -> GatewayResult<Bytes> {
        let item = DbItem::db(db_number, start, length);
        let pdu_ref = self.take_pdu_ref();
        let reply = self
            .exchange(S7Message::job(pdu_ref, read_var_param(&item), Bytes::new()))
            .await?;
        parse_read_response(&reply)
    }

    /// Write-var of `data` into a data block
    pub async fn write_block(
        &mut self,
        db_number: u16,
        start: u32,
        data: &[u8],
    ) -> GatewayResult<()> {
        let item = DbItem::db(db_number, start, data.len() as u16);
        let (param, payload) = write_var_sections(&item, data);
        let pdu_ref = self.take_pdu_ref();
        let reply = self.exchange(S7Message::job(pdu_ref, param, payload)).await?;
        parse_write_response(&reply)
    }
}

#[async_trait]
impl TransportSession for S7Session {
    type Frame = Bytes;

    fn endpoint(&self) -> String {
        format!(
            "s7://{}/rack{}/slot{}/DB{}",
            self.addr(),
            self.config.rack,
            self.config.slot,
            self.config.db_number
        )
    }

    async fn connect(&mut self) -> GatewayResult<()> {
        let addr = self.addr();
        debug!("TCP connecting: {}", addr);

        let stream = match timeout(self.config.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(GatewayError::connection(addr, e)),
            Err(_) => {
                warn!("TCP timeout: {}", addr);
                return Err(GatewayError::connection(
                    addr,
                    format!("connect timed out after {:?}", self.config.connect_timeout),
                ));
            },
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("TCP_NODELAY: {}", e);
        }
        self.rx.clear();
        self.stream = Some(stream);

        if let Err(e) = self.handshake().await {
            self.stream = None;
            self.rx.clear();
            // Socket-level failures during the handshake mean the peer went away
            return Err(match e {
                GatewayError::TransientRead(reason) => GatewayError::connection(addr, reason),
                other => other,
            });
        }
        info!("S7 connected: {} (PDU {})", addr, self.pdu_length);
        Ok(())
    }

    async fn fetch(&mut self) -> GatewayResult<Bytes> {
        self.read_block(self.config.db_number, self.config.start, self.config.size)
            .await
    }

    async fn close(&mut self) {
        self.rx.clear();
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!("S7 session closed: {}", self.addr());
        }
        self.pdu_length = 0;
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}
