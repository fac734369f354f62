//! S7 mock server
//!
//! Accepts COTP connections, negotiates a PDU length and serves read-var and
//! write-var jobs against registered data blocks. Each block is a snapshot,
//! so a read never observes a torn reading.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use errors::{GatewayError, GatewayResult};
use gauge_model::CanonicalReading;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::frame::{
    connection_confirm, data_frame, parse_cotp, parse_items, read_tpkt, setup_param,
    setup_pdu_length, Cotp, DbItem, S7Message, AREA_DB, DATA_SIZE_BITS, DEFAULT_PDU_LENGTH,
    FN_READ_VAR, FN_SETUP_COMMUNICATION, FN_WRITE_VAR, RETURN_ADDRESS_OUT_OF_RANGE,
    RETURN_OBJECT_MISSING, RETURN_SUCCESS, ROSCTR_JOB,
};
use crate::codec::{ByteBlockCodec, Codec};
use crate::protocols::ReadingPublisher;
use crate::snapshot::SnapshotCell;

/// Error class/code for an unsupported job function
const ERROR_FUNCTION_UNSUPPORTED: (u8, u8) = (0x81, 0x04);

/// Handle to one registered data block
#[derive(Clone)]
pub struct DataBlock {
    number: u16,
    image: Arc<SnapshotCell<Bytes>>,
}

impl DataBlock {
    pub fn number(&self) -> u16 {
        self.number
    }

    pub fn load(&self) -> Bytes {
        (*self.image.load()).clone()
    }

    /// Overwrite bytes from `offset`; bytes past the block end are dropped
    pub fn write(&self, offset: usize, data: &[u8]) {
        self.image.rcu(|current| {
            let mut next = BytesMut::from(&current[..]);
            let end = (offset + data.len()).min(next.len());
            if offset < end {
                next[offset..end].copy_from_slice(&data[..end - offset]);
            }
            next.freeze()
        });
    }
}

impl ReadingPublisher for DataBlock {
    fn publish(&self, reading: &CanonicalReading) {
        self.write(0, &ByteBlockCodec.encode(reading));
    }
}

/// In-memory S7 server
#[derive(Clone)]
pub struct S7Server {
    blocks: Arc<SnapshotCell<HashMap<u16, DataBlock>>>,
    max_pdu_length: u16,
}

impl Default for S7Server {
    fn default() -> Self {
        Self::new()
    }
}

impl S7Server {
    pub fn new() -> Self {
        Self {
            blocks: Arc::new(SnapshotCell::new(HashMap::new())),
            max_pdu_length: DEFAULT_PDU_LENGTH,
        }
    }

    /// Cap on the PDU length offered during negotiation
    pub fn with_max_pdu_length(mut self, max_pdu_length: u16) -> Self {
        self.max_pdu_length = max_pdu_length;
        self
    }

    /// Register a zero-filled DB, replacing any block with the same number
    pub fn register_db(&self, number: u16, size: usize) -> DataBlock {
        let block = DataBlock {
            number,
            image: Arc::new(SnapshotCell::new(Bytes::from(vec![0u8; size]))),
        };
        let inserted = block.clone();
        self.blocks.rcu(move |blocks| {
            let mut next = blocks.clone();
            next.insert(number, inserted.clone());
            next
        });
        block
    }

    pub fn db(&self, number: u16) -> Option<DataBlock> {
        self.blocks.load().get(&number).cloned()
    }

    /// Bind and serve until `token` is cancelled
    pub async fn start(
        &self,
        addr: &str,
        token: CancellationToken,
    ) -> GatewayResult<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| GatewayError::connection(addr, e))?;
        let local_addr = listener.local_addr()?;
        info!("S7 server listening on {}", local_addr);

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
            info!("S7 server on {} stopped", local_addr);
        });

        Ok((local_addr, handle))
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> GatewayResult<()> {
        let request = read_tpkt(&mut stream).await?;
        if parse_cotp(&request)? != Cotp::ConnectRequest {
            return Err(GatewayError::malformed(
                "expected COTP connection request",
                "CR",
                format!("{:02X?}", request.get(1)),
            ));
        }
        stream.write_all(&connection_confirm(&request)).await?;

        loop {
            let payload = read_tpkt(&mut stream).await?;
            let inner = match parse_cotp(&payload)? {
                Cotp::Data(inner) => inner,
                Cotp::Disconnect => return Ok(()),
                other => {
                    warn!("Unexpected COTP {:?}", other);
                    continue;
                },
            };
            let job = S7Message::parse(&inner)?;
            if job.rosctr != ROSCTR_JOB {
                debug!("Ignoring S7 ROSCTR 0x{:02X}", job.rosctr);
                continue;
            }
            let reply = self.process_job(&job);
            stream.write_all(&data_frame(&reply.encode())).await?;
        }
    }

    /// Answer one S7 job
    pub fn process_job(&self, job: &S7Message) -> S7Message {
        match job.function() {
            Some(FN_SETUP_COMMUNICATION) => match setup_pdu_length(&job.param) {
                Ok(requested) => {
                    let negotiated = requested.min(self.max_pdu_length);
                    S7Message::ack_data(job.pdu_ref, setup_param(negotiated), Bytes::new())
                },
                Err(_) => {
                    let (class, code) = ERROR_FUNCTION_UNSUPPORTED;
                    S7Message::ack_error(job.pdu_ref, class, code)
                },
            },
            Some(FN_READ_VAR) => self.read_var(job),
            Some(FN_WRITE_VAR) => self.write_var(job),
            _ => {
                let (class, code) = ERROR_FUNCTION_UNSUPPORTED;
                S7Message::ack_error(job.pdu_ref, class, code)
            },
        }
    }

    /// Locate the bytes an item addresses
    fn resolve(&self, item: Option<DbItem>) -> Result<(DataBlock, usize, usize), u8> {
        let item = item.ok_or(RETURN_OBJECT_MISSING)?;
        if item.area != AREA_DB {
            return Err(RETURN_OBJECT_MISSING);
        }
        let block = self.db(item.db_number).ok_or(RETURN_OBJECT_MISSING)?;
        let start = item.start as usize;
        let end = start + usize::from(item.length);
        if end > block.load().len() {
            return Err(RETURN_ADDRESS_OUT_OF_RANGE);
        }
        Ok((block, start, end))
    }

    fn read_var(&self, job: &S7Message) -> S7Message {
        let items = parse_items(&job.param);
        let mut data = BytesMut::new();
        let last = items.len().saturating_sub(1);

        for (i, item) in items.into_iter().enumerate() {
            match self.resolve(item) {
                Ok((block, start, end)) => {
                    let image = block.load();
                    let bytes = &image[start..end];
                    data.put_u8(RETURN_SUCCESS);
                    data.put_u8(DATA_SIZE_BITS);
                    data.put_u16((bytes.len() * 8) as u16);
                    data.put_slice(bytes);
                    // Items after the first start on an even offset
                    if i < last && bytes.len() % 2 == 1 {
                        data.put_u8(0);
                    }
                },
                Err(code) => {
                    data.put_u8(code);
                    data.put_u8(0);
                    data.put_u16(0);
                },
            }
        }

        let param = Bytes::copy_from_slice(&job.param[..2.min(job.param.len())]);
        S7Message::ack_data(job.pdu_ref, param, data.freeze())
    }

    fn write_var(&self, job: &S7Message) -> S7Message {
        let items = parse_items(&job.param);
        let mut results = BytesMut::with_capacity(items.len());
        let mut offset = 0usize;

        for item in items {
            let Some(header) = job.data.get(offset..offset + 4) else {
                results.put_u8(RETURN_OBJECT_MISSING);
                continue;
            };
            let declared = usize::from(u16::from_be_bytes([header[2], header[3]]));
            let length = if header[1] == DATA_SIZE_BITS {
                declared.div_ceil(8)
            } else {
                declared
            };
            let payload = job.data.get(offset + 4..offset + 4 + length);
            offset += 4 + length + (length % 2);

            let code = match (self.resolve(item), payload) {
                (Ok((block, start, end)), Some(payload)) if payload.len() == end - start => {
                    block.write(start, payload);
                    RETURN_SUCCESS
                },
                (Ok(_), _) => RETURN_ADDRESS_OUT_OF_RANGE,
                (Err(code), _) => code,
            };
            results.put_u8(code);
        }

        let param = Bytes::copy_from_slice(&job.param[..2.min(job.param.len())]);
        S7Message::ack_data(job.pdu_ref, param, results.freeze())
    }
}
