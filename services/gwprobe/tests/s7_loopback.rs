//! S7 client against the mock server over ISO-on-TCP
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::net::SocketAddr;
use std::time::Duration;

use errors::ErrorCategory;
use gauge_model::{CanonicalReading, Status};
use gwprobe::codec::{ByteBlockCodec, Codec, RegisterBankCodec, VariableNodeCodec};
use gwprobe::protocols::s7::frame::{
    connection_confirm, data_frame, parse_cotp, read_tpkt, Cotp, S7Message, FN_READ_VAR,
};
use gwprobe::protocols::s7::{S7ClientConfig, S7Server, S7Session};
use gwprobe::protocols::ReadingPublisher;
use gwprobe::runtime::{ChannelSink, ConsumerOptions, PollingConsumer};
use gwprobe::TransportSession;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn client_for(addr: SocketAddr, db_number: u16) -> S7ClientConfig {
    S7ClientConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        db_number,
        connect_timeout: Duration::from_secs(1),
        read_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

fn sample() -> CanonicalReading {
    CanonicalReading::new(50.0, 0x0000_0192_3AB0_1234, Status::from_bits(0x000F), 5).unwrap()
}

#[tokio::test]
async fn test_published_block_decodes_identically() {
    let token = CancellationToken::new();
    let server = S7Server::new();
    let block = server.register_db(10, 16);
    let (addr, _) = server.start("127.0.0.1:0", token.child_token()).await.unwrap();
    block.publish(&sample());

    let mut session = S7Session::new(client_for(addr, 10));
    session.connect().await.unwrap();
    assert!(session.pdu_length() > 34);

    let bytes = session.fetch().await.unwrap();
    assert_eq!(bytes.len(), 16);
    assert_eq!(&bytes[..4], &[0x42, 0x48, 0x00, 0x00]);
    let reading = ByteBlockCodec.decode(&bytes).unwrap();
    assert_eq!(reading, sample());

    // Same record through the other two layouts
    let words = RegisterBankCodec.encode(&sample());
    assert_eq!(RegisterBankCodec.decode(&words).unwrap(), reading);
    let nodes = VariableNodeCodec.encode(&sample());
    assert_eq!(VariableNodeCodec.decode(&nodes).unwrap(), reading);

    session.close().await;
    token.cancel();
}

#[tokio::test]
async fn test_write_block_then_read_back() {
    let token = CancellationToken::new();
    let server = S7Server::new();
    let block = server.register_db(20, 32);
    let (addr, _) = server.start("127.0.0.1:0", token.child_token()).await.unwrap();

    let mut session = S7Session::new(client_for(addr, 20));
    session.connect().await.unwrap();
    session.write_block(20, 8, &[1, 2, 3, 4]).await.unwrap();
    assert_eq!(&block.load()[8..12], &[1, 2, 3, 4]);
    assert_eq!(
        &session.read_block(20, 6, 6).await.unwrap()[..],
        &[0, 0, 1, 2, 3, 4]
    );
    token.cancel();
}

#[tokio::test]
async fn test_missing_db_is_transient_and_keeps_session() {
    let token = CancellationToken::new();
    let server = S7Server::new();
    server.register_db(10, 16);
    let (addr, _) = server.start("127.0.0.1:0", token.child_token()).await.unwrap();

    let mut session = S7Session::new(client_for(addr, 11));
    session.connect().await.unwrap();
    let err = session.fetch().await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Transient);
    assert!(session.is_connected());

    let out_of_range = session.read_block(10, 8, 16).await.unwrap_err();
    assert_eq!(out_of_range.category(), ErrorCategory::Transient);
    token.cancel();
}

#[tokio::test]
async fn test_pdu_too_small_for_reading_is_fatal() {
    let token = CancellationToken::new();
    let server = S7Server::new().with_max_pdu_length(32);
    server.register_db(10, 16);
    let (addr, _) = server.start("127.0.0.1:0", token.child_token()).await.unwrap();

    let mut session = S7Session::new(client_for(addr, 10));
    let err = session.connect().await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Fatal);
    assert!(!session.is_connected());
    token.cancel();
}

#[tokio::test]
async fn test_consumer_emits_each_published_sequence_once() {
    let token = CancellationToken::new();
    let server = S7Server::new();
    let block = server.register_db(10, 16);
    let (addr, _) = server.start("127.0.0.1:0", token.child_token()).await.unwrap();

    let (sink, mut rx) = ChannelSink::channel(16);
    let mut consumer = PollingConsumer::new(
        S7Session::new(client_for(addr, 10)),
        ByteBlockCodec,
        sink,
        ConsumerOptions::new(Duration::from_millis(10)),
    );
    let run_token = token.child_token();
    let task = tokio::spawn(async move { consumer.run(run_token).await });

    for sequence in [1u32, 2, 3] {
        let reading = CanonicalReading::new(30.0, 1_000, Status::HEALTHY, sequence).unwrap();
        block.publish(&reading);
        let got = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(got, reading);
    }

    token.cancel();
    let stats = task.await.unwrap().unwrap();
    assert_eq!(stats.emitted, 3);
    assert_eq!(stats.last_sequence, 3);
}

#[tokio::test]
async fn test_ack_split_across_timeout_is_not_lost() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = S7Server::new();
    let block = server.register_db(10, 16);
    let first = CanonicalReading::new(20.0, 1_000, Status::HEALTHY, 1).unwrap();
    let second = CanonicalReading::new(20.5, 2_000, Status::HEALTHY, 2).unwrap();
    block.publish(&first);

    // Answers jobs through the mock server, splitting the first read ack
    let peer = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let request = read_tpkt(&mut stream).await.unwrap();
        stream.write_all(&connection_confirm(&request)).await.unwrap();

        let mut reads = 0;
        while let Ok(payload) = read_tpkt(&mut stream).await {
            let Ok(Cotp::Data(inner)) = parse_cotp(&payload) else {
                break;
            };
            let job = S7Message::parse(&inner).unwrap();
            let ack = data_frame(&server.process_job(&job).encode());
            let is_read = job.function() == Some(FN_READ_VAR);
            reads += u32::from(is_read);
            if is_read && reads == 1 {
                stream.write_all(&ack[..10]).await.unwrap();
                tokio::time::sleep(Duration::from_millis(300)).await;
                stream.write_all(&ack[10..]).await.unwrap();
            } else {
                stream.write_all(&ack).await.unwrap();
            }
        }
    });

    let mut session = S7Session::new(S7ClientConfig {
        read_timeout: Duration::from_millis(100),
        ..client_for(addr, 10)
    });
    session.connect().await.unwrap();

    let err = session.fetch().await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Transient);
    assert!(session.is_connected());

    block.publish(&second);
    tokio::time::sleep(Duration::from_millis(400)).await;
    let bytes = session.fetch().await.unwrap();
    assert_eq!(ByteBlockCodec.decode(&bytes).unwrap(), second);
    assert!(session.is_connected());

    session.close().await;
    peer.await.unwrap();
}
