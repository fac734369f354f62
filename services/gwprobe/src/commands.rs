//! Subcommand implementations

use std::sync::Arc;
use std::time::Duration;

use errors::GatewayResult;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bootstrap::{Args, Command, Protocol, ServeArgs, ServeProtocol, WatchArgs};
use crate::codec::{ByteBlockCodec, Codec, RegisterBankCodec, VariableNodeCodec};
use crate::config::AppConfig;
use crate::protocols::modbus::{ModbusClientConfig, ModbusServer, ModbusTcpSession};
use crate::protocols::s7::{S7ClientConfig, S7Server, S7Session};
use crate::protocols::variable_space::{VariableSpace, VariableSpaceSession};
use crate::protocols::{ReadingPublisher, TransportSession};
use crate::runtime::consumer::{ConsumerOptions, ConsumerStats, PollingConsumer};
use crate::runtime::reconnect::ReconnectPolicy;
use crate::runtime::sink::{LimitSink, TracingSink};
use crate::simulator::SyntheticProducer;

pub async fn run(args: Args, config: AppConfig) -> GatewayResult<()> {
    match args.command {
        Command::Watch(watch_args) => watch(watch_args, config).await.map(|_| ()),
        Command::Serve(serve_args) => serve(serve_args, config).await,
        Command::CheckConfig => check_config(&config),
    }
}

/// Print the effective configuration as YAML
pub fn check_config(config: &AppConfig) -> GatewayResult<()> {
    config.validate()?;
    let rendered = serde_yaml::to_string(config)?;
    println!("{}", rendered);
    Ok(())
}

/// Start the synthetic producer on its own task
fn spawn_producer(
    codec: &impl Codec,
    interval: Duration,
    token: CancellationToken,
    publisher: Arc<dyn ReadingPublisher>,
) -> JoinHandle<()> {
    let producer = SyntheticProducer::new(codec.sequence_width());
    tokio::spawn(producer.run(interval, token, publisher))
}

async fn consume<T, C>(
    session: T,
    codec: C,
    poll_interval: Duration,
    config: &AppConfig,
    count: Option<u64>,
    token: CancellationToken,
) -> GatewayResult<ConsumerStats>
where
    T: TransportSession,
    C: Codec<Frame = T::Frame>,
{
    let options = ConsumerOptions {
        poll_interval,
        detector: config.consumer.detector(),
        reconnect: ReconnectPolicy::from_config(&config.consumer.reconnect),
    };
    let sink = LimitSink::new(TracingSink::new(codec.name()), count);
    let mut consumer = PollingConsumer::new(session, codec, sink, options);
    let stats = consumer.run(token).await?;

    match serde_json::to_string(&stats) {
        Ok(json) => info!("Consumer stats: {}", json),
        Err(e) => warn!("Cannot render stats: {}", e),
    }
    Ok(stats)
}

/// Run one consumer until shutdown, `--count` readings, or a fatal error
pub async fn watch(args: WatchArgs, config: AppConfig) -> GatewayResult<ConsumerStats> {
    let token = CancellationToken::new();
    let signals = common::shutdown::cancel_on_shutdown(token.clone());
    let producer_interval = Duration::from_millis(args.interval_ms.max(1));

    let result = match args.protocol {
        Protocol::Modbus => {
            let cfg = &config.modbus;
            let mut client = ModbusClientConfig {
                host: args.host.clone().unwrap_or_else(|| cfg.host.clone()),
                port: args.port.unwrap_or(cfg.port),
                unit_id: cfg.unit_id,
                start_address: cfg.start_address,
                connect_timeout: Duration::from_millis(cfg.connect_timeout_ms),
                read_timeout: Duration::from_millis(cfg.read_timeout_ms),
                ..Default::default()
            };
            if args.simulate {
                let server = ModbusServer::new(cfg.register_count).with_unit_id(cfg.unit_id);
                let (addr, _) = server.start("127.0.0.1:0", token.child_token()).await?;
                spawn_producer(
                    &RegisterBankCodec,
                    producer_interval,
                    token.child_token(),
                    Arc::new(server),
                );
                client.host = addr.ip().to_string();
                client.port = addr.port();
            }
            let session = ModbusTcpSession::new(client);
            consume(
                session,
                RegisterBankCodec,
                cfg.poll_interval(),
                &config,
                args.count,
                token.clone(),
            )
            .await
        },
        Protocol::S7 => {
            let cfg = &config.s7;
            let mut client = S7ClientConfig {
                host: args.host.clone().unwrap_or_else(|| cfg.host.clone()),
                port: args.port.unwrap_or(cfg.port),
                rack: cfg.rack,
                slot: cfg.slot,
                db_number: cfg.db_number,
                start: cfg.start,
                connect_timeout: Duration::from_millis(cfg.connect_timeout_ms),
                read_timeout: Duration::from_millis(cfg.read_timeout_ms),
                ..Default::default()
            };
            if args.simulate {
                let server = S7Server::new();
                let block = server.register_db(cfg.db_number, cfg.db_size);
                let (addr, _) = server.start("127.0.0.1:0", token.child_token()).await?;
                spawn_producer(
                    &ByteBlockCodec,
                    producer_interval,
                    token.child_token(),
                    Arc::new(block),
                );
                client.host = addr.ip().to_string();
                client.port = addr.port();
            }
            let session = S7Session::new(client);
            consume(
                session,
                ByteBlockCodec,
                cfg.poll_interval(),
                &config,
                args.count,
                token.clone(),
            )
            .await
        },
        Protocol::Opcua if args.simulate => {
            let space = Arc::new(VariableSpace::new());
            spawn_producer(
                &VariableNodeCodec,
                producer_interval,
                token.child_token(),
                space.clone(),
            );
            consume(
                VariableSpaceSession::new(space),
                VariableNodeCodec,
                config.opcua.poll_interval(),
                &config,
                args.count,
                token.clone(),
            )
            .await
        },
        Protocol::Opcua => watch_opcua(&args, &config, token.clone()).await,
    };

    // Stop the mock endpoint and producer, if any
    token.cancel();
    let _ = signals.await;
    result
}

#[cfg(feature = "opcua")]
async fn watch_opcua(
    args: &WatchArgs,
    config: &AppConfig,
    token: CancellationToken,
) -> GatewayResult<ConsumerStats> {
    use crate::protocols::opcua::{OpcUaClientConfig, OpcUaSession};

    let cfg = &config.opcua;
    let client = OpcUaClientConfig {
        endpoint_url: override_endpoint(&cfg.endpoint_url, args.host.as_deref(), args.port),
        namespace_index: cfg.namespace_index,
        connect_timeout: Duration::from_millis(cfg.connect_timeout_ms),
        read_timeout: Duration::from_millis(cfg.read_timeout_ms),
    };
    consume(
        OpcUaSession::new(client),
        VariableNodeCodec,
        cfg.poll_interval(),
        config,
        args.count,
        token,
    )
    .await
}

#[cfg(not(feature = "opcua"))]
async fn watch_opcua(
    _args: &WatchArgs,
    _config: &AppConfig,
    _token: CancellationToken,
) -> GatewayResult<ConsumerStats> {
    Err(errors::GatewayError::fatal(
        "OPC UA client not built (enable the `opcua` feature, or use --simulate)",
    ))
}

/// Replace host and/or port in an `opc.tcp://host:port/path` URL
pub fn override_endpoint(url: &str, host: Option<&str>, port: Option<u16>) -> String {
    if host.is_none() && port.is_none() {
        return url.to_string();
    }
    let (scheme, rest) = url.split_once("://").unwrap_or(("opc.tcp", url));
    let (authority, path) = match rest.find('/') {
        Some(idx) => rest.split_at(idx),
        None => (rest, ""),
    };
    let (current_host, current_port) = match authority.rsplit_once(':') {
        Some((h, p)) => (h, Some(p)),
        None => (authority, None),
    };

    let host = host.unwrap_or(current_host);
    match (port.map(|p| p.to_string()).as_deref().or(current_port), path) {
        (Some(port), path) => format!("{}://{}:{}{}", scheme, host, port, path),
        (None, path) => format!("{}://{}{}", scheme, host, path),
    }
}

/// Run a mock endpoint until shutdown
pub async fn serve(args: ServeArgs, config: AppConfig) -> GatewayResult<()> {
    let token = CancellationToken::new();
    let signals = common::shutdown::cancel_on_shutdown(token.clone());
    let interval = Duration::from_millis(args.interval_ms.max(1));

    let (addr, server_task, producer) = match args.protocol {
        ServeProtocol::Modbus => {
            let bind = args.bind.clone().unwrap_or_else(|| config.modbus.bind.clone());
            let server =
                ModbusServer::new(config.modbus.register_count).with_unit_id(config.modbus.unit_id);
            let (addr, task) = server.start(&bind, token.child_token()).await?;
            let producer = args.simulate.then(|| {
                spawn_producer(
                    &RegisterBankCodec,
                    interval,
                    token.child_token(),
                    Arc::new(server.clone()),
                )
            });
            (addr, task, producer)
        },
        ServeProtocol::S7 => {
            let bind = args.bind.clone().unwrap_or_else(|| config.s7.bind.clone());
            let server = S7Server::new();
            let block = server.register_db(config.s7.db_number, config.s7.db_size);
            let (addr, task) = server.start(&bind, token.child_token()).await?;
            let producer = args.simulate.then(|| {
                spawn_producer(
                    &ByteBlockCodec,
                    interval,
                    token.child_token(),
                    Arc::new(block),
                )
            });
            (addr, task, producer)
        },
    };

    info!(
        "Serving {:?} on {}{}",
        args.protocol,
        addr,
        if args.simulate { " with synthetic readings" } else { "" }
    );
    token.cancelled().await;

    if let Err(e) = server_task.await {
        warn!("Server task ended abnormally: {}", e);
    }
    if let Some(producer) = producer {
        let _ = producer.await;
    }
    let _ = signals.await;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use errors::ErrorCategory;

    #[test]
    fn test_override_endpoint() {
        let url = "opc.tcp://127.0.0.1:4840/gateway";
        assert_eq!(override_endpoint(url, None, None), url);
        assert_eq!(
            override_endpoint(url, Some("10.1.2.3"), None),
            "opc.tcp://10.1.2.3:4840/gateway"
        );
        assert_eq!(
            override_endpoint(url, None, Some(4841)),
            "opc.tcp://127.0.0.1:4841/gateway"
        );
        assert_eq!(
            override_endpoint("opc.tcp://plc", None, Some(4840)),
            "opc.tcp://plc:4840"
        );
    }

    #[cfg(not(feature = "opcua"))]
    #[tokio::test]
    async fn test_network_opcua_without_feature_is_fatal() {
        let args = WatchArgs {
            protocol: Protocol::Opcua,
            host: None,
            port: None,
            count: Some(1),
            simulate: false,
            interval_ms: 100,
        };
        let err = watch(args, AppConfig::default()).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Fatal);
    }

    #[tokio::test]
    async fn test_simulated_watch_stops_after_count() {
        let mut config = AppConfig::default();
        config.modbus.poll_interval_ms = 20;
        let args = WatchArgs {
            protocol: Protocol::Modbus,
            host: None,
            port: None,
            count: Some(2),
            simulate: true,
            interval_ms: 30,
        };
        let stats = watch(args, config).await.unwrap();
        assert_eq!(stats.emitted, 2);
    }

    #[test]
    fn test_check_config_accepts_defaults() {
        check_config(&AppConfig::default()).unwrap();
    }
}
