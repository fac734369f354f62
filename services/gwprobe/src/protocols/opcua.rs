//! OPC UA variable-node client (feature `opcua`)
//!
//! Anonymous session without message security. Each poll reads the value
//! attribute of the four `Gateway.*` variables in one Read request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use errors::{GatewayError, GatewayResult};
use opcua::client::{ClientBuilder, IdentityToken, Session};
use opcua::crypto::SecurityPolicy;
use opcua::types::{
    DataValue, MessageSecurityMode, NodeId, ReadValueId, StatusCode, TimestampsToReturn,
    UserTokenPolicy, Variant,
};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::codec::{GatewayVariable, NodeValue, VariableFrame};
use crate::protocols::TransportSession;

/// Namespace index the gateway registers its variables in
pub const DEFAULT_NAMESPACE_INDEX: u16 = 2;

#[derive(Debug, Clone)]
pub struct OpcUaClientConfig {
    pub endpoint_url: String,
    pub namespace_index: u16,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for OpcUaClientConfig {
    fn default() -> Self {
        Self {
            endpoint_url: "opc.tcp://127.0.0.1:4840".to_string(),
            namespace_index: DEFAULT_NAMESPACE_INDEX,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(1),
        }
    }
}

pub struct OpcUaSession {
    config: OpcUaClientConfig,
    session: Option<Arc<Session>>,
    event_loop: Option<JoinHandle<StatusCode>>,
    nodes: Vec<ReadValueId>,
}

impl OpcUaSession {
    pub fn new(config: OpcUaClientConfig) -> Self {
        let nodes = GatewayVariable::ALL
            .iter()
            .map(|v| ReadValueId::from(NodeId::new(config.namespace_index, v.node_path())))
            .collect();
        Self {
            config,
            session: None,
            event_loop: None,
            nodes,
        }
    }

    fn lost(&mut self, reason: impl std::fmt::Display) -> GatewayError {
        self.session = None;
        if let Some(handle) = self.event_loop.take() {
            handle.abort();
        }
        GatewayError::connection(self.config.endpoint_url.clone(), reason)
    }
}

/// Status codes that mean the session itself is gone
fn is_session_loss(status: StatusCode) -> bool {
    status == StatusCode::BadNotConnected
        || status == StatusCode::BadConnectionClosed
        || status == StatusCode::BadSessionIdInvalid
        || status == StatusCode::BadSessionClosed
        || status == StatusCode::BadSecureChannelClosed
}

fn node_value(variant: &Variant) -> NodeValue {
    match variant {
        Variant::Float(v) => NodeValue::Float(*v),
        Variant::Double(v) => NodeValue::Double(*v),
        Variant::Int64(v) => NodeValue::Int64(*v),
        Variant::UInt64(v) => NodeValue::UInt64(*v),
        Variant::UInt16(v) => NodeValue::UInt16(*v),
        Variant::UInt32(v) => NodeValue::UInt32(*v),
        other => {
            let debug = format!("{:?}", other);
            let name = debug.split('(').next().unwrap_or("Unknown");
            NodeValue::Other(name.to_string())
        },
    }
}

/// Value of one read result; bad-quality and empty values are missing
fn read_result(variable: GatewayVariable, value: &DataValue) -> Option<NodeValue> {
    if let Some(status) = value.status {
        if status.is_bad() {
            debug!("{} read with status {}", variable.node_path(), status);
            return None;
        }
    }
    value.value.as_ref().map(node_value)
}

#[async_trait]
impl TransportSession for OpcUaSession {
    type Frame = VariableFrame;

    fn endpoint(&self) -> String {
        self.config.endpoint_url.clone()
    }

    async fn connect(&mut self) -> GatewayResult<()> {
        let endpoint = self.config.endpoint_url.clone();
        let mut client = ClientBuilder::new()
            .application_name("gwprobe")
            .application_uri("urn:gwprobe")
            .session_retry_limit(0)
            .create_sample_keypair(true)
            .trust_server_certs(true)
            .client()
            .map_err(|e| GatewayError::config(e.join(", ")))?;

        let connecting = client.connect_to_matching_endpoint(
            (
                endpoint.as_str(),
                SecurityPolicy::None.to_uri(),
                MessageSecurityMode::None,
                UserTokenPolicy::anonymous(),
            ),
            IdentityToken::Anonymous,
        );
        let (session, event_loop) = match timeout(self.config.connect_timeout, connecting).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(status)) => return Err(GatewayError::connection(endpoint, status)),
            Err(_) => {
                return Err(GatewayError::connection(
                    endpoint,
                    format!("connect timed out after {:?}", self.config.connect_timeout),
                ));
            },
        };

        let handle = event_loop.spawn();
        if timeout(self.config.connect_timeout, session.wait_for_connection())
            .await
            .is_err()
        {
            handle.abort();
            return Err(GatewayError::connection(endpoint, "session never activated"));
        }

        info!("OPC UA connected: {}", endpoint);
        self.session = Some(session);
        self.event_loop = Some(handle);
        Ok(())
    }

    async fn fetch(&mut self) -> GatewayResult<VariableFrame> {
        let Some(session) = self.session.clone() else {
            return Err(GatewayError::connection(self.endpoint(), "not connected"));
        };
        if self.event_loop.as_ref().is_some_and(|h| h.is_finished()) {
            return Err(self.lost("session event loop ended"));
        }

        let read = session.read(&self.nodes, TimestampsToReturn::Neither, 0.0);
        let values = match timeout(self.config.read_timeout, read).await {
            Ok(Ok(values)) => values,
            Ok(Err(status)) if is_session_loss(status) => return Err(self.lost(status)),
            Ok(Err(status)) => {
                return Err(GatewayError::transient(format!("read failed: {}", status)))
            },
            Err(_) => {
                return Err(GatewayError::transient(format!(
                    "no response within {:?}",
                    self.config.read_timeout
                )))
            },
        };

        if values.len() != GatewayVariable::ALL.len() {
            warn!(
                "OPC UA returned {} results for {} nodes",
                values.len(),
                GatewayVariable::ALL.len()
            );
        }
        let mut frame = VariableFrame::default();
        for (variable, value) in GatewayVariable::ALL.iter().zip(values.iter()) {
            frame.set(*variable, read_result(*variable, value));
        }
        Ok(frame)
    }

    async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(status) = session.disconnect().await {
                debug!("OPC UA disconnect: {}", status);
            }
        }
        if let Some(handle) = self.event_loop.take() {
            handle.abort();
        }
    }

    fn is_connected(&self) -> bool {
        self.session.is_some()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_variant_mapping() {
        assert_eq!(node_value(&Variant::Float(12.5)), NodeValue::Float(12.5));
        assert_eq!(node_value(&Variant::UInt16(7)), NodeValue::UInt16(7));
        assert!(matches!(
            node_value(&Variant::Boolean(true)),
            NodeValue::Other(_)
        ));
    }

    #[test]
    fn test_bad_status_is_missing() {
        let mut value = DataValue::new_now(Variant::UInt32(5));
        assert_eq!(
            read_result(GatewayVariable::Sequence, &value),
            Some(NodeValue::UInt32(5))
        );
        value.status = Some(StatusCode::BadNodeIdUnknown);
        assert_eq!(read_result(GatewayVariable::Sequence, &value), None);
    }

    #[test]
    fn test_session_loss_classification() {
        assert!(is_session_loss(StatusCode::BadNotConnected));
        assert!(!is_session_loss(StatusCode::BadTimeout));
    }
}
