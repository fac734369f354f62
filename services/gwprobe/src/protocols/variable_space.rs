//! In-process variable-node endpoint
//!
//! Stands in for an OPC UA server when the network client is not built: a
//! producer writes typed variables, a [`VariableSpaceSession`] reads all four
//! in one snapshot. The space can be taken offline to exercise reconnects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use errors::{GatewayError, GatewayResult};
use gauge_model::CanonicalReading;
use tracing::debug;

use crate::codec::{Codec, GatewayVariable, NodeValue, VariableFrame, VariableNodeCodec};
use crate::protocols::{ReadingPublisher, TransportSession};
use crate::snapshot::SnapshotCell;

/// Shared variable store
#[derive(Debug)]
pub struct VariableSpace {
    frame: SnapshotCell<VariableFrame>,
    online: AtomicBool,
}

impl Default for VariableSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl VariableSpace {
    pub fn new() -> Self {
        Self {
            frame: SnapshotCell::new(VariableFrame::default()),
            online: AtomicBool::new(true),
        }
    }

    /// Write one variable; the others keep their values
    pub fn write_variable(&self, variable: GatewayVariable, value: Option<NodeValue>) {
        self.frame.rcu(|current| {
            let mut next = current.clone();
            next.set(variable, value.clone());
            next
        });
    }

    pub fn snapshot(&self) -> Arc<VariableFrame> {
        self.frame.load()
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

impl ReadingPublisher for VariableSpace {
    fn publish(&self, reading: &CanonicalReading) {
        self.frame.publish(VariableNodeCodec.encode(reading));
    }
}

/// Session reading from a [`VariableSpace`]
pub struct VariableSpaceSession {
    space: Arc<VariableSpace>,
    connected: bool,
}

impl VariableSpaceSession {
    pub fn new(space: Arc<VariableSpace>) -> Self {
        Self {
            space,
            connected: false,
        }
    }
}

#[async_trait]
impl TransportSession for VariableSpaceSession {
    type Frame = VariableFrame;

    fn endpoint(&self) -> String {
        "local://variable-space".to_string()
    }

    async fn connect(&mut self) -> GatewayResult<()> {
        if !self.space.is_online() {
            return Err(GatewayError::connection(self.endpoint(), "variable space offline"));
        }
        self.connected = true;
        debug!("Variable space session opened");
        Ok(())
    }

    async fn fetch(&mut self) -> GatewayResult<VariableFrame> {
        if !self.connected {
            return Err(GatewayError::connection(self.endpoint(), "not connected"));
        }
        if !self.space.is_online() {
            self.connected = false;
            return Err(GatewayError::connection(self.endpoint(), "variable space went offline"));
        }
        Ok(self.space.snapshot().as_ref().clone())
    }

    async fn close(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
