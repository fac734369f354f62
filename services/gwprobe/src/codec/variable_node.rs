//! Variable-node layout (OPC UA variables under the `Gateway` object)
//!
//! Four independently addressable variables, each with its own protocol
//! type. There is no byte order; each value arrives already typed.

use std::fmt;

use errors::{GatewayError, GatewayResult};
use gauge_model::{CanonicalReading, SequenceWidth, Status};
use serde::Serialize;

use super::Codec;

/// Parent object holding the four variables
pub const GATEWAY_OBJECT: &str = "Gateway";

/// One of the four gateway variables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayVariable {
    Thickness,
    Timestamp,
    Status,
    Sequence,
}

impl GatewayVariable {
    pub const ALL: [GatewayVariable; 4] = [
        GatewayVariable::Thickness,
        GatewayVariable::Timestamp,
        GatewayVariable::Status,
        GatewayVariable::Sequence,
    ];

    pub fn browse_name(self) -> &'static str {
        match self {
            Self::Thickness => "Thickness",
            Self::Timestamp => "Timestamp",
            Self::Status => "Status",
            Self::Sequence => "Sequence",
        }
    }

    /// String node identifier, e.g. `Gateway.Thickness`
    pub fn node_path(self) -> String {
        format!("{}.{}", GATEWAY_OBJECT, self.browse_name())
    }
}

/// Typed value of one variable as read from the server
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum NodeValue {
    Float(f32),
    Double(f64),
    Int64(i64),
    UInt64(u64),
    UInt16(u16),
    UInt32(u32),
    /// Any other protocol type, kept by name for diagnostics
    Other(String),
}

impl NodeValue {
    pub fn type_name(&self) -> &str {
        match self {
            Self::Float(_) => "Float",
            Self::Double(_) => "Double",
            Self::Int64(_) => "Int64",
            Self::UInt64(_) => "UInt64",
            Self::UInt16(_) => "UInt16",
            Self::UInt32(_) => "UInt32",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for NodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{}", v),
            Self::Double(v) => write!(f, "{}", v),
            Self::Int64(v) => write!(f, "{}", v),
            Self::UInt64(v) => write!(f, "{}", v),
            Self::UInt16(v) => write!(f, "{}", v),
            Self::UInt32(v) => write!(f, "{}", v),
            Self::Other(name) => write!(f, "<{}>", name),
        }
    }
}

/// The four variables as read in one poll; `None` when a read came back empty
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VariableFrame {
    pub thickness: Option<NodeValue>,
    pub timestamp: Option<NodeValue>,
    pub status: Option<NodeValue>,
    pub sequence: Option<NodeValue>,
}

impl VariableFrame {
    pub fn get(&self, variable: GatewayVariable) -> Option<&NodeValue> {
        match variable {
            GatewayVariable::Thickness => self.thickness.as_ref(),
            GatewayVariable::Timestamp => self.timestamp.as_ref(),
            GatewayVariable::Status => self.status.as_ref(),
            GatewayVariable::Sequence => self.sequence.as_ref(),
        }
    }

    pub fn set(&mut self, variable: GatewayVariable, value: Option<NodeValue>) {
        let slot = match variable {
            GatewayVariable::Thickness => &mut self.thickness,
            GatewayVariable::Timestamp => &mut self.timestamp,
            GatewayVariable::Status => &mut self.status,
            GatewayVariable::Sequence => &mut self.sequence,
        };
        *slot = value;
    }
}

fn require(frame: &VariableFrame, variable: GatewayVariable) -> GatewayResult<&NodeValue> {
    frame.get(variable).ok_or_else(|| {
        GatewayError::malformed(
            format!("variable {} missing", variable.node_path()),
            "value",
            "nothing",
        )
    })
}

fn wrong_type(variable: GatewayVariable, expected: &str, value: &NodeValue) -> GatewayError {
    GatewayError::malformed(
        format!("variable {} has wrong type", variable.node_path()),
        expected,
        value.type_name(),
    )
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VariableNodeCodec;

impl Codec for VariableNodeCodec {
    type Frame = VariableFrame;

    fn name(&self) -> &'static str {
        "variable-node"
    }

    fn sequence_width(&self) -> SequenceWidth {
        SequenceWidth::Bits32
    }

    fn decode(&self, frame: &VariableFrame) -> GatewayResult<CanonicalReading> {
        let thickness = match require(frame, GatewayVariable::Thickness)? {
            NodeValue::Float(v) => *v,
            // Some servers publish Double; narrowing keeps every f32 exact
            NodeValue::Double(v) => *v as f32,
            other => return Err(wrong_type(GatewayVariable::Thickness, "Float", other)),
        };

        let timestamp_ms = match require(frame, GatewayVariable::Timestamp)? {
            NodeValue::Int64(v) => u64::try_from(*v).map_err(|_| {
                GatewayError::malformed(
                    "negative timestamp",
                    "epoch milliseconds >= 0",
                    v.to_string(),
                )
            })?,
            NodeValue::UInt64(v) => *v,
            other => return Err(wrong_type(GatewayVariable::Timestamp, "Int64", other)),
        };

        let status = match require(frame, GatewayVariable::Status)? {
            NodeValue::UInt16(v) => Status::from_bits(*v),
            other => return Err(wrong_type(GatewayVariable::Status, "UInt16", other)),
        };

        let sequence = match require(frame, GatewayVariable::Sequence)? {
            NodeValue::UInt32(v) => *v,
            other => return Err(wrong_type(GatewayVariable::Sequence, "UInt32", other)),
        };

        CanonicalReading::new(thickness, timestamp_ms, status, sequence)
    }

    fn encode(&self, reading: &CanonicalReading) -> VariableFrame {
        let timestamp = match i64::try_from(reading.timestamp_ms()) {
            Ok(ts) => NodeValue::Int64(ts),
            Err(_) => NodeValue::UInt64(reading.timestamp_ms()),
        };
        VariableFrame {
            thickness: Some(NodeValue::Float(reading.thickness())),
            timestamp: Some(timestamp),
            status: Some(NodeValue::UInt16(reading.status().bits())),
            sequence: Some(NodeValue::UInt32(reading.sequence())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use errors::ErrorCategory;

    fn full_frame() -> VariableFrame {
        VariableFrame {
            thickness: Some(NodeValue::Float(12.5)),
            timestamp: Some(NodeValue::Int64(1_700_000_000_000)),
            status: Some(NodeValue::UInt16(0x000F)),
            sequence: Some(NodeValue::UInt32(42)),
        }
    }

    #[test]
    fn test_decode_full_frame() {
        let reading = VariableNodeCodec.decode(&full_frame()).unwrap();
        assert_eq!(reading.thickness(), 12.5);
        assert_eq!(reading.timestamp_ms(), 1_700_000_000_000);
        assert!(reading.status().is_healthy());
        assert_eq!(reading.sequence(), 42);
    }

    #[test]
    fn test_unsigned_timestamp_is_accepted() {
        let mut frame = full_frame();
        frame.timestamp = Some(NodeValue::UInt64(1_700_000_000_001));
        let reading = VariableNodeCodec.decode(&frame).unwrap();
        assert_eq!(reading.timestamp_ms(), 1_700_000_000_001);
    }

    #[test]
    fn test_missing_variable_is_malformed() {
        let mut frame = full_frame();
        frame.set(GatewayVariable::Status, None);
        let err = VariableNodeCodec.decode(&frame).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Decode);
        assert!(err.to_string().contains("Gateway.Status"));
    }

    #[test]
    fn test_wrong_variant_is_malformed() {
        let mut frame = full_frame();
        frame.sequence = Some(NodeValue::Other("String".to_string()));
        let err = VariableNodeCodec.decode(&frame).unwrap_err();
        assert!(err.to_string().contains("UInt32"));
        assert!(err.to_string().contains("String"));
    }

    #[test]
    fn test_negative_timestamp_is_malformed() {
        let mut frame = full_frame();
        frame.timestamp = Some(NodeValue::Int64(-1));
        let err = VariableNodeCodec.decode(&frame).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Decode);
    }

    #[test]
    fn test_infinite_thickness_is_malformed() {
        let mut frame = full_frame();
        frame.thickness = Some(NodeValue::Float(f32::INFINITY));
        assert!(VariableNodeCodec.decode(&frame).is_err());
    }

    #[test]
    fn test_full_width_sequence() {
        let mut frame = full_frame();
        frame.sequence = Some(NodeValue::UInt32(u32::MAX));
        let reading = VariableNodeCodec.decode(&frame).unwrap();
        assert_eq!(reading.sequence(), u32::MAX);
    }

    #[test]
    fn test_node_paths() {
        let paths: Vec<String> = GatewayVariable::ALL
            .iter()
            .map(|v| v.node_path())
            .collect();
        assert_eq!(
            paths,
            [
                "Gateway.Thickness",
                "Gateway.Timestamp",
                "Gateway.Status",
                "Gateway.Sequence"
            ]
        );
    }
}
