//! Event stream transport.
//!
//! This module provides the MQTT subscription used as the detection event
//! stream, along with the payload parser that validates every message at
//! the stream boundary before it reaches the reconciliation engine.

pub mod mqtt;
pub mod payload;

pub use mqtt::{
    parse_mqtt_endpoint, validate_loopback_addr, MqttEndpoint, MqttEventSource, MqttSettings,
    TlsMaterials,
};
pub use payload::{parse_stream_payload, DetectionEvent, StreamPayload};
