//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `fix_listener` - TCP listener for newline-delimited JSON fixes
//! - `http` - HTTP API and Prometheus metrics endpoint
//! - `egress` - Zone events and alerts to file (JSONL format)
//! - `egress_channel` - Typed channel for MQTT egress messages
//! - `mqtt_egress` - MQTT publisher for egress messages

pub mod egress;
pub mod egress_channel;
pub mod fix_listener;
pub mod http;
pub mod mqtt_egress;

// Re-export commonly used types
pub use egress_channel::{create_egress_channel, EgressMessage, EgressSender};
pub use fix_listener::{start_fix_listener, FixListenerConfig};
pub use http::{start_http_server, ApiState};
pub use mqtt_egress::MqttPublisher;
