// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Aggregating MQTT-SN gateway.
//!
//! Bridges MQTT-SN v1.2 clients (sensors and MCUs speaking a compact binary
//! protocol over UDP) to a regular MQTT broker. All clients share a single
//! broker session held by the gateway.
//!
//! # Architecture
//!
//! ```text
//! MQTT-SN Client (UDP)            Gateway (this crate)              MQTT Broker
//!        |                                |                              |
//!        |--- CONNECT ------------------>|                              |
//!        |--- REGISTER("a/b") ---------->|  topic id allocated          |
//!        |<-- REGACK(id) ----------------|                              |
//!        |--- PUBLISH(id, data) -------->|--- PUBLISH("a/b", data) --->|
//!        |--- SUBSCRIBE("s/+") --------->|--- SUBSCRIBE("s/+") ------->|  first subscriber only
//!        |<-- SUBACK --------------------|                              |
//!        |                                |<-- PUBLISH("s/1", data) ----|
//!        |<-- REGISTER(id, "s/1") -------|  client lacks the id         |
//!        |--- REGACK(id) --------------->|                              |
//!        |<-- PUBLISH(id, data) ---------|                              |
//! ```
//!
//! # Key Features
//!
//! - **Topic ids**: gateway-wide name <-> id registry, ids learned per client
//! - **Subscription fan-out**: one broker subscription per filter, `+` / `#`
//!   matching, reference-counted by subscribed clients
//! - **Deferred delivery**: broker messages for an unknown id wait behind a
//!   gateway-initiated REGISTER without blocking other clients
//! - **Broker-agnostic**: the broker side is the [`Upstream`] trait;
//!   [`MqttUpstream`] implements it with `rumqttc`

pub mod config;
pub mod error;
pub mod gateway;
pub mod observe;
pub mod protocol;
pub mod session;
pub mod topics;
pub mod transport;
pub mod tree;
pub mod upstream;

// Re-exports for convenience.
pub use config::{BrokerConfig, ConfigError, GatewayConfig};
pub use error::GatewayError;
pub use gateway::Gateway;
pub use observe::{
    CloseReason, GatewayEvent, GatewayStats, GatewayStatsSnapshot, Observer, TracingObserver,
};
pub use protocol::{DecodeError, Message, MessageType, QoS, ReturnCode};
pub use session::{ClientRegistry, ClientSession};
pub use topics::{TopicError, TopicRegistry};
pub use transport::{DatagramTransport, UdpTransport};
pub use tree::{Matches, SubscriptionTree};
pub use upstream::{BrokerEvent, Delivery, MqttUpstream, Upstream, UpstreamError};
