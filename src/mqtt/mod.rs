//! MQTT v5 server engine.
//!
//! Each accepted network stream carries raw MQTT bytes. The server decodes
//! packets, routes topics to application streams and encodes replies back
//! onto the network stream, all against the flow-controlled engine substrate.

pub mod alias;
pub mod codec;
mod decoder;
pub mod intern;
pub mod reason;
pub mod route;
pub mod server;
pub mod session;
pub mod topic;

pub use reason::{reason_name, ReasonCode, ReasonCodes};
pub use route::{ConfigMqttRouter, MqttRouter, RouteId};
pub use server::{
    MqttServerFactory, SIGNAL_CONNECT_TIMEOUT, SIGNAL_KEEP_ALIVE_TIMEOUT, SIGNAL_PUBLISH_EXPIRED,
    SIGNAL_SESSION_EXPIRY,
};
