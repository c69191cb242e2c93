//! gRPC framing engines.
//!
//! [`GrpcServerFactory`] terminates gRPC-over-HTTP/2 (and gRPC-Web) requests
//! and proxies whole messages to application streams; [`GrpcClientFactory`]
//! turns application calls into outbound HTTP/2 requests.

pub mod client;
mod health;
pub mod message;
pub mod metadata;
pub mod route;
pub mod server;
pub mod status;
pub mod timeout;

pub use client::GrpcClientFactory;
pub use health::HEALTH_SERVICE;
pub use message::{MessageDecoder, MessageError};
pub use route::{ConfigGrpcRouter, GrpcRouter, RouteId};
pub use server::{GrpcServerFactory, SIGNAL_DEADLINE};
pub use status::{ContentType, GrpcStatus};
