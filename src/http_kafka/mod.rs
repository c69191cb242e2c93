//! HTTP-Kafka correlation proxies.
//!
//! [`HttpKafkaProxyFactory`] accepts HTTP request streams and answers each
//! one from Kafka merged streams: a GET fetches one record (or merges every
//! matching record), while a produce request writes the body as a record and
//! may wait for a reply record that carries the same correlation id.

pub mod etag;
mod factory;
mod fetch;
pub mod hash;
mod produce;
mod proxy;
pub mod route;

pub use factory::HttpKafkaProxyFactory;
pub use hash::ProduceHash;
pub use proxy::{KafkaRole, SIGNAL_WAIT_EXPIRED};
pub use route::{ConfigHttpKafkaRouter, HttpKafkaCapability, HttpKafkaRoute, HttpKafkaRouter, MergeFraming, RouteId};
