#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::similar_names)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
// Wire formats: widths and signedness are fixed by the protocols
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::trivially_copy_pass_by_ref)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::redundant_closure_for_method_calls)]
#![allow(clippy::large_enum_variant)]

//! Gantry - sans-io protocol engines over a shared duplex-stream substrate.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Configuration parsing and validation
//! - `core::time` - Deterministic time utilities
//!
//! ## Substrate
//! - `engine` - Frames, flow control, budgets, timers and stream bookkeeping
//! - `ext` - Typed frame extensions for each protocol
//!
//! ## Engines
//! - `mqtt` - MQTT v5 server engine
//! - `grpc` - gRPC server, client and health framing
//! - `http_kafka` - HTTP-Kafka fetch, produce and correlation proxies
//!
//! ## Operations
//! - `ops::telemetry` - Structured logging
//!
//! ## CLI
//! - `cli` - Command-line tooling

// Core infrastructure
pub mod core;

// Substrate
pub mod engine;
pub mod ext;

// Engines
pub mod grpc;
pub mod http_kafka;
pub mod mqtt;

// Operations
pub mod ops;

// CLI
pub mod cli;

pub use self::core::{config, time};
pub use engine::{EngineContext, Frame, FrameHeader, FrameKind, StreamFactory};
pub use grpc::{GrpcClientFactory, GrpcServerFactory};
pub use http_kafka::HttpKafkaProxyFactory;
pub use mqtt::MqttServerFactory;
pub use ops::telemetry;
