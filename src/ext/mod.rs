//! Typed stream extensions.
//!
//! Each protocol attaches metadata to transport frames through an extension.
//! Frames carry at most one extension, tagged by the protocol that owns it.

pub mod grpc;
pub mod http;
pub mod kafka;
pub mod mqtt;

pub use grpc::{GrpcAbortEx, GrpcBeginEx, GrpcDataEx, GrpcMetadata, GrpcResetEx, MetadataKind};
pub use http::{HttpBeginEx, HttpEndEx, HttpHeader};
pub use kafka::{
    KafkaAckMode, KafkaBeginEx, KafkaCapabilities, KafkaCondition, KafkaDataEx, KafkaFilter,
    KafkaFlushEx, KafkaHeader, KafkaPartitionOffset,
};
pub use mqtt::{
    Capabilities, MqttBeginEx, MqttDataEx, MqttFlushEx, PayloadFormat, SubscribeFlags, UserProperty,
    PUBLISH_RETAIN,
};

/// Extension payload attached to a frame.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Extension {
    #[default]
    None,
    HttpBegin(HttpBeginEx),
    HttpEnd(HttpEndEx),
    MqttBegin(MqttBeginEx),
    MqttData(MqttDataEx),
    MqttFlush(MqttFlushEx),
    GrpcBegin(GrpcBeginEx),
    GrpcData(GrpcDataEx),
    GrpcReset(GrpcResetEx),
    GrpcAbort(GrpcAbortEx),
    KafkaBegin(KafkaBeginEx),
    KafkaData(KafkaDataEx),
    KafkaFlush(KafkaFlushEx),
}

impl Extension {
    pub fn is_none(&self) -> bool {
        matches!(self, Extension::None)
    }

    pub fn http_begin(&self) -> Option<&HttpBeginEx> {
        match self {
            Extension::HttpBegin(ex) => Some(ex),
            _ => None,
        }
    }

    pub fn http_end(&self) -> Option<&HttpEndEx> {
        match self {
            Extension::HttpEnd(ex) => Some(ex),
            _ => None,
        }
    }

    pub fn mqtt_begin(&self) -> Option<&MqttBeginEx> {
        match self {
            Extension::MqttBegin(ex) => Some(ex),
            _ => None,
        }
    }

    pub fn mqtt_data(&self) -> Option<&MqttDataEx> {
        match self {
            Extension::MqttData(ex) => Some(ex),
            _ => None,
        }
    }

    pub fn mqtt_flush(&self) -> Option<&MqttFlushEx> {
        match self {
            Extension::MqttFlush(ex) => Some(ex),
            _ => None,
        }
    }

    pub fn grpc_begin(&self) -> Option<&GrpcBeginEx> {
        match self {
            Extension::GrpcBegin(ex) => Some(ex),
            _ => None,
        }
    }

    pub fn grpc_data(&self) -> Option<&GrpcDataEx> {
        match self {
            Extension::GrpcData(ex) => Some(ex),
            _ => None,
        }
    }

    pub fn grpc_reset(&self) -> Option<&GrpcResetEx> {
        match self {
            Extension::GrpcReset(ex) => Some(ex),
            _ => None,
        }
    }

    pub fn grpc_abort(&self) -> Option<&GrpcAbortEx> {
        match self {
            Extension::GrpcAbort(ex) => Some(ex),
            _ => None,
        }
    }

    pub fn kafka_begin(&self) -> Option<&KafkaBeginEx> {
        match self {
            Extension::KafkaBegin(ex) => Some(ex),
            _ => None,
        }
    }

    pub fn kafka_data(&self) -> Option<&KafkaDataEx> {
        match self {
            Extension::KafkaData(ex) => Some(ex),
            _ => None,
        }
    }

    pub fn kafka_flush(&self) -> Option<&KafkaFlushEx> {
        match self {
            Extension::KafkaFlush(ex) => Some(ex),
            _ => None,
        }
    }
}
