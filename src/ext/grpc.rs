//! gRPC call metadata exchanged with the application side.

use bytes::Bytes;

/// How a metadata value is represented on the HTTP side.
///
/// `Base64` values travel under a `-bin` suffixed header name and are
/// base64 encoded there; the extension always holds the raw bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MetadataKind {
    #[default]
    Text,
    Base64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrpcMetadata {
    pub kind: MetadataKind,
    /// Name without any `-bin` suffix.
    pub name: String,
    pub value: Bytes,
}

impl GrpcMetadata {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: MetadataKind::Text,
            name: name.into(),
            value: Bytes::from(value.into()),
        }
    }

    pub fn binary(name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            kind: MetadataKind::Base64,
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GrpcBeginEx {
    pub scheme: String,
    pub authority: String,
    pub service: String,
    pub method: String,
    pub metadata: Vec<GrpcMetadata>,
}

impl GrpcBeginEx {
    pub fn metadata(&self, name: &str) -> Option<&GrpcMetadata> {
        self.metadata
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(name))
    }
}

/// Marks a message whose remaining bytes follow in later DATA frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GrpcDataEx {
    pub deferred: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GrpcResetEx {
    pub status: String,
    pub message: Option<String>,
}

impl GrpcResetEx {
    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            message: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GrpcAbortEx {
    pub status: String,
    pub message: Option<String>,
}

impl GrpcAbortEx {
    pub fn status(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_lookup_ignores_case() {
        let ex = GrpcBeginEx {
            metadata: vec![
                GrpcMetadata::text("X-Request-Id", "abc"),
                GrpcMetadata::binary("trace", Bytes::from_static(&[0, 1])),
            ],
            ..GrpcBeginEx::default()
        };
        assert_eq!(ex.metadata("x-request-id").map(|m| m.kind), Some(MetadataKind::Text));
        assert_eq!(ex.metadata("TRACE").map(|m| m.kind), Some(MetadataKind::Base64));
        assert!(ex.metadata("missing").is_none());
    }
}
