//! Translation between HTTP headers and gRPC call metadata.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use tracing::debug;

use super::timeout::parse_timeout;
use crate::ext::{GrpcMetadata, HttpBeginEx, HttpHeader, MetadataKind};

const BINARY_SUFFIX: &str = "-bin";

/// Binary metadata is sent unpadded and accepted either way.
const BINARY: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Headers the engine synthesizes itself; never carried as metadata.
const RESERVED: &[&str] = &[
    ":path",
    ":method",
    ":scheme",
    ":authority",
    ":status",
    "service-name",
    "te",
    "content-type",
    "content-length",
    "user-agent",
];

fn is_reserved(name: &str) -> bool {
    RESERVED.iter().any(|r| r.eq_ignore_ascii_case(name))
        || name.get(..5).is_some_and(|prefix| prefix.eq_ignore_ascii_case("grpc-"))
}

/// Metadata entry for one inbound header, or `None` when the header is
/// reserved or its binary value does not decode.
pub fn from_header(header: &HttpHeader) -> Option<GrpcMetadata> {
    if is_reserved(&header.name) {
        return None;
    }
    let name = header.name.to_ascii_lowercase();
    match name.strip_suffix(BINARY_SUFFIX) {
        Some(stripped) => match BINARY.decode(header.value.trim()) {
            Ok(value) => Some(GrpcMetadata::binary(stripped, value)),
            Err(err) => {
                debug!(header = %header.name, %err, "dropping undecodable binary metadata");
                None
            }
        },
        None => Some(GrpcMetadata::text(name, header.value.clone())),
    }
}

/// Header for one outbound metadata entry.
pub fn to_header(metadata: &GrpcMetadata) -> HttpHeader {
    match metadata.kind {
        MetadataKind::Base64 => HttpHeader::new(
            format!("{}{BINARY_SUFFIX}", metadata.name),
            BINARY.encode(&metadata.value),
        ),
        MetadataKind::Text => HttpHeader::new(
            metadata.name.clone(),
            String::from_utf8_lossy(&metadata.value).into_owned(),
        ),
    }
}

/// Everything the server needs from request headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Option<String>,
    pub scheme: String,
    pub authority: String,
    pub path: Option<String>,
    pub service_name: Option<String>,
    pub content_type: Option<String>,
    pub te: Option<String>,
    pub timeout_millis: Option<i64>,
    pub metadata: Vec<GrpcMetadata>,
}

impl RequestHead {
    pub fn parse(begin: &HttpBeginEx) -> Self {
        let mut head = RequestHead::default();
        for header in &begin.headers {
            let value = header.value.as_str();
            match header.name.to_ascii_lowercase().as_str() {
                ":method" => head.method = Some(value.to_owned()),
                ":scheme" => head.scheme = value.to_owned(),
                ":authority" => head.authority = value.to_owned(),
                ":path" => head.path = Some(value.to_owned()),
                "service-name" => head.service_name = Some(value.to_owned()),
                "content-type" => head.content_type = Some(value.to_owned()),
                "te" => head.te = Some(value.to_owned()),
                "grpc-timeout" => head.timeout_millis = parse_timeout(value),
                _ => {}
            }
            if let Some(metadata) = from_header(header) {
                head.metadata.push(metadata);
            }
        }
        head
    }

    /// `(service, method)` from `/{service}/{method}`; a `service-name`
    /// header overrides the service.
    pub fn service_method(&self) -> Option<(String, String)> {
        let path = self.path.as_deref()?.strip_prefix('/')?;
        let (service, method) = path.split_once('/')?;
        if service.is_empty() || method.is_empty() {
            return None;
        }
        let service = self.service_name.clone().unwrap_or_else(|| service.to_owned());
        Some((service, method.to_owned()))
    }
}

/// Raw bytes of a text metadata value.
pub fn text_value(metadata: &GrpcMetadata) -> Option<&str> {
    match metadata.kind {
        MetadataKind::Text => std::str::from_utf8(&metadata.value).ok(),
        MetadataKind::Base64 => None,
    }
}

/// Metadata carried over from response headers or trailers on the client side.
pub fn collect(headers: &[HttpHeader]) -> Vec<GrpcMetadata> {
    headers.iter().filter_map(from_header).collect()
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn binary(name: &str, value: &[u8]) -> GrpcMetadata {
        GrpcMetadata::binary(name, Bytes::copy_from_slice(value))
    }

    fn request() -> HttpBeginEx {
        HttpBeginEx::new()
            .with(":method", "POST")
            .with(":scheme", "http")
            .with(":authority", "localhost:8080")
            .with(":path", "/example.EchoService/EchoUnary")
            .with("content-type", "application/grpc")
            .with("te", "trailers")
            .with("grpc-timeout", "100m")
            .with("custom", "test")
            .with("idempotency-key-bin", "AQID")
    }

    #[test]
    fn parses_request_head() {
        let head = RequestHead::parse(&request());
        assert_eq!(head.method.as_deref(), Some("POST"));
        assert_eq!(head.te.as_deref(), Some("trailers"));
        assert_eq!(head.timeout_millis, Some(100));
        assert_eq!(
            head.service_method(),
            Some(("example.EchoService".into(), "EchoUnary".into()))
        );
        assert_eq!(
            head.metadata,
            vec![
                GrpcMetadata::text("custom", "test"),
                binary("idempotency-key", &[1, 2, 3]),
            ]
        );
    }

    #[test]
    fn service_name_header_overrides_path() {
        let head = RequestHead::parse(&request().with("service-name", "other.Service"));
        assert_eq!(head.service_method().map(|(s, _)| s), Some("other.Service".into()));
    }

    #[test]
    fn binary_metadata_round_trips_through_headers() {
        let metadata = binary("trace", &[0xde, 0xad, 0xbe, 0xef]);
        let header = to_header(&metadata);
        assert_eq!(header.name, "trace-bin");
        assert_eq!(header.value, "3q2+7w");
        assert_eq!(from_header(&header), Some(metadata));
        assert_eq!(
            from_header(&HttpHeader::new("trace-bin", "3q2+7w==")),
            Some(binary("trace", &[0xde, 0xad, 0xbe, 0xef]))
        );
    }

    #[test]
    fn reserved_and_invalid_headers_are_skipped() {
        assert_eq!(from_header(&HttpHeader::new("grpc-encoding", "identity")), None);
        assert_eq!(from_header(&HttpHeader::new("User-Agent", "x")), None);
        assert_eq!(from_header(&HttpHeader::new("key-bin", "!!!")), None);
    }
}
