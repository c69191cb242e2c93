//! gRPC status codes and how each content type carries them.

use bytes::{Bytes, BytesMut};

use super::message::{encode_prefix, TRAILER_FLAG};
use crate::ext::{HttpBeginEx, HttpEndEx};

pub const OK: &str = "0";
pub const DEADLINE_EXCEEDED: &str = "4";
pub const NOT_FOUND: &str = "5";
pub const ABORTED: &str = "10";
pub const UNIMPLEMENTED: &str = "12";
pub const INTERNAL: &str = "13";

pub const CONTENT_TYPE_GRPC: &str = "application/grpc";
pub const CONTENT_TYPE_GRPC_PROTO: &str = "application/grpc+proto";
pub const CONTENT_TYPE_GRPC_WEB: &str = "application/grpc-web";
pub const CONTENT_TYPE_GRPC_WEB_PROTO: &str = "application/grpc-web+proto";

/// A call outcome: status code plus optional message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrpcStatus {
    pub code: String,
    pub message: Option<String>,
}

impl GrpcStatus {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: None,
        }
    }

    pub fn with_message(code: impl Into<String>, message: Option<String>) -> Self {
        Self {
            code: code.into(),
            message,
        }
    }

    pub fn ok() -> Self {
        Self::new(OK)
    }

    pub fn is_ok(&self) -> bool {
        self.code == OK
    }

    /// HTTP/2 trailers for a call whose response headers were already sent.
    pub fn trailers(&self) -> HttpEndEx {
        let mut trailers = HttpEndEx::default().with("grpc-status", self.code.as_str());
        if let Some(message) = &self.message {
            trailers = trailers.with("grpc-message", message.as_str());
        }
        trailers
    }

    /// Headers of a trailers-only response.
    pub fn trailers_only(&self, content_type: &str) -> HttpBeginEx {
        let mut headers = HttpBeginEx::new()
            .with(":status", "200")
            .with("content-type", content_type)
            .with("grpc-status", self.code.as_str());
        if let Some(message) = &self.message {
            headers.push("grpc-message", message.as_str());
        }
        headers
    }

    /// gRPC-Web trailer frame appended to the response body.
    pub fn web_trailer(&self) -> Bytes {
        let mut lines = format!("Grpc-Status: {}\r\n", self.code);
        if let Some(message) = &self.message {
            lines.push_str(&format!("Grpc-Message: {message}\r\n"));
        }
        let mut out = BytesMut::with_capacity(5 + lines.len());
        encode_prefix(&mut out, TRAILER_FLAG, lines.len() as u32);
        out.extend_from_slice(lines.as_bytes());
        out.freeze()
    }
}

/// Where a call's final status travels, chosen by the request content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    /// HTTP/2 trailers.
    Grpc,
    /// A trailer frame at the end of the body.
    GrpcWebProto,
}

impl ContentType {
    pub fn from_header(value: &str) -> Option<Self> {
        let essence = value.split(';').next().unwrap_or(value).trim();
        match essence {
            CONTENT_TYPE_GRPC | CONTENT_TYPE_GRPC_PROTO => Some(ContentType::Grpc),
            CONTENT_TYPE_GRPC_WEB | CONTENT_TYPE_GRPC_WEB_PROTO => Some(ContentType::GrpcWebProto),
            _ => None,
        }
    }

    pub fn uses_web_trailer(self) -> bool {
        self == ContentType::GrpcWebProto
    }
}

/// Headers of a synthetic response for a request that never reaches a route.
pub fn rejection(http_status: &str, grpc_status: Option<&str>) -> HttpBeginEx {
    let mut headers = HttpBeginEx::new().with(":status", http_status);
    if let Some(code) = grpc_status {
        headers.push("grpc-status", code);
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_strategy() {
        assert_eq!(ContentType::from_header("application/grpc"), Some(ContentType::Grpc));
        assert_eq!(
            ContentType::from_header("application/grpc+proto; charset=utf-8"),
            Some(ContentType::Grpc)
        );
        assert_eq!(
            ContentType::from_header("application/grpc-web+proto"),
            Some(ContentType::GrpcWebProto)
        );
        assert_eq!(ContentType::from_header("application/json"), None);
    }

    #[test]
    fn web_trailer_frame_layout() {
        let frame = GrpcStatus::with_message(DEADLINE_EXCEEDED, Some("late".into())).web_trailer();
        let body = b"Grpc-Status: 4\r\nGrpc-Message: late\r\n";
        assert_eq!(frame[0], TRAILER_FLAG);
        assert_eq!(&frame[1..5], &(body.len() as u32).to_be_bytes());
        assert_eq!(&frame[5..], body);
    }

    #[test]
    fn trailers_carry_message_only_when_present() {
        let trailers = GrpcStatus::ok().trailers();
        assert_eq!(trailers.trailer("grpc-status"), Some("0"));
        assert_eq!(trailers.trailer("grpc-message"), None);

        let headers = GrpcStatus::new(UNIMPLEMENTED).trailers_only(CONTENT_TYPE_GRPC);
        assert_eq!(headers.status(), Some("200"));
        assert_eq!(headers.header("grpc-status"), Some("12"));
    }
}
