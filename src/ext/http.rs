//! HTTP request/response metadata carried on BEGIN and END.

/// One HTTP header (or pseudo-header such as `:status`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHeader {
    pub name: String,
    pub value: String,
}

impl HttpHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Headers sent with the first frame of an HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HttpBeginEx {
    pub headers: Vec<HttpHeader>,
}

impl HttpBeginEx {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header, builder style.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(HttpHeader::new(name, value));
        self
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push(HttpHeader::new(name, value));
    }

    /// First header matching `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        find(&self.headers, name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    pub fn status(&self) -> Option<&str> {
        self.header(":status")
    }

    pub fn method(&self) -> Option<&str> {
        self.header(":method")
    }

    pub fn path(&self) -> Option<&str> {
        self.header(":path")
    }
}

/// Trailers sent with the END of an HTTP response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HttpEndEx {
    pub trailers: Vec<HttpHeader>,
}

impl HttpEndEx {
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.trailers.push(HttpHeader::new(name, value));
        self
    }

    pub fn trailer(&self, name: &str) -> Option<&str> {
        find(&self.trailers, name)
    }
}

fn find<'a>(headers: &'a [HttpHeader], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_ignores_case() {
        let ex = HttpBeginEx::new()
            .with(":status", "200")
            .with("Content-Type", "text/plain");
        assert_eq!(ex.status(), Some("200"));
        assert_eq!(ex.header("content-type"), Some("text/plain"));
        assert!(!ex.contains("etag"));
    }

    #[test]
    fn trailer_lookup_returns_first_match() {
        let ex = HttpEndEx::default()
            .with("grpc-status", "0")
            .with("grpc-status", "13");
        assert_eq!(ex.trailer("grpc-status"), Some("0"));
    }
}
