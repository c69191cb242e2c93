//! Route resolution for HTTP-Kafka requests.
//!
//! Route paths are templates such as `/items/{id}`; the values captured from
//! the request path are substituted into the route's topic, key, filters,
//! reply topic and async location. A `{correlationId}` capture marks a route
//! that looks up the reply of an earlier asynchronous request.

use std::collections::HashMap;

use crate::core::config::{HttpKafkaCapabilityConfig, HttpKafkaConfig, HttpKafkaRouteConfig};
use crate::ext::{HttpBeginEx, KafkaAckMode};

pub type RouteId = u64;

/// Template parameter carrying the correlation id of an async request.
pub const CORRELATION_ID_PARAM: &str = "correlationId";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpKafkaCapability {
    Fetch,
    Produce,
}

/// Framing that joins merged records into one response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeFraming {
    pub content_type: String,
    pub header: String,
    pub separator: String,
    pub trailer: String,
}

/// A route resolved for one request, templates already substituted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpKafkaRoute {
    pub id: RouteId,
    pub capability: HttpKafkaCapability,
    pub topic: String,
    pub key: Option<String>,
    /// Header name and value pairs a fetched record must carry.
    pub filters: Vec<(String, String)>,
    pub merge: Option<MergeFraming>,
    pub reply_to: Option<String>,
    /// Location of an async reply; `{correlationId}` is still unresolved.
    pub async_location: Option<String>,
    /// Correlation id captured from the request path.
    pub correlation_id: Option<String>,
    pub correlation_header: String,
    pub reply_to_header: String,
    pub idempotency_header: String,
    pub ack_mode: KafkaAckMode,
    pub wait_secs: u64,
}

/// Maps an HTTP request to the Kafka capability that serves it.
pub trait HttpKafkaRouter {
    fn resolve(&self, method: &str, path: &str, headers: &HttpBeginEx) -> Option<HttpKafkaRoute>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Literal(String),
    Param(String),
}

fn tokenize(template: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}') else {
            break;
        };
        if open > 0 {
            tokens.push(Token::Literal(rest[..open].to_string()));
        }
        tokens.push(Token::Param(rest[open + 1..open + close].to_string()));
        rest = &rest[open + close + 1..];
    }
    if !rest.is_empty() {
        tokens.push(Token::Literal(rest.to_string()));
    }
    tokens
}

/// Match `path` against `template`, capturing every `{param}`.
///
/// A parameter spans at least one character, stops at the literal that
/// follows it, and never crosses a `/`.
pub fn match_path(template: &str, path: &str) -> Option<HashMap<String, String>> {
    let tokens = tokenize(template);
    let mut params = HashMap::new();
    let mut rest = path;
    for (index, token) in tokens.iter().enumerate() {
        match token {
            Token::Literal(literal) => rest = rest.strip_prefix(literal.as_str())?,
            Token::Param(name) => {
                let segment_end = rest.find('/').unwrap_or(rest.len());
                let end = match tokens.get(index + 1) {
                    Some(Token::Literal(next)) => rest[..segment_end]
                        .find(next.as_str())
                        .or_else(|| next.starts_with('/').then_some(segment_end))?,
                    _ => segment_end,
                };
                if end == 0 {
                    return None;
                }
                params.insert(name.clone(), rest[..end].to_string());
                rest = &rest[end..];
            }
        }
    }
    rest.is_empty().then_some(params)
}

/// Replace every `{param}` with a captured value, leaving unknown names as is.
pub fn substitute(template: &str, params: &HashMap<String, String>) -> String {
    tokenize(template)
        .into_iter()
        .map(|token| match token {
            Token::Literal(literal) => literal,
            Token::Param(name) => match params.get(&name) {
                Some(value) => value.clone(),
                None => format!("{{{name}}}"),
            },
        })
        .collect()
}

/// Router backed by the `[http_kafka]` config section; the first matching route wins.
#[derive(Debug, Clone, Default)]
pub struct ConfigHttpKafkaRouter {
    routes: Vec<HttpKafkaRouteConfig>,
}

impl ConfigHttpKafkaRouter {
    pub fn new(config: &HttpKafkaConfig) -> Self {
        Self {
            routes: config.routes.clone(),
        }
    }
}

fn resolved(route: &HttpKafkaRouteConfig, params: HashMap<String, String>) -> HttpKafkaRoute {
    let mut filters: Vec<(String, String)> = route
        .filters
        .iter()
        .map(|(name, value)| (name.clone(), substitute(value, &params)))
        .collect();
    filters.sort();
    HttpKafkaRoute {
        id: route.id,
        capability: match route.capability {
            HttpKafkaCapabilityConfig::Fetch => HttpKafkaCapability::Fetch,
            HttpKafkaCapabilityConfig::Produce => HttpKafkaCapability::Produce,
        },
        topic: substitute(&route.topic, &params),
        key: route.key.as_deref().map(|key| substitute(key, &params)),
        filters,
        merge: route.merged.then(|| MergeFraming {
            content_type: route.merge.content_type.clone(),
            header: route.merge.header.clone(),
            separator: route.merge.separator.clone(),
            trailer: route.merge.trailer.clone(),
        }),
        reply_to: route.reply_to.as_deref().map(|topic| substitute(topic, &params)),
        async_location: route
            .async_location
            .as_deref()
            .map(|location| substitute(location, &params)),
        correlation_id: params.get(CORRELATION_ID_PARAM).cloned(),
        correlation_header: route.correlation_header.clone(),
        reply_to_header: route.reply_to_header.clone(),
        idempotency_header: route.idempotency_header.clone(),
        ack_mode: route.ack_mode.into(),
        wait_secs: route.wait_secs,
    }
}

impl HttpKafkaRouter for ConfigHttpKafkaRouter {
    fn resolve(&self, method: &str, path: &str, _headers: &HttpBeginEx) -> Option<HttpKafkaRoute> {
        let path = path.split('?').next().unwrap_or(path);
        self.routes.iter().find_map(|route| {
            if route
                .method
                .as_deref()
                .is_some_and(|m| !m.eq_ignore_ascii_case(method))
            {
                return None;
            }
            match_path(&route.path, path).map(|params| resolved(route, params))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTES: &str = r#"
[[routes]]
id = 1
method = "GET"
path = "/items/{id};cid={correlationId}"
capability = "produce"
topic = "requests"
reply_to = "responses"
async_location = "/items/{id};cid={correlationId}"

[[routes]]
id = 2
method = "GET"
path = "/items/{id}"
capability = "fetch"
topic = "items"
key = "{id}"
filters = { tenant = "{id}-t" }

[[routes]]
id = 3
path = "/items/{id}"
capability = "produce"
topic = "requests"
key = "{id}"
reply_to = "responses"
"#;

    fn router() -> ConfigHttpKafkaRouter {
        let config: HttpKafkaConfig = toml::from_str(ROUTES).unwrap();
        ConfigHttpKafkaRouter::new(&config)
    }

    #[test]
    fn templates_capture_params() {
        let params = match_path("/items/{id};cid={correlationId}", "/items/42;cid=abc-1").unwrap();
        assert_eq!(params["id"], "42");
        assert_eq!(params["correlationId"], "abc-1");
        assert!(match_path("/items/{id}", "/items/").is_none());
        assert!(match_path("/items/{id}", "/items/1/2").is_none());
        assert!(match_path("/items/{id}/meta", "/items/1/meta").is_some());
    }

    #[test]
    fn unknown_params_survive_substitution() {
        let params = HashMap::from([("id".to_string(), "7".to_string())]);
        assert_eq!(
            substitute("/items/{id};cid={correlationId}", &params),
            "/items/7;cid={correlationId}"
        );
    }

    #[test]
    fn first_matching_route_wins() {
        let router = router();
        let headers = HttpBeginEx::new();

        let fetch = router.resolve("GET", "/items/42?x=1", &headers).unwrap();
        assert_eq!(fetch.id, 2);
        assert_eq!(fetch.capability, HttpKafkaCapability::Fetch);
        assert_eq!(fetch.key.as_deref(), Some("42"));
        assert_eq!(fetch.filters, vec![("tenant".to_string(), "42-t".to_string())]);

        let lookup = router.resolve("GET", "/items/42;cid=c9", &headers).unwrap();
        assert_eq!(lookup.id, 1);
        assert_eq!(lookup.correlation_id.as_deref(), Some("c9"));
        assert_eq!(lookup.async_location.as_deref(), Some("/items/42;cid=c9"));

        let produce = router.resolve("PUT", "/items/42", &headers).unwrap();
        assert_eq!(produce.id, 3);
        assert_eq!(produce.reply_to.as_deref(), Some("responses"));
        assert_eq!(produce.correlation_header, "correlation-id");

        assert!(router.resolve("GET", "/other", &headers).is_none());
    }
}
