//! Route resolution for gRPC calls.

use crate::core::config::{GrpcConfig, GrpcRouteConfig};
use crate::ext::GrpcMetadata;

use super::metadata::text_value;

pub type RouteId = u64;

/// Maps a gRPC service and method to a downstream route.
pub trait GrpcRouter {
    fn resolve(&self, service: &str, method: &str, metadata: &[GrpcMetadata]) -> Option<RouteId>;

    /// Services the built-in health check reports as SERVING.
    fn health_services(&self) -> &[String];
}

/// Router backed by the `[grpc]` config section; the first matching route wins.
#[derive(Debug, Clone, Default)]
pub struct ConfigGrpcRouter {
    routes: Vec<GrpcRouteConfig>,
    health_services: Vec<String>,
}

impl ConfigGrpcRouter {
    pub fn new(config: &GrpcConfig) -> Self {
        Self {
            routes: config.routes.clone(),
            health_services: config.health_services.clone(),
        }
    }
}

fn route_matches(route: &GrpcRouteConfig, service: &str, method: &str, metadata: &[GrpcMetadata]) -> bool {
    route.service == service
        && route.method.as_deref().map_or(true, |m| m == method)
        && route.metadata.iter().all(|(name, expected)| {
            metadata
                .iter()
                .filter(|m| m.name.eq_ignore_ascii_case(name))
                .any(|m| text_value(m) == Some(expected.as_str()))
        })
}

impl GrpcRouter for ConfigGrpcRouter {
    fn resolve(&self, service: &str, method: &str, metadata: &[GrpcMetadata]) -> Option<RouteId> {
        self.routes
            .iter()
            .find(|route| route_matches(route, service, method, metadata))
            .map(|route| route.id)
    }

    fn health_services(&self) -> &[String] {
        &self.health_services
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn router() -> ConfigGrpcRouter {
        ConfigGrpcRouter::new(&GrpcConfig {
            health_services: vec!["example.EchoService".into()],
            routes: vec![
                GrpcRouteConfig {
                    id: 7,
                    service: "example.EchoService".into(),
                    method: Some("EchoUnary".into()),
                    metadata: HashMap::from([("tenant".to_string(), "blue".to_string())]),
                },
                GrpcRouteConfig {
                    id: 8,
                    service: "example.EchoService".into(),
                    method: None,
                    metadata: HashMap::new(),
                },
            ],
            ..GrpcConfig::default()
        })
    }

    #[test]
    fn metadata_constrains_route() {
        let router = router();
        let blue = [GrpcMetadata::text("tenant", "blue")];
        assert_eq!(router.resolve("example.EchoService", "EchoUnary", &blue), Some(7));
        assert_eq!(router.resolve("example.EchoService", "EchoUnary", &[]), Some(8));
        assert_eq!(router.resolve("example.EchoService", "EchoStream", &blue), Some(8));
        assert_eq!(router.resolve("other.Service", "EchoUnary", &blue), None);
    }

    #[test]
    fn exposes_health_services() {
        assert_eq!(router().health_services(), ["example.EchoService".to_string()]);
    }
}
