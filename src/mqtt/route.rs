//! Route resolution for MQTT topics.

use crate::core::config::MqttRouteConfig;

use super::topic;

pub type RouteId = u64;

/// Maps MQTT topics and filters to downstream routes.
pub trait MqttRouter {
    fn resolve_publish(&self, topic: &str) -> Option<RouteId>;

    fn resolve_subscribe(&self, filter: &str) -> Option<RouteId>;

    fn resolve_session(&self) -> Option<RouteId>;
}

/// Router backed by the `[[mqtt.routes]]` table; the first matching route wins.
#[derive(Debug, Clone, Default)]
pub struct ConfigMqttRouter {
    routes: Vec<MqttRouteConfig>,
}

impl ConfigMqttRouter {
    pub fn new(routes: Vec<MqttRouteConfig>) -> Self {
        Self { routes }
    }
}

/// Shared subscriptions resolve on the filter behind the group name.
fn unshared(filter: &str) -> &str {
    filter
        .strip_prefix("$share/")
        .and_then(|rest| rest.split_once('/'))
        .map(|(_, inner)| inner)
        .unwrap_or(filter)
}

impl MqttRouter for ConfigMqttRouter {
    fn resolve_publish(&self, name: &str) -> Option<RouteId> {
        self.routes
            .iter()
            .find(|route| route.publish.iter().any(|f| topic::matches(f, name)))
            .map(|route| route.id)
    }

    fn resolve_subscribe(&self, filter: &str) -> Option<RouteId> {
        let filter = unshared(filter);
        self.routes
            .iter()
            .find(|route| {
                route
                    .subscribe
                    .iter()
                    .any(|f| f == filter || topic::matches(f, filter))
            })
            .map(|route| route.id)
    }

    fn resolve_session(&self) -> Option<RouteId> {
        self.routes.iter().find(|route| route.session).map(|route| route.id)
    }
}
