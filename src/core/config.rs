use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::ext::KafkaAckMode;
use crate::mqtt::topic;

/// Top-level configuration for the gantry engines.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct GatewayConfig {
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub grpc: GrpcConfig,
    #[serde(default)]
    pub http_kafka: HttpKafkaConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TelemetryConfig {
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// Idle publish-only topic streams end after this long.
    #[serde(default = "default_publish_timeout_secs")]
    pub publish_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Upper bound on the session expiry a client may request; 0 means unlimited.
    #[serde(default)]
    pub session_expiry_interval_secs: u32,
    #[serde(default = "default_session_expiry_grace_period_secs")]
    pub session_expiry_grace_period_secs: u32,
    #[serde(default)]
    pub maximum_qos: u8,
    #[serde(default = "default_true")]
    pub retain_available: bool,
    #[serde(default = "default_true")]
    pub wildcard_subscription_available: bool,
    #[serde(default = "default_true")]
    pub subscription_identifiers_available: bool,
    #[serde(default)]
    pub shared_subscription_available: bool,
    #[serde(default = "default_true")]
    pub no_local: bool,
    /// Upper bound on the client topic alias maximum; 0 means unlimited.
    #[serde(default)]
    pub topic_alias_maximum: u32,
    /// Fixed client id assigned to every connection when set.
    #[serde(default)]
    pub client_id: Option<String>,
    /// Largest inbound packet accepted; 0 means unlimited.
    #[serde(default)]
    pub maximum_packet_size: u32,
    /// Window granted on network and application reply streams.
    #[serde(default = "default_initial_window")]
    pub initial_window: u32,
    #[serde(default)]
    pub routes: Vec<MqttRouteConfig>,
}

/// One MQTT route: topic filters it accepts publishes and subscribes for.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttRouteConfig {
    pub id: u64,
    #[serde(default)]
    pub publish: Vec<String>,
    #[serde(default)]
    pub subscribe: Vec<String>,
    /// Whether session state for connecting clients is sent to this route.
    #[serde(default)]
    pub session: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GrpcConfig {
    /// Services the health check reports as SERVING.
    #[serde(default)]
    pub health_services: Vec<String>,
    #[serde(default = "default_initial_window")]
    pub initial_window: u32,
    #[serde(default)]
    pub routes: Vec<GrpcRouteConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GrpcRouteConfig {
    pub id: u64,
    pub service: String,
    /// Any method of the service when absent.
    #[serde(default)]
    pub method: Option<String>,
    /// Metadata entries the request must carry.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpKafkaConfig {
    #[serde(default = "default_initial_window")]
    pub initial_window: u32,
    #[serde(default)]
    pub routes: Vec<HttpKafkaRouteConfig>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HttpKafkaCapabilityConfig {
    Fetch,
    Produce,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpKafkaRouteConfig {
    pub id: u64,
    /// HTTP method to match; any method when absent.
    #[serde(default)]
    pub method: Option<String>,
    /// Path template with `{param}` segments.
    pub path: String,
    pub capability: HttpKafkaCapabilityConfig,
    pub topic: String,
    /// Record key template for fetch filters and produced records.
    #[serde(default)]
    pub key: Option<String>,
    /// Header filters for fetch, values may use `{param}`.
    #[serde(default)]
    pub filters: HashMap<String, String>,
    /// Fetch every matching record as one framed body.
    #[serde(default)]
    pub merged: bool,
    #[serde(default)]
    pub merge: MergeFramingConfig,
    /// Topic correlated replies are fetched from.
    #[serde(default)]
    pub reply_to: Option<String>,
    /// Location template for async replies, may use `{correlationId}`.
    #[serde(default)]
    pub async_location: Option<String>,
    #[serde(default = "default_correlation_header")]
    pub correlation_header: String,
    /// Record header naming the reply topic on produced requests.
    #[serde(default = "default_reply_to_header")]
    pub reply_to_header: String,
    /// Request header supplying the idempotency key.
    #[serde(default = "default_idempotency_header")]
    pub idempotency_header: String,
    #[serde(default)]
    pub ack_mode: AckModeConfig,
    /// Upper bound on correlated reply waits.
    #[serde(default = "default_correlation_wait_secs")]
    pub wait_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergeFramingConfig {
    #[serde(default = "default_merge_content_type")]
    pub content_type: String,
    #[serde(default = "default_merge_header")]
    pub header: String,
    #[serde(default = "default_merge_separator")]
    pub separator: String,
    #[serde(default = "default_merge_trailer")]
    pub trailer: String,
}

impl Default for MergeFramingConfig {
    fn default() -> Self {
        Self {
            content_type: default_merge_content_type(),
            header: default_merge_header(),
            separator: default_merge_separator(),
            trailer: default_merge_trailer(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AckModeConfig {
    None,
    LeaderOnly,
    #[default]
    InSyncReplicas,
}

impl From<AckModeConfig> for KafkaAckMode {
    fn from(mode: AckModeConfig) -> Self {
        match mode {
            AckModeConfig::None => KafkaAckMode::None,
            AckModeConfig::LeaderOnly => KafkaAckMode::LeaderOnly,
            AckModeConfig::InSyncReplicas => KafkaAckMode::InSyncReplicas,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            publish_timeout_secs: default_publish_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            session_expiry_interval_secs: 0,
            session_expiry_grace_period_secs: default_session_expiry_grace_period_secs(),
            maximum_qos: 0,
            retain_available: true,
            wildcard_subscription_available: true,
            subscription_identifiers_available: true,
            shared_subscription_available: false,
            no_local: true,
            topic_alias_maximum: 0,
            client_id: None,
            maximum_packet_size: 0,
            initial_window: default_initial_window(),
            routes: Vec::new(),
        }
    }
}

impl Default for GrpcConfig {
    fn default() -> Self {
        Self {
            health_services: Vec::new(),
            initial_window: default_initial_window(),
            routes: Vec::new(),
        }
    }
}

impl Default for HttpKafkaConfig {
    fn default() -> Self {
        Self {
            initial_window: default_initial_window(),
            routes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// `tracing` filter directive for this level.
    pub fn directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => bail!("invalid telemetry.log_level {}", other),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from `GANTRY_CONFIG`, or `config/gantry.toml`,
    /// then apply `GANTRY_*` overrides.
    pub fn load_from_env() -> Result<Self> {
        Self::load_with_overrides(env_config_path())
    }

    /// Load a specific file, then apply `GANTRY_*` overrides.
    pub fn load_with_overrides(path: impl AsRef<Path>) -> Result<Self> {
        let mut cfg = Self::load(path)?;
        cfg.apply_env_overrides()?;
        Ok(cfg)
    }

    /// Load configuration from a specific file (TOML or JSON based on extension).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ref = path.as_ref();
        let data = fs::read_to_string(path_ref)
            .with_context(|| format!("unable to read config {}", path_ref.display()))?;
        Self::parse(path_ref, &data)
    }

    /// Parse configuration text, choosing JSON or TOML by the path's extension.
    pub fn parse(path: &Path, data: &str) -> Result<Self> {
        if is_json(path) {
            Ok(serde_json::from_str(data)
                .with_context(|| format!("invalid JSON config {}", path.display()))?)
        } else {
            Ok(toml::from_str(data)
                .with_context(|| format!("invalid TOML config {}", path.display()))?)
        }
    }

    pub fn log_level(&self) -> Result<LogLevel> {
        match &self.telemetry.log_level {
            Some(level) => LogLevel::from_str(level),
            None => Ok(LogLevel::Info),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.log_level()?;

        let mqtt = &self.mqtt;
        if mqtt.maximum_qos > 1 {
            bail!("mqtt.maximum_qos must be 0 or 1");
        }
        if mqtt.connect_timeout_secs == 0 {
            bail!("mqtt.connect_timeout_secs must be > 0");
        }
        if mqtt.initial_window == 0 {
            bail!("mqtt.initial_window must be > 0");
        }
        if let Some(client_id) = &mqtt.client_id {
            if client_id.is_empty() || client_id.len() > crate::mqtt::codec::MAX_CLIENT_ID_LENGTH {
                bail!("mqtt.client_id must be 1..=36 bytes");
            }
        }
        unique_ids("mqtt.routes", mqtt.routes.iter().map(|r| r.id))?;
        for route in &mqtt.routes {
            for filter in route.publish.iter().chain(&route.subscribe) {
                if !topic::is_valid_filter(filter) {
                    bail!("mqtt route {} has invalid topic filter {:?}", route.id, filter);
                }
            }
        }
        if mqtt.routes.iter().filter(|r| r.session).count() > 1 {
            bail!("at most one mqtt route may accept sessions");
        }

        unique_ids("grpc.routes", self.grpc.routes.iter().map(|r| r.id))?;
        for route in &self.grpc.routes {
            if route.service.is_empty() {
                bail!("grpc route {} must name a service", route.id);
            }
        }

        unique_ids("http_kafka.routes", self.http_kafka.routes.iter().map(|r| r.id))?;
        for route in &self.http_kafka.routes {
            if !route.path.starts_with('/') {
                bail!("http_kafka route {} path must start with '/'", route.id);
            }
            if route.topic.is_empty() {
                bail!("http_kafka route {} must name a topic", route.id);
            }
            if route.async_location.is_some() && route.reply_to.is_none() {
                bail!("http_kafka route {} async_location requires reply_to", route.id);
            }
            if route.capability == HttpKafkaCapabilityConfig::Fetch && route.reply_to.is_some() {
                bail!("http_kafka route {} reply_to only applies to produce", route.id);
            }
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(level) = std::env::var("GANTRY_LOG_LEVEL") {
            self.telemetry.log_level = Some(level);
        }
        if let Ok(client_id) = std::env::var("GANTRY_MQTT_CLIENT_ID") {
            self.mqtt.client_id = Some(client_id);
        }
        if let Ok(timeout) = std::env::var("GANTRY_MQTT_CONNECT_TIMEOUT_SECS") {
            self.mqtt.connect_timeout_secs = timeout
                .parse()
                .with_context(|| format!("invalid GANTRY_MQTT_CONNECT_TIMEOUT_SECS {timeout}"))?;
        }
        Ok(())
    }
}

fn unique_ids(section: &str, ids: impl Iterator<Item = u64>) -> Result<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if id == 0 {
            bail!("{section} ids must be > 0");
        }
        if !seen.insert(id) {
            bail!("{section} id {id} is duplicated");
        }
    }
    Ok(())
}

fn env_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("GANTRY_CONFIG") {
        PathBuf::from(path)
    } else {
        PathBuf::from("config/gantry.toml")
    }
}

fn is_json(path: &Path) -> bool {
    matches!(path.extension().and_then(|s| s.to_str()), Some("json"))
}

fn default_true() -> bool {
    true
}

fn default_publish_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    3
}

fn default_session_expiry_grace_period_secs() -> u32 {
    30
}

fn default_initial_window() -> u32 {
    64 * 1024
}

fn default_correlation_header() -> String {
    "correlation-id".into()
}

fn default_reply_to_header() -> String {
    "reply-to".into()
}

fn default_idempotency_header() -> String {
    "idempotency-key".into()
}

fn default_correlation_wait_secs() -> u64 {
    60
}

fn default_merge_content_type() -> String {
    "application/json".into()
}

fn default_merge_header() -> String {
    "[".into()
}

fn default_merge_separator() -> String {
    ",".into()
}

fn default_merge_trailer() -> String {
    "]".into()
}
