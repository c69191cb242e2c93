//! Session-state record published on the session stream, and the will
//! message metadata carried by the will stream.

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::codec::WillMessage;
use crate::ext::{MqttDataEx, PUBLISH_RETAIN};

/// Reserved topic carrying a client's session state.
pub fn session_topic(client_id: &str) -> String {
    format!("$SYS/sessions/{client_id}")
}

/// Reserved topic the will stream is opened for.
pub fn will_topic(client_id: &str) -> String {
    format!("$SYS/sessions/{client_id}/will")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    /// Epoch millis after which the session may be discarded.
    pub expires_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub will_delay: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub will_topic: Option<String>,
}

impl SessionState {
    pub fn new(now_millis: i64, session_expiry_secs: u32, will: Option<&WillMessage>) -> Self {
        Self {
            expires_at: now_millis + i64::from(session_expiry_secs) * 1000,
            will_delay: will.map(|w| w.delay),
            will_topic: will.map(|w| w.topic.clone()),
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let json = serde_json::to_vec(self).context("encode session state")?;
        Ok(Bytes::from(json))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("decode session state")
    }
}

/// Application message metadata for publishing a will.
pub fn will_data_ex(will: &WillMessage) -> MqttDataEx {
    MqttDataEx {
        topic: Some(will.topic.clone()),
        flags: if will.retain { PUBLISH_RETAIN } else { 0 },
        expiry: will.expiry,
        content_type: will.content_type.clone(),
        format: will.format,
        response_topic: will.response_topic.clone(),
        correlation: will.correlation.clone(),
        user_properties: will.user_properties.clone(),
        ..MqttDataEx::default()
    }
}
