//! MQTT stream metadata exchanged with the application side.

use bitflags::bitflags;
use bytes::Bytes;

bitflags! {
    /// What an application stream opened for a topic is used for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct Capabilities: u8 {
        const PUBLISH_ONLY = 0b0001;
        const SUBSCRIBE_ONLY = 0b0010;
        const SESSION = 0b0100;
    }
}

bitflags! {
    /// Subscription options carried on BEGIN and FLUSH.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct SubscribeFlags: u8 {
        const SEND_RETAINED = 0b0001;
        const RETAIN_AS_PUBLISHED = 0b0010;
        const NO_LOCAL = 0b0100;
    }
}

/// PUBLISH flag bit for retained messages, as in the MQTT fixed header.
pub const PUBLISH_RETAIN: u8 = 0b0001;

/// Payload format indicator (MQTT property 0x01).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadFormat {
    #[default]
    Binary,
    Text,
}

impl PayloadFormat {
    pub fn from_u8(value: u8) -> Self {
        if value == 1 {
            PayloadFormat::Text
        } else {
            PayloadFormat::Binary
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            PayloadFormat::Binary => 0,
            PayloadFormat::Text => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProperty {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MqttBeginEx {
    pub capabilities: Capabilities,
    pub client_id: String,
    pub topic: String,
    pub flags: SubscribeFlags,
    pub subscription_id: u32,
}

/// Per-message metadata for a publish in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttDataEx {
    /// Topic name, absent when the stream topic applies.
    pub topic: Option<String>,
    pub flags: u8,
    /// Message expiry in seconds, `-1` when unset.
    pub expiry: i32,
    pub content_type: Option<String>,
    pub format: PayloadFormat,
    pub response_topic: Option<String>,
    pub correlation: Option<Bytes>,
    pub user_properties: Vec<UserProperty>,
    pub subscription_ids: Vec<u32>,
    /// Payload bytes still to follow in later DATA frames of the same message.
    pub deferred: u32,
}

impl Default for MqttDataEx {
    fn default() -> Self {
        Self {
            topic: None,
            flags: 0,
            expiry: -1,
            content_type: None,
            format: PayloadFormat::Binary,
            response_topic: None,
            correlation: None,
            user_properties: Vec::new(),
            subscription_ids: Vec::new(),
            deferred: 0,
        }
    }
}

impl MqttDataEx {
    pub fn retain(&self) -> bool {
        self.flags & PUBLISH_RETAIN != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MqttFlushEx {
    pub capabilities: Capabilities,
    pub flags: SubscribeFlags,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_combine_and_clear() {
        let mut caps = Capabilities::PUBLISH_ONLY;
        caps |= Capabilities::SUBSCRIBE_ONLY;
        assert!(caps.contains(Capabilities::PUBLISH_ONLY | Capabilities::SUBSCRIBE_ONLY));
        caps.remove(Capabilities::PUBLISH_ONLY);
        assert_eq!(caps, Capabilities::SUBSCRIBE_ONLY);
    }

    #[test]
    fn data_ex_defaults_to_unset_expiry() {
        let ex = MqttDataEx::default();
        assert_eq!(ex.expiry, -1);
        assert!(!ex.retain());
    }

    #[test]
    fn payload_format_maps_text_only_for_one() {
        assert_eq!(PayloadFormat::from_u8(1), PayloadFormat::Text);
        assert_eq!(PayloadFormat::from_u8(0), PayloadFormat::Binary);
        assert_eq!(PayloadFormat::from_u8(7), PayloadFormat::Binary);
    }
}
