//! MQTT v5 reason codes used by the server engine.

/// A reason code as it appears on the wire.
pub type ReasonCode = u8;

pub struct ReasonCodes;

impl ReasonCodes {
    pub const SUCCESS: u8 = 0x00;
    pub const NORMAL_DISCONNECTION: u8 = 0x00;
    pub const GRANTED_QOS_1: u8 = 0x01;
    pub const DISCONNECT_WITH_WILL_MESSAGE: u8 = 0x04;
    pub const NO_SUBSCRIPTION_EXISTED: u8 = 0x11;
    pub const UNSPECIFIED_ERROR: u8 = 0x80;
    pub const MALFORMED_PACKET: u8 = 0x81;
    pub const PROTOCOL_ERROR: u8 = 0x82;
    pub const IMPLEMENTATION_SPECIFIC_ERROR: u8 = 0x83;
    pub const UNSUPPORTED_PROTOCOL_VERSION: u8 = 0x84;
    pub const CLIENT_IDENTIFIER_NOT_VALID: u8 = 0x85;
    pub const BAD_USER_NAME_OR_PASSWORD: u8 = 0x86;
    pub const NOT_AUTHORIZED: u8 = 0x87;
    pub const SERVER_UNAVAILABLE: u8 = 0x88;
    pub const SERVER_BUSY: u8 = 0x89;
    pub const SERVER_SHUTTING_DOWN: u8 = 0x8B;
    pub const BAD_AUTHENTICATION_METHOD: u8 = 0x8C;
    pub const KEEP_ALIVE_TIMEOUT: u8 = 0x8D;
    pub const SESSION_TAKEN_OVER: u8 = 0x8E;
    pub const TOPIC_FILTER_INVALID: u8 = 0x8F;
    pub const TOPIC_NAME_INVALID: u8 = 0x90;
    pub const RECEIVE_MAXIMUM_EXCEEDED: u8 = 0x93;
    pub const TOPIC_ALIAS_INVALID: u8 = 0x94;
    pub const PACKET_TOO_LARGE: u8 = 0x95;
    pub const QUOTA_EXCEEDED: u8 = 0x97;
    pub const PAYLOAD_FORMAT_INVALID: u8 = 0x99;
    pub const RETAIN_NOT_SUPPORTED: u8 = 0x9A;
    pub const QOS_NOT_SUPPORTED: u8 = 0x9B;
    pub const SHARED_SUBSCRIPTIONS_NOT_SUPPORTED: u8 = 0x9E;
    pub const SUBSCRIPTION_IDENTIFIERS_NOT_SUPPORTED: u8 = 0xA1;
    pub const WILDCARD_SUBSCRIPTIONS_NOT_SUPPORTED: u8 = 0xA2;
}

/// Human readable name for logs.
pub fn reason_name(code: ReasonCode) -> &'static str {
    match code {
        0x00 => "SUCCESS",
        0x01 => "GRANTED_QOS_1",
        0x04 => "DISCONNECT_WITH_WILL_MESSAGE",
        0x11 => "NO_SUBSCRIPTION_EXISTED",
        0x80 => "UNSPECIFIED_ERROR",
        0x81 => "MALFORMED_PACKET",
        0x82 => "PROTOCOL_ERROR",
        0x83 => "IMPLEMENTATION_SPECIFIC_ERROR",
        0x84 => "UNSUPPORTED_PROTOCOL_VERSION",
        0x85 => "CLIENT_IDENTIFIER_NOT_VALID",
        0x86 => "BAD_USER_NAME_OR_PASSWORD",
        0x87 => "NOT_AUTHORIZED",
        0x88 => "SERVER_UNAVAILABLE",
        0x89 => "SERVER_BUSY",
        0x8B => "SERVER_SHUTTING_DOWN",
        0x8C => "BAD_AUTHENTICATION_METHOD",
        0x8D => "KEEP_ALIVE_TIMEOUT",
        0x8E => "SESSION_TAKEN_OVER",
        0x8F => "TOPIC_FILTER_INVALID",
        0x90 => "TOPIC_NAME_INVALID",
        0x93 => "RECEIVE_MAXIMUM_EXCEEDED",
        0x94 => "TOPIC_ALIAS_INVALID",
        0x95 => "PACKET_TOO_LARGE",
        0x97 => "QUOTA_EXCEEDED",
        0x99 => "PAYLOAD_FORMAT_INVALID",
        0x9A => "RETAIN_NOT_SUPPORTED",
        0x9B => "QOS_NOT_SUPPORTED",
        0x9E => "SHARED_SUBSCRIPTIONS_NOT_SUPPORTED",
        0xA1 => "SUBSCRIPTION_IDENTIFIERS_NOT_SUPPORTED",
        0xA2 => "WILDCARD_SUBSCRIPTIONS_NOT_SUPPORTED",
        _ => "UNKNOWN",
    }
}

/// Whether a code reports failure (`>= 0x80`).
pub fn is_failure(code: ReasonCode) -> bool {
    code >= 0x80
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_codes_start_at_0x80() {
        assert!(!is_failure(ReasonCodes::SUCCESS));
        assert!(!is_failure(ReasonCodes::NO_SUBSCRIPTION_EXISTED));
        assert!(is_failure(ReasonCodes::UNSPECIFIED_ERROR));
        assert!(is_failure(ReasonCodes::TOPIC_FILTER_INVALID));
    }

    #[test]
    fn names_cover_disconnect_reasons() {
        assert_eq!(reason_name(ReasonCodes::KEEP_ALIVE_TIMEOUT), "KEEP_ALIVE_TIMEOUT");
        assert_eq!(reason_name(ReasonCodes::PROTOCOL_ERROR), "PROTOCOL_ERROR");
        assert_eq!(reason_name(0x7F), "UNKNOWN");
    }
}
