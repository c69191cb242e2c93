//! MQTT v5 wire codec: fixed header peeking, packet body decoding and the
//! server-side packet encoders.
//!
//! Decoders work on a complete packet body and report failures as reason
//! codes, so the caller can answer with the matching CONNACK or DISCONNECT.

use bytes::{BufMut, Bytes, BytesMut};

use super::reason::{ReasonCode, ReasonCodes};
use super::topic;
use crate::ext::{MqttDataEx, PayloadFormat, UserProperty};

pub const PROTOCOL_NAME: &str = "MQTT";
pub const PROTOCOL_VERSION: u8 = 5;
pub const MAX_CLIENT_ID_LENGTH: usize = 36;

pub const CONNECT_RESERVED: u8 = 0x01;
pub const CONNECT_CLEAN_START: u8 = 0x02;
pub const CONNECT_WILL_FLAG: u8 = 0x04;
pub const CONNECT_WILL_QOS: u8 = 0x18;
pub const CONNECT_WILL_RETAIN: u8 = 0x20;
pub const CONNECT_BASIC_AUTH: u8 = 0xC0;

pub const SUBSCRIBE_QOS: u8 = 0x03;
pub const SUBSCRIBE_NO_LOCAL: u8 = 0x04;
pub const SUBSCRIBE_RETAIN_AS_PUBLISHED: u8 = 0x08;
pub const SUBSCRIBE_RETAIN_HANDLING: u8 = 0x30;
const SUBSCRIBE_RESERVED: u8 = 0xC0;

const PROP_PAYLOAD_FORMAT: u8 = 0x01;
const PROP_MESSAGE_EXPIRY: u8 = 0x02;
const PROP_CONTENT_TYPE: u8 = 0x03;
const PROP_RESPONSE_TOPIC: u8 = 0x08;
const PROP_CORRELATION_DATA: u8 = 0x09;
const PROP_SUBSCRIPTION_ID: u8 = 0x0B;
const PROP_SESSION_EXPIRY: u8 = 0x11;
const PROP_ASSIGNED_CLIENT_ID: u8 = 0x12;
const PROP_AUTHENTICATION_METHOD: u8 = 0x15;
const PROP_AUTHENTICATION_DATA: u8 = 0x16;
const PROP_REQUEST_PROBLEM_INFO: u8 = 0x17;
const PROP_WILL_DELAY: u8 = 0x18;
const PROP_REQUEST_RESPONSE_INFO: u8 = 0x19;
const PROP_SERVER_REFERENCE: u8 = 0x1C;
const PROP_REASON_STRING: u8 = 0x1F;
const PROP_RECEIVE_MAXIMUM: u8 = 0x21;
const PROP_TOPIC_ALIAS_MAXIMUM: u8 = 0x22;
const PROP_TOPIC_ALIAS: u8 = 0x23;
const PROP_MAXIMUM_QOS: u8 = 0x24;
const PROP_RETAIN_AVAILABLE: u8 = 0x25;
const PROP_USER_PROPERTY: u8 = 0x26;
const PROP_MAXIMUM_PACKET_SIZE: u8 = 0x27;
const PROP_WILDCARD_AVAILABLE: u8 = 0x28;
const PROP_SUBSCRIPTION_IDS_AVAILABLE: u8 = 0x29;
const PROP_SHARED_AVAILABLE: u8 = 0x2A;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Connect,
    ConnAck,
    Publish,
    PubAck,
    PubRec,
    PubRel,
    PubComp,
    Subscribe,
    SubAck,
    Unsubscribe,
    UnsubAck,
    PingReq,
    PingResp,
    Disconnect,
    Auth,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => PacketType::Connect,
            2 => PacketType::ConnAck,
            3 => PacketType::Publish,
            4 => PacketType::PubAck,
            5 => PacketType::PubRec,
            6 => PacketType::PubRel,
            7 => PacketType::PubComp,
            8 => PacketType::Subscribe,
            9 => PacketType::SubAck,
            10 => PacketType::Unsubscribe,
            11 => PacketType::UnsubAck,
            12 => PacketType::PingReq,
            13 => PacketType::PingResp,
            14 => PacketType::Disconnect,
            15 => PacketType::Auth,
            _ => return None,
        })
    }
}

/// Type, flags and remaining length of one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub type_and_flags: u8,
    pub remaining_length: usize,
    pub header_length: usize,
}

impl FixedHeader {
    pub fn packet_type(&self) -> Option<PacketType> {
        PacketType::from_u8(self.type_and_flags >> 4)
    }

    pub fn flags(&self) -> u8 {
        self.type_and_flags & 0x0F
    }

    pub fn packet_length(&self) -> usize {
        self.header_length + self.remaining_length
    }
}

/// Peek the fixed header at the start of `buf` without consuming anything.
///
/// `Ok(None)` means the remaining length is not yet fully buffered.
pub fn peek_fixed_header(buf: &[u8]) -> Result<Option<FixedHeader>, ReasonCode> {
    let Some(&type_and_flags) = buf.first() else {
        return Ok(None);
    };
    let mut value = 0usize;
    for index in 1..=4 {
        let Some(&byte) = buf.get(index) else {
            return Ok(None);
        };
        value |= ((byte & 0x7F) as usize) << (7 * (index - 1));
        if byte & 0x80 == 0 {
            return Ok(Some(FixedHeader {
                type_and_flags,
                remaining_length: value,
                header_length: index + 1,
            }));
        }
    }
    Err(ReasonCodes::MALFORMED_PACKET)
}

pub fn read_u8(buf: &[u8], cursor: &mut usize) -> Result<u8, ReasonCode> {
    let value = *buf.get(*cursor).ok_or(ReasonCodes::MALFORMED_PACKET)?;
    *cursor += 1;
    Ok(value)
}

pub fn read_u16(buf: &[u8], cursor: &mut usize) -> Result<u16, ReasonCode> {
    let bytes = buf
        .get(*cursor..*cursor + 2)
        .ok_or(ReasonCodes::MALFORMED_PACKET)?;
    *cursor += 2;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

pub fn read_u32(buf: &[u8], cursor: &mut usize) -> Result<u32, ReasonCode> {
    let bytes = buf
        .get(*cursor..*cursor + 4)
        .ok_or(ReasonCodes::MALFORMED_PACKET)?;
    *cursor += 4;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub fn read_string(buf: &[u8], cursor: &mut usize) -> Result<String, ReasonCode> {
    let len = read_u16(buf, cursor)? as usize;
    let bytes = buf
        .get(*cursor..*cursor + len)
        .ok_or(ReasonCodes::MALFORMED_PACKET)?;
    let value = std::str::from_utf8(bytes).map_err(|_| ReasonCodes::MALFORMED_PACKET)?;
    if value.contains('\u{0}') {
        return Err(ReasonCodes::MALFORMED_PACKET);
    }
    *cursor += len;
    Ok(value.to_string())
}

pub fn read_binary(buf: &[u8], cursor: &mut usize) -> Result<Bytes, ReasonCode> {
    let len = read_u16(buf, cursor)? as usize;
    let bytes = buf
        .get(*cursor..*cursor + len)
        .ok_or(ReasonCodes::MALFORMED_PACKET)?;
    *cursor += len;
    Ok(Bytes::copy_from_slice(bytes))
}

/// Variable byte integer, at most four bytes.
pub fn read_varint(buf: &[u8], cursor: &mut usize) -> Result<u32, ReasonCode> {
    let mut value = 0u32;
    for shift in [0u32, 7, 14, 21] {
        let byte = read_u8(buf, cursor)?;
        value |= ((byte & 0x7F) as u32) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(ReasonCodes::MALFORMED_PACKET)
}

fn read_user_property(buf: &[u8], cursor: &mut usize) -> Result<UserProperty, ReasonCode> {
    let key = read_string(buf, cursor)?;
    let value = read_string(buf, cursor)?;
    Ok(UserProperty { key, value })
}

/// Read the property length and return where the property list ends.
fn properties_end(buf: &[u8], cursor: &mut usize) -> Result<usize, ReasonCode> {
    let len = read_varint(buf, cursor)? as usize;
    let end = cursor
        .checked_add(len)
        .ok_or(ReasonCodes::MALFORMED_PACKET)?;
    if end > buf.len() {
        return Err(ReasonCodes::MALFORMED_PACKET);
    }
    Ok(end)
}

/// Seen-property bitmask; a repeated property is a protocol error.
#[derive(Debug, Default)]
struct PropertyMask(u64);

impl PropertyMask {
    fn mark(&mut self, id: u8) -> Result<(), ReasonCode> {
        let bit = 1u64 << (id & 0x3F);
        if self.0 & bit != 0 {
            return Err(ReasonCodes::PROTOCOL_ERROR);
        }
        self.0 |= bit;
        Ok(())
    }
}

fn check_format(format: PayloadFormat, payload: &[u8]) -> Result<(), ReasonCode> {
    if format == PayloadFormat::Text && std::str::from_utf8(payload).is_err() {
        return Err(ReasonCodes::PAYLOAD_FORMAT_INVALID);
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: u8,
    pub retain: bool,
    pub delay: u32,
    pub format: PayloadFormat,
    /// Message expiry in seconds, `-1` when unset.
    pub expiry: i32,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation: Option<Bytes>,
    pub user_properties: Vec<UserProperty>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPacket {
    pub flags: u8,
    pub keep_alive: u16,
    pub session_expiry: u32,
    pub receive_maximum: u16,
    pub maximum_packet_size: u32,
    pub topic_alias_maximum: u16,
    pub user_properties: Vec<UserProperty>,
    pub client_id: String,
    pub will: Option<WillMessage>,
}

impl ConnectPacket {
    pub fn clean_start(&self) -> bool {
        self.flags & CONNECT_CLEAN_START != 0
    }
}

pub fn decode_connect(body: &[u8]) -> Result<ConnectPacket, ReasonCode> {
    let mut cursor = 0usize;
    let name = read_string(body, &mut cursor)?;
    let version = read_u8(body, &mut cursor)?;
    if name != PROTOCOL_NAME || version != PROTOCOL_VERSION {
        return Err(ReasonCodes::UNSUPPORTED_PROTOCOL_VERSION);
    }
    let flags = read_u8(body, &mut cursor)?;
    if flags & CONNECT_RESERVED != 0 {
        return Err(ReasonCodes::MALFORMED_PACKET);
    }
    let keep_alive = read_u16(body, &mut cursor)?;

    let mut packet = ConnectPacket {
        flags,
        keep_alive,
        session_expiry: 0,
        receive_maximum: u16::MAX,
        maximum_packet_size: u32::MAX,
        topic_alias_maximum: 0,
        user_properties: Vec::new(),
        client_id: String::new(),
        will: None,
    };

    let props_end = properties_end(body, &mut cursor)?;
    let mut seen = PropertyMask::default();
    while cursor < props_end {
        let id = read_u8(body, &mut cursor)?;
        if id != PROP_USER_PROPERTY {
            seen.mark(id)?;
        }
        match id {
            PROP_SESSION_EXPIRY => packet.session_expiry = read_u32(body, &mut cursor)?,
            PROP_RECEIVE_MAXIMUM => {
                packet.receive_maximum = read_u16(body, &mut cursor)?;
                if packet.receive_maximum == 0 {
                    return Err(ReasonCodes::PROTOCOL_ERROR);
                }
            }
            PROP_MAXIMUM_PACKET_SIZE => {
                packet.maximum_packet_size = read_u32(body, &mut cursor)?;
                if packet.maximum_packet_size == 0 {
                    return Err(ReasonCodes::PROTOCOL_ERROR);
                }
            }
            PROP_TOPIC_ALIAS_MAXIMUM => packet.topic_alias_maximum = read_u16(body, &mut cursor)?,
            PROP_REQUEST_PROBLEM_INFO | PROP_REQUEST_RESPONSE_INFO => {
                if read_u8(body, &mut cursor)? > 1 {
                    return Err(ReasonCodes::PROTOCOL_ERROR);
                }
            }
            PROP_USER_PROPERTY => packet
                .user_properties
                .push(read_user_property(body, &mut cursor)?),
            PROP_AUTHENTICATION_METHOD | PROP_AUTHENTICATION_DATA => {
                return Err(ReasonCodes::BAD_AUTHENTICATION_METHOD)
            }
            _ => return Err(ReasonCodes::MALFORMED_PACKET),
        }
    }
    if cursor != props_end {
        return Err(ReasonCodes::MALFORMED_PACKET);
    }

    packet.client_id = read_string(body, &mut cursor)?;
    if packet.client_id.len() > MAX_CLIENT_ID_LENGTH {
        return Err(ReasonCodes::CLIENT_IDENTIFIER_NOT_VALID);
    }

    if flags & CONNECT_WILL_FLAG != 0 {
        let qos = (flags & CONNECT_WILL_QOS) >> 3;
        if qos > 2 {
            return Err(ReasonCodes::MALFORMED_PACKET);
        }
        packet.will = Some(decode_will(body, &mut cursor, qos, flags & CONNECT_WILL_RETAIN != 0)?);
    } else if flags & (CONNECT_WILL_QOS | CONNECT_WILL_RETAIN) != 0 {
        return Err(ReasonCodes::MALFORMED_PACKET);
    }

    if flags & CONNECT_BASIC_AUTH != 0 {
        return Err(ReasonCodes::NOT_AUTHORIZED);
    }
    if cursor != body.len() {
        return Err(ReasonCodes::MALFORMED_PACKET);
    }
    Ok(packet)
}

fn decode_will(
    body: &[u8],
    cursor: &mut usize,
    qos: u8,
    retain: bool,
) -> Result<WillMessage, ReasonCode> {
    let mut will = WillMessage {
        topic: String::new(),
        payload: Bytes::new(),
        qos,
        retain,
        delay: 0,
        format: PayloadFormat::Binary,
        expiry: -1,
        content_type: None,
        response_topic: None,
        correlation: None,
        user_properties: Vec::new(),
    };
    let props_end = properties_end(body, cursor)?;
    let mut seen = PropertyMask::default();
    while *cursor < props_end {
        let id = read_u8(body, cursor)?;
        if id != PROP_USER_PROPERTY {
            seen.mark(id)?;
        }
        match id {
            PROP_WILL_DELAY => will.delay = read_u32(body, cursor)?,
            PROP_PAYLOAD_FORMAT => will.format = PayloadFormat::from_u8(read_u8(body, cursor)?),
            PROP_MESSAGE_EXPIRY => {
                will.expiry = i32::try_from(read_u32(body, cursor)?).unwrap_or(i32::MAX)
            }
            PROP_CONTENT_TYPE => will.content_type = Some(read_string(body, cursor)?),
            PROP_RESPONSE_TOPIC => will.response_topic = Some(read_string(body, cursor)?),
            PROP_CORRELATION_DATA => will.correlation = Some(read_binary(body, cursor)?),
            PROP_USER_PROPERTY => will.user_properties.push(read_user_property(body, cursor)?),
            _ => return Err(ReasonCodes::MALFORMED_PACKET),
        }
    }
    if *cursor != props_end {
        return Err(ReasonCodes::MALFORMED_PACKET);
    }
    will.topic = read_string(body, cursor)?;
    if !topic::is_valid_name(&will.topic) {
        return Err(ReasonCodes::TOPIC_NAME_INVALID);
    }
    will.payload = read_binary(body, cursor)?;
    check_format(will.format, &will.payload)?;
    Ok(will)
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PublishProperties {
    pub format: PayloadFormat,
    pub expiry: Option<u32>,
    pub content_type: Option<String>,
    pub response_topic: Option<String>,
    pub correlation: Option<Bytes>,
    pub topic_alias: Option<u16>,
    pub user_properties: Vec<UserProperty>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishPacket {
    pub qos: u8,
    pub dup: bool,
    pub retain: bool,
    /// Empty when the publish relies on a topic alias.
    pub topic: String,
    pub packet_id: Option<u16>,
    pub properties: PublishProperties,
    pub payload: Bytes,
}

pub fn decode_publish(flags: u8, body: &[u8]) -> Result<PublishPacket, ReasonCode> {
    let qos = (flags >> 1) & 0x03;
    let dup = flags & 0x08 != 0;
    let retain = flags & 0x01 != 0;
    if qos > 2 || (qos == 0 && dup) {
        return Err(ReasonCodes::MALFORMED_PACKET);
    }

    let mut cursor = 0usize;
    let topic = read_string(body, &mut cursor)?;
    if !topic.is_empty() && !topic::is_valid_name(&topic) {
        return Err(ReasonCodes::TOPIC_NAME_INVALID);
    }
    let packet_id = if qos > 0 {
        let id = read_u16(body, &mut cursor)?;
        if id == 0 {
            return Err(ReasonCodes::PROTOCOL_ERROR);
        }
        Some(id)
    } else {
        None
    };

    let mut properties = PublishProperties::default();
    let props_end = properties_end(body, &mut cursor)?;
    let mut seen = PropertyMask::default();
    while cursor < props_end {
        let id = read_u8(body, &mut cursor)?;
        if id != PROP_USER_PROPERTY {
            seen.mark(id)?;
        }
        match id {
            PROP_PAYLOAD_FORMAT => {
                properties.format = PayloadFormat::from_u8(read_u8(body, &mut cursor)?)
            }
            PROP_MESSAGE_EXPIRY => properties.expiry = Some(read_u32(body, &mut cursor)?),
            PROP_CONTENT_TYPE => properties.content_type = Some(read_string(body, &mut cursor)?),
            PROP_RESPONSE_TOPIC => {
                let response = read_string(body, &mut cursor)?;
                if !topic::is_valid_name(&response) {
                    return Err(ReasonCodes::PROTOCOL_ERROR);
                }
                properties.response_topic = Some(response);
            }
            PROP_CORRELATION_DATA => properties.correlation = Some(read_binary(body, &mut cursor)?),
            PROP_TOPIC_ALIAS => properties.topic_alias = Some(read_u16(body, &mut cursor)?),
            PROP_USER_PROPERTY => properties
                .user_properties
                .push(read_user_property(body, &mut cursor)?),
            PROP_SUBSCRIPTION_ID => return Err(ReasonCodes::PROTOCOL_ERROR),
            _ => return Err(ReasonCodes::MALFORMED_PACKET),
        }
    }
    if cursor != props_end {
        return Err(ReasonCodes::MALFORMED_PACKET);
    }

    let payload = &body[cursor..];
    check_format(properties.format, payload)?;
    Ok(PublishPacket {
        qos,
        dup,
        retain,
        topic,
        packet_id,
        properties,
        payload: Bytes::copy_from_slice(payload),
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeFilter {
    pub filter: String,
    pub options: u8,
}

impl SubscribeFilter {
    pub fn qos(&self) -> u8 {
        self.options & SUBSCRIBE_QOS
    }

    pub fn no_local(&self) -> bool {
        self.options & SUBSCRIBE_NO_LOCAL != 0
    }

    pub fn retain_as_published(&self) -> bool {
        self.options & SUBSCRIBE_RETAIN_AS_PUBLISHED != 0
    }

    /// 0 sends retained messages, 1 only for new subscriptions, 2 never.
    pub fn retain_handling(&self) -> u8 {
        (self.options & SUBSCRIBE_RETAIN_HANDLING) >> 4
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribePacket {
    pub packet_id: u16,
    pub subscription_id: Option<u32>,
    pub user_properties: Vec<UserProperty>,
    pub filters: Vec<SubscribeFilter>,
}

pub fn decode_subscribe(flags: u8, body: &[u8]) -> Result<SubscribePacket, ReasonCode> {
    if flags != 0x02 {
        return Err(ReasonCodes::MALFORMED_PACKET);
    }
    let mut cursor = 0usize;
    let packet_id = read_u16(body, &mut cursor)?;
    let mut subscription_id = None;
    let mut user_properties = Vec::new();

    let props_end = properties_end(body, &mut cursor)?;
    let mut seen = PropertyMask::default();
    while cursor < props_end {
        let id = read_u8(body, &mut cursor)?;
        if id != PROP_USER_PROPERTY {
            seen.mark(id)?;
        }
        match id {
            PROP_SUBSCRIPTION_ID => {
                let value = read_varint(body, &mut cursor)?;
                if value == 0 {
                    return Err(ReasonCodes::PROTOCOL_ERROR);
                }
                subscription_id = Some(value);
            }
            PROP_USER_PROPERTY => user_properties.push(read_user_property(body, &mut cursor)?),
            _ => return Err(ReasonCodes::MALFORMED_PACKET),
        }
    }
    if cursor != props_end {
        return Err(ReasonCodes::MALFORMED_PACKET);
    }

    let mut filters = Vec::new();
    while cursor < body.len() {
        let filter = read_string(body, &mut cursor)?;
        let options = read_u8(body, &mut cursor)?;
        if options & SUBSCRIBE_RESERVED != 0
            || options & SUBSCRIBE_QOS == 0x03
            || options & SUBSCRIBE_RETAIN_HANDLING == SUBSCRIBE_RETAIN_HANDLING
        {
            return Err(ReasonCodes::MALFORMED_PACKET);
        }
        filters.push(SubscribeFilter { filter, options });
    }
    if filters.is_empty() {
        return Err(ReasonCodes::PROTOCOL_ERROR);
    }
    Ok(SubscribePacket {
        packet_id,
        subscription_id,
        user_properties,
        filters,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribePacket {
    pub packet_id: u16,
    pub user_properties: Vec<UserProperty>,
    pub filters: Vec<String>,
}

pub fn decode_unsubscribe(flags: u8, body: &[u8]) -> Result<UnsubscribePacket, ReasonCode> {
    if flags != 0x02 {
        return Err(ReasonCodes::MALFORMED_PACKET);
    }
    let mut cursor = 0usize;
    let packet_id = read_u16(body, &mut cursor)?;
    let mut user_properties = Vec::new();
    let props_end = properties_end(body, &mut cursor)?;
    while cursor < props_end {
        match read_u8(body, &mut cursor)? {
            PROP_USER_PROPERTY => user_properties.push(read_user_property(body, &mut cursor)?),
            _ => return Err(ReasonCodes::MALFORMED_PACKET),
        }
    }
    if cursor != props_end {
        return Err(ReasonCodes::MALFORMED_PACKET);
    }
    let mut filters = Vec::new();
    while cursor < body.len() {
        filters.push(read_string(body, &mut cursor)?);
    }
    if filters.is_empty() {
        return Err(ReasonCodes::PROTOCOL_ERROR);
    }
    Ok(UnsubscribePacket {
        packet_id,
        user_properties,
        filters,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DisconnectPacket {
    pub reason: ReasonCode,
    pub session_expiry: Option<u32>,
    pub reason_string: Option<String>,
}

pub fn decode_disconnect(flags: u8, body: &[u8]) -> Result<DisconnectPacket, ReasonCode> {
    if flags != 0 {
        return Err(ReasonCodes::MALFORMED_PACKET);
    }
    let mut packet = DisconnectPacket::default();
    if body.is_empty() {
        return Ok(packet);
    }
    let mut cursor = 0usize;
    packet.reason = read_u8(body, &mut cursor)?;
    if cursor == body.len() {
        return Ok(packet);
    }
    let props_end = properties_end(body, &mut cursor)?;
    let mut seen = PropertyMask::default();
    while cursor < props_end {
        let id = read_u8(body, &mut cursor)?;
        if id != PROP_USER_PROPERTY {
            seen.mark(id)?;
        }
        match id {
            PROP_SESSION_EXPIRY => packet.session_expiry = Some(read_u32(body, &mut cursor)?),
            PROP_REASON_STRING => packet.reason_string = Some(read_string(body, &mut cursor)?),
            PROP_SERVER_REFERENCE => {
                read_string(body, &mut cursor)?;
            }
            PROP_USER_PROPERTY => {
                read_user_property(body, &mut cursor)?;
            }
            _ => return Err(ReasonCodes::MALFORMED_PACKET),
        }
    }
    if cursor != props_end || cursor != body.len() {
        return Err(ReasonCodes::MALFORMED_PACKET);
    }
    Ok(packet)
}

/// PINGREQ carries no flags and no body.
pub fn decode_pingreq(flags: u8, body: &[u8]) -> Result<(), ReasonCode> {
    if flags != 0 || !body.is_empty() {
        return Err(ReasonCodes::MALFORMED_PACKET);
    }
    Ok(())
}

pub fn put_varint(out: &mut BytesMut, mut value: usize) {
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

pub fn put_string(out: &mut BytesMut, value: &str) {
    out.put_u16(value.len() as u16);
    out.put_slice(value.as_bytes());
}

pub fn put_binary(out: &mut BytesMut, value: &[u8]) {
    out.put_u16(value.len() as u16);
    out.put_slice(value);
}

fn put_user_property(out: &mut BytesMut, property: &UserProperty) {
    out.put_u8(PROP_USER_PROPERTY);
    put_string(out, &property.key);
    put_string(out, &property.value);
}

fn put_packet(out: &mut BytesMut, type_and_flags: u8, variable: &[u8]) {
    out.put_u8(type_and_flags);
    put_varint(out, variable.len());
    out.put_slice(variable);
}

/// Negotiated properties advertised on CONNACK; `None` fields are omitted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnackProperties {
    pub session_expiry: Option<u32>,
    pub maximum_qos: Option<u8>,
    pub retain_available: Option<bool>,
    pub maximum_packet_size: Option<u32>,
    pub topic_alias_maximum: Option<u16>,
    pub wildcard_subscription_available: Option<bool>,
    pub subscription_identifiers_available: Option<bool>,
    pub shared_subscription_available: Option<bool>,
    pub assigned_client_id: Option<String>,
}

pub fn encode_connack(
    out: &mut BytesMut,
    session_present: bool,
    reason: ReasonCode,
    props: &ConnackProperties,
) {
    let mut props_buf = BytesMut::new();
    if let Some(expiry) = props.session_expiry {
        props_buf.put_u8(PROP_SESSION_EXPIRY);
        props_buf.put_u32(expiry);
    }
    if let Some(qos) = props.maximum_qos {
        props_buf.put_u8(PROP_MAXIMUM_QOS);
        props_buf.put_u8(qos);
    }
    if let Some(available) = props.retain_available {
        props_buf.put_u8(PROP_RETAIN_AVAILABLE);
        props_buf.put_u8(available as u8);
    }
    if let Some(size) = props.maximum_packet_size {
        props_buf.put_u8(PROP_MAXIMUM_PACKET_SIZE);
        props_buf.put_u32(size);
    }
    if let Some(maximum) = props.topic_alias_maximum {
        props_buf.put_u8(PROP_TOPIC_ALIAS_MAXIMUM);
        props_buf.put_u16(maximum);
    }
    if let Some(available) = props.wildcard_subscription_available {
        props_buf.put_u8(PROP_WILDCARD_AVAILABLE);
        props_buf.put_u8(available as u8);
    }
    if let Some(available) = props.subscription_identifiers_available {
        props_buf.put_u8(PROP_SUBSCRIPTION_IDS_AVAILABLE);
        props_buf.put_u8(available as u8);
    }
    if let Some(available) = props.shared_subscription_available {
        props_buf.put_u8(PROP_SHARED_AVAILABLE);
        props_buf.put_u8(available as u8);
    }
    if let Some(client_id) = &props.assigned_client_id {
        props_buf.put_u8(PROP_ASSIGNED_CLIENT_ID);
        put_string(&mut props_buf, client_id);
    }

    let mut variable = BytesMut::with_capacity(props_buf.len() + 6);
    variable.put_u8(session_present as u8);
    variable.put_u8(reason);
    put_varint(&mut variable, props_buf.len());
    variable.put_slice(&props_buf);
    put_packet(out, 0x20, &variable);
}

pub fn encode_suback(out: &mut BytesMut, packet_id: u16, reasons: &[ReasonCode]) {
    let mut variable = BytesMut::with_capacity(3 + reasons.len());
    variable.put_u16(packet_id);
    variable.put_u8(0);
    variable.put_slice(reasons);
    put_packet(out, 0x90, &variable);
}

pub fn encode_unsuback(out: &mut BytesMut, packet_id: u16, reasons: &[ReasonCode]) {
    let mut variable = BytesMut::with_capacity(3 + reasons.len());
    variable.put_u16(packet_id);
    variable.put_u8(0);
    variable.put_slice(reasons);
    put_packet(out, 0xB0, &variable);
}

/// PUBACK with the implied SUCCESS reason and no properties.
pub fn encode_puback(out: &mut BytesMut, packet_id: u16) {
    out.put_u8(0x40);
    out.put_u8(0x02);
    out.put_u16(packet_id);
}

pub fn encode_pingresp(out: &mut BytesMut) {
    out.put_slice(&[0xD0, 0x00]);
}

pub fn encode_disconnect(out: &mut BytesMut, reason: ReasonCode) {
    out.put_slice(&[0xE0, 0x02, reason, 0x00]);
}

/// Encode an outbound PUBLISH at QoS 0 from application message metadata.
pub fn encode_publish(
    out: &mut BytesMut,
    topic_name: &str,
    retain: bool,
    ex: &MqttDataEx,
    payload: &[u8],
) {
    let mut props_buf = BytesMut::new();
    for id in &ex.subscription_ids {
        props_buf.put_u8(PROP_SUBSCRIPTION_ID);
        put_varint(&mut props_buf, *id as usize);
    }
    if ex.expiry >= 0 {
        props_buf.put_u8(PROP_MESSAGE_EXPIRY);
        props_buf.put_u32(ex.expiry as u32);
    }
    if let Some(content_type) = &ex.content_type {
        props_buf.put_u8(PROP_CONTENT_TYPE);
        put_string(&mut props_buf, content_type);
    }
    if ex.format == PayloadFormat::Text {
        props_buf.put_u8(PROP_PAYLOAD_FORMAT);
        props_buf.put_u8(ex.format.as_u8());
    }
    if let Some(response_topic) = &ex.response_topic {
        props_buf.put_u8(PROP_RESPONSE_TOPIC);
        put_string(&mut props_buf, response_topic);
    }
    if let Some(correlation) = &ex.correlation {
        props_buf.put_u8(PROP_CORRELATION_DATA);
        put_binary(&mut props_buf, correlation);
    }
    for property in &ex.user_properties {
        put_user_property(&mut props_buf, property);
    }

    let mut variable = BytesMut::with_capacity(topic_name.len() + props_buf.len() + payload.len() + 8);
    put_string(&mut variable, topic_name);
    put_varint(&mut variable, props_buf.len());
    variable.put_slice(&props_buf);
    variable.put_slice(payload);
    put_packet(out, 0x30 | retain as u8, &variable);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_body(flags: u8, props: &[u8], client_id: &str) -> Vec<u8> {
        let mut body = BytesMut::new();
        put_string(&mut body, "MQTT");
        body.put_u8(5);
        body.put_u8(flags);
        body.put_u16(60);
        put_varint(&mut body, props.len());
        body.put_slice(props);
        put_string(&mut body, client_id);
        body.to_vec()
    }

    #[test]
    fn peek_waits_for_complete_remaining_length() {
        assert_eq!(peek_fixed_header(&[]), Ok(None));
        assert_eq!(peek_fixed_header(&[0x30]), Ok(None));
        assert_eq!(peek_fixed_header(&[0x30, 0x80]), Ok(None));
        let header = peek_fixed_header(&[0x30, 0x80, 0x01]).unwrap().unwrap();
        assert_eq!(header.remaining_length, 128);
        assert_eq!(header.header_length, 3);
        assert_eq!(header.packet_type(), Some(PacketType::Publish));
    }

    #[test]
    fn peek_rejects_five_byte_length() {
        assert_eq!(
            peek_fixed_header(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]),
            Err(ReasonCodes::MALFORMED_PACKET)
        );
    }

    #[test]
    fn connect_decodes_properties() {
        let props = [0x11, 0, 0, 0, 30, 0x22, 0, 10];
        let packet = decode_connect(&connect_body(CONNECT_CLEAN_START, &props, "client")).unwrap();
        assert_eq!(packet.client_id, "client");
        assert_eq!(packet.session_expiry, 30);
        assert_eq!(packet.topic_alias_maximum, 10);
        assert_eq!(packet.keep_alive, 60);
        assert!(packet.clean_start());
        assert!(packet.will.is_none());
    }

    #[test]
    fn connect_rejections_map_to_reason_codes() {
        assert_eq!(
            decode_connect(&connect_body(CONNECT_RESERVED, &[], "c")),
            Err(ReasonCodes::MALFORMED_PACKET)
        );
        assert_eq!(
            decode_connect(&connect_body(0, &[0x11, 0, 0, 0, 1, 0x11, 0, 0, 0, 2], "c")),
            Err(ReasonCodes::PROTOCOL_ERROR)
        );
        assert_eq!(
            decode_connect(&connect_body(0, &[], &"x".repeat(37))),
            Err(ReasonCodes::CLIENT_IDENTIFIER_NOT_VALID)
        );
        assert_eq!(
            decode_connect(&connect_body(CONNECT_WILL_RETAIN, &[], "c")),
            Err(ReasonCodes::MALFORMED_PACKET)
        );
        assert_eq!(
            decode_connect(&connect_body(0x80, &[], "c")),
            Err(ReasonCodes::NOT_AUTHORIZED)
        );

        let mut body = connect_body(0, &[], "c");
        body[6] = 4;
        assert_eq!(decode_connect(&body), Err(ReasonCodes::UNSUPPORTED_PROTOCOL_VERSION));
    }

    #[test]
    fn connect_decodes_will() {
        let mut body = BytesMut::from(&connect_body(CONNECT_WILL_FLAG | CONNECT_WILL_RETAIN, &[], "c")[..]);
        body.put_slice(&[7, 0x18, 0, 0, 0, 5, 0x01, 1]);
        put_string(&mut body, "will/topic");
        put_binary(&mut body, b"bye");
        let packet = decode_connect(&body).unwrap();
        let will = packet.will.unwrap();
        assert_eq!(will.topic, "will/topic");
        assert_eq!(&will.payload[..], b"bye");
        assert_eq!(will.delay, 5);
        assert!(will.retain);
        assert_eq!(will.format, PayloadFormat::Text);
    }

    #[test]
    fn publish_decodes_alias_and_payload() {
        let mut body = BytesMut::new();
        put_string(&mut body, "");
        body.put_slice(&[3, 0x23, 0, 2]);
        body.put_slice(&[1, 2, 3]);
        let packet = decode_publish(0, &body).unwrap();
        assert!(packet.topic.is_empty());
        assert_eq!(packet.properties.topic_alias, Some(2));
        assert_eq!(&packet.payload[..], &[1, 2, 3]);
        assert!(packet.packet_id.is_none());
    }

    #[test]
    fn publish_rejects_wildcard_topic_and_bad_text() {
        let mut body = BytesMut::new();
        put_string(&mut body, "a/+");
        body.put_u8(0);
        assert_eq!(decode_publish(0, &body), Err(ReasonCodes::TOPIC_NAME_INVALID));

        let mut body = BytesMut::new();
        put_string(&mut body, "a");
        body.put_slice(&[2, 0x01, 1, 0xFF, 0xFE]);
        assert_eq!(decode_publish(0, &body), Err(ReasonCodes::PAYLOAD_FORMAT_INVALID));

        assert_eq!(decode_publish(0x06, &[]), Err(ReasonCodes::MALFORMED_PACKET));
    }

    #[test]
    fn subscribe_options_are_validated() {
        let mut body = BytesMut::new();
        body.put_u16(7);
        body.put_slice(&[2, 0x0B, 5]);
        put_string(&mut body, "a/#");
        body.put_u8(SUBSCRIBE_NO_LOCAL | SUBSCRIBE_RETAIN_AS_PUBLISHED);
        let packet = decode_subscribe(0x02, &body).unwrap();
        assert_eq!(packet.packet_id, 7);
        assert_eq!(packet.subscription_id, Some(5));
        assert!(packet.filters[0].no_local());
        assert!(packet.filters[0].retain_as_published());

        let mut body = BytesMut::new();
        body.put_u16(7);
        body.put_u8(0);
        put_string(&mut body, "a");
        body.put_u8(SUBSCRIBE_RETAIN_HANDLING);
        assert_eq!(decode_subscribe(0x02, &body), Err(ReasonCodes::MALFORMED_PACKET));

        let mut body = BytesMut::new();
        body.put_u16(7);
        body.put_slice(&[2, 0x0B, 0]);
        assert_eq!(decode_subscribe(0x02, &body), Err(ReasonCodes::PROTOCOL_ERROR));
    }

    #[test]
    fn disconnect_body_is_optional() {
        assert_eq!(decode_disconnect(0, &[]).unwrap().reason, ReasonCodes::NORMAL_DISCONNECTION);
        let packet = decode_disconnect(0, &[0x04, 5, 0x11, 0, 0, 0, 9]).unwrap();
        assert_eq!(packet.reason, ReasonCodes::DISCONNECT_WITH_WILL_MESSAGE);
        assert_eq!(packet.session_expiry, Some(9));
    }

    #[test]
    fn connack_carries_assigned_client_id() {
        let mut out = BytesMut::new();
        let props = ConnackProperties {
            assigned_client_id: Some("abc".into()),
            ..ConnackProperties::default()
        };
        encode_connack(&mut out, false, ReasonCodes::SUCCESS, &props);
        assert_eq!(&out[..], &[0x20, 9, 0, 0, 6, 0x12, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn acks_and_control_packets() {
        let mut out = BytesMut::new();
        encode_suback(&mut out, 1, &[0x00, 0x8F]);
        assert_eq!(&out[..], &[0x90, 5, 0, 1, 0, 0x00, 0x8F]);

        let mut out = BytesMut::new();
        encode_unsuback(&mut out, 2, &[0x11]);
        assert_eq!(&out[..], &[0xB0, 4, 0, 2, 0, 0x11]);

        let mut out = BytesMut::new();
        encode_pingresp(&mut out);
        encode_disconnect(&mut out, ReasonCodes::KEEP_ALIVE_TIMEOUT);
        assert_eq!(&out[..], &[0xD0, 0, 0xE0, 2, 0x8D, 0]);

        let mut out = BytesMut::new();
        encode_puback(&mut out, 0x0102);
        assert_eq!(&out[..], &[0x40, 2, 1, 2]);
    }

    #[test]
    fn publish_encodes_retain_and_properties() {
        let ex = MqttDataEx {
            expiry: 10,
            subscription_ids: vec![3],
            ..MqttDataEx::default()
        };
        let mut out = BytesMut::new();
        encode_publish(&mut out, "a/b", true, &ex, b"hi");
        assert_eq!(
            &out[..],
            &[0x31, 15, 0, 3, b'a', b'/', b'b', 7, 0x0B, 3, 0x02, 0, 0, 0, 10, b'h', b'i']
        );
    }
}
