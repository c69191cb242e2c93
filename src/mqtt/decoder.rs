//! Restartable packet decoding for [`MqttServer`].
//!
//! Bytes stay in the connection's decode slot until a whole packet is
//! present and its handler commits to it, so decoding can be re-run against
//! a growing buffer or after a blocked packet becomes writable.

use bytes::Buf;
use tracing::{debug, info};

use super::codec::{self, ConnackProperties, FixedHeader, PacketType};
use super::reason::{reason_name, ReasonCode, ReasonCodes};
use super::server::{
    MqttServer, PendingAck, ServerEnv, Subscription, SIGNAL_PUBLISH_EXPIRED,
};
use super::session::SessionState;
use super::topic;
use crate::engine::{EngineContext, FLAG_FIN, FLAG_INIT};
use crate::ext::{Capabilities, Extension, MqttDataEx, SubscribeFlags, PUBLISH_RETAIN};

/// Which packets the connection currently accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Decoder {
    /// Only CONNECT is valid as the first packet.
    Connect,
    Packet,
    /// Terminal: bytes are acknowledged and discarded.
    IgnoreAll,
}

/// Outcome of a packet handler that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Decoded {
    Consumed,
    /// Not consumed; decoding resumes once the blocking stream has room.
    Blocked,
}

impl MqttServer {
    pub(super) fn resume_decode(&mut self, ctx: &mut EngineContext, env: &mut ServerEnv) {
        self.blocked_on = None;
        self.decode_network(ctx, env);
    }

    /// Decode every complete packet in the decode slot, then acknowledge the
    /// bytes consumed on the network initial window.
    pub(super) fn decode_network(&mut self, ctx: &mut EngineContext, env: &mut ServerEnv) {
        if self.decoding {
            return;
        }
        let Some(slot) = self.decode_slot else {
            return;
        };
        self.decoding = true;
        let mut buffer = std::mem::take(ctx.buffers.buffer_mut(slot));
        let capacity = ctx.buffers.slot_capacity();
        let mut offset = 0;

        while offset < buffer.len() {
            if self.decoder == Decoder::IgnoreAll {
                offset = buffer.len();
                break;
            }
            let remaining = &buffer[offset..];
            let header = match codec::peek_fixed_header(remaining) {
                Ok(Some(header)) => header,
                Ok(None) => break,
                Err(code) => {
                    self.on_decode_error(ctx, code, false);
                    offset = buffer.len();
                    break;
                }
            };
            let length = header.packet_length();
            let limit = env.config.maximum_packet_size as usize;
            if (limit > 0 && length > limit) || length > capacity {
                let connecting = self.decoder == Decoder::Connect;
                self.on_decode_error(ctx, ReasonCodes::PACKET_TOO_LARGE, connecting);
                offset = buffer.len();
                break;
            }
            if remaining.len() < length {
                break;
            }
            let body = &remaining[header.header_length..length];
            match self.decode_packet(ctx, env, header, body) {
                Ok(Decoded::Consumed) => {
                    offset += length;
                    if self.keep_alive_millis > 0 {
                        self.keep_alive_deadline = ctx.now_millis() + self.keep_alive_millis;
                    }
                }
                Ok(Decoded::Blocked) => break,
                Err(code) => {
                    let connecting = header.packet_type() == Some(PacketType::Connect)
                        && !self.connack_sent
                        && self.connack_pending.is_none();
                    self.on_decode_error(ctx, code, connecting);
                    offset = buffer.len();
                    break;
                }
            }
        }

        buffer.advance(offset);
        let buffered = buffer.len();
        if self.decode_slot == Some(slot) {
            *ctx.buffers.buffer_mut(slot) = buffer;
            if buffered == 0 {
                self.release_decode_slot(ctx);
            }
        }
        self.decoding = false;

        let acknowledge = self.net.initial.seq - buffered as u64;
        self.net.window_to(ctx, self.trace_id, acknowledge, self.window);
    }

    fn decode_packet(
        &mut self,
        ctx: &mut EngineContext,
        env: &mut ServerEnv,
        header: FixedHeader,
        body: &[u8],
    ) -> Result<Decoded, ReasonCode> {
        let packet_type = header.packet_type().ok_or(ReasonCodes::MALFORMED_PACKET)?;
        match self.decoder {
            Decoder::IgnoreAll => Ok(Decoded::Consumed),
            Decoder::Connect => match packet_type {
                PacketType::Connect => self.decode_connect(ctx, env, header.flags(), body),
                _ => Err(ReasonCodes::PROTOCOL_ERROR),
            },
            Decoder::Packet => {
                if self.connack_pending.is_some() {
                    return Ok(Decoded::Blocked);
                }
                match packet_type {
                    PacketType::Publish => self.decode_publish(ctx, env, header.flags(), body),
                    PacketType::Subscribe => self.decode_subscribe(ctx, env, header.flags(), body),
                    PacketType::Unsubscribe => {
                        self.decode_unsubscribe(ctx, env, header.flags(), body)
                    }
                    PacketType::PingReq => {
                        codec::decode_pingreq(header.flags(), body)?;
                        self.encode_network(ctx, codec::encode_pingresp);
                        Ok(Decoded::Consumed)
                    }
                    PacketType::Disconnect => self.decode_disconnect(ctx, header.flags(), body),
                    // QoS 2, AUTH and server-bound acknowledgements are not accepted
                    _ => Err(ReasonCodes::PROTOCOL_ERROR),
                }
            }
        }
    }

    /// Stop decoding and report `code` the only way the client can still hear it.
    fn on_decode_error(&mut self, ctx: &mut EngineContext, code: ReasonCode, connecting: bool) {
        info!(client_id = %self.client_id, reason = reason_name(code), "mqtt decode failed");
        if self.connack_sent {
            self.disconnect(ctx, code);
            return;
        }
        if connecting {
            self.encode_network(ctx, |out| {
                codec::encode_connack(out, false, code, &ConnackProperties::default());
            });
        }
        self.decoder = Decoder::IgnoreAll;
        self.release_will(ctx, false);
        self.close_app_streams(ctx, false);
        self.net.reset(ctx, self.trace_id, Extension::None);
        if self.encode_slot.is_some() {
            self.end_after_flush = true;
        } else {
            self.net.end(ctx, self.trace_id, Extension::None);
        }
    }

    fn decode_connect(
        &mut self,
        ctx: &mut EngineContext,
        env: &mut ServerEnv,
        flags: u8,
        body: &[u8],
    ) -> Result<Decoded, ReasonCode> {
        if flags != 0 {
            return Err(ReasonCodes::MALFORMED_PACKET);
        }
        let packet = codec::decode_connect(body)?;
        if let Some(will) = &packet.will {
            if will.qos > env.config.maximum_qos {
                return Err(ReasonCodes::QOS_NOT_SUPPORTED);
            }
            if will.retain && !env.config.retain_available {
                return Err(ReasonCodes::RETAIN_NOT_SUPPORTED);
            }
        }

        let mut props = ConnackProperties::default();
        let client_id = if packet.client_id.is_empty() {
            let assigned = match env.config.client_id.clone() {
                Some(fixed) => fixed,
                None => (env.supply_client_id)(),
            };
            props.assigned_client_id = Some(assigned.clone());
            assigned
        } else {
            packet.client_id.clone()
        };

        let config = &env.config;

        let expiry_limit = config.session_expiry_interval_secs;
        self.session_expiry = if expiry_limit > 0 && packet.session_expiry > expiry_limit {
            props.session_expiry = Some(expiry_limit);
            expiry_limit
        } else {
            packet.session_expiry
        };

        let alias_limit = match config.topic_alias_maximum {
            0 => u16::MAX,
            limit => u16::try_from(limit).unwrap_or(u16::MAX),
        };
        let alias_maximum = packet.topic_alias_maximum.min(alias_limit);
        self.aliases.set_max_alias(alias_maximum);
        if alias_maximum > 0 {
            props.topic_alias_maximum = Some(alias_maximum);
        }
        if config.maximum_qos < 2 {
            props.maximum_qos = Some(config.maximum_qos);
        }
        if !config.retain_available {
            props.retain_available = Some(false);
        }
        if !config.wildcard_subscription_available {
            props.wildcard_subscription_available = Some(false);
        }
        if !config.subscription_identifiers_available {
            props.subscription_identifiers_available = Some(false);
        }
        if !config.shared_subscription_available {
            props.shared_subscription_available = Some(false);
        }
        if config.maximum_packet_size > 0 {
            props.maximum_packet_size = Some(config.maximum_packet_size);
        }

        self.client_id = client_id;
        self.client_maximum_packet_size = packet.maximum_packet_size;
        self.keep_alive_millis = i64::from(packet.keep_alive) * 1500;
        self.decoder = Decoder::Packet;
        debug!(
            client_id = %self.client_id,
            keep_alive = packet.keep_alive,
            session_expiry = self.session_expiry,
            will = packet.will.is_some(),
            "mqtt connect"
        );

        let session_route = if self.session_expiry > 0 || packet.will.is_some() {
            env.router.resolve_session()
        } else {
            None
        };
        let session_state = match session_route {
            Some(_) => Some(
                SessionState::new(ctx.now_millis(), self.session_expiry, packet.will.as_ref())
                    .to_bytes()
                    .map_err(|err| {
                        debug!(client_id = %self.client_id, %err, "mqtt session state encode failed");
                        ReasonCodes::IMPLEMENTATION_SPECIFIC_ERROR
                    })?,
            ),
            None => None,
        };

        if let Some(will) = packet.will {
            match env.router.resolve_publish(&will.topic) {
                Some(route_id) => self.open_will_stream(ctx, route_id, will),
                None => debug!(client_id = %self.client_id, topic = %will.topic, "no route for will"),
            }
        }

        match (session_route, session_state) {
            (Some(route_id), Some(state)) => {
                self.open_session_stream(ctx, route_id, state);
                self.connack_pending = Some(props);
            }
            _ => {
                if self.session_expiry > 0 {
                    debug!(client_id = %self.client_id, "no session route, session state unavailable");
                    props.session_expiry = Some(0);
                    self.session_expiry = 0;
                }
                self.send_connack(ctx, props);
            }
        }
        Ok(Decoded::Consumed)
    }

    fn decode_publish(
        &mut self,
        ctx: &mut EngineContext,
        env: &mut ServerEnv,
        flags: u8,
        body: &[u8],
    ) -> Result<Decoded, ReasonCode> {
        let packet = codec::decode_publish(flags, body)?;
        if packet.qos > env.config.maximum_qos {
            return Err(ReasonCodes::QOS_NOT_SUPPORTED);
        }
        if packet.retain && !env.config.retain_available {
            return Err(ReasonCodes::RETAIN_NOT_SUPPORTED);
        }
        let topic = self
            .aliases
            .resolve(&packet.topic, packet.properties.topic_alias)
            .map_err(|err| err.reason())?;

        if self.drop_blocked_publish {
            self.drop_blocked_publish = false;
            debug!(client_id = %self.client_id, topic = %topic, "mqtt publish dropped after stream reset");
            return Ok(self.acknowledge_publish(ctx, packet.packet_id));
        }

        let Some(route_id) = env.router.resolve_publish(&topic) else {
            debug!(client_id = %self.client_id, topic = %topic, "no route for publish");
            return Ok(self.acknowledge_publish(ctx, packet.packet_id));
        };

        let key = self.attach_topic_stream(
            ctx,
            route_id,
            &topic,
            Capabilities::PUBLISH_ONLY,
            SubscribeFlags::empty(),
            0,
        );
        let trace_id = self.trace_id;
        let publish_timeout = (env.config.publish_timeout_secs * 1000) as i64;
        let Some(stream) = self.streams.get_mut(&key) else {
            return Ok(Decoded::Consumed);
        };
        if !stream.app.state.initial_opened() {
            self.blocked_on = Some(stream.app.ids.initial_id);
            return Ok(Decoded::Blocked);
        }
        let Some(reserved) = stream.app.claim_whole(ctx, packet.payload.len()) else {
            self.blocked_on = Some(stream.app.ids.initial_id);
            return Ok(Decoded::Blocked);
        };

        let properties = packet.properties;
        let ex = MqttDataEx {
            topic: Some(topic),
            flags: if packet.retain { PUBLISH_RETAIN } else { 0 },
            expiry: properties
                .expiry
                .map_or(-1, |expiry| i32::try_from(expiry).unwrap_or(i32::MAX)),
            content_type: properties.content_type,
            format: properties.format,
            response_topic: properties.response_topic,
            correlation: properties.correlation,
            user_properties: properties.user_properties,
            ..MqttDataEx::default()
        };
        if stream
            .app
            .data(
                ctx,
                trace_id,
                FLAG_INIT | FLAG_FIN,
                reserved,
                Some(packet.payload),
                Extension::MqttData(ex),
            )
            .is_err()
        {
            return Err(ReasonCodes::IMPLEMENTATION_SPECIFIC_ERROR);
        }

        stream.publish_expires_at = ctx.now_millis() + publish_timeout;
        if stream.publish_timer.is_none() {
            let target = stream.app.signal_target(trace_id);
            stream.publish_timer = Some(ctx.signal_at(
                stream.publish_expires_at,
                target,
                SIGNAL_PUBLISH_EXPIRED,
                0,
            ));
        }
        self.blocked_on = None;
        Ok(self.acknowledge_publish(ctx, packet.packet_id))
    }

    fn acknowledge_publish(&mut self, ctx: &mut EngineContext, packet_id: Option<u16>) -> Decoded {
        if let Some(packet_id) = packet_id {
            self.encode_network(ctx, |out| codec::encode_puback(out, packet_id));
        }
        Decoded::Consumed
    }

    fn decode_subscribe(
        &mut self,
        ctx: &mut EngineContext,
        env: &mut ServerEnv,
        flags: u8,
        body: &[u8],
    ) -> Result<Decoded, ReasonCode> {
        let packet = codec::decode_subscribe(flags, body)?;
        if packet.subscription_id.is_some() && !env.config.subscription_identifiers_available {
            return Err(ReasonCodes::SUBSCRIPTION_IDENTIFIERS_NOT_SUPPORTED);
        }
        let subscription = self.next_subscription;
        self.next_subscription += 1;
        self.subscriptions.insert(
            subscription,
            Subscription {
                packet_id: packet.packet_id,
                reasons: vec![None; packet.filters.len()],
            },
        );

        let subscription_id = packet.subscription_id.unwrap_or(0);
        for (index, filter) in packet.filters.iter().enumerate() {
            let config = &env.config;
            let failure = if !topic::is_valid_filter(&filter.filter) {
                Some(ReasonCodes::TOPIC_FILTER_INVALID)
            } else if topic::is_shared(&filter.filter) && !config.shared_subscription_available {
                Some(ReasonCodes::SHARED_SUBSCRIPTIONS_NOT_SUPPORTED)
            } else if topic::has_wildcard(&filter.filter) && !config.wildcard_subscription_available {
                Some(ReasonCodes::WILDCARD_SUBSCRIPTIONS_NOT_SUPPORTED)
            } else {
                None
            };
            if let Some(code) = failure {
                self.complete_subscription(ctx, subscription, index, code);
                continue;
            }
            let Some(route_id) = env.router.resolve_subscribe(&filter.filter) else {
                debug!(client_id = %self.client_id, filter = %filter.filter, "no route for subscribe");
                self.complete_subscription(
                    ctx,
                    subscription,
                    index,
                    ReasonCodes::IMPLEMENTATION_SPECIFIC_ERROR,
                );
                continue;
            };

            let mut options = SubscribeFlags::empty();
            if filter.retain_handling() != 2 {
                options |= SubscribeFlags::SEND_RETAINED;
            }
            if filter.retain_as_published() {
                options |= SubscribeFlags::RETAIN_AS_PUBLISHED;
            }
            if filter.no_local() && config.no_local {
                options |= SubscribeFlags::NO_LOCAL;
            }
            let granted = filter.qos().min(config.maximum_qos);

            let key = self.attach_topic_stream(
                ctx,
                route_id,
                &filter.filter,
                Capabilities::SUBSCRIBE_ONLY,
                options,
                subscription_id,
            );
            let Some(stream) = self.streams.get_mut(&key) else {
                continue;
            };
            if stream.app.state.initial_opened() {
                self.complete_subscription(ctx, subscription, index, granted);
            } else {
                stream.pending_acks.push(PendingAck {
                    subscription,
                    index,
                    granted,
                });
            }
        }
        Ok(Decoded::Consumed)
    }

    fn decode_unsubscribe(
        &mut self,
        ctx: &mut EngineContext,
        env: &mut ServerEnv,
        flags: u8,
        body: &[u8],
    ) -> Result<Decoded, ReasonCode> {
        let packet = codec::decode_unsubscribe(flags, body)?;
        let mut reasons = Vec::with_capacity(packet.filters.len());
        for filter in &packet.filters {
            let key = env
                .router
                .resolve_subscribe(filter)
                .zip(self.interner.get(filter));
            let subscribed = key.is_some_and(|key| {
                self.streams
                    .get(&key)
                    .is_some_and(|s| s.capabilities.contains(Capabilities::SUBSCRIBE_ONLY))
            });
            match key {
                Some(key) if subscribed => {
                    self.detach_topic_stream(ctx, key, Capabilities::SUBSCRIBE_ONLY);
                    reasons.push(ReasonCodes::SUCCESS);
                }
                _ => reasons.push(ReasonCodes::NO_SUBSCRIPTION_EXISTED),
            }
        }
        self.encode_network(ctx, |out| codec::encode_unsuback(out, packet.packet_id, &reasons));
        Ok(Decoded::Consumed)
    }

    fn decode_disconnect(
        &mut self,
        ctx: &mut EngineContext,
        flags: u8,
        body: &[u8],
    ) -> Result<Decoded, ReasonCode> {
        let packet = codec::decode_disconnect(flags, body)?;
        if let Some(expiry) = packet.session_expiry {
            if expiry > 0 && self.session_expiry == 0 {
                return Err(ReasonCodes::PROTOCOL_ERROR);
            }
            self.session_expiry = expiry;
        }
        info!(client_id = %self.client_id, reason = reason_name(packet.reason), "mqtt client disconnected");
        self.decoder = Decoder::IgnoreAll;
        if packet.reason == ReasonCodes::DISCONNECT_WITH_WILL_MESSAGE {
            self.on_ungraceful(ctx);
        } else {
            self.release_will(ctx, false);
        }
        self.close_app_streams(ctx, false);
        if self.encode_slot.is_some() {
            self.end_after_flush = true;
        } else {
            self.net.end(ctx, self.trace_id, Extension::None);
        }
        Ok(Decoded::Consumed)
    }
}
