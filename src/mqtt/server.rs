//! MQTT v5 server engine.
//!
//! One [`MqttServer`] exists per accepted network stream. It decodes client
//! packets (see `decoder.rs`) and fans out to one application stream per
//! `(route, topic)`, plus an optional session stream and an optional will
//! stream. Everything is driven by frames fed through [`MqttServerFactory`].

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::alias::TopicAliases;
use super::codec::{self, ConnackProperties, WillMessage};
use super::decoder::Decoder;
use super::intern::{TopicInterner, TopicKey};
use super::reason::{reason_name, ReasonCode, ReasonCodes};
use super::route::{MqttRouter, RouteId};
use super::session;
use crate::core::config::MqttConfig;
use crate::core::time::Clock;
use crate::engine::{
    AcceptedStream, BufferSizing, EngineContext, Frame, FrameHeader, FrameKind, OpenedStream,
    SlotId, StreamFactory, StreamIds, TimerHandle, FLAG_FIN, FLAG_INIT,
};
use crate::ext::{
    Capabilities, Extension, MqttBeginEx, MqttDataEx, MqttFlushEx, PayloadFormat, SubscribeFlags,
};

pub const SIGNAL_PUBLISH_EXPIRED: u32 = 1;
pub const SIGNAL_KEEP_ALIVE_TIMEOUT: u32 = 2;
pub const SIGNAL_CONNECT_TIMEOUT: u32 = 3;
/// Fires when a delayed will is due after an ungraceful close.
pub const SIGNAL_SESSION_EXPIRY: u32 = 4;
/// Fires when a due will has waited out the grace period for its stream.
pub const SIGNAL_WILL_ABANDONED: u32 = 5;

pub(super) type StreamKey = (RouteId, TopicKey);

/// What an application stream id belongs to within its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum AppStream {
    Topic(StreamKey),
    Session,
    Will,
}

/// Immutable collaborators shared by every connection of a factory.
pub(super) struct ServerEnv {
    pub(super) config: MqttConfig,
    pub(super) router: Box<dyn MqttRouter>,
    pub(super) supply_client_id: Box<dyn FnMut() -> String>,
}

/// Accepts MQTT network streams and routes every inbound frame to the
/// connection that owns its stream id.
pub struct MqttServerFactory {
    ctx: EngineContext,
    env: ServerEnv,
    servers: HashMap<u64, MqttServer>,
}

impl MqttServerFactory {
    pub fn new(config: MqttConfig, router: Box<dyn MqttRouter>, clock: Arc<dyn Clock>) -> Self {
        let mut sizing = BufferSizing::default();
        sizing.slot_capacity = sizing
            .slot_capacity
            .max(config.maximum_packet_size as usize)
            .max(config.initial_window as usize);
        Self {
            ctx: EngineContext::new(clock, sizing),
            env: ServerEnv {
                config,
                router,
                supply_client_id: Box::new(|| Uuid::new_v4().to_string()),
            },
            servers: HashMap::new(),
        }
    }

    /// Replace the generator for server-assigned client ids.
    pub fn with_client_id_supplier(mut self, supplier: impl FnMut() -> String + 'static) -> Self {
        self.env.supply_client_id = Box::new(supplier);
        self
    }

    /// Live connections, including ones waiting only on a delayed will.
    pub fn connections(&self) -> usize {
        self.servers.len()
    }

    fn flush_budgets(&mut self) {
        loop {
            let watchers = self.ctx.budgets.take_flushable();
            if watchers.is_empty() {
                break;
            }
            for watcher in watchers {
                let Some(owner) = self.ctx.owner(watcher) else {
                    continue;
                };
                if let Some(server) = self.servers.get_mut(&owner) {
                    server.on_budget_ready(&mut self.ctx, &mut self.env, watcher);
                }
                self.reap(owner);
            }
        }
    }

    fn reap(&mut self, owner: u64) {
        if !self.servers.get(&owner).is_some_and(MqttServer::is_done) {
            return;
        }
        if let Some(mut server) = self.servers.remove(&owner) {
            server.release(&mut self.ctx);
            debug!(stream_id = owner, client_id = %server.client_id, "mqtt connection released");
        }
    }
}

impl StreamFactory for MqttServerFactory {
    fn handle(&mut self, frame: Frame) {
        let stream_id = frame.stream_id();
        let owner = match self.ctx.owner(stream_id) {
            Some(owner) => owner,
            None => {
                if let FrameKind::Begin { affinity, .. } = frame.kind {
                    if !EngineContext::is_supplied(stream_id) {
                        if let Some(server) =
                            MqttServer::accept(&mut self.ctx, &self.env, &frame.header, affinity)
                        {
                            self.ctx.bind_pair(stream_id, stream_id);
                            self.servers.insert(stream_id, server);
                        }
                        return;
                    }
                }
                debug!(stream_id, frame = frame.name(), "mqtt frame for unknown stream");
                return;
            }
        };
        if let Some(server) = self.servers.get_mut(&owner) {
            server.on_frame(&mut self.ctx, &mut self.env, frame);
        }
        self.flush_budgets();
        self.reap(owner);
    }

    fn context(&mut self) -> &mut EngineContext {
        &mut self.ctx
    }
}

/// A pending SUBACK slot waiting on a topic stream's first window.
#[derive(Debug, Clone, Copy)]
pub(super) struct PendingAck {
    pub(super) subscription: u64,
    pub(super) index: usize,
    pub(super) granted: ReasonCode,
}

/// Application stream for one topic on one route.
pub(super) struct TopicStream {
    pub(super) app: OpenedStream,
    pub(super) topic: String,
    pub(super) capabilities: Capabilities,
    pub(super) flags: SubscribeFlags,
    pub(super) subscription_id: u32,
    pub(super) pending_acks: Vec<PendingAck>,
    pub(super) publish_expires_at: i64,
    pub(super) publish_timer: Option<TimerHandle>,
    message: BytesMut,
    message_ex: Option<MqttDataEx>,
}

/// Outstanding SUBSCRIBE: one reason code slot per filter, in packet order.
#[derive(Debug)]
pub(super) struct Subscription {
    pub(super) packet_id: u16,
    pub(super) reasons: Vec<Option<ReasonCode>>,
}

pub(super) struct SessionStream {
    pub(super) app: OpenedStream,
    /// Session-state record not yet written.
    pub(super) state: Option<Bytes>,
}

pub(super) struct WillStream {
    pub(super) app: OpenedStream,
    pub(super) message: WillMessage,
    pub(super) publish_pending: bool,
    pub(super) abandon_timer: Option<TimerHandle>,
}

pub(super) struct MqttServer {
    pub(super) net: AcceptedStream,
    pub(super) trace_id: u64,
    pub(super) affinity: u64,
    pub(super) window: u32,
    pub(super) decoder: Decoder,
    pub(super) decoding: bool,
    pub(super) decode_slot: Option<SlotId>,
    pub(super) encode_slot: Option<SlotId>,
    pub(super) end_after_flush: bool,
    pub(super) connack_sent: bool,
    pub(super) connack_pending: Option<ConnackProperties>,
    pub(super) client_id: String,
    /// Largest packet the client accepts, from its CONNECT.
    pub(super) client_maximum_packet_size: u32,
    pub(super) session_expiry: u32,
    pub(super) will_grace_millis: i64,
    pub(super) keep_alive_millis: i64,
    pub(super) keep_alive_deadline: i64,
    pub(super) connect_timer: Option<TimerHandle>,
    pub(super) keep_alive_timer: Option<TimerHandle>,
    pub(super) will_timer: Option<TimerHandle>,
    pub(super) aliases: TopicAliases,
    pub(super) interner: TopicInterner,
    pub(super) streams: HashMap<StreamKey, TopicStream>,
    pub(super) app_index: HashMap<u64, AppStream>,
    pub(super) subscriptions: HashMap<u64, Subscription>,
    pub(super) next_subscription: u64,
    pub(super) session: Option<SessionStream>,
    pub(super) will: Option<WillStream>,
    /// Initial id of the topic stream a PUBLISH is waiting on.
    pub(super) blocked_on: Option<u64>,
    pub(super) drop_blocked_publish: bool,
}

impl MqttServer {
    fn accept(
        ctx: &mut EngineContext,
        env: &ServerEnv,
        header: &FrameHeader,
        affinity: u64,
    ) -> Option<Self> {
        let net = match AcceptedStream::accept(header) {
            Ok(net) => net,
            Err(err) => {
                warn!(stream_id = header.stream_id, %err, "rejecting mqtt network stream");
                return None;
            }
        };
        let trace_id = header.trace_id;
        let mut server = Self {
            net,
            trace_id,
            affinity,
            window: env.config.initial_window,
            decoder: Decoder::Connect,
            decoding: false,
            decode_slot: None,
            encode_slot: None,
            end_after_flush: false,
            connack_sent: false,
            connack_pending: None,
            client_id: String::new(),
            client_maximum_packet_size: u32::MAX,
            session_expiry: 0,
            will_grace_millis: i64::from(env.config.session_expiry_grace_period_secs) * 1000,
            keep_alive_millis: 0,
            keep_alive_deadline: 0,
            connect_timer: None,
            keep_alive_timer: None,
            will_timer: None,
            aliases: TopicAliases::default(),
            interner: TopicInterner::new(),
            streams: HashMap::new(),
            app_index: HashMap::new(),
            subscriptions: HashMap::new(),
            next_subscription: 0,
            session: None,
            will: None,
            blocked_on: None,
            drop_blocked_publish: false,
        };
        server.net.begin(ctx, trace_id, affinity, Extension::None);
        server.net.window(ctx, trace_id, server.window);
        let timeout = (env.config.connect_timeout_secs * 1000) as i64;
        let target = server.net.signal_target(trace_id);
        server.connect_timer =
            Some(ctx.signal_at(ctx.now_millis() + timeout, target, SIGNAL_CONNECT_TIMEOUT, 0));
        debug!(stream_id = header.stream_id, "mqtt connection accepted");
        Some(server)
    }

    pub(super) fn is_done(&self) -> bool {
        self.net.state.closed() && self.will.is_none()
    }

    fn on_frame(&mut self, ctx: &mut EngineContext, env: &mut ServerEnv, frame: Frame) {
        self.trace_id = frame.header.trace_id;
        let stream_id = frame.stream_id();
        if stream_id == self.net.ids.initial_id || stream_id == self.net.ids.reply_id {
            self.on_network(ctx, env, frame);
            return;
        }
        match self.app_index.get(&(stream_id | 1)).copied() {
            Some(AppStream::Topic(key)) => self.on_topic(ctx, env, key, frame),
            Some(AppStream::Session) => self.on_session(ctx, env, frame),
            Some(AppStream::Will) => self.on_will(ctx, frame),
            None => debug!(stream_id, frame = frame.name(), "mqtt frame for released stream"),
        }
    }

    fn on_budget_ready(&mut self, ctx: &mut EngineContext, env: &mut ServerEnv, watcher: u64) {
        if watcher == self.net.ids.reply_id {
            self.flush_network(ctx);
            self.release_app_replies(ctx);
        } else if self.blocked_on == Some(watcher) {
            self.resume_decode(ctx, env);
        } else if self.session.as_ref().is_some_and(|s| s.app.ids.initial_id == watcher) {
            self.send_session_state(ctx);
            self.decode_network(ctx, env);
        } else if self.will.as_ref().is_some_and(|w| w.app.ids.initial_id == watcher) {
            self.publish_will(ctx);
        }
    }

    fn on_network(&mut self, ctx: &mut EngineContext, env: &mut ServerEnv, frame: Frame) {
        let Frame { header, kind } = frame;
        match kind {
            FrameKind::Begin { .. } => debug!(stream_id = header.stream_id, "duplicate mqtt begin"),
            FrameKind::Data {
                reserved, payload, ..
            } => self.on_net_data(ctx, env, &header, reserved, payload),
            FrameKind::Flush { reserved, .. } => {
                if let Err(err) = self.net.on_data(&header, reserved) {
                    warn!(stream_id = header.stream_id, %err, "mqtt network flow violated");
                    self.fail_network(ctx);
                }
            }
            FrameKind::End { .. } => self.on_net_end(ctx, &header, false),
            FrameKind::Abort { .. } => self.on_net_end(ctx, &header, true),
            FrameKind::Window {
                budget_id, padding, ..
            } => {
                if let Err(err) = self.net.on_window(&header, budget_id, padding) {
                    warn!(stream_id = header.stream_id, %err, "mqtt network window invalid");
                    self.fail_network(ctx);
                    return;
                }
                self.flush_network(ctx);
                self.release_app_replies(ctx);
            }
            FrameKind::Reset { .. } => self.on_net_reset(ctx),
            FrameKind::Signal { signal_id, .. } => self.on_net_signal(ctx, signal_id),
        }
    }

    fn on_net_data(
        &mut self,
        ctx: &mut EngineContext,
        env: &mut ServerEnv,
        header: &FrameHeader,
        reserved: u32,
        payload: Option<Bytes>,
    ) {
        if let Err(err) = self.net.on_data(header, reserved) {
            warn!(stream_id = header.stream_id, %err, "mqtt network flow violated");
            self.fail_network(ctx);
            return;
        }
        let Some(payload) = payload else {
            return;
        };
        if self.decoder == Decoder::IgnoreAll {
            self.net.window(ctx, self.trace_id, self.window);
            return;
        }
        let Some(slot) = self.decode_slot.or_else(|| ctx.buffers.acquire()) else {
            warn!(stream_id = header.stream_id, "mqtt decode buffers exhausted");
            self.fail_network(ctx);
            return;
        };
        self.decode_slot = Some(slot);
        ctx.buffers.buffer_mut(slot).extend_from_slice(&payload);
        self.decode_network(ctx, env);
    }

    fn on_net_end(&mut self, ctx: &mut EngineContext, header: &FrameHeader, abort: bool) {
        if let Err(err) = self.net.on_end(header) {
            debug!(stream_id = header.stream_id, %err, "mqtt network end out of sequence");
        }
        self.release_decode_slot(ctx);
        if self.decoder != Decoder::IgnoreAll {
            debug!(client_id = %self.client_id, abort, "mqtt client closed without disconnect");
            self.decoder = Decoder::IgnoreAll;
            self.on_ungraceful(ctx);
        }
        self.close_app_streams(ctx, abort);
        if abort {
            self.release_encode_slot(ctx);
            self.net.abort(ctx, self.trace_id, Extension::None);
        } else {
            self.end_network(ctx);
        }
    }

    fn on_net_reset(&mut self, ctx: &mut EngineContext) {
        self.net.on_reset(ctx);
        self.release_encode_slot(ctx);
        if self.decoder != Decoder::IgnoreAll {
            self.decoder = Decoder::IgnoreAll;
            self.on_ungraceful(ctx);
        }
        self.close_app_streams(ctx, true);
        self.release_decode_slot(ctx);
        self.net.reset(ctx, self.trace_id, Extension::None);
    }

    fn on_net_signal(&mut self, ctx: &mut EngineContext, signal_id: u32) {
        match signal_id {
            SIGNAL_CONNECT_TIMEOUT => {
                self.connect_timer = None;
                if !self.connack_sent && !self.net.state.closed() {
                    debug!(stream_id = self.net.ids.initial_id, "mqtt connect timed out");
                    self.decoder = Decoder::IgnoreAll;
                    self.release_will(ctx, false);
                    self.close_app_streams(ctx, false);
                    self.release_decode_slot(ctx);
                    self.net.reset(ctx, self.trace_id, Extension::None);
                    self.end_network(ctx);
                }
            }
            SIGNAL_KEEP_ALIVE_TIMEOUT => {
                self.keep_alive_timer = None;
                if self.decoder == Decoder::IgnoreAll {
                    return;
                }
                if ctx.now_millis() >= self.keep_alive_deadline {
                    self.disconnect(ctx, ReasonCodes::KEEP_ALIVE_TIMEOUT);
                } else {
                    self.arm_keep_alive(ctx);
                }
            }
            SIGNAL_SESSION_EXPIRY => {
                self.will_timer = None;
                self.publish_will(ctx);
            }
            SIGNAL_WILL_ABANDONED => {
                if let Some(will) = self.will.as_mut() {
                    will.abandon_timer = None;
                    warn!(client_id = %self.client_id, topic = %will.message.topic, "mqtt will abandoned");
                    self.release_will(ctx, true);
                }
            }
            other => debug!(signal_id = other, "unexpected mqtt signal"),
        }
    }

    /// Tear down after a transport-level violation.
    fn fail_network(&mut self, ctx: &mut EngineContext) {
        if self.decoder != Decoder::IgnoreAll {
            self.decoder = Decoder::IgnoreAll;
            self.on_ungraceful(ctx);
        }
        self.close_app_streams(ctx, true);
        self.release_decode_slot(ctx);
        self.release_encode_slot(ctx);
        self.net.reset(ctx, self.trace_id, Extension::None);
        self.net.abort(ctx, self.trace_id, Extension::None);
    }

    /// Server-initiated DISCONNECT followed by network END.
    pub(super) fn disconnect(&mut self, ctx: &mut EngineContext, reason: ReasonCode) {
        info!(client_id = %self.client_id, reason = reason_name(reason), "mqtt disconnecting client");
        if self.connack_sent {
            self.encode_network(ctx, |out| codec::encode_disconnect(out, reason));
        }
        self.decoder = Decoder::IgnoreAll;
        self.on_ungraceful(ctx);
        self.close_app_streams(ctx, false);
        self.end_network(ctx);
    }

    pub(super) fn send_connack(&mut self, ctx: &mut EngineContext, props: ConnackProperties) {
        self.encode_network(ctx, |out| {
            codec::encode_connack(out, false, ReasonCodes::SUCCESS, &props);
        });
        self.connack_sent = true;
        ctx.cancel(&mut self.connect_timer);
        if self.keep_alive_millis > 0 {
            self.keep_alive_deadline = ctx.now_millis() + self.keep_alive_millis;
            self.arm_keep_alive(ctx);
        }
        info!(client_id = %self.client_id, session_expiry = self.session_expiry, "mqtt client connected");
    }

    fn arm_keep_alive(&mut self, ctx: &mut EngineContext) {
        if self.keep_alive_timer.is_none() {
            let target = self.net.signal_target(self.trace_id);
            self.keep_alive_timer =
                Some(ctx.signal_at(self.keep_alive_deadline, target, SIGNAL_KEEP_ALIVE_TIMEOUT, 0));
        }
    }

    // ---- network encoding ----

    /// Append encoded bytes to the network encode slot and flush what fits.
    pub(super) fn encode_network(&mut self, ctx: &mut EngineContext, encode: impl FnOnce(&mut BytesMut)) {
        if self.net.state.reply_closed() || self.end_after_flush {
            return;
        }
        let Some(slot) = self.encode_slot.or_else(|| ctx.buffers.acquire()) else {
            warn!(client_id = %self.client_id, "mqtt encode buffers exhausted");
            self.fail_network(ctx);
            return;
        };
        self.encode_slot = Some(slot);
        encode(ctx.buffers.buffer_mut(slot));
        self.flush_network(ctx);
    }

    fn flush_network(&mut self, ctx: &mut EngineContext) {
        let Some(slot) = self.encode_slot else {
            return;
        };
        if !self.net.state.reply_opened() || self.net.state.reply_closed() {
            return;
        }
        let pending = ctx.buffers.buffer(slot).len();
        let (length, reserved) = self.net.claim_partial(ctx, pending);
        if length > 0 {
            let payload = ctx.buffers.buffer_mut(slot).split_to(length).freeze();
            let trace_id = self.trace_id;
            if let Err(err) =
                self.net
                    .data(ctx, trace_id, FLAG_INIT | FLAG_FIN, reserved, Some(payload), Extension::None)
            {
                warn!(client_id = %self.client_id, %err, "mqtt network write rejected");
            }
        }
        if ctx.buffers.buffer(slot).is_empty() {
            self.release_encode_slot(ctx);
            if self.end_after_flush {
                self.end_after_flush = false;
                self.net.end(ctx, self.trace_id, Extension::None);
            }
        }
    }

    fn end_network(&mut self, ctx: &mut EngineContext) {
        if self.encode_slot.is_some() {
            self.end_after_flush = true;
        } else {
            self.net.end(ctx, self.trace_id, Extension::None);
        }
    }

    fn release_encode_slot(&mut self, ctx: &mut EngineContext) {
        if let Some(slot) = self.encode_slot.take() {
            ctx.buffers.release(slot);
        }
    }

    pub(super) fn release_decode_slot(&mut self, ctx: &mut EngineContext) {
        if let Some(slot) = self.decode_slot.take() {
            ctx.buffers.release(slot);
        }
    }

    /// Reopen application reply windows once encoded output has drained.
    fn release_app_replies(&mut self, ctx: &mut EngineContext) {
        if self.encode_slot.is_some() {
            return;
        }
        for stream in self.streams.values_mut() {
            if stream.app.state.reply_opened() {
                stream.app.window(ctx, self.trace_id, self.window);
            }
        }
    }

    // ---- topic streams ----

    /// Find or open the topic stream for `topic` on `route_id` and make sure
    /// it carries `capability`.
    pub(super) fn attach_topic_stream(
        &mut self,
        ctx: &mut EngineContext,
        route_id: RouteId,
        topic: &str,
        capability: Capabilities,
        flags: SubscribeFlags,
        subscription_id: u32,
    ) -> StreamKey {
        let key = (route_id, self.interner.intern(topic));
        let trace_id = self.trace_id;
        let subscribing = capability.contains(Capabilities::SUBSCRIBE_ONLY);
        if let Some(stream) = self.streams.get_mut(&key) {
            let changed = !stream.capabilities.contains(capability)
                || subscribing
                    && (stream.flags != flags || stream.subscription_id != subscription_id);
            stream.capabilities |= capability;
            if subscribing {
                stream.flags = flags;
                stream.subscription_id = subscription_id;
            }
            if changed {
                let ex = MqttFlushEx {
                    capabilities: stream.capabilities,
                    flags: stream.flags,
                };
                stream.app.flush(ctx, trace_id, Extension::MqttFlush(ex));
            }
            return key;
        }

        let ids = StreamIds::new(
            self.net.ids.routed_id,
            route_id,
            ctx.supply_initial_id(),
            self.net.ids.authorization,
        );
        let mut app = OpenedStream::new(ids);
        let ex = MqttBeginEx {
            capabilities: capability,
            client_id: self.client_id.clone(),
            topic: topic.to_string(),
            flags: if subscribing { flags } else { SubscribeFlags::empty() },
            subscription_id: if subscribing { subscription_id } else { 0 },
        };
        app.begin(ctx, trace_id, self.affinity, Extension::MqttBegin(ex));
        ctx.bind_pair(ids.initial_id, self.net.ids.initial_id);
        self.app_index.insert(ids.initial_id, AppStream::Topic(key));
        self.streams.insert(
            key,
            TopicStream {
                app,
                topic: topic.to_string(),
                capabilities: capability,
                flags: if subscribing { flags } else { SubscribeFlags::empty() },
                subscription_id: if subscribing { subscription_id } else { 0 },
                pending_acks: Vec::new(),
                publish_expires_at: 0,
                publish_timer: None,
                message: BytesMut::new(),
                message_ex: None,
            },
        );
        debug!(client_id = %self.client_id, topic, route_id, "mqtt topic stream opened");
        key
    }

    /// Drop one capability; the stream ends once none remain.
    pub(super) fn detach_topic_stream(
        &mut self,
        ctx: &mut EngineContext,
        key: StreamKey,
        capability: Capabilities,
    ) {
        let Some(stream) = self.streams.get_mut(&key) else {
            return;
        };
        stream.capabilities.remove(capability);
        if stream.capabilities.is_empty() {
            self.drop_topic_stream(ctx, key, false);
        } else {
            let ex = MqttFlushEx {
                capabilities: stream.capabilities,
                flags: stream.flags,
            };
            stream.app.flush(ctx, self.trace_id, Extension::MqttFlush(ex));
        }
    }

    fn drop_topic_stream(&mut self, ctx: &mut EngineContext, key: StreamKey, abort: bool) {
        let Some(mut stream) = self.streams.remove(&key) else {
            return;
        };
        ctx.cancel(&mut stream.publish_timer);
        stream.app.cleanup(ctx, self.trace_id, abort);
        let initial_id = stream.app.ids.initial_id;
        ctx.unbind_pair(initial_id);
        self.app_index.remove(&initial_id);
        if !self.streams.keys().any(|(_, topic)| *topic == key.1) {
            self.interner.release(key.1);
        }
        if self.blocked_on == Some(initial_id) {
            self.blocked_on = None;
            self.drop_blocked_publish = true;
        }
        for ack in stream.pending_acks {
            self.complete_subscription(ctx, ack.subscription, ack.index, ReasonCodes::UNSPECIFIED_ERROR);
        }
    }

    fn on_topic(&mut self, ctx: &mut EngineContext, env: &mut ServerEnv, key: StreamKey, frame: Frame) {
        let trace_id = self.trace_id;
        let window = self.window;
        let Some(stream) = self.streams.get_mut(&key) else {
            return;
        };
        let initial_id = stream.app.ids.initial_id;
        let Frame { header, kind } = frame;
        match kind {
            FrameKind::Window {
                budget_id, padding, ..
            } => {
                if let Err(err) = stream.app.on_window(&header, budget_id, padding) {
                    warn!(topic = %stream.topic, %err, "mqtt topic window invalid");
                    self.drop_topic_stream(ctx, key, true);
                    self.resume_after_drop(ctx, env);
                    return;
                }
                let acks = std::mem::take(&mut stream.pending_acks);
                for ack in acks {
                    self.complete_subscription(ctx, ack.subscription, ack.index, ack.granted);
                }
                if self.blocked_on == Some(initial_id) {
                    self.resume_decode(ctx, env);
                }
            }
            FrameKind::Reset { .. } => {
                stream.app.on_reset(ctx);
                debug!(topic = %stream.topic, "mqtt topic stream reset");
                self.drop_topic_stream(ctx, key, false);
                self.resume_after_drop(ctx, env);
            }
            FrameKind::Begin { .. } => {
                if let Err(err) = stream.app.on_begin(&header) {
                    warn!(topic = %stream.topic, %err, "mqtt topic reply rejected");
                    self.drop_topic_stream(ctx, key, true);
                    return;
                }
                stream.app.window(ctx, trace_id, window);
            }
            FrameKind::Data {
                flags,
                reserved,
                payload,
                extension,
                ..
            } => {
                if let Err(err) = stream.app.on_data(&header, reserved) {
                    warn!(topic = %stream.topic, %err, "mqtt topic reply flow violated");
                    self.drop_topic_stream(ctx, key, true);
                    return;
                }
                self.on_topic_data(ctx, key, flags, payload, &extension);
            }
            FrameKind::Flush { reserved, .. } => {
                if let Err(err) = stream.app.on_data(&header, reserved) {
                    warn!(topic = %stream.topic, %err, "mqtt topic reply flow violated");
                    self.drop_topic_stream(ctx, key, true);
                }
            }
            FrameKind::End { .. } | FrameKind::Abort { .. } => {
                if let Err(err) = stream.app.on_end(&header) {
                    debug!(topic = %stream.topic, %err, "mqtt topic reply end out of sequence");
                }
                debug!(topic = %stream.topic, "mqtt topic stream closed by application");
                self.drop_topic_stream(ctx, key, false);
                self.resume_after_drop(ctx, env);
            }
            FrameKind::Signal {
                signal_id: SIGNAL_PUBLISH_EXPIRED,
                ..
            } => self.on_publish_expired(ctx, key),
            FrameKind::Signal { signal_id, .. } => {
                debug!(signal_id, "unexpected mqtt topic signal");
            }
        }
    }

    /// A dropped stream may have been holding back a PUBLISH.
    fn resume_after_drop(&mut self, ctx: &mut EngineContext, env: &mut ServerEnv) {
        if self.drop_blocked_publish {
            self.decode_network(ctx, env);
        }
    }

    fn on_topic_data(
        &mut self,
        ctx: &mut EngineContext,
        key: StreamKey,
        flags: u8,
        payload: Option<Bytes>,
        extension: &Extension,
    ) {
        let Some(stream) = self.streams.get_mut(&key) else {
            return;
        };
        if flags & FLAG_INIT != 0 {
            stream.message.clear();
            stream.message_ex = extension.mqtt_data().cloned();
        }
        if let Some(payload) = &payload {
            stream.message.extend_from_slice(payload);
        }
        if flags & FLAG_FIN == 0 {
            return;
        }
        let mut ex = stream.message_ex.take().unwrap_or_default();
        let message = stream.message.split().freeze();
        let topic = ex.topic.take().unwrap_or_else(|| stream.topic.clone());
        let retain = ex.retain() && stream.flags.contains(SubscribeFlags::RETAIN_AS_PUBLISHED);
        if ex.subscription_ids.is_empty() && stream.subscription_id != 0 {
            ex.subscription_ids.push(stream.subscription_id);
        }
        let mut packet = BytesMut::new();
        codec::encode_publish(&mut packet, &topic, retain, &ex, &message);
        if packet.len() > self.client_maximum_packet_size as usize {
            debug!(
                client_id = %self.client_id,
                topic = %topic,
                size = packet.len(),
                "mqtt publish exceeds client maximum packet size"
            );
        } else {
            self.encode_network(ctx, |out| out.extend_from_slice(&packet));
        }
        self.release_app_replies(ctx);
    }

    fn on_publish_expired(&mut self, ctx: &mut EngineContext, key: StreamKey) {
        let trace_id = self.trace_id;
        let Some(stream) = self.streams.get_mut(&key) else {
            return;
        };
        stream.publish_timer = None;
        if ctx.now_millis() < stream.publish_expires_at {
            let target = stream.app.signal_target(trace_id);
            stream.publish_timer =
                Some(ctx.signal_at(stream.publish_expires_at, target, SIGNAL_PUBLISH_EXPIRED, 0));
            return;
        }
        debug!(topic = %stream.topic, "mqtt publish stream idle");
        self.detach_topic_stream(ctx, key, Capabilities::PUBLISH_ONLY);
    }

    /// Record one filter's outcome; SUBACK goes out once every filter has one.
    pub(super) fn complete_subscription(
        &mut self,
        ctx: &mut EngineContext,
        subscription: u64,
        index: usize,
        reason: ReasonCode,
    ) {
        let Some(entry) = self.subscriptions.get_mut(&subscription) else {
            return;
        };
        if let Some(slot) = entry.reasons.get_mut(index) {
            slot.get_or_insert(reason);
        }
        if entry.reasons.iter().any(Option::is_none) {
            return;
        }
        if let Some(entry) = self.subscriptions.remove(&subscription) {
            let reasons: Vec<ReasonCode> = entry.reasons.into_iter().flatten().collect();
            self.encode_network(ctx, |out| codec::encode_suback(out, entry.packet_id, &reasons));
        }
    }

    // ---- session stream ----

    pub(super) fn open_session_stream(&mut self, ctx: &mut EngineContext, route_id: RouteId, state: Bytes) {
        let ids = StreamIds::new(
            self.net.ids.routed_id,
            route_id,
            ctx.supply_initial_id(),
            self.net.ids.authorization,
        );
        let mut app = OpenedStream::new(ids);
        let ex = MqttBeginEx {
            capabilities: Capabilities::SESSION,
            client_id: self.client_id.clone(),
            topic: session::session_topic(&self.client_id),
            ..MqttBeginEx::default()
        };
        app.begin(ctx, self.trace_id, self.affinity, Extension::MqttBegin(ex));
        ctx.bind_pair(ids.initial_id, self.net.ids.initial_id);
        self.app_index.insert(ids.initial_id, AppStream::Session);
        self.session = Some(SessionStream {
            app,
            state: Some(state),
        });
    }

    fn on_session(&mut self, ctx: &mut EngineContext, env: &mut ServerEnv, frame: Frame) {
        let trace_id = self.trace_id;
        let window = self.window;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Frame { header, kind } = frame;
        match kind {
            FrameKind::Window {
                budget_id, padding, ..
            } => {
                if let Err(err) = session.app.on_window(&header, budget_id, padding) {
                    warn!(client_id = %self.client_id, %err, "mqtt session window invalid");
                    self.release_session(ctx, true);
                    self.session_unavailable(ctx, env);
                    return;
                }
                self.send_session_state(ctx);
                self.decode_network(ctx, env);
            }
            FrameKind::Reset { .. } => {
                session.app.on_reset(ctx);
                debug!(client_id = %self.client_id, "mqtt session state unavailable");
                self.release_session(ctx, false);
                self.session_unavailable(ctx, env);
            }
            FrameKind::Begin { .. } => {
                if session.app.on_begin(&header).is_ok() {
                    session.app.window(ctx, trace_id, window);
                }
            }
            FrameKind::Data { reserved, .. } | FrameKind::Flush { reserved, .. } => {
                if session.app.on_data(&header, reserved).is_ok() {
                    session.app.window(ctx, trace_id, window);
                }
            }
            FrameKind::End { .. } | FrameKind::Abort { .. } => {
                // trailing sequence is irrelevant once the session is gone
                let _ = session.app.on_end(&header);
                self.release_session(ctx, false);
                if self.connack_sent && self.decoder != Decoder::IgnoreAll {
                    self.disconnect(ctx, ReasonCodes::SESSION_TAKEN_OVER);
                } else {
                    self.session_unavailable(ctx, env);
                }
            }
            FrameKind::Signal { .. } => {}
        }
    }

    /// Write the pending session-state record, then release the held CONNACK.
    fn send_session_state(&mut self, ctx: &mut EngineContext) {
        let trace_id = self.trace_id;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(state) = session.state.clone() else {
            return;
        };
        if !session.app.state.initial_opened() {
            return;
        }
        let Some(reserved) = session.app.claim_whole(ctx, state.len()) else {
            return;
        };
        let ex = MqttDataEx {
            topic: Some(session::session_topic(&self.client_id)),
            format: PayloadFormat::Text,
            ..MqttDataEx::default()
        };
        if let Err(err) = session.app.data(
            ctx,
            trace_id,
            FLAG_INIT | FLAG_FIN,
            reserved,
            Some(state),
            Extension::MqttData(ex),
        ) {
            warn!(client_id = %self.client_id, %err, "mqtt session state rejected");
            return;
        }
        session.state = None;
        if let Some(props) = self.connack_pending.take() {
            self.send_connack(ctx, props);
        }
    }

    /// CONNACK without session persistence when the session store is gone.
    fn session_unavailable(&mut self, ctx: &mut EngineContext, env: &mut ServerEnv) {
        if let Some(mut props) = self.connack_pending.take() {
            if self.session_expiry != 0 {
                props.session_expiry = Some(0);
            }
            self.session_expiry = 0;
            self.send_connack(ctx, props);
            self.decode_network(ctx, env);
        }
    }

    fn release_session(&mut self, ctx: &mut EngineContext, abort: bool) {
        if let Some(mut session) = self.session.take() {
            session.app.cleanup(ctx, self.trace_id, abort);
            ctx.unbind_pair(session.app.ids.initial_id);
            self.app_index.remove(&session.app.ids.initial_id);
        }
    }

    // ---- will stream ----

    pub(super) fn open_will_stream(&mut self, ctx: &mut EngineContext, route_id: RouteId, message: WillMessage) {
        let ids = StreamIds::new(
            self.net.ids.routed_id,
            route_id,
            ctx.supply_initial_id(),
            self.net.ids.authorization,
        );
        let mut app = OpenedStream::new(ids);
        let ex = MqttBeginEx {
            capabilities: Capabilities::PUBLISH_ONLY,
            client_id: self.client_id.clone(),
            topic: session::will_topic(&self.client_id),
            ..MqttBeginEx::default()
        };
        app.begin(ctx, self.trace_id, self.affinity, Extension::MqttBegin(ex));
        ctx.bind_pair(ids.initial_id, self.net.ids.initial_id);
        self.app_index.insert(ids.initial_id, AppStream::Will);
        self.will = Some(WillStream {
            app,
            message,
            publish_pending: false,
            abandon_timer: None,
        });
    }

    fn on_will(&mut self, ctx: &mut EngineContext, frame: Frame) {
        let trace_id = self.trace_id;
        let window = self.window;
        let Some(will) = self.will.as_mut() else {
            return;
        };
        let Frame { header, kind } = frame;
        match kind {
            FrameKind::Window {
                budget_id, padding, ..
            } => {
                if let Err(err) = will.app.on_window(&header, budget_id, padding) {
                    warn!(client_id = %self.client_id, %err, "mqtt will window invalid");
                    self.release_will(ctx, true);
                    return;
                }
                if will.publish_pending {
                    self.publish_will(ctx);
                }
            }
            FrameKind::Reset { .. } => {
                will.app.on_reset(ctx);
                debug!(client_id = %self.client_id, "mqtt will stream reset");
                self.release_will(ctx, false);
            }
            FrameKind::Begin { .. } => {
                if will.app.on_begin(&header).is_ok() {
                    will.app.window(ctx, trace_id, window);
                }
            }
            FrameKind::Data { reserved, .. } | FrameKind::Flush { reserved, .. } => {
                if will.app.on_data(&header, reserved).is_ok() {
                    will.app.window(ctx, trace_id, window);
                }
            }
            FrameKind::End { .. } | FrameKind::Abort { .. } => {
                let _ = will.app.on_end(&header);
            }
            FrameKind::Signal { .. } => {}
        }
    }

    /// Ungraceful close: publish the will now, or after its delay when the
    /// session outlives the connection.
    pub(super) fn on_ungraceful(&mut self, ctx: &mut EngineContext) {
        let Some(will) = self.will.as_mut() else {
            return;
        };
        if will.publish_pending || self.will_timer.is_some() {
            return;
        }
        let delay = if self.session_expiry == 0 {
            0
        } else {
            will.message.delay.min(self.session_expiry)
        };
        if delay == 0 {
            self.publish_will(ctx);
        } else {
            let at = ctx.now_millis() + i64::from(delay) * 1000;
            let target = self.net.signal_target(self.trace_id);
            self.will_timer = Some(ctx.signal_at(at, target, SIGNAL_SESSION_EXPIRY, 0));
            debug!(client_id = %self.client_id, delay, "mqtt will delayed");
        }
    }

    fn publish_will(&mut self, ctx: &mut EngineContext) {
        let trace_id = self.trace_id;
        let Some(will) = self.will.as_mut() else {
            return;
        };
        will.publish_pending = true;
        if will.abandon_timer.is_none() {
            let at = ctx.now_millis() + self.will_grace_millis;
            let target = self.net.signal_target(trace_id);
            will.abandon_timer = Some(ctx.signal_at(at, target, SIGNAL_WILL_ABANDONED, 0));
        }
        if !will.app.state.initial_opened() {
            return;
        }
        let payload = will.message.payload.clone();
        let Some(reserved) = will.app.claim_whole(ctx, payload.len()) else {
            return;
        };
        let ex = session::will_data_ex(&will.message);
        ctx.cancel(&mut will.abandon_timer);
        if let Err(err) = will.app.data(
            ctx,
            trace_id,
            FLAG_INIT | FLAG_FIN,
            reserved,
            Some(payload),
            Extension::MqttData(ex),
        ) {
            warn!(client_id = %self.client_id, %err, "mqtt will rejected");
        } else {
            info!(client_id = %self.client_id, topic = %will.message.topic, "mqtt will published");
        }
        self.release_will(ctx, false);
    }

    /// End the will stream; unpublished wills are discarded.
    pub(super) fn release_will(&mut self, ctx: &mut EngineContext, abort: bool) {
        ctx.cancel(&mut self.will_timer);
        if let Some(mut will) = self.will.take() {
            ctx.cancel(&mut will.abandon_timer);
            will.app.cleanup(ctx, self.trace_id, abort);
            ctx.unbind_pair(will.app.ids.initial_id);
            self.app_index.remove(&will.app.ids.initial_id);
        }
    }

    // ---- teardown ----

    pub(super) fn close_app_streams(&mut self, ctx: &mut EngineContext, abort: bool) {
        self.subscriptions.clear();
        let keys: Vec<StreamKey> = self.streams.keys().copied().collect();
        for key in keys {
            self.drop_topic_stream(ctx, key, abort);
        }
        self.release_session(ctx, abort);
        self.blocked_on = None;
        self.drop_blocked_publish = false;
    }

    fn release(&mut self, ctx: &mut EngineContext) {
        ctx.cancel(&mut self.connect_timer);
        ctx.cancel(&mut self.keep_alive_timer);
        self.close_app_streams(ctx, true);
        self.release_will(ctx, true);
        self.release_decode_slot(ctx);
        self.release_encode_slot(ctx);
        ctx.budgets.release(self.net.ids.reply_id);
        ctx.unbind_pair(self.net.ids.initial_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::MqttRouteConfig;
    use crate::core::time::ManualClock;
    use crate::mqtt::route::ConfigMqttRouter;

    const NET: u64 = 3;

    fn factory(clock: ManualClock) -> MqttServerFactory {
        let router = ConfigMqttRouter::new(vec![MqttRouteConfig {
            id: 7,
            publish: vec!["#".into()],
            subscribe: vec!["#".into()],
            session: false,
        }]);
        MqttServerFactory::new(MqttConfig::default(), Box::new(router), Arc::new(clock))
            .with_client_id_supplier(|| "client-1".to_string())
    }

    fn header(stream_id: u64) -> FrameHeader {
        FrameHeader {
            origin_id: 1,
            routed_id: 2,
            stream_id,
            ..FrameHeader::default()
        }
    }

    fn connect_bytes() -> Bytes {
        // CONNECT, protocol MQTT v5, clean start, keep alive 0, no properties, empty client id
        Bytes::from_static(&[
            0x10, 13, 0, 4, b'M', b'Q', b'T', b'T', 5, 0x02, 0, 0, 0, 0, 0,
        ])
    }

    #[test]
    fn begin_opens_connection_with_window_and_connect_timer() {
        let clock = ManualClock::new(0);
        let mut factory = factory(clock.clone());
        factory.handle(Frame::begin(header(NET), 0, Extension::None));
        assert_eq!(factory.connections(), 1);

        let frames = factory.drain();
        assert_eq!(frames[0].name(), "BEGIN");
        assert_eq!(frames[0].stream_id(), NET ^ 1);
        assert_eq!(frames[1].name(), "WINDOW");
        assert_eq!(frames[1].header.maximum, MqttConfig::default().initial_window);

        clock.advance(3_000);
        factory.tick();
        let frames = factory.drain();
        let names: Vec<&str> = frames.iter().map(Frame::name).collect();
        assert_eq!(names, vec!["RESET", "END"]);
        assert_eq!(factory.connections(), 0);
    }

    #[test]
    fn connack_waits_for_network_window() {
        let clock = ManualClock::new(0);
        let mut factory = factory(clock);
        factory.handle(Frame::begin(header(NET), 0, Extension::None));
        factory.drain();

        let mut data = header(NET);
        data.sequence = 0;
        let connect = connect_bytes();
        let reserved = connect.len() as u32;
        factory.handle(Frame::data(data, FLAG_INIT | FLAG_FIN, 0, reserved, Some(connect), Extension::None));
        let frames = factory.drain();
        assert!(frames.iter().all(|f| f.name() != "DATA"));

        let window = FrameHeader {
            maximum: 1024,
            ..header(NET ^ 1)
        };
        factory.handle(Frame::window(window, 0, 0, 0));
        let frames = factory.drain();
        let connack = frames.iter().find(|f| f.name() == "DATA").unwrap();
        assert_eq!(connack.payload()[0], 0x20);
        assert_eq!(connack.payload()[3], ReasonCodes::SUCCESS);
    }

    fn deliver(factory: &mut MqttServerFactory, sequence: u64, packet: Bytes) -> Vec<Frame> {
        let mut data = header(NET);
        data.sequence = sequence;
        let reserved = packet.len() as u32;
        factory.handle(Frame::data(data, FLAG_INIT | FLAG_FIN, 0, reserved, Some(packet), Extension::None));
        factory.drain()
    }

    #[test]
    fn unsubscribed_topics_leave_the_interner() {
        // SUBSCRIBE packet id 1, filter "a/#"; UNSUBSCRIBE packet id 2, same filter
        const SUBSCRIBE: &[u8] = &[0x82, 9, 0, 1, 0, 0, 3, b'a', b'/', b'#', 0x00];
        const UNSUBSCRIBE: &[u8] = &[0xA2, 8, 0, 2, 0, 0, 3, b'a', b'/', b'#'];

        let mut factory = factory(ManualClock::new(0));
        factory.handle(Frame::begin(header(NET), 0, Extension::None));
        factory.handle(Frame::window(FrameHeader { maximum: 1024, ..header(NET ^ 1) }, 0, 0, 0));
        let connect = connect_bytes();
        let mut sequence = connect.len() as u64;
        deliver(&mut factory, 0, connect);

        deliver(&mut factory, sequence, Bytes::from_static(SUBSCRIBE));
        sequence += SUBSCRIBE.len() as u64;
        let interned = |factory: &MqttServerFactory| {
            factory.servers.values().map(|server| server.interner.len()).sum::<usize>()
        };
        assert_eq!(interned(&factory), 1);

        let frames = deliver(&mut factory, sequence, Bytes::from_static(UNSUBSCRIBE));
        let unsuback = frames.iter().find(|f| f.name() == "DATA" && f.stream_id() == NET ^ 1).unwrap();
        assert_eq!(unsuback.payload()[0], 0xB0);
        assert_eq!(interned(&factory), 0);
        assert_eq!(factory.connections(), 1);
    }
}
