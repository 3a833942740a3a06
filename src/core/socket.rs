use crate::core::auth::decode_jwt_payload;
use crate::core::channel::{Channel, ChannelEntry, SubscribeOptions};
use crate::core::config::ConnectOptions;
use crate::core::events::{
    ack_timeout_payload, ChannelEvent, ChannelSlot, ChannelStateChange, Responder, SlotTable,
    SlotTarget, SocketEvent, SocketSlot, Subscription,
};
use crate::core::pending::{CallId, PendingResponses, ResponseHandler, ResponseItem, ResponseSink};
use crate::core::state::{
    AtomicChannelState, AtomicConnectionState, AuthState, ChannelState, ConnectionState,
};
use crate::traits::codec::{CodecEngine, TextCodec, WsMessage};
use crate::traits::error::{AckFailure, Result, SocketError};
use crate::traits::transport::{establish, CloseReason, Transport, WsTransport};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Commands dispatched from the public handles to the executor task.
pub(crate) enum Command {
    Connect,
    Close(oneshot::Sender<Result<()>>),
    Emit {
        event: String,
        data: Value,
        handler: Option<ResponseHandler>,
        no_timeout: bool,
    },
    Subscribe {
        name: String,
        options: SubscribeOptions,
    },
    Unsubscribe {
        name: String,
    },
    DestroyChannel {
        name: String,
    },
    Watch {
        id: u64,
        slot: SocketSlot,
    },
    Unwatch {
        id: u64,
    },
    WatchChannel {
        name: String,
        id: u64,
        slot: ChannelSlot,
    },
    UnwatchChannel {
        name: String,
        id: u64,
    },
    /// Reply to a server-initiated event (from a [`Responder`]).
    Respond {
        rid: CallId,
        data: Value,
    },
    /// Posted by an armed ack timer when it expires.
    AckTimeout(CallId),
}

/// State shared between the executor and the public handles: lock-free
/// snapshots plus the token cells. All writes happen on the executor.
pub struct Shared {
    pub(crate) state: AtomicConnectionState,
    signed_auth_token: Mutex<Option<String>>,
    auth_token: Mutex<Option<Value>>,
    channel_states: Mutex<HashMap<String, Arc<AtomicChannelState>>>,
    next_slot_id: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: AtomicConnectionState::new(ConnectionState::Closed),
            signed_auth_token: Mutex::new(None),
            auth_token: Mutex::new(None),
            channel_states: Mutex::new(HashMap::new()),
            next_slot_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn auth_state(&self) -> AuthState {
        if self.signed_auth_token.lock().unwrap().is_some() {
            AuthState::Authenticated
        } else {
            AuthState::Unauthenticated
        }
    }

    fn signed_auth_token(&self) -> Option<String> {
        self.signed_auth_token.lock().unwrap().clone()
    }

    fn auth_token(&self) -> Option<Value> {
        self.auth_token.lock().unwrap().clone()
    }

    fn set_tokens(&self, signed: Option<String>, claims: Option<Value>) {
        *self.signed_auth_token.lock().unwrap() = signed;
        *self.auth_token.lock().unwrap() = claims;
    }

    /// Get or create the state cell for a channel; handles and the registry
    /// share the same cell.
    fn channel_state_cell(&self, name: &str) -> Arc<AtomicChannelState> {
        self.channel_states
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicChannelState::new(ChannelState::Unsubscribed)))
            .clone()
    }

    fn remove_channel_state(&self, name: &str) {
        self.channel_states.lock().unwrap().remove(name);
    }

    pub(crate) fn next_slot_id(&self) -> u64 {
        self.next_slot_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// A SocketCluster client socket.
///
/// Cheap to clone; all clones drive the same connection. The executor task
/// spawned by [`Socket::new`] owns every piece of mutable protocol state,
/// and every method here is a message to it.
#[derive(Clone)]
pub struct Socket {
    shared: Arc<Shared>,
    options: Arc<ConnectOptions>,
    tx: UnboundedSender<Command>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Socket {
    /// Create the socket and spawn its executor on the ambient tokio
    /// runtime. The socket starts closed; call [`Socket::connect`] to open
    /// it.
    pub fn new(options: ConnectOptions) -> Self {
        let options = Arc::new(options);
        let shared = Arc::new(Shared::new());
        let (tx, rx) = unbounded_channel();

        let core = SocketCore::new(options.clone(), shared.clone(), tx.clone(), rx);
        let task = tokio::spawn(core.run());

        Self {
            shared,
            options,
            tx,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    /// Begin connecting. No-op unless the socket is closed.
    pub fn connect(&self) {
        let _ = self.tx.send(Command::Connect);
    }

    /// Gracefully close the socket and stop its executor. Terminal: the
    /// socket cannot be reconnected afterwards. Suppresses auto-reconnect.
    pub async fn close(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Close(reply_tx))
            .map_err(|_| SocketError::SocketClosed)?;
        let result = reply_rx.await.map_err(|_| SocketError::SocketClosed)?;

        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        result
    }

    /// Alias for [`Socket::close`].
    pub async fn disconnect(&self) -> Result<()> {
        self.close().await
    }

    /// Emit an event without requesting an acknowledgement.
    pub fn emit(&self, event: &str, data: impl Serialize) -> Result<()> {
        self.emit_inner(event, data, None, false)
    }

    /// Emit an event and invoke `handler` exactly once with the server's
    /// response, an [`AckFailure::Timeout`] after `ack_timeout`, or
    /// [`AckFailure::Cancelled`] if the socket closes first.
    pub fn emit_with_ack(
        &self,
        event: &str,
        data: impl Serialize,
        handler: impl FnOnce(std::result::Result<Value, AckFailure>) + Send + 'static,
    ) -> Result<()> {
        self.emit_inner(event, data, Some(Box::new(handler)), false)
    }

    /// Like [`Socket::emit_with_ack`] but without an ack timer; the handler
    /// waits indefinitely for the response (or cancellation at close).
    pub fn emit_with_ack_no_timeout(
        &self,
        event: &str,
        data: impl Serialize,
        handler: impl FnOnce(std::result::Result<Value, AckFailure>) + Send + 'static,
    ) -> Result<()> {
        self.emit_inner(event, data, Some(Box::new(handler)), true)
    }

    fn emit_inner(
        &self,
        event: &str,
        data: impl Serialize,
        handler: Option<ResponseHandler>,
        no_timeout: bool,
    ) -> Result<()> {
        let data = serde_json::to_value(data).map_err(|e| SocketError::Parse(e.to_string()))?;
        self.tx
            .send(Command::Emit {
                event: event.to_string(),
                data,
                handler,
                no_timeout,
            })
            .map_err(|_| SocketError::SocketClosed)
    }

    /// Subscribe to a channel with default options.
    pub fn subscribe(&self, name: &str) -> Channel {
        self.subscribe_with(name, SubscribeOptions::default())
    }

    /// Subscribe to a channel. Idempotent: repeated calls return handles to
    /// the same channel. The `#subscribe` emit is gated on the socket being
    /// open and, with `wait_for_auth`, on authentication; a channel that
    /// cannot subscribe yet stays pending and is retried on those
    /// transitions.
    pub fn subscribe_with(&self, name: &str, options: SubscribeOptions) -> Channel {
        let cell = self.shared.channel_state_cell(name);
        let _ = self.tx.send(Command::Subscribe {
            name: name.to_string(),
            options,
        });
        Channel::new(name.to_string(), cell, self.tx.clone(), self.shared.clone())
    }

    /// Leave a channel; its registry entry (and slots) survive for a later
    /// resubscribe.
    pub fn unsubscribe(&self, name: &str) {
        let _ = self.tx.send(Command::Unsubscribe {
            name: name.to_string(),
        });
    }

    /// Detach all channel slots, unsubscribe, and drop the channel.
    pub fn destroy_channel(&self, name: &str) {
        let _ = self.tx.send(Command::DestroyChannel {
            name: name.to_string(),
        });
    }

    /// Attach a slot receiving every socket event.
    pub fn on(&self, slot: impl FnMut(&SocketEvent) + Send + 'static) -> Subscription {
        let id = self.shared.next_slot_id();
        let _ = self.tx.send(Command::Watch {
            id,
            slot: Box::new(slot),
        });
        Subscription::new(id, SlotTarget::Socket, self.tx.clone())
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    pub fn auth_state(&self) -> AuthState {
        self.shared.auth_state()
    }

    /// The opaque signed token from the last `#setAuthToken`, if any.
    pub fn signed_auth_token(&self) -> Option<String> {
        self.shared.signed_auth_token()
    }

    /// The decoded JWT payload from the last `#setAuthToken`, if any.
    pub fn auth_token(&self) -> Option<Value> {
        self.shared.auth_token()
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }
}

enum CommandOutcome {
    Continue,
    Connect,
    Close(oneshot::Sender<Result<()>>),
}

enum SessionEnd {
    /// `close()` was called; reply once cleanup is done.
    UserClose(oneshot::Sender<Result<()>>),
    /// Every handle was dropped.
    HandlesDropped,
    /// The connection failed or the peer went away.
    Lost(SocketError),
}

enum IdleOutcome {
    Connect,
    Shutdown(Option<oneshot::Sender<Result<()>>>),
}

/// The executor: owns the transport, the channel registry, the pending
/// response table, the egress queue, and all timers. Runs until the socket
/// is closed or every handle is dropped.
struct SocketCore {
    options: Arc<ConnectOptions>,
    shared: Arc<Shared>,
    tx: UnboundedSender<Command>,
    rx: UnboundedReceiver<Command>,
    codec: Arc<dyn CodecEngine>,
    slots: SlotTable<SocketEvent>,
    channels: HashMap<String, ChannelEntry>,
    pending: PendingResponses,
    out_queue: VecDeque<Value>,
    next_call_id: CallId,
    connect_attempts: u32,
    ping_timeout: Duration,
    rng: StdRng,
}

impl SocketCore {
    fn new(
        options: Arc<ConnectOptions>,
        shared: Arc<Shared>,
        tx: UnboundedSender<Command>,
        rx: UnboundedReceiver<Command>,
    ) -> Self {
        let codec = options
            .codec_engine
            .clone()
            .unwrap_or_else(|| Arc::new(TextCodec));
        let ping_timeout = options.ack_timeout;

        Self {
            options,
            shared,
            tx,
            rx,
            codec,
            slots: SlotTable::new(),
            channels: HashMap::new(),
            pending: PendingResponses::new(),
            out_queue: VecDeque::new(),
            next_call_id: 1,
            connect_attempts: 0,
            ping_timeout,
            rng: StdRng::from_entropy(),
        }
    }

    async fn run(mut self) {
        let mut reconnect_at: Option<Instant> = None;

        loop {
            match self.wait_for_connect(reconnect_at.take()).await {
                IdleOutcome::Connect => {}
                IdleOutcome::Shutdown(reply) => {
                    self.enter_closed();
                    if let Some(reply) = reply {
                        let _ = reply.send(Ok(()));
                    }
                    debug!("executor exiting");
                    return;
                }
            }

            // CLOSED -> CONNECTING
            self.shared.state.set(ConnectionState::Connecting);
            self.next_call_id = 1;
            self.slots.emit(&SocketEvent::Connecting);

            let attempt =
                tokio::time::timeout(self.ping_timeout, establish(&self.options)).await;
            let transport = match attempt {
                Ok(Ok(t)) => t,
                Ok(Err(e)) => {
                    self.connect_aborted(e, &mut reconnect_at);
                    continue;
                }
                Err(_) => {
                    self.connect_aborted(SocketError::PingTimeout, &mut reconnect_at);
                    continue;
                }
            };

            // CONNECTING -> OPEN: application handshake goes out first.
            self.shared.state.set(ConnectionState::Open);
            info!(host = %self.options.host, "connection open");
            let cid = self.next_cid();
            self.out_queue
                .push_back(json!({ "event": "#handshake", "data": null, "cid": cid }));

            match self.session(transport).await {
                SessionEnd::UserClose(reply) => {
                    self.enter_closed();
                    let _ = reply.send(Ok(()));
                    debug!("closed by user");
                    return;
                }
                SessionEnd::HandlesDropped => {
                    self.enter_closed();
                    debug!("all handles dropped");
                    return;
                }
                SessionEnd::Lost(error) => {
                    self.enter_closed();
                    info!(%error, "disconnected");
                    self.slots.emit(&SocketEvent::Disconnect(error));
                    if self.options.auto_reconnect {
                        reconnect_at = Some(self.schedule_reconnect());
                    }
                }
            }
        }
    }

    /// Idle (closed) phase: process commands until `connect()` arrives or a
    /// scheduled reconnect deadline fires.
    async fn wait_for_connect(&mut self, reconnect_at: Option<Instant>) -> IdleOutcome {
        loop {
            tokio::select! {
                biased;

                cmd = self.rx.recv() => match cmd {
                    None => return IdleOutcome::Shutdown(None),
                    Some(cmd) => match self.handle_command(cmd) {
                        CommandOutcome::Connect => return IdleOutcome::Connect,
                        CommandOutcome::Close(reply) => {
                            return IdleOutcome::Shutdown(Some(reply))
                        }
                        CommandOutcome::Continue => {}
                    },
                },

                _ = deadline(reconnect_at) => {
                    debug!("reconnect timer fired");
                    return IdleOutcome::Connect;
                }
            }
        }
    }

    /// One open connection: alternate the single-writer egress pump with
    /// reads, commands, and the ping watchdog.
    async fn session(&mut self, mut transport: WsTransport) -> SessionEnd {
        let mut ping_deadline = Instant::now() + self.ping_timeout;

        loop {
            while let Some(packet) = self.out_queue.pop_front() {
                let msg = match self.codec.encode(&packet) {
                    Ok(msg) => msg,
                    Err(e) => {
                        self.slots.emit_error(e);
                        continue;
                    }
                };
                if let Err(e) = transport.write_message(msg).await {
                    return SessionEnd::Lost(e);
                }
            }

            tokio::select! {
                biased;

                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => match self.handle_command(cmd) {
                        CommandOutcome::Close(reply) => {
                            let _ = transport.close(CloseReason::Normal).await;
                            return SessionEnd::UserClose(reply);
                        }
                        CommandOutcome::Connect | CommandOutcome::Continue => {}
                    },
                    None => {
                        let _ = transport.close(CloseReason::Normal).await;
                        return SessionEnd::HandlesDropped;
                    }
                },

                _ = tokio::time::sleep_until(ping_deadline) => {
                    warn!("ping timeout; closing transport");
                    let _ = transport.close(CloseReason::ProtocolError).await;
                    return SessionEnd::Lost(SocketError::PingTimeout);
                }

                inbound = transport.read_message() => match inbound {
                    Ok(Some(frame)) => {
                        if let Some(end) = self
                            .handle_frame(frame, &mut transport, &mut ping_deadline)
                            .await
                        {
                            return end;
                        }
                    }
                    Ok(None) => {
                        return SessionEnd::Lost(SocketError::ConnectionClosed(
                            "end of stream".into(),
                        ))
                    }
                    Err(e) => return SessionEnd::Lost(e),
                },
            }
        }
    }

    /// One complete inbound frame: raw event, ping shortcut, decode,
    /// classify, dispatch.
    async fn handle_frame(
        &mut self,
        frame: WsMessage,
        transport: &mut WsTransport,
        ping_deadline: &mut Instant,
    ) -> Option<SessionEnd> {
        self.slots.emit(&SocketEvent::Raw(frame.clone()));

        // SocketCluster heartbeat: two-byte "#1", answered with a raw "#2"
        // that bypasses the codec.
        if frame.as_bytes() == b"#1" {
            *ping_deadline = Instant::now() + self.ping_timeout;
            if let Err(e) = transport.write_message(WsMessage::Text("#2".into())).await {
                return Some(SessionEnd::Lost(e));
            }
            return None;
        }

        let payload = match self.codec.decode(frame.as_bytes()) {
            Ok(payload) => payload,
            Err(e) => {
                self.slots.emit_error(e);
                return None;
            }
        };

        match payload {
            Value::Array(items) => {
                for item in items {
                    if item.is_object() {
                        self.dispatch_packet(item, ping_deadline);
                    } else {
                        self.slots.emit_error(SocketError::Protocol(
                            "batch element is not an object".into(),
                        ));
                    }
                }
            }
            item if item.is_object() => self.dispatch_packet(item, ping_deadline),
            _ => self
                .slots
                .emit_error(SocketError::Protocol("packet is not an object".into())),
        }

        None
    }

    fn dispatch_packet(&mut self, payload: Value, ping_deadline: &mut Instant) {
        match packet_kind(&payload) {
            Err(e) => self.slots.emit_error(e),
            Ok(PacketKind::IsAuthenticated) => {
                // Handshake acknowledged; the connection is fully usable.
                self.connect_attempts = 0;
                if let Some(ms) = payload
                    .pointer("/data/pingTimeout")
                    .and_then(Value::as_u64)
                {
                    self.set_ping_timeout(Duration::from_millis(ms), ping_deadline);
                }
                self.slots.emit(&SocketEvent::Connect(payload));
                self.flush_pending_subscriptions();
            }
            Ok(PacketKind::Publish) => self.handle_publish(&payload),
            Ok(PacketKind::RemoveToken) => {
                self.shared.set_tokens(None, None);
                self.slots.emit(&SocketEvent::Deauthenticate);
            }
            Ok(PacketKind::SetToken) => self.handle_set_token(&payload, ping_deadline),
            Ok(PacketKind::Event) => self.handle_event(payload),
            Ok(PacketKind::AckReceive) => self.handle_ack(payload),
        }
    }

    fn handle_publish(&mut self, payload: &Value) {
        let fields = payload.get("data").and_then(|data| {
            Some((data.get("channel")?.as_str()?, data.get("data")?))
        });
        match fields {
            Some((name, inner)) => {
                if let Some(entry) = self.channels.get_mut(name) {
                    entry.slots.emit(&ChannelEvent::Message(inner.clone()));
                }
                // Publishes for unknown channels are silently ignored.
            }
            None => self.slots.emit_error(SocketError::Protocol(
                "publish without channel/data".into(),
            )),
        }
    }

    fn handle_set_token(&mut self, payload: &Value, ping_deadline: &mut Instant) {
        let Some(data) = payload.get("data") else {
            return self
                .slots
                .emit_error(SocketError::Protocol("set-token without data".into()));
        };

        if let Some(ms) = data.get("pingTimeout").and_then(Value::as_u64) {
            self.set_ping_timeout(Duration::from_millis(ms), ping_deadline);
        }

        let Some(token) = data.get("token").and_then(Value::as_str) else {
            return self
                .slots
                .emit_error(SocketError::Protocol("set-token without token".into()));
        };
        let token = token.to_string();

        match decode_jwt_payload(&token) {
            Ok(claims) => {
                let first_auth = self.shared.signed_auth_token().is_none();
                self.shared.set_tokens(Some(token.clone()), Some(claims));
                if first_auth {
                    self.slots.emit(&SocketEvent::Authenticate(token.clone()));
                    self.flush_pending_subscriptions();
                }
                self.slots.emit(&SocketEvent::AuthTokenChange(token));
            }
            Err(e) => self.slots.emit_error(e),
        }
    }

    fn handle_event(&mut self, payload: Value) {
        let event = payload
            .get("event")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let Some(data) = payload.get("data").cloned() else {
            return self
                .slots
                .emit_error(SocketError::Protocol(format!("event {event} without data")));
        };

        let cid = payload.get("cid").and_then(Value::as_u64).unwrap_or(0);
        let responder = (cid != 0).then(|| Responder::new(cid, self.tx.clone()));
        self.slots.emit(&SocketEvent::Emit {
            event,
            data,
            responder,
        });
    }

    fn handle_ack(&mut self, payload: Value) {
        let rid = payload.get("rid").and_then(Value::as_u64).unwrap_or(0);
        match self.pending.remove(rid) {
            None => self.slots.emit_error(SocketError::UnexpectedRid(rid)),
            Some(sink) => {
                let outcome = match payload.get("error") {
                    Some(error) => Err(AckFailure::Response {
                        error: error.clone(),
                    }),
                    None => Ok(payload.get("data").cloned().unwrap_or_else(|| json!({}))),
                };
                self.finish_call(sink, outcome);
            }
        }
    }

    fn finish_call(
        &mut self,
        sink: ResponseSink,
        outcome: std::result::Result<Value, AckFailure>,
    ) {
        match sink {
            ResponseSink::User(handler) => handler(outcome),
            ResponseSink::SubscribeAck { channel } => match outcome {
                Ok(_) => self.confirm_subscribe(&channel),
                // Channel suspension already dealt with the state.
                Err(AckFailure::Cancelled) => {}
                Err(AckFailure::Timeout { .. }) => {
                    self.fail_subscribe(&channel, SocketError::AckTimeout)
                }
                Err(AckFailure::Response { error }) => {
                    self.fail_subscribe(&channel, SocketError::Response(error))
                }
            },
        }
    }

    fn handle_command(&mut self, cmd: Command) -> CommandOutcome {
        match cmd {
            Command::Connect => return CommandOutcome::Connect,
            Command::Close(reply) => return CommandOutcome::Close(reply),
            Command::Emit {
                event,
                data,
                handler,
                no_timeout,
            } => self.handle_emit(event, data, handler, no_timeout),
            Command::Subscribe { name, options } => self.handle_subscribe(name, options),
            Command::Unsubscribe { name } => self.handle_unsubscribe(&name),
            Command::DestroyChannel { name } => self.handle_destroy_channel(&name),
            Command::Watch { id, slot } => self.slots.insert(id, slot),
            Command::Unwatch { id } => self.slots.remove(id),
            Command::WatchChannel { name, id, slot } => {
                let cell = self.shared.channel_state_cell(&name);
                self.channels
                    .entry(name)
                    .or_insert_with(|| ChannelEntry::new(cell))
                    .slots
                    .insert(id, slot);
            }
            Command::UnwatchChannel { name, id } => {
                if let Some(entry) = self.channels.get_mut(&name) {
                    entry.slots.remove(id);
                }
            }
            Command::Respond { rid, data } => {
                self.out_queue.push_back(json!({ "rid": rid, "data": data }));
            }
            Command::AckTimeout(cid) => self.handle_ack_timeout(cid),
        }
        CommandOutcome::Continue
    }

    fn handle_emit(
        &mut self,
        event: String,
        data: Value,
        handler: Option<ResponseHandler>,
        no_timeout: bool,
    ) {
        let mut packet = json!({ "event": event, "data": data });
        if let Some(handler) = handler {
            let cid = self.next_cid();
            packet["cid"] = json!(cid);
            let timer = (!no_timeout).then(|| self.spawn_ack_timer(cid));
            self.pending.insert(
                cid,
                ResponseItem {
                    sink: ResponseSink::User(handler),
                    timer,
                },
            );
        }
        self.out_queue.push_back(packet);
    }

    fn handle_ack_timeout(&mut self, cid: CallId) {
        // A late timer whose call already resolved finds nothing here.
        if let Some(sink) = self.pending.remove(cid) {
            debug!(cid, "ack timeout");
            let payload = ack_timeout_payload(cid);
            self.finish_call(sink, Err(AckFailure::Timeout { payload }));
        }
    }

    fn handle_subscribe(&mut self, name: String, options: SubscribeOptions) {
        let cell = self.shared.channel_state_cell(&name);
        let entry = self
            .channels
            .entry(name.clone())
            .or_insert_with(|| ChannelEntry::new(cell));

        if entry.state.get() == ChannelState::Unsubscribed {
            entry.state.set(ChannelState::Pending);
            entry.options = options;
            self.try_subscribe(&name);
        }
    }

    /// Send `#subscribe` if the gate passes: socket open, and authenticated
    /// when the channel asked to wait for auth. Re-run on handshake and on
    /// authenticate transitions.
    fn try_subscribe(&mut self, name: &str) {
        let Some(entry) = self.channels.get(name) else {
            return;
        };
        if entry.state.get() != ChannelState::Pending || entry.awaiting_ack {
            return;
        }

        let gate = self.shared.state.is_open()
            && (!entry.options.wait_for_auth
                || self.shared.auth_state() == AuthState::Authenticated);
        if !gate {
            return;
        }

        let mut sub_data = json!({ "channel": name });
        if let Some(data) = &entry.options.data {
            sub_data["data"] = data.clone();
        }

        let cid = self.next_cid();
        let timer = Some(self.spawn_ack_timer(cid));
        self.pending.insert(
            cid,
            ResponseItem {
                sink: ResponseSink::SubscribeAck {
                    channel: name.to_string(),
                },
                timer,
            },
        );
        if let Some(entry) = self.channels.get_mut(name) {
            entry.awaiting_ack = true;
        }
        self.out_queue
            .push_back(json!({ "event": "#subscribe", "data": sub_data, "cid": cid }));
    }

    fn flush_pending_subscriptions(&mut self) {
        let pending: Vec<String> = self
            .channels
            .iter()
            .filter(|(_, entry)| entry.state.get() == ChannelState::Pending)
            .map(|(name, _)| name.clone())
            .collect();
        for name in pending {
            self.try_subscribe(&name);
        }
    }

    fn confirm_subscribe(&mut self, name: &str) {
        let Some(entry) = self.channels.get_mut(name) else {
            return;
        };
        let old_state = entry.state.get();
        entry.awaiting_ack = false;
        if old_state == ChannelState::Subscribed {
            return;
        }
        entry.state.set(ChannelState::Subscribed);

        let change = ChannelStateChange {
            name: name.to_string(),
            old_state,
            new_state: ChannelState::Subscribed,
        };
        entry.slots.emit(&ChannelEvent::StateChange(change.clone()));
        entry.slots.emit(&ChannelEvent::Subscribe);

        self.slots
            .emit(&SocketEvent::SubscriptionStateChange(change));
        self.slots.emit(&SocketEvent::Subscribe(name.to_string()));
    }

    fn fail_subscribe(&mut self, name: &str, error: SocketError) {
        let Some(entry) = self.channels.get_mut(name) else {
            return;
        };
        entry.awaiting_ack = false;
        if entry.state.get() == ChannelState::Unsubscribed {
            return;
        }
        entry.state.set(ChannelState::Unsubscribed);

        entry
            .slots
            .emit(&ChannelEvent::SubscribeFail(error.clone()));
        self.slots.emit(&SocketEvent::SubscribeFail {
            channel: name.to_string(),
            error,
        });
    }

    fn handle_unsubscribe(&mut self, name: &str) {
        let Some(entry) = self.channels.get(name) else {
            return;
        };
        if entry.state.get() == ChannelState::Unsubscribed {
            return;
        }
        self.demote_channel(name, ChannelState::Unsubscribed);
        self.out_queue
            .push_back(json!({ "event": "#unsubscribe", "data": name }));
    }

    fn handle_destroy_channel(&mut self, name: &str) {
        if let Some(entry) = self.channels.get_mut(name) {
            entry.slots.clear();
        }
        self.handle_unsubscribe(name);
        self.channels.remove(name);
        self.shared.remove_channel_state(name);
    }

    /// Move a channel to `new_state`, firing unsubscribe events if it was
    /// subscribed.
    fn demote_channel(&mut self, name: &str, new_state: ChannelState) {
        let Some(entry) = self.channels.get_mut(name) else {
            return;
        };
        let old_state = entry.state.get();
        entry.state.set(new_state);
        entry.awaiting_ack = false;

        if old_state != ChannelState::Subscribed {
            return;
        }

        let change = ChannelStateChange {
            name: name.to_string(),
            old_state,
            new_state,
        };
        entry.slots.emit(&ChannelEvent::StateChange(change.clone()));
        entry.slots.emit(&ChannelEvent::Unsubscribe);

        self.slots
            .emit(&SocketEvent::SubscriptionStateChange(change));
        self.slots.emit(&SocketEvent::Unsubscribe(name.to_string()));
    }

    /// Every transition to CLOSED funnels through here: pending calls are
    /// cancelled, the egress queue is dropped, and live subscriptions are
    /// suspended to pending for resubscription.
    fn enter_closed(&mut self) {
        self.shared.state.set(ConnectionState::Closed);

        for sink in self.pending.drain() {
            match sink {
                ResponseSink::User(handler) => handler(Err(AckFailure::Cancelled)),
                ResponseSink::SubscribeAck { .. } => {}
            }
        }
        debug_assert!(self.pending.is_empty());
        self.out_queue.clear();
        self.suspend_channels();
    }

    fn suspend_channels(&mut self) {
        let names: Vec<String> = self.channels.keys().cloned().collect();
        for name in names {
            let state = match self.channels.get(&name) {
                Some(entry) => entry.state.get(),
                None => continue,
            };
            match state {
                ChannelState::Subscribed | ChannelState::Pending => {
                    self.demote_channel(&name, ChannelState::Pending);
                }
                ChannelState::Unsubscribed => {}
            }
        }
    }

    fn connect_aborted(&mut self, error: SocketError, reconnect_at: &mut Option<Instant>) {
        warn!(%error, "connect aborted");
        self.enter_closed();
        self.slots.emit(&SocketEvent::ConnectAbort(error));
        if self.options.auto_reconnect {
            *reconnect_at = Some(self.schedule_reconnect());
        }
    }

    fn schedule_reconnect(&mut self) -> Instant {
        let attempt = self.connect_attempts;
        self.connect_attempts += 1;
        let jitter = self.rng.gen::<f64>();
        let delay = self
            .options
            .auto_reconnect_options
            .delay_for(attempt, jitter, None);
        info!(?delay, attempt, "reconnect scheduled");
        Instant::now() + delay
    }

    fn set_ping_timeout(&mut self, timeout: Duration, ping_deadline: &mut Instant) {
        self.ping_timeout = timeout;
        *ping_deadline = Instant::now() + timeout;
    }

    fn next_cid(&mut self) -> CallId {
        let cid = self.next_call_id;
        self.next_call_id += 1;
        cid
    }

    fn spawn_ack_timer(&self, cid: CallId) -> tokio::task::AbortHandle {
        let tx = self.tx.clone();
        let timeout = self.options.ack_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(Command::AckTimeout(cid));
        })
        .abort_handle()
    }
}

enum PacketKind {
    Publish,
    RemoveToken,
    SetToken,
    Event,
    IsAuthenticated,
    AckReceive,
}

/// Inbound packet classification, in the protocol's precedence order.
fn packet_kind(payload: &Value) -> Result<PacketKind> {
    if let Some(event) = payload.get("event") {
        let Some(event) = event.as_str() else {
            return Err(SocketError::Protocol("event is not a string".into()));
        };
        return Ok(match event {
            "#publish" => PacketKind::Publish,
            "#removeAuthToken" => PacketKind::RemoveToken,
            "#setAuthToken" => PacketKind::SetToken,
            _ => PacketKind::Event,
        });
    }

    if payload.get("rid").and_then(Value::as_u64) == Some(1) {
        return Ok(PacketKind::IsAuthenticated);
    }

    Ok(PacketKind::AckReceive)
}

/// Sleep until the deadline, or forever when there is none.
async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
