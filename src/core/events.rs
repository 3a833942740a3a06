use crate::core::socket::Command;
use crate::core::state::ChannelState;
use crate::traits::codec::WsMessage;
use crate::traits::error::SocketError;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

/// Channel FSM transition descriptor carried by state-change events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStateChange {
    pub name: String,
    pub old_state: ChannelState,
    pub new_state: ChannelState,
}

/// Reply handle passed to `Emit` slots when the server requested an
/// acknowledgement (the packet carried a `cid`).
#[derive(Clone)]
pub struct Responder {
    cid: u64,
    tx: UnboundedSender<Command>,
}

impl Responder {
    pub(crate) fn new(cid: u64, tx: UnboundedSender<Command>) -> Self {
        Self { cid, tx }
    }

    /// Queue a response packet `{rid, data}` for the server.
    pub fn respond(&self, data: Value) {
        let _ = self.tx.send(Command::Respond {
            rid: self.cid,
            data,
        });
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder").field("cid", &self.cid).finish()
    }
}

/// Socket-level event, delivered by reference to every registered slot.
#[derive(Debug)]
pub enum SocketEvent {
    /// A complete inbound frame, before any decoding.
    Raw(WsMessage),
    /// Protocol/parse failure; the offending message was dropped.
    Error(SocketError),
    Connecting,
    /// Handshake acknowledged; carries the full handshake response payload.
    Connect(Value),
    /// Failure before the connection reached open.
    ConnectAbort(SocketError),
    /// Established connection lost.
    Disconnect(SocketError),
    /// First transition to an authenticated token; carries the signed token.
    Authenticate(String),
    /// Every signed-token update.
    AuthTokenChange(String),
    Deauthenticate,
    Subscribe(String),
    SubscribeFail {
        channel: String,
        error: SocketError,
    },
    SubscriptionStateChange(ChannelStateChange),
    Unsubscribe(String),
    /// Server-initiated event. `responder` is present iff the server asked
    /// for an acknowledgement.
    Emit {
        event: String,
        data: Value,
        responder: Option<Responder>,
    },
}

/// Channel-level event, mirroring the socket-level subscription events plus
/// message delivery.
#[derive(Debug)]
pub enum ChannelEvent {
    Subscribe,
    SubscribeFail(SocketError),
    StateChange(ChannelStateChange),
    Unsubscribe,
    /// A `#publish` payload for this channel.
    Message(Value),
}

pub(crate) type SocketSlot = Box<dyn FnMut(&SocketEvent) + Send>;
pub(crate) type ChannelSlot = Box<dyn FnMut(&ChannelEvent) + Send>;

/// Where a slot is attached; used by [`Subscription::detach`].
#[derive(Debug, Clone)]
pub(crate) enum SlotTarget {
    Socket,
    Channel(String),
}

/// Detachable handle for a registered slot.
///
/// Dropping the handle leaves the slot attached, like the signal
/// connections this models; call [`Subscription::detach`] to remove it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    target: SlotTarget,
    tx: UnboundedSender<Command>,
}

impl Subscription {
    pub(crate) fn new(id: u64, target: SlotTarget, tx: UnboundedSender<Command>) -> Self {
        Self { id, target, tx }
    }

    /// Remove the slot. Further events will not reach it.
    pub fn detach(self) {
        let cmd = match self.target {
            SlotTarget::Socket => Command::Unwatch { id: self.id },
            SlotTarget::Channel(name) => Command::UnwatchChannel { name, id: self.id },
        };
        let _ = self.tx.send(cmd);
    }
}

/// Slot registry living on the executor.
pub(crate) struct SlotTable<E> {
    slots: HashMap<u64, Box<dyn FnMut(&E) + Send>>,
}

impl<E> SlotTable<E> {
    pub(crate) fn new() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, id: u64, slot: Box<dyn FnMut(&E) + Send>) {
        self.slots.insert(id, slot);
    }

    pub(crate) fn remove(&mut self, id: u64) {
        self.slots.remove(&id);
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
    }

    pub(crate) fn emit(&mut self, event: &E) {
        for slot in self.slots.values_mut() {
            slot(event);
        }
    }
}

impl SlotTable<SocketEvent> {
    /// Surface an error on the error event. The message it came from has
    /// already been dropped; processing continues.
    pub(crate) fn emit_error(&mut self, error: SocketError) {
        warn!(%error, "socket error");
        self.emit(&SocketEvent::Error(error));
    }
}

/// Synthetic payload delivered alongside an ack timeout, mirroring the wire
/// shape of a server error response.
pub(crate) fn ack_timeout_payload(cid: u64) -> Value {
    json!({ "error": { "message": format!("no ack for call id {cid}") } })
}
