use crate::core::events::{ChannelEvent, ChannelSlot, SlotTable, SlotTarget, Subscription};
use crate::core::socket::{Command, Shared};
use crate::core::state::{AtomicChannelState, ChannelState};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

/// Options for a channel subscription.
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Defer the `#subscribe` emit until the socket is authenticated.
    pub wait_for_auth: bool,
    /// Optional payload forwarded inside the `#subscribe` packet.
    pub data: Option<Value>,
}

/// Handle to a named channel.
///
/// Channels are pure data on this side; every mutation (subscribe state,
/// slot registration) is routed through the owning socket's executor. The
/// handle stays valid across reconnects and is only retired by
/// [`Channel::destroy`].
#[derive(Clone)]
pub struct Channel {
    name: String,
    state: Arc<AtomicChannelState>,
    tx: UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl Channel {
    pub(crate) fn new(
        name: String,
        state: Arc<AtomicChannelState>,
        tx: UnboundedSender<Command>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            name,
            state,
            tx,
            shared,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current subscription state.
    pub fn state(&self) -> ChannelState {
        self.state.get()
    }

    /// Attach a slot for published messages on this channel.
    pub fn watch(&self, mut slot: impl FnMut(&Value) + Send + 'static) -> Subscription {
        self.on(move |event| {
            if let ChannelEvent::Message(data) = event {
                slot(data);
            }
        })
    }

    /// Attach a slot for every channel event (lifecycle and messages).
    pub fn on(&self, slot: impl FnMut(&ChannelEvent) + Send + 'static) -> Subscription {
        let id = self.shared.next_slot_id();
        let boxed: ChannelSlot = Box::new(slot);
        let _ = self.tx.send(Command::WatchChannel {
            name: self.name.clone(),
            id,
            slot: boxed,
        });
        Subscription::new(id, SlotTarget::Channel(self.name.clone()), self.tx.clone())
    }

    /// Leave the channel. The registry entry survives for resubscription.
    pub fn unsubscribe(&self) {
        let _ = self.tx.send(Command::Unsubscribe {
            name: self.name.clone(),
        });
    }

    /// Detach all slots, unsubscribe, and drop the registry entry.
    pub fn destroy(&self) {
        let _ = self.tx.send(Command::DestroyChannel {
            name: self.name.clone(),
        });
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("state", &self.state.get())
            .finish()
    }
}

/// Executor-owned registry entry for one channel.
pub(crate) struct ChannelEntry {
    pub(crate) state: Arc<AtomicChannelState>,
    pub(crate) options: SubscribeOptions,
    pub(crate) slots: SlotTable<ChannelEvent>,
    /// A `#subscribe` is in flight; don't send another until it resolves.
    pub(crate) awaiting_ack: bool,
}

impl ChannelEntry {
    pub(crate) fn new(state: Arc<AtomicChannelState>) -> Self {
        Self {
            state,
            options: SubscribeOptions::default(),
            slots: SlotTable::new(),
            awaiting_ack: false,
        }
    }
}
