use crate::traits::error::AckFailure;
use serde_json::Value;
use std::collections::HashMap;
use tokio::task::AbortHandle;

/// Outbound request correlation number.
pub type CallId = u64;

/// Callback invoked exactly once with the outcome of an acknowledged emit.
pub type ResponseHandler = Box<dyn FnOnce(Result<Value, AckFailure>) + Send>;

/// Who consumes the acknowledgement for a call id.
pub(crate) enum ResponseSink {
    /// A user handler from `emit_with_ack`.
    User(ResponseHandler),
    /// An internal `#subscribe` round-trip for the named channel.
    SubscribeAck { channel: String },
}

pub(crate) struct ResponseItem {
    pub(crate) sink: ResponseSink,
    pub(crate) timer: Option<AbortHandle>,
}

/// `cid -> ResponseItem` with timer bookkeeping.
///
/// Every inserted entry leaves the table in exactly one way: response
/// receipt, ack timeout, or cancellation at close.
#[derive(Default)]
pub(crate) struct PendingResponses {
    items: HashMap<CallId, ResponseItem>,
}

impl PendingResponses {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, cid: CallId, item: ResponseItem) {
        self.items.insert(cid, item);
    }

    /// Remove an entry, aborting its ack timer. A timer that already fired
    /// finds the entry gone and no-ops, so this doubles as cancellation.
    pub(crate) fn remove(&mut self, cid: CallId) -> Option<ResponseSink> {
        self.items.remove(&cid).map(|item| {
            if let Some(timer) = item.timer {
                timer.abort();
            }
            item.sink
        })
    }

    /// Take every outstanding sink, aborting all timers.
    pub(crate) fn drain(&mut self) -> Vec<ResponseSink> {
        self.items
            .drain()
            .map(|(_, item)| {
                if let Some(timer) = item.timer {
                    timer.abort();
                }
                item.sink
            })
            .collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
