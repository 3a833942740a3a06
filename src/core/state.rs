use std::sync::atomic::{AtomicU8, Ordering};

/// Connection lifecycle state of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed = 0,
    Connecting = 1,
    Open = 2,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Open,
            _ => ConnectionState::Closed,
        }
    }
}

/// Authentication state, derived from whether a signed token is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticated,
}

/// Subscription state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unsubscribed = 0,
    Pending = 1,
    Subscribed = 2,
}

impl ChannelState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ChannelState::Pending,
            2 => ChannelState::Subscribed,
            _ => ChannelState::Unsubscribed,
        }
    }
}

/// Lock-free connection state cell shared between the executor task and the
/// public handles.
#[derive(Debug)]
pub struct AtomicConnectionState(AtomicU8);

impl AtomicConnectionState {
    pub fn new(state: ConnectionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    pub fn is_open(&self) -> bool {
        self.get() == ConnectionState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.get() == ConnectionState::Closed
    }
}

/// Lock-free channel state cell, shared by the registry and every handle to
/// the same channel.
#[derive(Debug)]
pub struct AtomicChannelState(AtomicU8);

impl AtomicChannelState {
    pub fn new(state: ChannelState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> ChannelState {
        ChannelState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ChannelState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_state_round_trips() {
        let cell = AtomicConnectionState::new(ConnectionState::Closed);
        assert!(cell.is_closed());
        cell.set(ConnectionState::Connecting);
        assert_eq!(cell.get(), ConnectionState::Connecting);
        cell.set(ConnectionState::Open);
        assert!(cell.is_open());
    }

    #[test]
    fn channel_state_round_trips() {
        let cell = AtomicChannelState::new(ChannelState::Unsubscribed);
        cell.set(ChannelState::Pending);
        assert_eq!(cell.get(), ChannelState::Pending);
        cell.set(ChannelState::Subscribed);
        assert_eq!(cell.get(), ChannelState::Subscribed);
    }
}
