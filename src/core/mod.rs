//! Socket machinery: configuration, shared state cells, events, the channel
//! registry, the pending-response table, and the executor itself.

pub mod auth;
pub mod channel;
pub mod config;
pub mod events;
pub mod pending;
pub mod reconnect;
pub mod socket;
pub mod state;

pub use channel::{Channel, SubscribeOptions};
pub use config::{AutoReconnectOptions, ConnectOptions, SecureOptions};
pub use events::{ChannelEvent, ChannelStateChange, Responder, SocketEvent, Subscription};
pub use socket::Socket;
pub use state::{AuthState, ChannelState, ConnectionState};
