//! # socketcluster-client
//!
//! A long-lived, auto-reconnecting, authenticated, multi-channel pub/sub and
//! RPC client for the SocketCluster protocol, multiplexing emits,
//! server-initiated events, request/response acknowledgements, heartbeat,
//! and channel subscription lifecycle over a single WebSocket.
//!
//! ## Design
//!
//! - **One executor per socket**: a single tokio task owns every piece of
//!   protocol state; public handles are cheap clones that message it.
//! - **Single-writer egress**: outbound packets go through one FIFO queue
//!   with at most one write in flight; reads and writes alternate.
//! - **Pluggable codec**: JSON text by default, MessagePack with min-bin
//!   field-alias compression via [`MinBinCodec`].
//! - **Channel FSM**: unsubscribed / pending / subscribed, suspended to
//!   pending on disconnect and resubscribed automatically after the next
//!   handshake (honoring `wait_for_auth`).
//!
//! ## Example
//!
//! ```rust,ignore
//! use socketcluster_client::{ConnectOptions, Socket, SocketEvent};
//!
//! let socket = Socket::new(ConnectOptions::new().host("example.com").port("8000"));
//! let _sub = socket.on(|event| {
//!     if let SocketEvent::Connect(payload) = event {
//!         println!("connected: {payload}");
//!     }
//! });
//! let channel = socket.subscribe("room");
//! let _watch = channel.watch(|msg| println!("room: {msg}"));
//! socket.connect();
//! ```

pub mod core;
pub mod traits;

pub use crate::core::{
    AuthState, AutoReconnectOptions, Channel, ChannelEvent, ChannelState, ChannelStateChange,
    ConnectOptions, ConnectionState, Responder, SecureOptions, Socket, SocketEvent,
    SubscribeOptions, Subscription,
};
pub use crate::traits::{
    AckFailure, CodecEngine, MinBinCodec, Result, SocketError, TextCodec, WsMessage,
};
