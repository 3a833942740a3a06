use serde_json::Value;
use thiserror::Error;

/// Main error type for the socket.
///
/// Protocol-shape and parse failures are surfaced on the `Error` event and
/// the offending message is dropped; the connection stays open. Transport
/// variants drive the `ConnectAbort`/`Disconnect` events instead.
#[derive(Error, Debug, Clone)]
pub enum SocketError {
    /// Malformed inbound packet or unexpected shape
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Response arrived for a call id we are not waiting on
    #[error("unexpected response id (rid) {0}")]
    UnexpectedRid(u64),

    /// Inbound payload could not be parsed by the active codec
    #[error("parse failure: {0}")]
    Parse(String),

    /// A response carried an `error` field; its value is here
    #[error("response contains error")]
    Response(Value),

    /// No acknowledgement arrived within the ack timeout
    #[error("acknowledgement timeout")]
    AckTimeout,

    /// WebSocket or TLS level error
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Transport closed (EOF or close frame from the peer)
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Server did not respond within the ping timeout window
    #[error("ping timeout")]
    PingTimeout,

    /// Invalid connect options
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The socket was closed before the operation could complete
    #[error("socket closed")]
    SocketClosed,
}

/// Failure outcome delivered to an emit's response handler.
///
/// Every handler passed to `emit_with_ack` is invoked exactly once, with
/// either the server's response data or one of these.
#[derive(Error, Debug, Clone)]
pub enum AckFailure {
    /// No acknowledgement arrived within the ack timeout. Carries the
    /// synthetic payload `{"error": {"message": "no ack for call id <cid>"}}`.
    #[error("acknowledgement timeout")]
    Timeout { payload: Value },

    /// The server's response carried an `error` field; its value is here.
    #[error("response contains error")]
    Response { error: Value },

    /// The socket transitioned to closed while the call was outstanding.
    #[error("operation cancelled")]
    Cancelled,
}

/// Result type for socket operations.
pub type Result<T> = std::result::Result<T, SocketError>;
