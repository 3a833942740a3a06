use crate::core::config::ConnectOptions;
use crate::traits::codec::WsMessage;
use crate::traits::error::{Result, SocketError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{
    HeaderValue, SEC_WEBSOCKET_EXTENSIONS, USER_AGENT,
};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Why the transport is being closed; maps to the WebSocket close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Normal,
    ProtocolError,
}

impl CloseReason {
    fn code(self) -> CloseCode {
        match self {
            CloseReason::Normal => CloseCode::Normal,
            CloseReason::ProtocolError => CloseCode::Protocol,
        }
    }
}

/// An opaque bidirectional message stream.
///
/// The socket core is monomorphic over this trait; the one shipped
/// implementation wraps a tokio-tungstenite stream that already unifies the
/// plain and TLS variants behind [`MaybeTlsStream`].
#[async_trait]
pub trait Transport: Send {
    /// Read the next complete data message. `Ok(None)` means the peer closed
    /// the stream (close frame or EOF).
    async fn read_message(&mut self) -> Result<Option<WsMessage>>;

    /// Write one complete message. The frame type (text/binary) follows the
    /// message variant.
    async fn write_message(&mut self, msg: WsMessage) -> Result<()>;

    /// Send a close frame with the given reason code.
    async fn close(&mut self, reason: CloseReason) -> Result<()>;
}

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Transport over tokio-tungstenite.
pub struct WsTransport {
    inner: WsStream,
}

impl WsTransport {
    pub(crate) fn new(inner: WsStream) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn read_message(&mut self) -> Result<Option<WsMessage>> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(WsMessage::Text(text.to_string()))),
                Some(Ok(Message::Binary(data))) => {
                    return Ok(Some(WsMessage::Binary(data.to_vec())))
                }
                // Control frames are handled by tungstenite; keep reading.
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "close frame from peer");
                    return Ok(None);
                }
                Some(Ok(Message::Frame(_))) => continue,
                Some(Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed))
                | Some(Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed))
                | None => return Ok(None),
                Some(Err(e)) => return Err(SocketError::WebSocket(e.to_string())),
            }
        }
    }

    async fn write_message(&mut self, msg: WsMessage) -> Result<()> {
        let frame = match msg {
            WsMessage::Text(s) => Message::Text(s.into()),
            WsMessage::Binary(b) => Message::Binary(b.into()),
        };
        self.inner
            .send(frame)
            .await
            .map_err(|e| SocketError::WebSocket(e.to_string()))
    }

    async fn close(&mut self, reason: CloseReason) -> Result<()> {
        let frame = CloseFrame {
            code: reason.code(),
            reason: "".into(),
        };
        match self.inner.send(Message::Close(Some(frame))).await {
            Ok(())
            | Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
            | Err(tokio_tungstenite::tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(SocketError::WebSocket(e.to_string())),
        }
    }
}

/// Resolve the request URI, perform TCP + TLS + WebSocket handshakes, and
/// return the connected transport.
pub(crate) async fn establish(opts: &ConnectOptions) -> Result<WsTransport> {
    let port = resolve_port(&opts.port)?;
    let scheme = if opts.secure { "wss" } else { "ws" };
    let uri = format!("{}://{}:{}{}", scheme, opts.host, port, opts.path);

    let mut request = uri
        .as_str()
        .into_client_request()
        .map_err(|e| SocketError::Configuration(e.to_string()))?;

    if !opts.user_agent.is_empty() {
        let value = opts
            .user_agent
            .parse()
            .map_err(|_| SocketError::Configuration("invalid user agent".into()))?;
        request.headers_mut().insert(USER_AGENT, value);
    }

    if opts.per_message_deflate {
        request.headers_mut().insert(
            SEC_WEBSOCKET_EXTENSIONS,
            HeaderValue::from_static("permessage-deflate"),
        );
    }

    debug!(%uri, "connecting");

    let connector = opts.secure_options.connector.clone();
    let (stream, _response) = connect_async_tls_with_config(request, None, false, connector)
        .await
        .map_err(|e| SocketError::WebSocket(e.to_string()))?;

    Ok(WsTransport::new(stream))
}

/// `port` is a service name or a number, resolver-style. Only the two
/// well-known web services are accepted.
fn resolve_port(port: &str) -> Result<u16> {
    match port {
        "http" => Ok(80),
        "https" => Ok(443),
        other => other
            .parse()
            .map_err(|_| SocketError::Configuration(format!("invalid port: {other}"))),
    }
}
