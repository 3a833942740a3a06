use crate::traits::codec::CodecEngine;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::Connector;

/// Backoff parameters for automatic reconnection.
///
/// The delay for attempt `n` is
/// `min(round((initial_delay + randomness * U(0,1)) * multiplier^n), max_delay)`.
#[derive(Debug, Clone)]
pub struct AutoReconnectOptions {
    pub initial_delay: Duration,
    pub randomness: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for AutoReconnectOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10_000),
            randomness: Duration::from_millis(10_000),
            multiplier: 1.5,
            max_delay: Duration::from_millis(60_000),
        }
    }
}

/// TLS settings for secure connections.
///
/// When `connector` is `None` the platform's default TLS stack is used;
/// certificate validation policy is whatever the injected connector decides.
#[derive(Default)]
pub struct SecureOptions {
    pub connector: Option<Connector>,
}

/// Everything needed to open (and keep reopening) a socket.
pub struct ConnectOptions {
    pub host: String,
    /// Service name ("http"/"https") or numeric port, resolver-style.
    pub port: String,
    pub path: String,
    pub secure: bool,
    pub user_agent: String,
    pub auto_reconnect: bool,
    pub auto_reconnect_options: AutoReconnectOptions,
    /// Per-emit response timeout; also the initial ping timeout.
    pub ack_timeout: Duration,
    pub per_message_deflate: bool,
    pub secure_options: SecureOptions,
    /// Active codec; `None` means the plain JSON text codec.
    pub codec_engine: Option<Arc<dyn CodecEngine>>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: "http".into(),
            path: "/socketcluster/".into(),
            secure: false,
            user_agent: String::new(),
            auto_reconnect: true,
            auto_reconnect_options: AutoReconnectOptions::default(),
            ack_timeout: Duration::from_secs(10),
            per_message_deflate: false,
            secure_options: SecureOptions::default(),
            codec_engine: None,
        }
    }
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: impl Into<String>) -> Self {
        self.port = port.into();
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    pub fn auto_reconnect_options(mut self, options: AutoReconnectOptions) -> Self {
        self.auto_reconnect_options = options;
        self
    }

    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn per_message_deflate(mut self, enabled: bool) -> Self {
        self.per_message_deflate = enabled;
        self
    }

    pub fn tls_connector(mut self, connector: Connector) -> Self {
        self.secure_options.connector = Some(connector);
        self
    }

    pub fn codec_engine(mut self, codec: Arc<dyn CodecEngine>) -> Self {
        self.codec_engine = Some(codec);
        self
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("path", &self.path)
            .field("secure", &self.secure)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("ack_timeout", &self.ack_timeout)
            .field("per_message_deflate", &self.per_message_deflate)
            .field("binary_codec", &self.codec_engine.as_ref().map(|c| c.is_binary()))
            .finish()
    }
}
