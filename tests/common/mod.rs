//! Common test utilities: a scriptable mock SocketCluster server.
//!
//! The server accepts WebSocket connections and hands each one to the test
//! as a [`ServerConn`]; the test plays the server side of the protocol by
//! hand. Dropping a `ServerConn` drops its connection, which is how the
//! reconnect tests sever the transport.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

pub struct MockServer {
    pub addr: SocketAddr,
    conn_rx: mpsc::UnboundedReceiver<ServerConn>,
    shutdown: Arc<Notify>,
}

impl MockServer {
    /// Bind an ephemeral port and start accepting connections.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(Notify::new());
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();

        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        let Ok((stream, _)) = result else { break };
                        let (in_tx, in_rx) = mpsc::unbounded_channel();
                        let (out_tx, out_rx) = mpsc::unbounded_channel();
                        if conn_tx
                            .send(ServerConn { incoming: in_rx, outgoing: out_tx })
                            .is_err()
                        {
                            break;
                        }
                        let conn_shutdown = accept_shutdown.clone();
                        tokio::spawn(async move {
                            Self::handle_connection(stream, in_tx, out_rx, conn_shutdown).await;
                        });
                    }
                    _ = accept_shutdown.notified() => break,
                }
            }
        });

        Self {
            addr,
            conn_rx,
            shutdown,
        }
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        in_tx: mpsc::UnboundedSender<Message>,
        mut out_rx: mpsc::UnboundedReceiver<Message>,
        shutdown: Arc<Notify>,
    ) {
        let mut ws = match accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                eprintln!("mock server handshake failed: {e}");
                return;
            }
        };

        loop {
            tokio::select! {
                msg = ws.next() => match msg {
                    Some(Ok(msg)) if msg.is_text() || msg.is_binary() => {
                        if in_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                },
                out = out_rx.recv() => match out {
                    Some(msg) => {
                        if ws.send(msg).await.is_err() {
                            break;
                        }
                    }
                    // The test dropped its ServerConn: sever the transport.
                    None => break,
                },
                _ = shutdown.notified() => break,
            }
        }
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> String {
        self.addr.port().to_string()
    }

    /// Wait for the next client connection.
    pub async fn next_conn(&mut self) -> ServerConn {
        tokio::time::timeout(std::time::Duration::from_secs(5), self.conn_rx.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("accept loop gone")
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_waiters();
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One accepted client connection, driven by the test.
pub struct ServerConn {
    incoming: mpsc::UnboundedReceiver<Message>,
    outgoing: mpsc::UnboundedSender<Message>,
}

impl ServerConn {
    /// Next data frame from the client.
    pub async fn recv_raw(&mut self) -> Message {
        tokio::time::timeout(std::time::Duration::from_secs(5), self.incoming.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("connection gone")
    }

    /// Next text frame.
    pub async fn recv_text(&mut self) -> String {
        match self.recv_raw().await {
            Message::Text(text) => text.to_string(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    /// Next text frame parsed as JSON.
    pub async fn recv_json(&mut self) -> Value {
        let text = self.recv_text().await;
        serde_json::from_str(&text).expect("client sent invalid json")
    }

    pub fn send_text(&self, text: &str) {
        self.outgoing
            .send(Message::Text(text.to_string().into()))
            .expect("connection gone");
    }

    pub fn send_json(&self, value: &Value) {
        self.send_text(&value.to_string());
    }

    pub fn send_binary(&self, payload: Vec<u8>) {
        self.outgoing
            .send(Message::Binary(payload.into()))
            .expect("connection gone");
    }

    /// Read the client's `#handshake` and return its call id (always 1 on a
    /// fresh connection).
    pub async fn expect_handshake(&mut self) -> u64 {
        let packet = self.recv_json().await;
        assert_eq!(packet["event"], "#handshake", "expected #handshake, got {packet}");
        packet["cid"].as_u64().expect("handshake without cid")
    }

    /// Answer the `#handshake` with the given payload.
    pub async fn complete_handshake(&mut self, data: Value) {
        let cid = self.expect_handshake().await;
        self.send_json(&serde_json::json!({ "rid": cid, "data": data }));
    }
}
