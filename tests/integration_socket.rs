//! Socket-level integration tests against the mock server: connection
//! lifecycle, emit acknowledgements, heartbeat, auth tokens, and the error
//! taxonomy surfaced on the error event.

mod common;

use common::MockServer;
use serde_json::{json, Value};
use socketcluster_client::{
    AckFailure, AuthState, ConnectOptions, ConnectionState, Socket, SocketError, SocketEvent,
};
use std::time::Duration;
use tokio::sync::mpsc;

/// Owned mirror of the socket events a test wants to assert on.
#[derive(Debug, Clone)]
enum Ev {
    Connecting,
    Connect(Value),
    ConnectAbort(String),
    Disconnect(String),
    Error(String),
    Authenticate(String),
    AuthTokenChange(String),
    Deauthenticate,
    Emit(String, Value, bool),
}

fn mirror(event: &SocketEvent) -> Option<Ev> {
    Some(match event {
        SocketEvent::Connecting => Ev::Connecting,
        SocketEvent::Connect(payload) => Ev::Connect(payload.clone()),
        SocketEvent::ConnectAbort(e) => Ev::ConnectAbort(e.to_string()),
        SocketEvent::Disconnect(e) => Ev::Disconnect(e.to_string()),
        SocketEvent::Error(e) => Ev::Error(e.to_string()),
        SocketEvent::Authenticate(token) => Ev::Authenticate(token.clone()),
        SocketEvent::AuthTokenChange(token) => Ev::AuthTokenChange(token.clone()),
        SocketEvent::Deauthenticate => Ev::Deauthenticate,
        SocketEvent::Emit {
            event,
            data,
            responder,
        } => Ev::Emit(event.clone(), data.clone(), responder.is_some()),
        _ => return None,
    })
}

fn watch_events(socket: &Socket) -> mpsc::UnboundedReceiver<Ev> {
    let (tx, rx) = mpsc::unbounded_channel();
    let _ = socket.on(move |event| {
        if let Some(ev) = mirror(event) {
            let _ = tx.send(ev);
        }
    });
    rx
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Ev>) -> Ev {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a socket event")
        .expect("event stream ended")
}

fn test_options(server: &MockServer) -> ConnectOptions {
    ConnectOptions::new()
        .host(server.host())
        .port(server.port())
        .auto_reconnect(false)
        .ack_timeout(Duration::from_secs(5))
}

/// Handshake data that keeps the ping watchdog out of the test's way.
fn quiet_handshake() -> Value {
    json!({ "id": "test", "isAuthenticated": false, "pingTimeout": 60_000 })
}

#[tokio::test]
async fn connect_emits_connecting_then_connect_with_the_handshake_payload() {
    let mut server = MockServer::start().await;
    let socket = Socket::new(test_options(&server));
    let mut events = watch_events(&socket);

    assert_eq!(socket.state(), ConnectionState::Closed);
    socket.connect();

    let mut conn = server.next_conn().await;
    conn.complete_handshake(json!({ "id": "abc", "isAuthenticated": false, "pingTimeout": 20_000 }))
        .await;

    assert!(matches!(next_event(&mut events).await, Ev::Connecting));
    match next_event(&mut events).await {
        Ev::Connect(payload) => {
            assert_eq!(payload["rid"], 1);
            assert_eq!(payload["data"]["id"], "abc");
            assert_eq!(payload["data"]["pingTimeout"], 20_000);
        }
        other => panic!("expected connect, got {other:?}"),
    }
    assert_eq!(socket.state(), ConnectionState::Open);

    socket.close().await.unwrap();
    assert_eq!(socket.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn emit_with_ack_delivers_the_response() {
    let mut server = MockServer::start().await;
    let socket = Socket::new(test_options(&server));
    socket.connect();

    let mut conn = server.next_conn().await;
    conn.complete_handshake(quiet_handshake()).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    socket
        .emit_with_ack("foo", json!({ "x": 1 }), move |result| {
            let _ = tx.send(result);
        })
        .unwrap();

    let packet = conn.recv_json().await;
    assert_eq!(
        packet,
        json!({ "event": "foo", "data": { "x": 1 }, "cid": 2 })
    );
    conn.send_json(&json!({ "rid": 2, "data": { "ok": true } }));

    let result = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.unwrap(), json!({ "ok": true }));

    socket.close().await.unwrap();
}

#[tokio::test]
async fn emit_without_a_handler_carries_no_cid() {
    let mut server = MockServer::start().await;
    let socket = Socket::new(test_options(&server));
    socket.connect();

    let mut conn = server.next_conn().await;
    conn.complete_handshake(quiet_handshake()).await;

    socket.emit("fire", json!("and-forget")).unwrap();
    let packet = conn.recv_json().await;
    assert_eq!(packet, json!({ "event": "fire", "data": "and-forget" }));

    socket.close().await.unwrap();
}

#[tokio::test]
async fn unanswered_emit_times_out_with_the_synthetic_payload() {
    let mut server = MockServer::start().await;
    let socket = Socket::new(
        test_options(&server).ack_timeout(Duration::from_millis(300)),
    );
    socket.connect();

    let mut conn = server.next_conn().await;
    conn.complete_handshake(quiet_handshake()).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    socket
        .emit_with_ack("slow", Value::Null, move |result| {
            let _ = tx.send(result);
        })
        .unwrap();

    // The server reads the emit and stays silent.
    let packet = conn.recv_json().await;
    assert_eq!(packet["cid"], 2);

    let result = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    match result {
        Err(AckFailure::Timeout { payload }) => {
            assert_eq!(
                payload,
                json!({ "error": { "message": "no ack for call id 2" } })
            );
        }
        other => panic!("expected ack timeout, got {other:?}"),
    }

    socket.close().await.unwrap();
}

#[tokio::test]
async fn response_errors_reach_the_handler_not_the_error_event() {
    let mut server = MockServer::start().await;
    let socket = Socket::new(test_options(&server));
    let mut events = watch_events(&socket);
    socket.connect();

    let mut conn = server.next_conn().await;
    conn.complete_handshake(quiet_handshake()).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    socket
        .emit_with_ack("guarded", json!({}), move |result| {
            let _ = tx.send(result);
        })
        .unwrap();

    let packet = conn.recv_json().await;
    conn.send_json(&json!({ "rid": packet["cid"], "error": { "message": "denied" } }));

    let result = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    match result {
        Err(AckFailure::Response { error }) => {
            assert_eq!(error, json!({ "message": "denied" }));
        }
        other => panic!("expected response error, got {other:?}"),
    }

    // No mirror on the error event: only lifecycle events observed so far.
    while let Ok(ev) = events.try_recv() {
        assert!(!matches!(ev, Ev::Error(_)), "unexpected error event: {ev:?}");
    }

    socket.close().await.unwrap();
}

#[tokio::test]
async fn protocol_ping_gets_a_raw_pong_and_is_not_decoded() {
    let mut server = MockServer::start().await;
    let socket = Socket::new(test_options(&server));
    let mut events = watch_events(&socket);
    socket.connect();

    let mut conn = server.next_conn().await;
    conn.complete_handshake(quiet_handshake()).await;
    // Drain connecting/connect.
    assert!(matches!(next_event(&mut events).await, Ev::Connecting));
    assert!(matches!(next_event(&mut events).await, Ev::Connect(_)));

    conn.send_text("#1");
    assert_eq!(conn.recv_text().await, "#2");

    // "#1" must not hit the codec: no parse errors surfaced.
    while let Ok(ev) = events.try_recv() {
        assert!(!matches!(ev, Ev::Error(_)), "unexpected error event: {ev:?}");
    }

    socket.close().await.unwrap();
}

#[tokio::test]
async fn set_token_updates_auth_state_and_fires_auth_events() {
    let mut server = MockServer::start().await;
    let socket = Socket::new(test_options(&server));
    let mut events = watch_events(&socket);
    socket.connect();

    let mut conn = server.next_conn().await;
    conn.complete_handshake(quiet_handshake()).await;
    assert!(matches!(next_event(&mut events).await, Ev::Connecting));
    assert!(matches!(next_event(&mut events).await, Ev::Connect(_)));
    assert_eq!(socket.auth_state(), AuthState::Unauthenticated);

    // {"user":"bob"} in the payload segment
    let token = "aaa.eyJ1c2VyIjoiYm9iIn0.zzz";
    conn.send_json(&json!({
        "event": "#setAuthToken",
        "data": { "token": token, "pingTimeout": 15_000 }
    }));

    match next_event(&mut events).await {
        Ev::Authenticate(t) => assert_eq!(t, token),
        other => panic!("expected authenticate, got {other:?}"),
    }
    match next_event(&mut events).await {
        Ev::AuthTokenChange(t) => assert_eq!(t, token),
        other => panic!("expected auth-token-change, got {other:?}"),
    }

    assert_eq!(socket.auth_state(), AuthState::Authenticated);
    assert_eq!(socket.signed_auth_token().as_deref(), Some(token));
    assert_eq!(socket.auth_token(), Some(json!({ "user": "bob" })));

    // A second token only fires auth-token-change.
    let token2 = "aaa.eyJ1c2VyIjoiYWxpY2UifQ.zzz";
    conn.send_json(&json!({ "event": "#setAuthToken", "data": { "token": token2 } }));
    match next_event(&mut events).await {
        Ev::AuthTokenChange(t) => assert_eq!(t, token2),
        other => panic!("expected auth-token-change, got {other:?}"),
    }

    // Removal clears both token forms.
    conn.send_json(&json!({ "event": "#removeAuthToken" }));
    assert!(matches!(next_event(&mut events).await, Ev::Deauthenticate));
    assert_eq!(socket.auth_state(), AuthState::Unauthenticated);
    assert_eq!(socket.signed_auth_token(), None);
    assert_eq!(socket.auth_token(), None);

    socket.close().await.unwrap();
}

#[tokio::test]
async fn malformed_auth_token_raises_a_protocol_error() {
    let mut server = MockServer::start().await;
    let socket = Socket::new(test_options(&server));
    let mut events = watch_events(&socket);
    socket.connect();

    let mut conn = server.next_conn().await;
    conn.complete_handshake(quiet_handshake()).await;
    assert!(matches!(next_event(&mut events).await, Ev::Connecting));
    assert!(matches!(next_event(&mut events).await, Ev::Connect(_)));

    conn.send_json(&json!({ "event": "#setAuthToken", "data": { "token": "garbage" } }));

    match next_event(&mut events).await {
        Ev::Error(message) => assert!(message.contains("protocol error"), "{message}"),
        other => panic!("expected error event, got {other:?}"),
    }
    assert_eq!(socket.auth_state(), AuthState::Unauthenticated);

    socket.close().await.unwrap();
}

#[tokio::test]
async fn server_initiated_events_dispatch_with_and_without_responders() {
    let mut server = MockServer::start().await;
    let socket = Socket::new(test_options(&server));
    let mut events = watch_events(&socket);

    // Answer "greet" through the responder.
    let _ = socket.on(|event| {
        if let SocketEvent::Emit {
            event, responder, ..
        } = event
        {
            if event == "greet" {
                responder
                    .as_ref()
                    .expect("greet carries a cid")
                    .respond(json!({ "hi": true }));
            }
        }
    });

    socket.connect();
    let mut conn = server.next_conn().await;
    conn.complete_handshake(quiet_handshake()).await;

    conn.send_json(&json!({ "event": "greet", "data": {}, "cid": 9 }));
    let reply = conn.recv_json().await;
    assert_eq!(reply, json!({ "rid": 9, "data": { "hi": true } }));

    conn.send_json(&json!({ "event": "note", "data": 1 }));
    loop {
        match next_event(&mut events).await {
            Ev::Emit(name, data, has_responder) if name == "note" => {
                assert_eq!(data, json!(1));
                assert!(!has_responder);
                break;
            }
            Ev::Emit(name, _, has_responder) if name == "greet" => assert!(has_responder),
            Ev::Connecting | Ev::Connect(_) => {}
            other => panic!("unexpected event: {other:?}"),
        }
    }

    socket.close().await.unwrap();
}

#[tokio::test]
async fn unexpected_rid_and_malformed_packets_surface_on_the_error_event() {
    let mut server = MockServer::start().await;
    let socket = Socket::new(test_options(&server));
    let mut events = watch_events(&socket);
    socket.connect();

    let mut conn = server.next_conn().await;
    conn.complete_handshake(quiet_handshake()).await;
    assert!(matches!(next_event(&mut events).await, Ev::Connecting));
    assert!(matches!(next_event(&mut events).await, Ev::Connect(_)));

    conn.send_json(&json!({ "rid": 42, "data": {} }));
    match next_event(&mut events).await {
        Ev::Error(message) => assert!(message.contains("unexpected response id"), "{message}"),
        other => panic!("expected error event, got {other:?}"),
    }

    conn.send_text("{ not json");
    match next_event(&mut events).await {
        Ev::Error(message) => assert!(message.contains("parse failure"), "{message}"),
        other => panic!("expected error event, got {other:?}"),
    }

    conn.send_text("42");
    match next_event(&mut events).await {
        Ev::Error(message) => assert!(message.contains("protocol error"), "{message}"),
        other => panic!("expected error event, got {other:?}"),
    }

    // The connection survives all of the above.
    let (tx, mut rx) = mpsc::unbounded_channel();
    socket
        .emit_with_ack("still-alive", json!({}), move |result| {
            let _ = tx.send(result);
        })
        .unwrap();
    let packet = conn.recv_json().await;
    conn.send_json(&json!({ "rid": packet["cid"], "data": {} }));
    let result = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());

    socket.close().await.unwrap();
}

#[tokio::test]
async fn batched_inbound_arrays_dispatch_element_wise() {
    let mut server = MockServer::start().await;
    let socket = Socket::new(test_options(&server));
    let mut events = watch_events(&socket);
    socket.connect();

    let mut conn = server.next_conn().await;
    conn.complete_handshake(quiet_handshake()).await;

    conn.send_text(
        &json!([
            { "event": "first", "data": 1 },
            { "event": "second", "data": 2 }
        ])
        .to_string(),
    );

    let mut seen = Vec::new();
    while seen.len() < 2 {
        if let Ev::Emit(name, _, _) = next_event(&mut events).await {
            seen.push(name);
        }
    }
    assert_eq!(seen, vec!["first", "second"]);

    socket.close().await.unwrap();
}

#[tokio::test]
async fn close_cancels_pending_response_handlers() {
    let server = MockServer::start().await;
    let socket = Socket::new(test_options(&server));

    let (tx, mut rx) = mpsc::unbounded_channel();
    socket
        .emit_with_ack_no_timeout("never", Value::Null, move |result| {
            let _ = tx.send(result);
        })
        .unwrap();

    socket.close().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(AckFailure::Cancelled)));
}

#[tokio::test]
async fn failed_connect_emits_connect_abort() {
    // Grab a port with nothing listening on it.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let socket = Socket::new(
        ConnectOptions::new()
            .host("127.0.0.1")
            .port(port.to_string())
            .auto_reconnect(false),
    );
    let mut events = watch_events(&socket);
    socket.connect();

    assert!(matches!(next_event(&mut events).await, Ev::Connecting));
    assert!(matches!(next_event(&mut events).await, Ev::ConnectAbort(_)));
    assert_eq!(socket.state(), ConnectionState::Closed);

    socket.close().await.unwrap();
}

#[tokio::test]
async fn ping_timeout_closes_the_connection() {
    let mut server = MockServer::start().await;
    let socket = Socket::new(test_options(&server));
    let mut events = watch_events(&socket);
    socket.connect();

    let mut conn = server.next_conn().await;
    // Short watchdog, then total silence from the server.
    conn.complete_handshake(json!({ "id": "t", "pingTimeout": 300 }))
        .await;

    assert!(matches!(next_event(&mut events).await, Ev::Connecting));
    assert!(matches!(next_event(&mut events).await, Ev::Connect(_)));

    match next_event(&mut events).await {
        Ev::Disconnect(message) => {
            assert_eq!(message, SocketError::PingTimeout.to_string());
        }
        other => panic!("expected disconnect, got {other:?}"),
    }
    assert_eq!(socket.state(), ConnectionState::Closed);

    socket.close().await.unwrap();
}
