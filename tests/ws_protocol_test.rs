//! End-to-end protocol tests over a real WebSocket.
//!
//! Each test starts a gateway on an ephemeral port, speaks the wire
//! protocol with tokio-tungstenite, and checks handshake, dispatch, and
//! close behavior as a client would see it.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use portcullis::config::schema::{AuthMode, GatewayConfig};
use portcullis::server::ws::frames::CloseCause;
use portcullis::server::{run_server, ServerConfig, ServerHandle};
use portcullis::state::GatewayState;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn open_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.gateway.port = 0;
    config.gateway.auth.mode = AuthMode::None;
    config
}

async fn start_server(config: GatewayConfig) -> ServerHandle {
    let state = Arc::new(GatewayState::new(config));
    run_server(ServerConfig::for_testing(state)).await.unwrap()
}

async fn ws_connect(handle: &ServerHandle) -> WsClient {
    let (stream, _) = connect_async(handle.ws_url())
        .await
        .expect("websocket connect failed");
    stream
}

fn connect_frame(id: &str, auth: Option<Value>) -> Value {
    let mut params = json!({
        "minProtocol": 3,
        "maxProtocol": 3,
        "client": {
            "id": "test-ui",
            "displayName": "test workstation",
            "version": "1.0.0",
            "platform": "linux",
            "mode": "ui",
            "instanceId": "inst-test",
        },
    });
    if let Some(auth) = auth {
        params["auth"] = auth;
    }
    json!({"type": "req", "id": id, "method": "connect", "params": params})
}

async fn send(client: &mut WsClient, frame: &Value) {
    client
        .send(Message::Text(frame.to_string()))
        .await
        .expect("send failed");
}

/// Next JSON frame of any kind.
async fn recv_json(client: &mut WsClient) -> Value {
    loop {
        let msg = tokio::time::timeout(std::time::Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("stream error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("invalid json frame");
        }
    }
}

/// Next response frame, skipping interleaved events.
async fn recv_response(client: &mut WsClient) -> Value {
    loop {
        let frame = recv_json(client).await;
        if frame["type"] == "res" {
            return frame;
        }
    }
}

/// Next event frame with the given name, skipping everything else.
async fn recv_event(client: &mut WsClient, event: &str) -> Value {
    loop {
        let frame = recv_json(client).await;
        if frame["type"] == "event" && frame["event"] == event {
            return frame;
        }
    }
}

/// Wait for the server's close frame and return (code, reason).
async fn recv_close(client: &mut WsClient) -> (u16, String) {
    loop {
        match tokio::time::timeout(std::time::Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for close")
        {
            Some(Ok(Message::Close(Some(frame)))) => {
                return (u16::from(frame.code), frame.reason.to_string());
            }
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => panic!("stream ended without a close frame"),
        }
    }
}

async fn handshake(client: &mut WsClient) -> Value {
    send(client, &connect_frame("c1", None)).await;
    let res = recv_response(client).await;
    assert_eq!(res["ok"], true, "handshake failed: {res}");
    res["payload"].clone()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_returns_hello_snapshot() {
    let handle = start_server(open_config()).await;
    let mut client = ws_connect(&handle).await;

    let hello = handshake(&mut client).await;
    assert_eq!(hello["protocol"], 3);
    assert!(hello["connId"].is_string());
    assert!(hello["methods"].as_array().unwrap().iter().any(|m| m == "ping"));
    assert!(hello["events"].as_array().unwrap().iter().any(|e| e == "presence"));
    assert!(hello["policy"]["maxPayloadBytes"].as_u64().unwrap() > 0);
    // The connecting client is already in the presence snapshot.
    assert!(hello["presence"].as_object().unwrap().contains_key("inst-test"));

    handle.shutdown(CloseCause::Normal).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_presence_announced_after_connect() {
    let handle = start_server(open_config()).await;
    let mut client = ws_connect(&handle).await;
    handshake(&mut client).await;

    let event = recv_event(&mut client, "presence").await;
    assert!(event["seq"].as_u64().unwrap() >= 1);
    assert!(event["stateVersion"]["presence"].as_u64().unwrap() >= 1);
    assert!(event["payload"]["presence"]
        .as_object()
        .unwrap()
        .contains_key("inst-test"));

    handle.shutdown(CloseCause::Normal).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ping_round_trip() {
    let handle = start_server(open_config()).await;
    let mut client = ws_connect(&handle).await;
    handshake(&mut client).await;

    send(&mut client, &json!({"type": "req", "id": "p1", "method": "ping"})).await;
    let res = recv_response(&mut client).await;
    assert_eq!(res["id"], "p1");
    assert_eq!(res["ok"], true);
    assert_eq!(res["payload"]["pong"], true);

    handle.shutdown(CloseCause::Normal).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_protocol_mismatch_closes_1002() {
    let handle = start_server(open_config()).await;
    let mut client = ws_connect(&handle).await;

    let mut frame = connect_frame("c1", None);
    frame["params"]["minProtocol"] = json!(99);
    frame["params"]["maxProtocol"] = json!(99);
    send(&mut client, &frame).await;

    let res = recv_response(&mut client).await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["code"], "INVALID_REQUEST");
    assert_eq!(res["error"]["details"]["serverProtocol"], 3);

    let (code, reason) = recv_close(&mut client).await;
    assert_eq!(code, 1002);
    assert_eq!(reason, "protocol mismatch");

    handle.shutdown(CloseCause::Normal).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wrong_token_closes_unauthorized() {
    let mut config = open_config();
    config.gateway.auth.mode = AuthMode::Token;
    config.gateway.auth.token = Some("right-token".to_string());
    let handle = start_server(config).await;
    let mut client = ws_connect(&handle).await;

    send(
        &mut client,
        &connect_frame("c1", Some(json!({"token": "wrong-token"}))),
    )
    .await;

    let res = recv_response(&mut client).await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["code"], "UNAUTHORIZED");
    // No detail beyond "unauthorized" crosses the wire.
    assert_eq!(res["error"]["message"], "unauthorized");

    let (code, _) = recv_close(&mut client).await;
    assert_eq!(code, 1008);

    handle.shutdown(CloseCause::Normal).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_correct_token_admitted() {
    let mut config = open_config();
    config.gateway.auth.mode = AuthMode::Token;
    config.gateway.auth.token = Some("right-token".to_string());
    let handle = start_server(config).await;
    let mut client = ws_connect(&handle).await;

    send(
        &mut client,
        &connect_frame("c1", Some(json!({"token": "right-token"}))),
    )
    .await;
    let res = recv_response(&mut client).await;
    assert_eq!(res["ok"], true);

    handle.shutdown(CloseCause::Normal).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_first_request_must_be_connect() {
    let handle = start_server(open_config()).await;
    let mut client = ws_connect(&handle).await;

    send(&mut client, &json!({"type": "req", "id": "p1", "method": "ping"})).await;
    let res = recv_response(&mut client).await;
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["message"], "first request must be connect");

    let (code, _) = recv_close(&mut client).await;
    assert_eq!(code, 1008);

    handle.shutdown(CloseCause::Normal).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handshake_timeout_closes_1008() {
    let mut config = open_config();
    config.gateway.limits.handshake_timeout_ms = 200;
    let handle = start_server(config).await;
    let mut client = ws_connect(&handle).await;

    // Say nothing and wait for the server to give up.
    let (code, reason) = recv_close(&mut client).await;
    assert_eq!(code, 1008);
    assert_eq!(reason, "handshake timeout");

    handle.shutdown(CloseCause::Normal).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_connect_is_error_not_close() {
    let handle = start_server(open_config()).await;
    let mut client = ws_connect(&handle).await;
    handshake(&mut client).await;

    send(&mut client, &connect_frame("c2", None)).await;
    let res = recv_response(&mut client).await;
    assert_eq!(res["id"], "c2");
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["message"], "already connected");

    // The connection survives.
    send(&mut client, &json!({"type": "req", "id": "p1", "method": "ping"})).await;
    let res = recv_response(&mut client).await;
    assert_eq!(res["ok"], true);

    handle.shutdown(CloseCause::Normal).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_method_is_structured_error() {
    let handle = start_server(open_config()).await;
    let mut client = ws_connect(&handle).await;
    handshake(&mut client).await;

    send(
        &mut client,
        &json!({"type": "req", "id": "x1", "method": "no.such.method"}),
    )
    .await;
    let res = recv_response(&mut client).await;
    assert_eq!(res["id"], "x1");
    assert_eq!(res["ok"], false);
    assert_eq!(res["error"]["code"], "INVALID_REQUEST");
    assert!(res["error"]["message"]
        .as_str()
        .unwrap()
        .contains("unknown method"));

    handle.shutdown(CloseCause::Normal).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_status_reports_this_connection() {
    let handle = start_server(open_config()).await;
    let mut client = ws_connect(&handle).await;
    handshake(&mut client).await;

    send(&mut client, &json!({"type": "req", "id": "s1", "method": "status"})).await;
    let res = recv_response(&mut client).await;
    assert_eq!(res["ok"], true);
    assert_eq!(res["payload"]["connections"], 1);
    assert!(res["payload"]["uptimeMs"].is_u64());

    handle.shutdown(CloseCause::Normal).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_chat_send_is_idempotent() {
    let handle = start_server(open_config()).await;
    let mut client = ws_connect(&handle).await;
    handshake(&mut client).await;

    let params = json!({
        "sessionKey": "session-1",
        "message": "hello there",
        "idempotencyKey": "idem-1",
    });
    send(
        &mut client,
        &json!({"type": "req", "id": "m1", "method": "chat.send", "params": params}),
    )
    .await;
    let first = recv_response(&mut client).await;
    assert_eq!(first["ok"], true);
    assert_eq!(first["payload"]["runId"], "idem-1");
    assert_eq!(first["payload"]["status"], "pending");

    // The run start is announced as an event.
    let event = recv_event(&mut client, "chat.run").await;
    assert_eq!(event["payload"]["runId"], "idem-1");

    send(
        &mut client,
        &json!({"type": "req", "id": "m2", "method": "chat.send", "params": params}),
    )
    .await;
    let second = recv_response(&mut client).await;
    assert_eq!(second["ok"], true);
    assert_eq!(second["payload"]["deduplicated"], true);

    handle.shutdown(CloseCause::Normal).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_chat_abort_round_trip() {
    let handle = start_server(open_config()).await;
    let mut client = ws_connect(&handle).await;
    handshake(&mut client).await;

    send(
        &mut client,
        &json!({"type": "req", "id": "m1", "method": "chat.send", "params": {
            "sessionKey": "session-1",
            "message": "long task",
            "idempotencyKey": "run-abort-1",
        }}),
    )
    .await;
    assert_eq!(recv_response(&mut client).await["ok"], true);

    send(
        &mut client,
        &json!({"type": "req", "id": "a1", "method": "chat.abort", "params": {
            "runId": "run-abort-1",
        }}),
    )
    .await;
    let res = recv_response(&mut client).await;
    assert_eq!(res["ok"], true);
    assert_eq!(res["payload"]["aborted"], true);

    // A second abort for the recently-aborted run is acknowledged quietly.
    send(
        &mut client,
        &json!({"type": "req", "id": "a2", "method": "chat.abort", "params": {
            "runId": "run-abort-1",
        }}),
    )
    .await;
    let res = recv_response(&mut client).await;
    assert_eq!(res["ok"], true);
    assert_eq!(res["payload"]["aborted"], true);

    handle.shutdown(CloseCause::Normal).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_closes_clients_with_cause() {
    let handle = start_server(open_config()).await;
    let mut client = ws_connect(&handle).await;
    handshake(&mut client).await;

    let state = handle.state().clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        state.begin_shutdown(CloseCause::ServiceRestart);
    });

    let (code, reason) = recv_close(&mut client).await;
    assert_eq!(code, 1012);
    assert_eq!(reason, "service restarting");

    handle.shutdown(CloseCause::ServiceRestart).await;
}
