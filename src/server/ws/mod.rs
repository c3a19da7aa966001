//! WebSocket connection manager.
//!
//! Owns the full lifecycle of a primary connection: upgrade, handshake
//! (connect frame, protocol window, auth), hello snapshot, the request
//! loop, and teardown. Each socket gets a dedicated send task fed by an
//! unbounded channel; nothing else touches the raw socket.

pub mod broadcast;
pub mod dispatch;
pub mod frames;

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth;
use crate::server::ws::broadcast::{broadcast_presence, mark_departed};
use crate::server::ws::dispatch::{dispatch_request, Caller, RequestContext};
use crate::server::ws::frames::{
    error_shape, parse_connect_params, parse_request_frame, response_err, response_ok,
    truncate_close_reason, ClientInfo, CloseCause, ConnectParams, ERROR_INVALID_REQUEST,
    ERROR_UNAUTHORIZED, PROTOCOL_VERSION,
};
use crate::state::presence::{PresenceEntry, PresenceMode, PresenceReason};
use crate::state::{ConnectionHandle, GatewayState, Outbound};

/// Events a client may receive, advertised in the hello payload.
pub const GATEWAY_EVENTS: [&str; 7] = [
    "tick",
    "presence",
    "presence.ping",
    "health",
    "chat.run",
    "config.reload",
    "shutdown",
];

/// Client modes that never appear in the presence table.
const EPHEMERAL_CLIENT_MODES: [&str; 2] = ["cli", "probe"];

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>, remote_addr: SocketAddr) {
    let (sender, mut receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
    let buffered = Arc::new(AtomicUsize::new(0));
    let send_task = tokio::spawn(run_send_task(sender, rx, buffered.clone()));

    let conn_id = Uuid::new_v4().to_string();
    let started = Instant::now();

    let handshake =
        match perform_handshake(&mut receiver, &tx, &buffered, &state, &conn_id, remote_addr).await
        {
            Ok(handshake) => handshake,
            Err(cause) => {
                info!(
                    target: "ws",
                    conn_id = %conn_id,
                    peer = %remote_addr,
                    cause = %cause,
                    "handshake failed"
                );
                drop(tx);
                let _ = send_task.await;
                return;
            }
        };

    let presence_key = handshake.presence_key.clone();
    let cause = run_message_loop(&mut receiver, &tx, &buffered, &state, &conn_id).await;

    // The slow-consumer path may already have removed us; whichever side
    // gets there first handles the presence departure.
    if state.remove_connection(&conn_id).is_some() {
        if let Some(key) = &presence_key {
            mark_departed(&state, key, PresenceReason::Disconnect);
        }
    }
    info!(
        target: "ws",
        conn_id = %conn_id,
        peer = %remote_addr,
        client = %handshake.connect.client.id,
        cause = %cause,
        duration_ms = started.elapsed().as_millis() as u64,
        "connection closed"
    );

    drop(tx);
    let _ = send_task.await;
}

/// Drain the outbound channel onto the socket. A close message ends the
/// task; everything still queued behind it is discarded.
pub(crate) async fn run_send_task(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    buffered: Arc<AtomicUsize>,
) {
    while let Some(msg) = rx.recv().await {
        match msg {
            Outbound::Text(text) => {
                let len = text.len();
                let result = sender.send(Message::Text(text)).await;
                buffered.fetch_sub(len, Ordering::SeqCst);
                if result.is_err() {
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let _ = sender
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: Cow::Owned(reason),
                    })))
                    .await;
                break;
            }
        }
    }
}

pub(crate) fn send_json(tx: &mpsc::UnboundedSender<Outbound>, buffered: &AtomicUsize, value: &Value) {
    let text = value.to_string();
    buffered.fetch_add(text.len(), Ordering::SeqCst);
    let _ = tx.send(Outbound::Text(text));
}

pub(crate) fn send_close(tx: &mpsc::UnboundedSender<Outbound>, cause: CloseCause, reason: &str) {
    let _ = tx.send(Outbound::Close {
        code: cause.close_code(),
        reason: truncate_close_reason(reason).into_owned(),
    });
}

struct HandshakeContext {
    connect: ConnectParams,
    presence_key: Option<String>,
}

/// Run the handshake: exactly one valid connect request within the timeout,
/// protocol window check, then auth. On success the connection is
/// registered, the hello response queued, and presence announced.
async fn perform_handshake(
    receiver: &mut SplitStream<WebSocket>,
    tx: &mpsc::UnboundedSender<Outbound>,
    buffered: &Arc<AtomicUsize>,
    state: &Arc<GatewayState>,
    conn_id: &str,
    remote_addr: SocketAddr,
) -> Result<HandshakeContext, CloseCause> {
    let config = state.config();
    let timeout = Duration::from_millis(config.gateway.limits.handshake_timeout_ms);

    let text = match tokio::time::timeout(timeout, next_text(receiver)).await {
        Err(_) => {
            send_close(tx, CloseCause::HandshakeTimeout, "handshake timeout");
            return Err(CloseCause::HandshakeTimeout);
        }
        Ok(None) => return Err(CloseCause::Normal),
        Ok(Some(text)) => text,
    };

    let value: Value = match serde_json::from_str(&text) {
        Ok(value) => value,
        Err(_) => {
            send_close(tx, CloseCause::InvalidHandshake, "invalid handshake: not json");
            return Err(CloseCause::InvalidHandshake);
        }
    };
    let frame = match parse_request_frame(&value) {
        Ok(frame) => frame,
        Err(err) => {
            let id = value.get("id").and_then(|v| v.as_str()).unwrap_or("");
            send_json(tx, buffered, &response_err(id, &err));
            send_close(tx, CloseCause::InvalidHandshake, "invalid handshake");
            return Err(CloseCause::InvalidHandshake);
        }
    };
    if frame.method != "connect" {
        let err = error_shape(ERROR_INVALID_REQUEST, "first request must be connect", None);
        send_json(tx, buffered, &response_err(&frame.id, &err));
        send_close(
            tx,
            CloseCause::InvalidHandshake,
            "invalid handshake: expected connect",
        );
        return Err(CloseCause::InvalidHandshake);
    }
    let connect = match parse_connect_params(frame.params.as_ref()) {
        Ok(connect) => connect,
        Err(err) => {
            send_json(tx, buffered, &response_err(&frame.id, &err));
            send_close(tx, CloseCause::InvalidHandshake, "invalid connect params");
            return Err(CloseCause::InvalidHandshake);
        }
    };

    if PROTOCOL_VERSION < connect.min_protocol || PROTOCOL_VERSION > connect.max_protocol {
        let err = error_shape(
            ERROR_INVALID_REQUEST,
            "protocol mismatch",
            Some(json!({
                "serverProtocol": PROTOCOL_VERSION,
                "minProtocol": connect.min_protocol,
                "maxProtocol": connect.max_protocol,
            })),
        );
        send_json(tx, buffered, &response_err(&frame.id, &err));
        send_close(tx, CloseCause::ProtocolMismatch, "protocol mismatch");
        return Err(CloseCause::ProtocolMismatch);
    }

    let resolved = auth::ResolvedAuth::from_section(&config.gateway.auth);
    match auth::resolve(&resolved, connect.auth.as_ref(), Some(remote_addr.ip())) {
        auth::AuthDecision::Allow { method } => {
            debug!(
                target: "auth",
                conn_id = %conn_id,
                method = method,
                client = %connect.client.id,
                "connection authenticated"
            );
        }
        auth::AuthDecision::Deny(failure) => {
            auth::log_denied(conn_id, Some(remote_addr.ip()), failure);
            let err = error_shape(ERROR_UNAUTHORIZED, "unauthorized", None);
            send_json(tx, buffered, &response_err(&frame.id, &err));
            send_close(tx, CloseCause::Unauthorized, "unauthorized");
            return Err(CloseCause::Unauthorized);
        }
    }

    let presence_key = presence_key_for(&connect.client, conn_id);

    let handle = ConnectionHandle {
        conn_id: conn_id.to_string(),
        client: connect.client.clone(),
        presence_key: presence_key.clone(),
        tx: tx.clone(),
        buffered: buffered.clone(),
        connected_at: Instant::now(),
    };
    state.register_connection(handle);

    if let Some(key) = &presence_key {
        let entry = presence_entry_for(&connect.client, remote_addr);
        state.presence.lock().upsert(key, entry);
        state.state_versions.lock().bump_presence();
    }

    let hello = build_hello(state, conn_id);
    send_json(tx, buffered, &response_ok(&frame.id, hello));

    if presence_key.is_some() {
        broadcast_presence(state);
    }

    Ok(HandshakeContext {
        connect,
        presence_key,
    })
}

/// Wait for the next text frame, skipping pings/pongs. `None` means the
/// socket went away.
pub(crate) async fn next_text(receiver: &mut SplitStream<WebSocket>) -> Option<String> {
    loop {
        match receiver.next().await? {
            Ok(Message::Text(text)) => return Some(text),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

/// Presence key for a client: the instance id when one was presented, the
/// connection id otherwise. Ephemeral modes get no presence entry at all.
fn presence_key_for(client: &ClientInfo, conn_id: &str) -> Option<String> {
    if EPHEMERAL_CLIENT_MODES.contains(&client.mode.as_str()) {
        return None;
    }
    Some(
        client
            .instance_id
            .clone()
            .unwrap_or_else(|| conn_id.to_string()),
    )
}

fn presence_entry_for(client: &ClientInfo, remote_addr: SocketAddr) -> PresenceEntry {
    PresenceEntry {
        host: client.display_name.clone(),
        ip: Some(remote_addr.ip().to_string()),
        version: Some(client.version.clone()),
        platform: Some(client.platform.clone()),
        device_family: client.device_family.clone(),
        mode: PresenceMode::Local,
        reason: PresenceReason::Connect,
        last_input_seconds: None,
        text: None,
        ts: 0,
    }
}

/// The hello snapshot returned from a successful connect: everything a
/// client needs to render without issuing follow-up requests.
fn build_hello(state: &GatewayState, conn_id: &str) -> Value {
    let config = state.config();
    json!({
        "protocol": PROTOCOL_VERSION,
        "server": {
            "name": "portcullis",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "connId": conn_id,
        "uptimeMs": state.uptime_ms(),
        "presence": state.presence.lock().snapshot(),
        "health": state.health.cached().unwrap_or(Value::Null),
        "stateVersion": state.state_version_value(),
        "methods": state.methods().method_names(),
        "events": GATEWAY_EVENTS,
        "policy": {
            "maxPayloadBytes": config.gateway.limits.max_payload_bytes,
            "maxBufferedBytes": config.gateway.limits.max_buffered_bytes,
            "tickIntervalMs": config.gateway.limits.tick_interval_ms,
        },
        "paths": {
            "configPath": crate::config::get_config_path().display().to_string(),
            "stateDir": crate::config::resolve_state_dir().display().to_string(),
        },
    })
}

/// Steady-state request loop. Requests are dispatched in arrival order and
/// each produces exactly one response frame.
async fn run_message_loop(
    receiver: &mut SplitStream<WebSocket>,
    tx: &mpsc::UnboundedSender<Outbound>,
    buffered: &Arc<AtomicUsize>,
    state: &Arc<GatewayState>,
    conn_id: &str,
) -> CloseCause {
    let max_payload = state.config().gateway.limits.max_payload_bytes;

    loop {
        let msg = match receiver.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(_)) | None => return CloseCause::Normal,
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => return CloseCause::Normal,
            Message::Binary(_) => {
                debug!(target: "ws", conn_id = %conn_id, "ignoring binary frame");
                continue;
            }
            _ => continue,
        };

        if text.len() > max_payload {
            warn!(
                target: "ws",
                conn_id = %conn_id,
                size = text.len(),
                limit = max_payload,
                "frame exceeds payload limit"
            );
            send_close(tx, CloseCause::InvalidHandshake, "payload too large");
            return CloseCause::InvalidHandshake;
        }

        let value: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(_) => {
                send_close(tx, CloseCause::InvalidHandshake, "invalid frame");
                return CloseCause::InvalidHandshake;
            }
        };
        let frame = match parse_request_frame(&value) {
            Ok(frame) => frame,
            Err(err) => {
                let id = value.get("id").and_then(|v| v.as_str()).unwrap_or("");
                send_json(tx, buffered, &response_err(id, &err));
                continue;
            }
        };

        // A second connect is an error, not a close.
        if frame.method == "connect" {
            let err = error_shape(ERROR_INVALID_REQUEST, "already connected", None);
            send_json(tx, buffered, &response_err(&frame.id, &err));
            continue;
        }

        let ctx = RequestContext {
            state: state.clone(),
            conn_id: conn_id.to_string(),
            caller: Caller::Primary,
        };
        let response = dispatch_request(ctx, frame).await;
        send_json(tx, buffered, &response);
    }
}
