//! Bridge subsystem.
//!
//! A second listener for paired remote nodes. Nodes authenticate with a
//! pairing token whose SHA-256 is pinned in the config, subscribe to the
//! session keys they care about, and receive session-scoped events for
//! those plus every global event. Each node re-announces its presence on a
//! periodic beacon until it disconnects.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::schema::PairedNode;
use crate::server::ws::broadcast::{broadcast_event, broadcast_presence, BroadcastOpts};
use crate::server::ws::dispatch::{dispatch_request, Caller, RequestContext};
use crate::server::ws::frames::{
    self, error_shape, parse_request_frame, response_err, response_ok, CloseCause,
    ERROR_INVALID_REQUEST, ERROR_UNAUTHORIZED, PROTOCOL_VERSION,
};
use crate::server::ws::{next_text, run_send_task, send_close, send_json};
use crate::state::presence::{PresenceEntry, PresenceMode, PresenceReason};
use crate::state::{GatewayState, Outbound};

/// A live node session. Owned by the nodes map on [`GatewayState`].
pub struct NodeSession {
    pub node_id: String,
    pub display_name: Option<String>,
    pub platform: String,
    pub version: String,
    pub device_family: Option<String>,
    pub remote_addr: SocketAddr,
    /// Session keys this node receives scoped events for.
    pub subscriptions: HashSet<String>,
    pub tx: mpsc::UnboundedSender<Outbound>,
    pub buffered: Arc<AtomicUsize>,
    /// Cancels the beacon task when the session ends.
    pub beacon: CancellationToken,
    pub connected_at: Instant,
}

impl NodeSession {
    pub fn send_text(&self, text: &str) -> Result<(), ()> {
        self.buffered.fetch_add(text.len(), Ordering::SeqCst);
        self.tx
            .send(Outbound::Text(text.to_string()))
            .map_err(|_| ())
    }

    pub fn send_close(&self, cause: CloseCause, reason: &str) {
        let _ = self.tx.send(Outbound::Close {
            code: cause.close_code(),
            reason: frames::truncate_close_reason(reason).into_owned(),
        });
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    pub fn presence_key(&self) -> String {
        node_presence_key(&self.node_id)
    }
}

pub fn node_presence_key(node_id: &str) -> String {
    format!("node:{node_id}")
}

/// Verifies a node's pairing credential. The gateway config carries only
/// token hashes; the cleartext token lives on the node.
pub trait NodePairing: Send + Sync {
    fn verify(&self, node_id: &str, token: &str) -> bool;
}

pub struct TokenHashPairing {
    nodes: Vec<PairedNode>,
}

impl TokenHashPairing {
    pub fn new(nodes: Vec<PairedNode>) -> Self {
        Self { nodes }
    }

    pub fn token_sha256_hex(token: &str) -> String {
        let digest = Sha256::digest(token.as_bytes());
        let mut out = String::with_capacity(digest.len() * 2);
        for byte in digest {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

impl NodePairing for TokenHashPairing {
    fn verify(&self, node_id: &str, token: &str) -> bool {
        let Some(paired) = self.nodes.iter().find(|n| n.node_id == node_id) else {
            return false;
        };
        let presented = Self::token_sha256_hex(token);
        crate::auth::timing_safe_eq(
            presented.as_bytes(),
            paired.token_sha256.to_lowercase().as_bytes(),
        )
    }
}

/// Descriptor a node presents in its connect request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_family: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConnectParams {
    pub min_protocol: u32,
    pub max_protocol: u32,
    pub node: NodeInfo,
    pub token: String,
    /// Session keys to subscribe to immediately, before the first
    /// subscribe request.
    #[serde(default)]
    pub subscriptions: Vec<String>,
}

pub async fn bridge_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<GatewayState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    ws.on_upgrade(move |socket| handle_node_socket(socket, state, addr))
}

async fn handle_node_socket(socket: WebSocket, state: Arc<GatewayState>, remote_addr: SocketAddr) {
    let (sender, mut receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();
    let buffered = Arc::new(AtomicUsize::new(0));
    let send_task = tokio::spawn(run_send_task(sender, rx, buffered.clone()));

    let started = Instant::now();
    let node_id = match perform_node_handshake(&mut receiver, &tx, &buffered, &state, remote_addr)
        .await
    {
        Ok(node_id) => node_id,
        Err(cause) => {
            info!(
                target: "bridge",
                peer = %remote_addr,
                cause = %cause,
                "node handshake failed"
            );
            drop(tx);
            let _ = send_task.await;
            return;
        }
    };

    let cause = run_node_loop(&mut receiver, &tx, &buffered, &state, &node_id).await;

    if let Some(session) = state.nodes.lock().remove(&node_id) {
        session.beacon.cancel();
    }
    mark_node_departed(&state, &node_id);
    info!(
        target: "bridge",
        node_id = %node_id,
        peer = %remote_addr,
        cause = %cause,
        duration_ms = started.elapsed().as_millis() as u64,
        "node disconnected"
    );

    drop(tx);
    let _ = send_task.await;
}

async fn perform_node_handshake(
    receiver: &mut SplitStream<WebSocket>,
    tx: &mpsc::UnboundedSender<Outbound>,
    buffered: &Arc<AtomicUsize>,
    state: &Arc<GatewayState>,
    remote_addr: SocketAddr,
) -> Result<String, CloseCause> {
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
        Ok(frame) if frame.method == "connect" => frame,
        Ok(frame) => {
            let err = error_shape(ERROR_INVALID_REQUEST, "first request must be connect", None);
            send_json(tx, buffered, &response_err(&frame.id, &err));
            send_close(tx, CloseCause::InvalidHandshake, "invalid handshake");
            return Err(CloseCause::InvalidHandshake);
        }
        Err(err) => {
            let id = value.get("id").and_then(|v| v.as_str()).unwrap_or("");
            send_json(tx, buffered, &response_err(id, &err));
            send_close(tx, CloseCause::InvalidHandshake, "invalid handshake");
            return Err(CloseCause::InvalidHandshake);
        }
    };

    let params: NodeConnectParams = match frame
        .params
        .as_ref()
        .ok_or(())
        .and_then(|p| serde_json::from_value(p.clone()).map_err(|_| ()))
    {
        Ok(params) => params,
        Err(()) => {
            let err = error_shape(ERROR_INVALID_REQUEST, "invalid connect params", None);
            send_json(tx, buffered, &response_err(&frame.id, &err));
            send_close(tx, CloseCause::InvalidHandshake, "invalid connect params");
            return Err(CloseCause::InvalidHandshake);
        }
    };

    if PROTOCOL_VERSION < params.min_protocol || PROTOCOL_VERSION > params.max_protocol {
        let err = error_shape(
            ERROR_INVALID_REQUEST,
            "protocol mismatch",
            Some(json!({"serverProtocol": PROTOCOL_VERSION})),
        );
        send_json(tx, buffered, &response_err(&frame.id, &err));
        send_close(tx, CloseCause::ProtocolMismatch, "protocol mismatch");
        return Err(CloseCause::ProtocolMismatch);
    }

    let pairing = TokenHashPairing::new(config.bridge.paired_nodes.clone());
    if !pairing.verify(&params.node.node_id, &params.token) {
        warn!(
            target: "bridge",
            node_id = %params.node.node_id,
            peer = %remote_addr,
            "node pairing rejected"
        );
        let err = error_shape(ERROR_UNAUTHORIZED, "unauthorized", None);
        send_json(tx, buffered, &response_err(&frame.id, &err));
        send_close(tx, CloseCause::Unauthorized, "unauthorized");
        return Err(CloseCause::Unauthorized);
    }

    let node_id = params.node.node_id.clone();
    let beacon = CancellationToken::new();
    let session = NodeSession {
        node_id: node_id.clone(),
        display_name: params.node.display_name.clone(),
        platform: params.node.platform.clone(),
        version: params.node.version.clone(),
        device_family: params.node.device_family.clone(),
        remote_addr,
        subscriptions: params.subscriptions.iter().cloned().collect(),
        tx: tx.clone(),
        buffered: buffered.clone(),
        beacon: beacon.clone(),
        connected_at: Instant::now(),
    };

    // A reconnect supersedes any stale session for the same node id.
    if let Some(previous) = state.nodes.lock().insert(node_id.clone(), session) {
        previous.beacon.cancel();
        previous.send_close(CloseCause::Normal, "superseded by new session");
    }

    let presence_key = node_presence_key(&node_id);
    state.presence.lock().upsert(
        &presence_key,
        PresenceEntry {
            host: params.node.display_name.clone(),
            ip: Some(remote_addr.ip().to_string()),
            version: Some(params.node.version.clone()),
            platform: Some(params.node.platform.clone()),
            device_family: params.node.device_family.clone(),
            mode: PresenceMode::Remote,
            reason: PresenceReason::NodeConnected,
            last_input_seconds: None,
            text: None,
            ts: 0,
        },
    );
    state.state_versions.lock().bump_presence();

    let hello = json!({
        "protocol": PROTOCOL_VERSION,
        "server": {"name": "portcullis", "version": env!("CARGO_PKG_VERSION")},
        "nodeId": node_id,
        "subscriptions": params.subscriptions,
        "stateVersion": state.state_version_value(),
        "policy": {
            "maxPayloadBytes": config.gateway.limits.max_payload_bytes,
            "maxBufferedBytes": config.gateway.limits.max_buffered_bytes,
            "beaconIntervalMs": config.bridge.beacon_interval_ms,
        },
    });
    send_json(tx, buffered, &response_ok(&frame.id, hello));
    broadcast_presence(state);

    spawn_beacon_task(
        state.clone(),
        node_id.clone(),
        Duration::from_millis(config.bridge.beacon_interval_ms),
        beacon,
    );

    Ok(node_id)
}

async fn run_node_loop(
    receiver: &mut SplitStream<WebSocket>,
    tx: &mpsc::UnboundedSender<Outbound>,
    buffered: &Arc<AtomicUsize>,
    state: &Arc<GatewayState>,
    node_id: &str,
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
            _ => continue,
        };

        if text.len() > max_payload {
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
        if frame.method == "connect" {
            let err = error_shape(ERROR_INVALID_REQUEST, "already connected", None);
            send_json(tx, buffered, &response_err(&frame.id, &err));
            continue;
        }

        let ctx = RequestContext {
            state: state.clone(),
            conn_id: node_presence_key(node_id),
            caller: Caller::Node {
                node_id: node_id.to_string(),
            },
        };
        let response = dispatch_request(ctx, frame).await;
        send_json(tx, buffered, &response);
    }
}

/// Periodic presence beacon. Re-stamps the node's presence entry and emits
/// a lossy ping so stale-node detection does not depend on request traffic.
fn spawn_beacon_task(
    state: Arc<GatewayState>,
    node_id: String,
    interval: Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let presence_key = node_presence_key(&node_id);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            if !state.presence.lock().beacon(&presence_key) {
                break;
            }
            broadcast_event(
                &state,
                "presence.ping",
                json!({"key": presence_key, "ts": crate::state::presence::now_ms()}),
                &BroadcastOpts::lossy(),
            );
        }
    });
}

/// Fan one serialized event frame out to node sessions. `session_key`
/// scopes delivery to subscribers; `None` reaches every connected node.
/// Slow nodes follow the same policy as primary connections.
pub fn fanout_nodes(
    state: &GatewayState,
    text: &str,
    session_key: Option<&str>,
    drop_if_slow: bool,
) {
    let max_buffered = state.config().gateway.limits.max_buffered_bytes;
    let mut dead: Vec<String> = Vec::new();
    let mut slow: Vec<String> = Vec::new();
    {
        let nodes = state.nodes.lock();
        for (node_id, session) in nodes.iter() {
            if let Some(key) = session_key {
                if !session.subscriptions.contains(key) {
                    continue;
                }
            }
            if session.buffered_bytes() > max_buffered {
                if drop_if_slow {
                    debug!(
                        target: "bridge",
                        node_id = %node_id,
                        buffered = session.buffered_bytes(),
                        "dropping event for slow node"
                    );
                } else {
                    slow.push(node_id.clone());
                }
                continue;
            }
            if session.send_text(text).is_err() {
                dead.push(node_id.clone());
            }
        }
    }

    for node_id in dead {
        if let Some(session) = state.nodes.lock().remove(&node_id) {
            session.beacon.cancel();
            debug!(target: "bridge", node_id = %node_id, "pruned dead node during fanout");
            mark_node_departed(state, &node_id);
        }
    }
    for node_id in slow {
        force_close_node(state, &node_id);
    }
}

/// Close a slow node on first overflow, same policy as primary connections.
pub fn force_close_node(state: &GatewayState, node_id: &str) {
    let Some(session) = state.nodes.lock().remove(node_id) else {
        return;
    };
    warn!(
        target: "bridge",
        node_id = %node_id,
        buffered = session.buffered_bytes(),
        "closing slow node"
    );
    session.beacon.cancel();
    session.send_close(CloseCause::SlowConsumer, "slow consumer");
    mark_node_departed(state, node_id);
}

fn mark_node_departed(state: &GatewayState, node_id: &str) {
    let presence_key = node_presence_key(node_id);
    if !state
        .presence
        .lock()
        .mark_disconnected(&presence_key, PresenceReason::NodeDisconnected)
    {
        return;
    }
    state.state_versions.lock().bump_presence();
    broadcast_presence(state);
}
