//! Event fan-out.
//!
//! Every broadcast allocates one global sequence number and serializes the
//! frame once, then enqueues the same text on every live connection. A
//! connection whose outbound buffer is over the configured cap is a slow
//! consumer: loss-tolerant events (ticks, presence pings) skip it, while
//! state-bearing events force-close it with a `slow-consumer` policy close
//! so the client reconnects and resyncs instead of consuming a stale view.

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::server::ws::frames::{self, CloseCause};
use crate::state::presence::PresenceReason;
use crate::state::GatewayState;

#[derive(Debug, Clone, Default)]
pub struct BroadcastOpts {
    /// Skip slow consumers instead of closing them. Set for events a client
    /// can afford to miss.
    pub drop_if_slow: bool,
    /// Attached to the frame when the event carries versioned state.
    pub state_version: Option<Value>,
    /// When set, bridge nodes only receive the event if they are subscribed
    /// to this session. Global events leave it unset and reach every node.
    pub session_key: Option<String>,
}

impl BroadcastOpts {
    pub fn lossy() -> Self {
        Self {
            drop_if_slow: true,
            ..Self::default()
        }
    }

    pub fn versioned(state: &GatewayState) -> Self {
        Self {
            drop_if_slow: false,
            state_version: Some(state.state_version_value()),
            session_key: None,
        }
    }

    pub fn for_session(session_key: &str) -> Self {
        Self {
            session_key: Some(session_key.to_string()),
            ..Self::default()
        }
    }
}

/// Broadcast one event to every primary connection. Returns the sequence
/// number the event went out with.
pub fn broadcast_event(
    state: &GatewayState,
    event: &str,
    payload: Value,
    opts: &BroadcastOpts,
) -> u64 {
    let seq = state.next_event_seq();
    let frame = frames::event_frame(event, &payload, seq, opts.state_version.as_ref());
    let text = frame.to_string();
    let max_buffered = state.config().gateway.limits.max_buffered_bytes;

    let mut dead: Vec<String> = Vec::new();
    let mut slow: Vec<String> = Vec::new();
    {
        let connections = state.connections.lock();
        for (conn_id, handle) in connections.iter() {
            if handle.buffered_bytes() > max_buffered {
                if opts.drop_if_slow {
                    debug!(
                        target: "ws",
                        conn_id = %conn_id,
                        event = %event,
                        buffered = handle.buffered_bytes(),
                        "dropping event for slow consumer"
                    );
                } else {
                    slow.push(conn_id.clone());
                }
                continue;
            }
            if handle.send_text(&text).is_err() {
                dead.push(conn_id.clone());
            }
        }
    }

    for conn_id in dead {
        if state.remove_connection(&conn_id).is_some() {
            debug!(target: "ws", conn_id = %conn_id, "pruned dead connection during broadcast");
        }
    }
    for conn_id in slow {
        force_close_slow(state, &conn_id);
    }

    crate::bridge::fanout_nodes(
        state,
        &text,
        opts.session_key.as_deref(),
        opts.drop_if_slow,
    );
    seq
}

/// Force-close a slow consumer. There is no second chance: the first
/// overflow on a state-bearing event ends the connection.
pub fn force_close_slow(state: &GatewayState, conn_id: &str) {
    let Some(handle) = state.remove_connection(conn_id) else {
        return;
    };
    warn!(
        target: "ws",
        conn_id = %conn_id,
        buffered = handle.buffered_bytes(),
        "closing slow consumer"
    );
    handle.send_close(CloseCause::SlowConsumer, "slow consumer");
    if let Some(presence_key) = &handle.presence_key {
        mark_departed(state, presence_key, PresenceReason::Disconnect);
    }
}

/// Record a presence departure and announce the new table. Used both by the
/// normal teardown path and by the slow-consumer close above; whichever runs
/// first wins, the other is a no-op on the connections map.
pub fn mark_departed(state: &GatewayState, presence_key: &str, reason: PresenceReason) {
    if !state.presence.lock().mark_disconnected(presence_key, reason) {
        return;
    }
    state.state_versions.lock().bump_presence();
    broadcast_presence(state);
}

/// Broadcast the full presence table. Versioned, so slow consumers are
/// closed rather than skipped.
pub fn broadcast_presence(state: &GatewayState) -> u64 {
    let snapshot = state.presence.lock().snapshot();
    broadcast_event(
        state,
        "presence",
        json!({"presence": snapshot}),
        &BroadcastOpts::versioned(state),
    )
}

/// Broadcast a liveness tick. Ticks are loss-tolerant.
pub fn broadcast_tick(state: &GatewayState) -> u64 {
    broadcast_event(
        state,
        "tick",
        json!({"ts": crate::state::presence::now_ms()}),
        &BroadcastOpts::lossy(),
    )
}
