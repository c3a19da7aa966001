//! Shared gateway state.
//!
//! Everything cross-cutting lives in one explicit [`GatewayState`] with a
//! defined lifecycle (`new`, `begin_shutdown`) and is injected where needed.
//! Nothing here is module-global; tests construct isolated instances.

pub mod dedupe;
pub mod health;
pub mod presence;
pub mod runs;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::bridge::NodeSession;
use crate::config::schema::GatewayConfig;
use crate::server::ws::dispatch::MethodRegistry;
use crate::server::ws::frames::{self, ClientInfo, CloseCause};

use dedupe::DedupeCache;
use health::HealthState;
use presence::{PresenceTable, StateVersion, StateVersionTracker};
use runs::ChatRunRegistry;

/// Message handed to a connection's send task. The raw socket is owned by
/// that task alone; everyone else goes through this channel.
#[derive(Debug)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// Book-keeping for one live primary connection. Referenced by id from the
/// dispatcher and broadcaster; owned by the connections map.
pub struct ConnectionHandle {
    pub conn_id: String,
    pub client: ClientInfo,
    /// Presence key, absent for pure CLI/automation clients.
    pub presence_key: Option<String>,
    pub tx: mpsc::UnboundedSender<Outbound>,
    /// Bytes enqueued but not yet written to the socket. The send task
    /// decrements after each write; the broadcaster reads it to spot slow
    /// consumers.
    pub buffered: Arc<AtomicUsize>,
    pub connected_at: Instant,
}

impl ConnectionHandle {
    pub fn send_text(&self, text: &str) -> Result<(), ()> {
        self.buffered.fetch_add(text.len(), Ordering::SeqCst);
        self.tx
            .send(Outbound::Text(text.to_string()))
            .map_err(|_| ())
    }

    pub fn send_close(&self, cause: CloseCause, reason: &str) {
        let reason = frames::truncate_close_reason(reason).into_owned();
        let _ = self.tx.send(Outbound::Close {
            code: cause.close_code(),
            reason,
        });
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }
}

pub struct GatewayState {
    config: RwLock<GatewayConfig>,
    start_time: Instant,
    pub connections: Mutex<HashMap<String, ConnectionHandle>>,
    pub nodes: Mutex<HashMap<String, NodeSession>>,
    pub presence: Mutex<PresenceTable>,
    pub health: HealthState,
    pub state_versions: Mutex<StateVersionTracker>,
    pub dedupe: DedupeCache,
    pub runs: Mutex<ChatRunRegistry>,
    event_seq: Mutex<u64>,
    methods: MethodRegistry,
    shutdown_tx: watch::Sender<bool>,
}

impl GatewayState {
    pub fn new(config: GatewayConfig) -> Self {
        let dedupe = DedupeCache::new(
            Duration::from_millis(config.gateway.dedupe.ttl_ms),
            config.gateway.dedupe.max_entries,
        );
        let runs = ChatRunRegistry::new(
            Duration::from_millis(config.gateway.runs.deadline_ms),
            Duration::from_millis(config.gateway.runs.recently_aborted_ms),
        );
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config: RwLock::new(config),
            start_time: Instant::now(),
            connections: Mutex::new(HashMap::new()),
            nodes: Mutex::new(HashMap::new()),
            presence: Mutex::new(PresenceTable::new()),
            health: HealthState::new(),
            state_versions: Mutex::new(StateVersionTracker::new()),
            dedupe,
            runs: Mutex::new(runs),
            event_seq: Mutex::new(0),
            methods: MethodRegistry::with_core_methods(),
            shutdown_tx,
        }
    }

    pub fn config(&self) -> GatewayConfig {
        self.config.read().clone()
    }

    /// Swap in a hot-reloaded config. Listener-affecting fields in the new
    /// value are ignored by the running process (they are restart-required).
    pub fn set_config(&self, config: GatewayConfig) {
        *self.config.write() = config;
    }

    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    pub fn methods(&self) -> &MethodRegistry {
        &self.methods
    }

    /// Allocate the next broadcast sequence number. Strictly increasing and
    /// global across all event types.
    pub fn next_event_seq(&self) -> u64 {
        let mut seq = self.event_seq.lock();
        *seq += 1;
        *seq
    }

    pub fn state_version(&self) -> StateVersion {
        self.state_versions.lock().current()
    }

    pub fn state_version_value(&self) -> Value {
        serde_json::to_value(self.state_version()).unwrap_or(Value::Null)
    }

    pub fn register_connection(&self, handle: ConnectionHandle) {
        self.connections.lock().insert(handle.conn_id.clone(), handle);
    }

    /// Idempotent removal; a double-close is a no-op.
    pub fn remove_connection(&self, conn_id: &str) -> Option<ConnectionHandle> {
        self.connections.lock().remove(conn_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Stop timers and close every primary and bridge connection with the
    /// given cause. Safe to call more than once.
    pub fn begin_shutdown(&self, cause: CloseCause) {
        let _ = self.shutdown_tx.send(true);

        let reason = match cause {
            CloseCause::ServiceRestart => "service restarting",
            _ => "gateway shutting down",
        };
        let connections: Vec<ConnectionHandle> = {
            let mut map = self.connections.lock();
            map.drain().map(|(_, h)| h).collect()
        };
        for handle in connections {
            handle.send_close(cause, reason);
        }
        let nodes: Vec<NodeSession> = {
            let mut map = self.nodes.lock();
            map.drain().map(|(_, n)| n).collect()
        };
        for node in nodes {
            node.beacon.cancel();
            node.send_close(cause, reason);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::test_handle;
    use super::*;

    #[test]
    fn test_event_seq_strictly_increasing() {
        let state = GatewayState::new(GatewayConfig::default());
        let mut last = 0;
        for _ in 0..100 {
            let seq = state.next_event_seq();
            assert!(seq > last);
            last = seq;
        }
    }

    #[test]
    fn test_register_and_double_remove() {
        let state = GatewayState::new(GatewayConfig::default());
        let (handle, _rx) = test_handle("c1");
        state.register_connection(handle);
        assert_eq!(state.connection_count(), 1);
        assert!(state.remove_connection("c1").is_some());
        assert!(state.remove_connection("c1").is_none());
        assert_eq!(state.connection_count(), 0);
    }

    #[test]
    fn test_send_text_tracks_buffered_bytes() {
        let (handle, mut rx) = test_handle("c1");
        handle.send_text("hello").unwrap();
        assert_eq!(handle.buffered_bytes(), 5);
        match rx.try_recv().unwrap() {
            Outbound::Text(t) => assert_eq!(t, "hello"),
            other => panic!("unexpected outbound: {other:?}"),
        }
    }

    #[test]
    fn test_begin_shutdown_closes_connections() {
        let state = GatewayState::new(GatewayConfig::default());
        let (handle, mut rx) = test_handle("c1");
        state.register_connection(handle);

        state.begin_shutdown(CloseCause::ServiceRestart);
        assert!(state.is_shutting_down());
        assert_eq!(state.connection_count(), 0);
        match rx.try_recv().unwrap() {
            Outbound::Close { code, reason } => {
                assert_eq!(code, 1012);
                assert_eq!(reason, "service restarting");
            }
            other => panic!("unexpected outbound: {other:?}"),
        }
        // Idempotent
        state.begin_shutdown(CloseCause::Normal);
    }
}
