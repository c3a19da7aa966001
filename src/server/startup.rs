//! Server startup and lifecycle.
//!
//! [`run_server`] validates startup invariants, binds the primary listener
//! (and the bridge listener when enabled), spawns the background timers,
//! and returns a [`ServerHandle`] for clean shutdown. Integration tests use
//! [`ServerConfig::for_testing`] to run a real gateway on an ephemeral port
//! with the timers disabled.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::auth::{self, StartupError};
use crate::bridge;
use crate::config::reload::{HotReloadReason, RestartReason};
use crate::config::watcher::{ConfigEvent, ConfigWatcher, ReloadResult};
use crate::providers::ProviderRegistry;
use crate::server::http;
use crate::server::ws;
use crate::server::ws::broadcast::{broadcast_event, broadcast_tick, BroadcastOpts};
use crate::server::ws::frames::CloseCause;
use crate::state::health::{gather_health, HEALTH_CACHE_TTL_SECS};
use crate::state::GatewayState;

/// Cadence of the dedupe and chat-run sweep timer, independent of traffic.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Everything needed to start a gateway.
pub struct ServerConfig {
    pub state: Arc<GatewayState>,
    /// Path the config watcher and SIGHUP reload re-read.
    pub config_path: PathBuf,
    pub providers: Arc<ProviderRegistry>,
    /// When `false` (tests), the tick, health refresh, sweep, and config
    /// watcher tasks are not spawned.
    pub spawn_background_tasks: bool,
}

impl ServerConfig {
    /// Minimal config for integration tests. The bind address comes from the
    /// state's `GatewayConfig`; use port 0 there for an OS-assigned port.
    pub fn for_testing(state: Arc<GatewayState>) -> Self {
        ServerConfig {
            state,
            config_path: std::env::temp_dir().join("portcullis-test.json5"),
            providers: Arc::new(ProviderRegistry::new()),
            spawn_background_tasks: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Startup(#[from] StartupError),

    #[error("invalid {which} address {addr}: {message}")]
    InvalidAddress {
        which: &'static str,
        addr: String,
        message: String,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

/// Handle to a running gateway. Dropping it does not stop the server; call
/// [`ServerHandle::shutdown`].
pub struct ServerHandle {
    local_addr: SocketAddr,
    bridge_addr: Option<SocketAddr>,
    state: Arc<GatewayState>,
    providers: Arc<ProviderRegistry>,
    server_task: JoinHandle<Result<(), std::io::Error>>,
    bridge_task: Option<JoinHandle<Result<(), std::io::Error>>>,
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("local_addr", &self.local_addr)
            .field("bridge_addr", &self.bridge_addr)
            .finish_non_exhaustive()
    }
}

impl ServerHandle {
    /// The port the primary listener actually bound to.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn bridge_addr(&self) -> Option<SocketAddr> {
        self.bridge_addr
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.local_addr)
    }

    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    /// Graceful shutdown: announce it, stop providers, close every
    /// connection with `cause`, then await the listener tasks.
    pub async fn shutdown(self, cause: CloseCause) {
        broadcast_event(
            &self.state,
            "shutdown",
            json!({"reason": cause.as_str()}),
            &BroadcastOpts::default(),
        );
        self.providers.stop_all().await;
        self.state.begin_shutdown(cause);

        // Brief grace period so the send tasks can flush close frames.
        tokio::time::sleep(Duration::from_millis(100)).await;

        await_listener("gateway", self.server_task).await;
        if let Some(task) = self.bridge_task {
            await_listener("bridge", task).await;
        }
    }
}

async fn await_listener(target: &'static str, task: JoinHandle<Result<(), std::io::Error>>) {
    match tokio::time::timeout(Duration::from_secs(5), task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!(target: "gateway", listener = target, "listener task failed: {e}"),
        Ok(Err(e)) => error!(target: "gateway", listener = target, "listener task panicked: {e}"),
        Err(_) => warn!(target: "gateway", listener = target, "listener did not stop within 5s"),
    }
}

/// Start the gateway from a fully-assembled [`ServerConfig`].
pub async fn run_server(server_config: ServerConfig) -> Result<ServerHandle, ServerError> {
    let ServerConfig {
        state,
        config_path,
        providers,
        spawn_background_tasks,
    } = server_config;
    let config = state.config();

    auth::validate_startup(&config)?;

    let addr = config
        .primary_addr()
        .map_err(|e| ServerError::InvalidAddress {
            which: "gateway",
            addr: config.gateway.bind.clone(),
            message: e.to_string(),
        })?;
    let app = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/health", get(http::health_handler))
        .with_state(state.clone());
    let listener = bind(addr).await?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| ServerError::Bind { addr, source })?;
    info!(target: "gateway", addr = %local_addr, "gateway listening");
    let server_task = tokio::spawn(serve_until_shutdown(listener, app, state.shutdown_rx()));

    let (bridge_addr, bridge_task) = if config.bridge.enabled {
        let addr = config
            .bridge_addr()
            .map_err(|e| ServerError::InvalidAddress {
                which: "bridge",
                addr: config.bridge.bind.clone(),
                message: e.to_string(),
            })?;
        let app = Router::new()
            .route("/bridge", get(bridge::bridge_handler))
            .with_state(state.clone());
        let listener = bind(addr).await?;
        let local = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;
        info!(target: "bridge", addr = %local, "bridge listening");
        let task = tokio::spawn(serve_until_shutdown(listener, app, state.shutdown_rx()));
        (Some(local), Some(task))
    } else {
        (None, None)
    };

    if spawn_background_tasks {
        spawn_background(&state, &providers, config_path);
    }
    providers.start_all().await;

    Ok(ServerHandle {
        local_addr,
        bridge_addr,
        state,
        providers,
        server_task,
        bridge_task,
    })
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

async fn serve_until_shutdown(
    listener: TcpListener,
    app: Router,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }
    })
    .await
}

/// Spawn the periodic timers and the config watcher. All of them stop when
/// the state's shutdown channel flips.
fn spawn_background(
    state: &Arc<GatewayState>,
    providers: &Arc<ProviderRegistry>,
    config_path: PathBuf,
) {
    spawn_tick_task(state.clone());
    spawn_health_task(state.clone());
    spawn_sweep_task(state.clone());

    let raw = crate::config::load_raw_at(&config_path)
        .unwrap_or_else(|_| Value::Object(serde_json::Map::new()));
    let watcher = ConfigWatcher::from_config(&state.config(), raw);
    let events = watcher.subscribe();
    watcher.start(config_path.clone(), state.shutdown_rx());
    spawn_config_event_task(state.clone(), providers.clone(), events);
    #[cfg(unix)]
    spawn_sighup_handler(watcher, config_path, state.shutdown_rx());
}

/// Liveness tick. The interval is re-read each round so a hot-reloaded
/// cadence takes effect without a restart.
fn spawn_tick_task(state: Arc<GatewayState>) {
    let mut shutdown_rx = state.shutdown_rx();
    tokio::spawn(async move {
        loop {
            let interval = state.config().gateway.limits.tick_interval_ms.max(100);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(interval)) => {
                    broadcast_tick(&state);
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });
}

/// Keep the health cache warm so connect hellos and `health` requests see a
/// recent snapshot without probing inline.
fn spawn_health_task(state: Arc<GatewayState>) {
    let mut shutdown_rx = state.shutdown_rx();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(HEALTH_CACHE_TTL_SECS)) => {
                    let probe_state = state.clone();
                    let payload = state
                        .health
                        .refresh(move || async move {
                            let state_dir = crate::config::resolve_state_dir();
                            let payload = gather_health(&state_dir, probe_state.uptime_ms());
                            probe_state.state_versions.lock().bump_health();
                            payload
                        })
                        .await;
                    broadcast_event(&state, "health", payload, &BroadcastOpts::versioned(&state));
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });
}

/// Dedupe TTL purge and chat-run deadline sweep. Runs that hit their hard
/// deadline are announced as timed out.
fn spawn_sweep_task(state: Arc<GatewayState>) {
    let mut shutdown_rx = state.shutdown_rx();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {
                    state.dedupe.sweep();
                    let expired = state.runs.lock().sweep();
                    for run_id in expired {
                        broadcast_event(
                            &state,
                            "chat.run",
                            json!({"runId": run_id, "status": "timed-out"}),
                            &BroadcastOpts::default(),
                        );
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });
}

/// Bridge config watcher events into the running gateway: swap the config
/// in on hot reloads, restart the providers the plan names, and surface
/// restart-required changes as a signal event. The process never restarts
/// itself.
fn spawn_config_event_task(
    state: Arc<GatewayState>,
    providers: Arc<ProviderRegistry>,
    mut events: tokio::sync::broadcast::Receiver<ConfigEvent>,
) {
    let mut shutdown_rx = state.shutdown_rx();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => {
                    use tokio::sync::broadcast::error::RecvError;
                    match event {
                        Ok(ConfigEvent::Reloaded(result)) => {
                            apply_reload(&state, &providers, result).await;
                        }
                        Ok(ConfigEvent::ReloadFailed(result)) => {
                            warn!(
                                target: "config",
                                issues = ?result.issues,
                                "config reload rejected, keeping last known good"
                            );
                        }
                        Ok(ConfigEvent::RestartRequired(reasons)) => {
                            let names: Vec<&str> =
                                reasons.iter().map(RestartReason::as_str).collect();
                            warn!(
                                target: "config",
                                reasons = ?names,
                                "config change requires a gateway restart"
                            );
                            broadcast_event(
                                &state,
                                "config.reload",
                                json!({"status": "restart-required", "restart": names}),
                                &BroadcastOpts::default(),
                            );
                        }
                        Err(RecvError::Lagged(n)) => {
                            warn!(target: "config", "config event receiver lagged by {n}");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });
}

async fn apply_reload(
    state: &Arc<GatewayState>,
    providers: &Arc<ProviderRegistry>,
    result: ReloadResult,
) {
    let Some(config) = result.config else {
        return;
    };
    state.set_config(config);
    let plan = result.plan.unwrap_or_default();
    for reason in &plan.hot {
        if let HotReloadReason::RestartProviders(ids) = reason {
            for id in ids {
                if let Err(e) = providers.restart(id).await {
                    warn!(target: "config", provider = %id, "provider restart failed: {e}");
                }
            }
        }
    }
    info!(
        target: "config",
        hot = plan.hot.len(),
        noop = plan.noop_paths.len(),
        "config applied"
    );
    broadcast_event(
        state,
        "config.reload",
        json!({"status": "reloaded"}),
        &BroadcastOpts::default(),
    );
}

/// Manual reload on SIGHUP, bypassing the debounce. The watcher moves in
/// here so its event channel outlives the startup scope.
#[cfg(unix)]
fn spawn_sighup_handler(
    watcher: ConfigWatcher,
    config_path: PathBuf,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!(target: "gateway", "failed to install SIGHUP handler: {e}");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = sighup.recv() => {
                    info!(target: "config", "SIGHUP received, reloading config");
                    let _ = watcher.reload_now(&config_path);
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::GatewayConfig;

    fn ephemeral_config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.gateway.port = 0;
        config.gateway.auth.token = Some("startup-test-token".to_string());
        config
    }

    #[tokio::test]
    async fn test_run_server_binds_ephemeral_port() {
        let state = Arc::new(GatewayState::new(ephemeral_config()));
        let handle = run_server(ServerConfig::for_testing(state))
            .await
            .unwrap();
        assert_ne!(handle.port(), 0);
        assert!(handle.bridge_addr().is_none());
        handle.shutdown(CloseCause::Normal).await;
    }

    #[tokio::test]
    async fn test_port_in_use_is_a_bind_error() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut config = ephemeral_config();
        config.gateway.port = port;
        let state = Arc::new(GatewayState::new(config));
        let err = run_server(ServerConfig::for_testing(state))
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Bind { .. }));
    }

    #[tokio::test]
    async fn test_bridge_listener_bound_when_enabled() {
        let mut config = ephemeral_config();
        config.bridge.enabled = true;
        config.bridge.port = 0;
        let state = Arc::new(GatewayState::new(config));
        let handle = run_server(ServerConfig::for_testing(state))
            .await
            .unwrap();
        let bridge = handle.bridge_addr().unwrap();
        assert_ne!(bridge.port(), 0);
        assert_ne!(bridge.port(), handle.port());
        handle.shutdown(CloseCause::ServiceRestart).await;
    }

    #[tokio::test]
    async fn test_open_bind_without_auth_refused() {
        let mut config = ephemeral_config();
        config.gateway.bind = "0.0.0.0".to_string();
        config.gateway.auth.mode = crate::config::schema::AuthMode::None;
        config.gateway.auth.token = None;
        let state = Arc::new(GatewayState::new(config));
        let err = run_server(ServerConfig::for_testing(state))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServerError::Startup(StartupError::OpenBindNotLoopback { .. })
        ));
    }
}
