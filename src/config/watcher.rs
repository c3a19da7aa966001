//! Config file watcher with debounced hot reload.
//!
//! Watches the persisted config file, coalesces editor write bursts through
//! a debounce window, re-reads and validates the file, and broadcasts the
//! outcome. An invalid edit never disturbs the running gateway: the last
//! known good config stays authoritative and a `ReloadFailed` event is
//! emitted instead.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{info, warn};

use crate::config::reload::{diff_config, GatewayReloadPlan, RestartReason};
use crate::config::GatewayConfig;

/// Far enough out that the debounce sleep never fires until armed.
const IDLE_SLEEP: Duration = Duration::from_secs(86_400);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadMode {
    Hot,
    Off,
}

impl ReloadMode {
    pub fn parse_mode(s: &str) -> ReloadMode {
        match s {
            "off" => ReloadMode::Off,
            _ => ReloadMode::Hot,
        }
    }
}

/// Outcome of one reload attempt.
#[derive(Debug, Clone)]
pub struct ReloadResult {
    pub success: bool,
    pub issues: Vec<String>,
    pub config: Option<GatewayConfig>,
    pub plan: Option<GatewayReloadPlan>,
}

#[derive(Debug, Clone)]
pub enum ConfigEvent {
    Reloaded(ReloadResult),
    ReloadFailed(ReloadResult),
    /// The new config is valid but contains changes the running process
    /// cannot absorb. The supervisor decides what to do with this.
    RestartRequired(Vec<RestartReason>),
}

pub struct ConfigWatcher {
    mode: ReloadMode,
    debounce: Duration,
    event_tx: broadcast::Sender<ConfigEvent>,
    last_good: Arc<Mutex<Value>>,
}

impl ConfigWatcher {
    pub fn from_config(config: &GatewayConfig, last_good_raw: Value) -> Self {
        let (event_tx, _) = broadcast::channel(32);
        Self {
            mode: ReloadMode::parse_mode(&config.gateway.reload.mode),
            debounce: Duration::from_millis(config.gateway.reload.debounce_ms.max(10)),
            event_tx,
            last_good: Arc::new(Mutex::new(last_good_raw)),
        }
    }

    pub fn mode(&self) -> ReloadMode {
        self.mode
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.event_tx.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<ConfigEvent> {
        self.event_tx.clone()
    }

    /// Start watching `config_path`. No-op when reload mode is `off`.
    pub fn start(&self, config_path: PathBuf, shutdown_rx: watch::Receiver<bool>) {
        if self.mode == ReloadMode::Off {
            info!(target: "config", "config reload disabled");
            return;
        }
        let debounce = self.debounce;
        let event_tx = self.event_tx.clone();
        let last_good = self.last_good.clone();
        tokio::spawn(async move {
            watcher_task(config_path, debounce, event_tx, last_good, shutdown_rx).await;
        });
    }

    /// Reload immediately (used by the SIGHUP path), bypassing the debounce.
    pub fn reload_now(&self, config_path: &Path) -> ReloadResult {
        let result = perform_reload(&self.last_good, config_path);
        publish(&self.event_tx, &result);
        result
    }
}

async fn watcher_task(
    config_path: PathBuf,
    debounce: Duration,
    event_tx: broadcast::Sender<ConfigEvent>,
    last_good: Arc<Mutex<Value>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let (fs_tx, mut fs_rx) = mpsc::unbounded_channel::<notify::Event>();

    let mut watcher: RecommendedWatcher = match notify::recommended_watcher(
        move |res: Result<notify::Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = fs_tx.send(event);
            }
        },
    ) {
        Ok(w) => w,
        Err(e) => {
            warn!(target: "config", "failed to create config watcher: {e}");
            return;
        }
    };

    // Editors typically replace the file, so watch the parent directory and
    // filter events down to our path.
    let watch_dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        warn!(target: "config", "failed to watch {}: {e}", watch_dir.display());
        return;
    }
    info!(target: "config", path = %config_path.display(), "config watcher started");

    let debounce_sleep = tokio::time::sleep(IDLE_SLEEP);
    tokio::pin!(debounce_sleep);
    let mut pending = false;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            event = fs_rx.recv() => {
                match event {
                    Some(event) => {
                        let relevant = event.paths.iter().any(|p| p == &config_path);
                        if relevant && is_mutation(&event.kind) {
                            pending = true;
                            debounce_sleep
                                .as_mut()
                                .reset(tokio::time::Instant::now() + debounce);
                        }
                    }
                    None => break,
                }
            }
            _ = &mut debounce_sleep, if pending => {
                pending = false;
                debounce_sleep
                    .as_mut()
                    .reset(tokio::time::Instant::now() + IDLE_SLEEP);
                let result = perform_reload(&last_good, &config_path);
                publish(&event_tx, &result);
            }
        }
    }
}

fn is_mutation(kind: &notify::EventKind) -> bool {
    matches!(
        kind,
        notify::EventKind::Create(_) | notify::EventKind::Modify(_) | notify::EventKind::Remove(_)
    )
}

fn publish(event_tx: &broadcast::Sender<ConfigEvent>, result: &ReloadResult) {
    if result.success {
        if let Some(plan) = result.plan.as_ref() {
            if plan.requires_process_restart() {
                let _ = event_tx.send(ConfigEvent::RestartRequired(plan.restart.clone()));
            }
        }
        let _ = event_tx.send(ConfigEvent::Reloaded(result.clone()));
    } else {
        let _ = event_tx.send(ConfigEvent::ReloadFailed(result.clone()));
    }
}

/// Re-read the config file. On success the last-good tree is swapped and the
/// change plan computed against the previous one; on failure the previous
/// tree stays authoritative.
pub fn perform_reload(last_good: &Mutex<Value>, config_path: &Path) -> ReloadResult {
    let snapshot = crate::config::read_config_snapshot_at(config_path.to_path_buf());
    match (snapshot.valid, snapshot.raw, snapshot.config) {
        (true, Some(raw), Some(config)) => {
            let plan = {
                let mut guard = last_good.lock();
                let plan = diff_config(&guard, &raw);
                *guard = raw;
                plan
            };
            info!(
                target: "config",
                hot = plan.hot.len(),
                restart = plan.restart.len(),
                noop = plan.noop_paths.len(),
                "config reloaded"
            );
            ReloadResult {
                success: true,
                issues: Vec::new(),
                config: Some(config),
                plan: Some(plan),
            }
        }
        (_, _, _) => {
            warn!(
                target: "config",
                issues = ?snapshot.issues,
                "config reload failed, keeping last known good"
            );
            ReloadResult {
                success: false,
                issues: snapshot.issues,
                config: None,
                plan: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_mode() {
        assert_eq!(ReloadMode::parse_mode("hot"), ReloadMode::Hot);
        assert_eq!(ReloadMode::parse_mode("off"), ReloadMode::Off);
        assert_eq!(ReloadMode::parse_mode("anything"), ReloadMode::Hot);
    }

    #[test]
    fn test_perform_reload_success_updates_last_good() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("portcullis.json5");
        std::fs::write(&path, "{ gateway: { port: 5555 } }").unwrap();

        let last_good = Mutex::new(json!({}));
        let result = perform_reload(&last_good, &path);
        assert!(result.success);
        assert_eq!(result.config.unwrap().gateway.port, 5555);
        let plan = result.plan.unwrap();
        assert!(plan
            .restart
            .contains(&crate::config::reload::RestartReason::Port));
        assert_eq!(last_good.lock()["gateway"]["port"], 5555);
    }

    #[test]
    fn test_perform_reload_invalid_keeps_last_good() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("portcullis.json5");
        std::fs::write(&path, "{ broken json5").unwrap();

        let previous = json!({"gateway": {"port": 4000}});
        let last_good = Mutex::new(previous.clone());
        let result = perform_reload(&last_good, &path);
        assert!(!result.success);
        assert!(!result.issues.is_empty());
        assert_eq!(*last_good.lock(), previous);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_watcher_emits_reloaded_on_file_change() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("portcullis.json5");
        std::fs::write(&path, "{ gateway: { port: 4000 } }").unwrap();

        let raw = crate::config::load_raw_at(&path).unwrap();
        let mut watcher_config = GatewayConfig::from_value(&raw).unwrap();
        watcher_config.gateway.reload.debounce_ms = 50;
        let watcher = ConfigWatcher::from_config(&watcher_config, raw);
        let mut events = watcher.subscribe();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        watcher.start(path.clone(), shutdown_rx);
        tokio::time::sleep(Duration::from_millis(200)).await;

        std::fs::write(&path, "{ gateway: { port: 4000 }, hooks: { x: 1 } }").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("watcher should emit within 5s")
            .unwrap();
        match event {
            ConfigEvent::Reloaded(result) => {
                let plan = result.plan.unwrap();
                assert!(plan
                    .hot
                    .contains(&crate::config::reload::HotReloadReason::Hooks));
            }
            other => panic!("expected Reloaded, got {other:?}"),
        }
        let _ = shutdown_tx.send(true);
    }

    #[test]
    fn test_reload_now_bypasses_debounce() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("portcullis.json5");
        std::fs::write(&path, "{}").unwrap();

        let watcher = ConfigWatcher::from_config(&GatewayConfig::default(), json!({}));
        let result = watcher.reload_now(&path);
        assert!(result.success);
        assert!(result.plan.unwrap().is_noop());
    }
}
