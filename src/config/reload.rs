//! Reload-plan classification.
//!
//! When the config file changes, each changed path is classified as either
//! dynamically re-read (no-op), hot-appliable through a targeted callback,
//! or restart-required. Restart-required changes only signal the supervising
//! process; the gateway never restarts itself.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotReloadReason {
    Hooks,
    HeartbeatCadence,
    CronStore,
    BrowserControl,
    ConcurrencyLimits,
    GmailWatcher,
    /// Providers whose configuration changed and need a stop/start cycle.
    RestartProviders(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    BindAddress,
    Port,
    AuthMode,
    Exposure,
    BridgeListener,
}

impl RestartReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartReason::BindAddress => "bind-address",
            RestartReason::Port => "port",
            RestartReason::AuthMode => "auth-mode",
            RestartReason::Exposure => "exposure",
            RestartReason::BridgeListener => "bridge-listener",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    Providers,
    Cron,
    Heartbeat,
    BrowserControl,
    GmailWatcher,
}

#[derive(Debug, Clone, Default)]
pub struct GatewayReloadPlan {
    /// Changed paths whose values are re-read on every use; nothing to do.
    pub noop_paths: Vec<String>,
    pub hot: Vec<HotReloadReason>,
    pub restart: Vec<RestartReason>,
    pub restart_subsystems: Vec<Subsystem>,
}

impl GatewayReloadPlan {
    pub fn requires_process_restart(&self) -> bool {
        !self.restart.is_empty()
    }

    pub fn is_noop(&self) -> bool {
        self.hot.is_empty() && self.restart.is_empty()
    }

    fn push_restart(&mut self, reason: RestartReason) {
        if !self.restart.contains(&reason) {
            self.restart.push(reason);
        }
    }

    fn push_subsystem(&mut self, subsystem: Subsystem) {
        if !self.restart_subsystems.contains(&subsystem) {
            self.restart_subsystems.push(subsystem);
        }
    }
}

/// Collect the dotted paths whose values differ between two config trees.
/// Objects recurse; arrays and scalars are leaves.
pub fn changed_paths(old: &Value, new: &Value) -> Vec<String> {
    let mut paths = Vec::new();
    diff_value("", old, new, &mut paths);
    paths.sort();
    paths
}

fn diff_value(prefix: &str, old: &Value, new: &Value, out: &mut Vec<String>) {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            for key in old_map.keys().chain(new_map.keys()) {
                let child = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                if out.contains(&child) {
                    continue;
                }
                match (old_map.get(key), new_map.get(key)) {
                    (Some(a), Some(b)) => diff_value(&child, a, b, out),
                    (Some(_), None) | (None, Some(_)) => out.push(child),
                    (None, None) => {}
                }
            }
        }
        _ => {
            if old != new {
                out.push(prefix.to_string());
            }
        }
    }
}

/// Diff two raw config trees and classify every change.
pub fn diff_config(old: &Value, new: &Value) -> GatewayReloadPlan {
    let mut plan = GatewayReloadPlan::default();
    let mut changed_providers: Vec<String> = Vec::new();

    for path in changed_paths(old, new) {
        if path == "gateway.bind" {
            plan.push_restart(RestartReason::BindAddress);
        } else if path == "gateway.port" {
            plan.push_restart(RestartReason::Port);
        } else if path == "gateway.auth.mode" {
            plan.push_restart(RestartReason::AuthMode);
        } else if path == "gateway.exposure" {
            plan.push_restart(RestartReason::Exposure);
        } else if path == "bridge.enabled" || path == "bridge.bind" || path == "bridge.port" {
            plan.push_restart(RestartReason::BridgeListener);
        } else if path == "hooks" || path.starts_with("hooks.") {
            if !plan.hot.contains(&HotReloadReason::Hooks) {
                plan.hot.push(HotReloadReason::Hooks);
            }
        } else if path.starts_with("heartbeat") {
            if !plan.hot.contains(&HotReloadReason::HeartbeatCadence) {
                plan.hot.push(HotReloadReason::HeartbeatCadence);
            }
            plan.push_subsystem(Subsystem::Heartbeat);
        } else if path.starts_with("cron") {
            if !plan.hot.contains(&HotReloadReason::CronStore) {
                plan.hot.push(HotReloadReason::CronStore);
            }
            plan.push_subsystem(Subsystem::Cron);
        } else if path.starts_with("browserControl") {
            if !plan.hot.contains(&HotReloadReason::BrowserControl) {
                plan.hot.push(HotReloadReason::BrowserControl);
            }
            plan.push_subsystem(Subsystem::BrowserControl);
        } else if path == "gateway.limits.maxConcurrentRuns" {
            if !plan.hot.contains(&HotReloadReason::ConcurrencyLimits) {
                plan.hot.push(HotReloadReason::ConcurrencyLimits);
            }
        } else if path.starts_with("gmailWatcher") {
            if !plan.hot.contains(&HotReloadReason::GmailWatcher) {
                plan.hot.push(HotReloadReason::GmailWatcher);
            }
            plan.push_subsystem(Subsystem::GmailWatcher);
        } else if let Some(rest) = path.strip_prefix("providers.") {
            let id = rest.split('.').next().unwrap_or(rest).to_string();
            if !changed_providers.contains(&id) {
                changed_providers.push(id);
            }
            plan.push_subsystem(Subsystem::Providers);
        } else {
            // Auth credentials, limits, dedupe/run windows and the like are
            // read from the live config on each use.
            plan.noop_paths.push(path);
        }
    }

    if !changed_providers.is_empty() {
        changed_providers.sort();
        plan.hot
            .push(HotReloadReason::RestartProviders(changed_providers));
    }

    plan
}
