//! Health snapshot cache with coalesced refresh.
//!
//! The snapshot payload is opaque to the gateway; it is cached together with
//! a refresh timestamp and broadcast with a monotonic version (tracked in
//! [`super::presence::StateVersionTracker`]). Exactly one refresh probe may
//! be in flight at a time: concurrent refresh requests attach to the running
//! probe instead of issuing their own.

use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::oneshot;

/// A cached snapshot is considered fresh for this long.
pub const HEALTH_CACHE_TTL_SECS: u64 = 30;

struct CachedHealth {
    payload: Value,
    refreshed_at: Instant,
}

struct Inner {
    snapshot: Option<CachedHealth>,
    /// `Some` while a probe is in flight; queued senders receive the result.
    waiters: Option<Vec<oneshot::Sender<Value>>>,
}

pub struct HealthState {
    inner: Mutex<Inner>,
    ttl: Duration,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                snapshot: None,
                waiters: None,
            }),
            ttl: Duration::from_secs(HEALTH_CACHE_TTL_SECS),
        }
    }

    /// The cached payload, if any, regardless of freshness.
    pub fn cached(&self) -> Option<Value> {
        self.inner.lock().snapshot.as_ref().map(|s| s.payload.clone())
    }

    /// The cached payload if it is still within the TTL.
    pub fn fresh(&self) -> Option<Value> {
        let inner = self.inner.lock();
        inner
            .snapshot
            .as_ref()
            .filter(|s| s.refreshed_at.elapsed() < self.ttl)
            .map(|s| s.payload.clone())
    }

    /// Refresh the snapshot via `probe`, coalescing concurrent callers onto
    /// one in-flight probe. Returns the refreshed payload.
    pub async fn refresh<F, Fut>(&self, probe: F) -> Value
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Value>,
    {
        let rx = {
            let mut inner = self.inner.lock();
            match inner.waiters.as_mut() {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                None => {
                    inner.waiters = Some(Vec::new());
                    None
                }
            }
        };

        if let Some(rx) = rx {
            return match rx.await {
                Ok(payload) => payload,
                // The probing task was dropped; fall back to whatever is cached.
                Err(_) => self.cached().unwrap_or(Value::Null),
            };
        }

        let payload = probe().await;

        let waiters = {
            let mut inner = self.inner.lock();
            inner.snapshot = Some(CachedHealth {
                payload: payload.clone(),
                refreshed_at: Instant::now(),
            });
            inner.waiters.take().unwrap_or_default()
        };
        for tx in waiters {
            let _ = tx.send(payload.clone());
        }
        payload
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

/// Default health probe: storage writability, process RSS, and uptime.
pub fn gather_health(state_dir: &Path, uptime_ms: u64) -> Value {
    json!({
        "status": "ok",
        "storageWritable": check_storage_writable(state_dir),
        "memoryRssBytes": memory_rss_bytes(),
        "uptimeMs": uptime_ms,
        "version": env!("CARGO_PKG_VERSION"),
    })
}

/// Touch + remove a temp file to verify the state directory is writable.
pub fn check_storage_writable(state_dir: &Path) -> bool {
    let probe = state_dir.join(".health_probe");
    match std::fs::File::create(&probe) {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

/// Resident set size of this process in bytes.
#[cfg(target_os = "linux")]
pub fn memory_rss_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
pub fn memory_rss_bytes() -> Option<u64> {
    None
}
