//! Typed configuration schema with production defaults.
//!
//! The on-disk file is JSON5; it deserializes into [`GatewayConfig`] with
//! every field defaulted so a missing section behaves like a stock install.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    None,
    #[default]
    Token,
    Password,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Exposure {
    #[default]
    Loopback,
    Lan,
    Tailscale,
    Public,
}

impl Exposure {
    /// Exposure modes that make the gateway reachable beyond the local
    /// network require password-class auth, validated once at startup.
    pub fn requires_password_auth(&self) -> bool {
        matches!(self, Exposure::Tailscale | Exposure::Public)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSection {
    pub mode: AuthMode,
    pub token: Option<String>,
    pub password: Option<String>,
    pub allow_trusted_network: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReloadSection {
    pub mode: String,
    pub debounce_ms: u64,
}

impl Default for ReloadSection {
    fn default() -> Self {
        Self {
            mode: "hot".to_string(),
            debounce_ms: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimitsSection {
    pub max_payload_bytes: usize,
    pub max_buffered_bytes: usize,
    pub tick_interval_ms: u64,
    pub handshake_timeout_ms: u64,
    pub max_concurrent_runs: usize,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_payload_bytes: crate::server::ws::frames::MAX_PAYLOAD_BYTES,
            max_buffered_bytes: crate::server::ws::frames::MAX_BUFFERED_BYTES,
            tick_interval_ms: crate::server::ws::frames::TICK_INTERVAL_MS,
            handshake_timeout_ms: crate::server::ws::frames::HANDSHAKE_TIMEOUT_MS,
            max_concurrent_runs: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DedupeSection {
    pub ttl_ms: u64,
    pub max_entries: usize,
}

impl Default for DedupeSection {
    fn default() -> Self {
        Self {
            ttl_ms: crate::state::dedupe::DEFAULT_DEDUPE_TTL_MS,
            max_entries: crate::state::dedupe::DEFAULT_DEDUPE_MAX_ENTRIES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunsSection {
    pub deadline_ms: u64,
    pub recently_aborted_ms: u64,
}

impl Default for RunsSection {
    fn default() -> Self {
        Self {
            deadline_ms: crate::state::runs::DEFAULT_RUN_DEADLINE_MS,
            recently_aborted_ms: crate::state::runs::DEFAULT_ABORTED_RETENTION_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySection {
    pub bind: String,
    pub port: u16,
    pub auth: AuthSection,
    pub exposure: Exposure,
    pub reload: ReloadSection,
    pub limits: LimitsSection,
    pub dedupe: DedupeSection,
    pub runs: RunsSection,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 4180,
            auth: AuthSection::default(),
            exposure: Exposure::default(),
            reload: ReloadSection::default(),
            limits: LimitsSection::default(),
            dedupe: DedupeSection::default(),
            runs: RunsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PairedNode {
    pub node_id: String,
    /// Hex SHA-256 of the node's pairing token. The token itself never
    /// appears in the config file.
    pub token_sha256: String,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeSection {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
    pub beacon_interval_ms: u64,
    pub paired_nodes: Vec<PairedNode>,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "127.0.0.1".to_string(),
            port: 4181,
            beacon_interval_ms: 20_000,
            paired_nodes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatSection {
    pub interval_ms: u64,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self { interval_ms: 60_000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct CronSection {
    pub store_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct BrowserControlSection {
    pub enabled: bool,
}

/// Root configuration. Sections the gateway only classifies for reload
/// purposes (hooks, providers, gmail watcher) stay schemaless.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    pub gateway: GatewaySection,
    pub bridge: BridgeSection,
    pub heartbeat: HeartbeatSection,
    pub cron: CronSection,
    pub browser_control: BrowserControlSection,
    pub hooks: Value,
    pub providers: Value,
    pub gmail_watcher: Value,
}

impl GatewayConfig {
    pub fn from_value(raw: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(raw.clone())
    }

    pub fn primary_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        let ip = IpAddr::from_str(&self.gateway.bind)?;
        Ok(SocketAddr::new(ip, self.gateway.port))
    }

    pub fn bridge_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        let ip = IpAddr::from_str(&self.bridge.bind)?;
        Ok(SocketAddr::new(ip, self.bridge.port))
    }
}

/// Validate a parsed config. Returned strings are human-readable issues;
/// an empty list means the config is usable.
pub fn validate(config: &GatewayConfig) -> Vec<String> {
    let mut issues = Vec::new();

    if IpAddr::from_str(&config.gateway.bind).is_err() {
        issues.push(format!(
            "gateway.bind is not a valid IP address: {:?}",
            config.gateway.bind
        ));
    }
    if config.bridge.enabled && IpAddr::from_str(&config.bridge.bind).is_err() {
        issues.push(format!(
            "bridge.bind is not a valid IP address: {:?}",
            config.bridge.bind
        ));
    }
    if !matches!(config.gateway.reload.mode.as_str(), "hot" | "off") {
        issues.push(format!(
            "gateway.reload.mode must be \"hot\" or \"off\", got {:?}",
            config.gateway.reload.mode
        ));
    }
    if config.gateway.limits.max_payload_bytes == 0 {
        issues.push("gateway.limits.maxPayloadBytes must be positive".to_string());
    }
    if config.gateway.limits.max_buffered_bytes == 0 {
        issues.push("gateway.limits.maxBufferedBytes must be positive".to_string());
    }
    for node in &config.bridge.paired_nodes {
        if node.node_id.is_empty() {
            issues.push("bridge.pairedNodes entry missing nodeId".to_string());
        }
        let hash = &node.token_sha256;
        if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            issues.push(format!(
                "bridge.pairedNodes[{}].tokenSha256 must be 64 hex chars",
                node.node_id
            ));
        }
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_from_empty_object() {
        let config = GatewayConfig::from_value(&json!({})).unwrap();
        assert_eq!(config.gateway.bind, "127.0.0.1");
        assert_eq!(config.gateway.port, 4180);
        assert_eq!(config.gateway.auth.mode, AuthMode::Token);
        assert_eq!(config.gateway.exposure, Exposure::Loopback);
        assert_eq!(config.gateway.reload.mode, "hot");
        assert!(!config.bridge.enabled);
        assert_eq!(config.bridge.port, 4181);
        assert!(validate(&config).is_empty());
    }

    #[test]
    fn test_camel_case_fields_parse() {
        let config = GatewayConfig::from_value(&json!({
            "gateway": {
                "bind": "0.0.0.0",
                "port": 9000,
                "auth": {"mode": "password", "password": "pw", "allowTrustedNetwork": true},
                "exposure": "lan",
                "limits": {"maxBufferedBytes": 1024},
            },
            "bridge": {"enabled": true, "beaconIntervalMs": 5000},
        }))
        .unwrap();
        assert_eq!(config.gateway.bind, "0.0.0.0");
        assert_eq!(config.gateway.auth.mode, AuthMode::Password);
        assert!(config.gateway.auth.allow_trusted_network);
        assert_eq!(config.gateway.exposure, Exposure::Lan);
        assert_eq!(config.gateway.limits.max_buffered_bytes, 1024);
        // Unspecified limits keep their defaults
        assert_eq!(
            config.gateway.limits.tick_interval_ms,
            crate::server::ws::frames::TICK_INTERVAL_MS
        );
        assert_eq!(config.bridge.beacon_interval_ms, 5000);
    }

    #[test]
    fn test_validate_flags_bad_bind() {
        let config = GatewayConfig::from_value(&json!({
            "gateway": {"bind": "not-an-ip"}
        }))
        .unwrap();
        let issues = validate(&config);
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("gateway.bind"));
    }

    #[test]
    fn test_validate_flags_bad_token_hash() {
        let config = GatewayConfig::from_value(&json!({
            "bridge": {
                "enabled": true,
                "pairedNodes": [{"nodeId": "phone", "tokenSha256": "abc"}]
            }
        }))
        .unwrap();
        let issues = validate(&config);
        assert!(issues.iter().any(|i| i.contains("tokenSha256")));
    }

    #[test]
    fn test_validate_flags_bad_reload_mode() {
        let config = GatewayConfig::from_value(&json!({
            "gateway": {"reload": {"mode": "hybrid-ish"}}
        }))
        .unwrap();
        assert!(validate(&config).iter().any(|i| i.contains("reload.mode")));
    }

    #[test]
    fn test_exposure_password_requirement() {
        assert!(!Exposure::Loopback.requires_password_auth());
        assert!(!Exposure::Lan.requires_password_auth());
        assert!(Exposure::Tailscale.requires_password_auth());
        assert!(Exposure::Public.requires_password_auth());
    }

    #[test]
    fn test_addrs() {
        let config = GatewayConfig::default();
        assert_eq!(config.primary_addr().unwrap().port(), 4180);
        assert_eq!(config.bridge_addr().unwrap().port(), 4181);
    }
}
