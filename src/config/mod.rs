//! Configuration loading.
//!
//! The config file is JSON5 with `${ENV_VAR}` substitution inside string
//! values. Path resolution order: `PORTCULLIS_CONFIG_PATH`, then
//! `PORTCULLIS_STATE_DIR/portcullis.json5`, then
//! `~/.portcullis/portcullis.json5`. A missing file behaves like `{}` so a
//! stock install starts with defaults.

pub mod reload;
pub mod schema;
pub mod watcher;

use std::env;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

pub use schema::GatewayConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {message}")]
    Read { path: String, message: String },

    #[error("failed to parse JSON5 at {path}: {message}")]
    Parse { path: String, message: String },

    #[error("missing environment variable: {var}")]
    MissingEnvVar { var: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

static RE_ENV_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var regex"));

/// Resolve the config file path.
pub fn get_config_path() -> PathBuf {
    if let Ok(path) = env::var("PORTCULLIS_CONFIG_PATH") {
        return PathBuf::from(path);
    }
    resolve_state_dir().join("portcullis.json5")
}

/// Resolve the state directory (`PORTCULLIS_STATE_DIR` or `~/.portcullis`).
pub fn resolve_state_dir() -> PathBuf {
    if let Ok(dir) = env::var("PORTCULLIS_STATE_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".portcullis")
}

/// Load and parse the config file as a raw JSON value, with `${ENV}`
/// substitution applied to string values. A missing file yields `{}`.
pub fn load_raw() -> Result<Value, ConfigError> {
    load_raw_at(&get_config_path())
}

/// [`load_raw`] against an explicit path.
pub fn load_raw_at(path: &std::path::Path) -> Result<Value, ConfigError> {
    if !path.exists() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    let display = path.display().to_string();
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: display.clone(),
        message: e.to_string(),
    })?;
    let mut raw: Value = json5::from_str(&text).map_err(|e| ConfigError::Parse {
        path: display,
        message: e.to_string(),
    })?;
    substitute_env(&mut raw)?;
    Ok(raw)
}

/// Load and type the configuration.
pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    let raw = load_raw()?;
    GatewayConfig::from_value(&raw).map_err(|e| ConfigError::Invalid(e.to_string()))
}

/// A point-in-time read of the config file, including validation findings.
/// `config` is `None` only when the file could not be parsed at all.
#[derive(Debug)]
pub struct ConfigSnapshot {
    pub path: PathBuf,
    pub raw: Option<Value>,
    pub config: Option<GatewayConfig>,
    pub valid: bool,
    pub issues: Vec<String>,
}

/// Read the config file without side effects, collecting every problem
/// instead of failing on the first one.
pub fn read_config_snapshot() -> ConfigSnapshot {
    read_config_snapshot_at(get_config_path())
}

/// [`read_config_snapshot`] against an explicit path.
pub fn read_config_snapshot_at(path: PathBuf) -> ConfigSnapshot {
    let raw = match load_raw_at(&path) {
        Ok(raw) => raw,
        Err(e) => {
            return ConfigSnapshot {
                path,
                raw: None,
                config: None,
                valid: false,
                issues: vec![e.to_string()],
            };
        }
    };
    match GatewayConfig::from_value(&raw) {
        Ok(config) => {
            let issues = schema::validate(&config);
            let valid = issues.is_empty();
            ConfigSnapshot {
                path,
                raw: Some(raw),
                config: Some(config),
                valid,
                issues,
            }
        }
        Err(e) => ConfigSnapshot {
            path,
            raw: Some(raw),
            config: None,
            valid: false,
            issues: vec![format!("schema: {e}")],
        },
    }
}

/// Replace `${VAR}` inside every string value. A reference to an unset
/// variable is an error, not a silent empty string.
fn substitute_env(value: &mut Value) -> Result<(), ConfigError> {
    match value {
        Value::String(s) => {
            if !RE_ENV_VAR.is_match(s) {
                return Ok(());
            }
            let mut out = String::with_capacity(s.len());
            let mut last = 0;
            for caps in RE_ENV_VAR.captures_iter(s) {
                let whole = caps.get(0).expect("match");
                let var = &caps[1];
                let resolved = env::var(var).map_err(|_| ConfigError::MissingEnvVar {
                    var: var.to_string(),
                })?;
                out.push_str(&s[last..whole.start()]);
                out.push_str(&resolved);
                last = whole.end();
            }
            out.push_str(&s[last..]);
            *s = out;
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                substitute_env(item)?;
            }
            Ok(())
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                substitute_env(v)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
pub(crate) struct EnvVarGuard {
    key: String,
    previous: Option<String>,
}

#[cfg(test)]
impl EnvVarGuard {
    pub fn set(key: &str, value: &str) -> Self {
        let previous = env::var(key).ok();
        env::set_var(key, value);
        Self {
            key: key.to_string(),
            previous,
        }
    }

    pub fn unset(key: &str) -> Self {
        let previous = env::var(key).ok();
        env::remove_var(key);
        Self {
            key: key.to_string(),
            previous,
        }
    }
}

#[cfg(test)]
impl Drop for EnvVarGuard {
    fn drop(&mut self) {
        match &self.previous {
            Some(v) => env::set_var(&self.key, v),
            None => env::remove_var(&self.key),
        }
    }
}
