//! Connection authentication.
//!
//! Resolves the configured auth mode against the credentials presented in a
//! connect request. Failures surface to the wire as a bare "unauthorized";
//! the specific reason goes only to the server log so a caller cannot probe
//! which credential was wrong.

use std::net::IpAddr;

use thiserror::Error;
use tracing::warn;

use crate::config::schema::{AuthMode, AuthSection, GatewayConfig};
use crate::server::ws::frames::AuthPayload;

pub const TOKEN_ENV_VAR: &str = "PORTCULLIS_GATEWAY_TOKEN";
pub const PASSWORD_ENV_VAR: &str = "PORTCULLIS_GATEWAY_PASSWORD";

/// Auth settings with env fallbacks applied, ready to check against.
#[derive(Debug, Clone)]
pub struct ResolvedAuth {
    pub mode: AuthMode,
    pub token: Option<String>,
    pub password: Option<String>,
    pub allow_trusted_network: bool,
}

impl ResolvedAuth {
    pub fn from_section(section: &AuthSection) -> Self {
        let token = section
            .token
            .clone()
            .or_else(|| std::env::var(TOKEN_ENV_VAR).ok())
            .filter(|s| !s.is_empty());
        let password = section
            .password
            .clone()
            .or_else(|| std::env::var(PASSWORD_ENV_VAR).ok())
            .filter(|s| !s.is_empty());
        Self {
            mode: section.mode,
            token,
            password,
            allow_trusted_network: section.allow_trusted_network,
        }
    }
}

/// Why a connection was denied. Never sent to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    MissingToken,
    TokenMismatch,
    MissingPassword,
    PasswordMismatch,
    NoCredentialConfigured,
}

impl AuthFailure {
    pub fn log_reason(&self) -> &'static str {
        match self {
            AuthFailure::MissingToken => "token required but not presented",
            AuthFailure::TokenMismatch => "token mismatch",
            AuthFailure::MissingPassword => "password required but not presented",
            AuthFailure::PasswordMismatch => "password mismatch",
            AuthFailure::NoCredentialConfigured => "no credential configured for auth mode",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Allow {
        /// How the connection was admitted, for the connect log line.
        method: &'static str,
    },
    Deny(AuthFailure),
}

/// Decide whether a connection may proceed past the handshake.
pub fn resolve(auth: &ResolvedAuth, presented: Option<&AuthPayload>, peer: Option<IpAddr>) -> AuthDecision {
    match auth.mode {
        AuthMode::None => AuthDecision::Allow { method: "open" },
        AuthMode::Token => {
            let expected = match auth.token.as_deref() {
                Some(t) => t,
                None => return deny(auth, peer, AuthFailure::NoCredentialConfigured),
            };
            match presented.and_then(|p| p.token.as_deref()) {
                Some(token) if timing_safe_eq(token.as_bytes(), expected.as_bytes()) => {
                    AuthDecision::Allow { method: "token" }
                }
                Some(_) => deny(auth, peer, AuthFailure::TokenMismatch),
                None => deny(auth, peer, AuthFailure::MissingToken),
            }
        }
        AuthMode::Password => {
            let expected = match auth.password.as_deref() {
                Some(p) => p,
                None => return deny(auth, peer, AuthFailure::NoCredentialConfigured),
            };
            match presented.and_then(|p| p.password.as_deref()) {
                Some(password) if timing_safe_eq(password.as_bytes(), expected.as_bytes()) => {
                    AuthDecision::Allow { method: "password" }
                }
                Some(_) => deny(auth, peer, AuthFailure::PasswordMismatch),
                None => deny(auth, peer, AuthFailure::MissingPassword),
            }
        }
    }
}

/// Loopback peers may be admitted without credentials when the trusted
/// network allowance is on. Checked only after the credential path failed.
fn deny(auth: &ResolvedAuth, peer: Option<IpAddr>, failure: AuthFailure) -> AuthDecision {
    if auth.allow_trusted_network {
        if let Some(ip) = peer {
            if is_loopback_addr(ip) {
                return AuthDecision::Allow {
                    method: "trusted-network",
                };
            }
        }
    }
    AuthDecision::Deny(failure)
}

/// Constant-time byte comparison. Length differences short-circuit, which is
/// acceptable: token length is not a secret.
pub fn timing_safe_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Loopback detection, including IPv4-mapped IPv6 loopback (::ffff:127.x).
pub fn is_loopback_addr(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => {
            if v6.is_loopback() {
                return true;
            }
            match v6.to_ipv4_mapped() {
                Some(v4) => v4.is_loopback(),
                None => false,
            }
        }
    }
}

/// Startup-time invariants. These are process-fatal, not per-connection
/// checks: a misconfigured exposure must never come up at all.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("refusing to bind {bind} with auth mode \"none\"; non-loopback binds require token or password auth")]
    OpenBindNotLoopback { bind: String },

    #[error("exposure mode {exposure:?} requires password auth, but none is configured")]
    ExposureRequiresPassword { exposure: String },

    #[error("auth mode {mode:?} selected but no credential is configured (set it in the config or via {var})")]
    MissingCredential { mode: String, var: &'static str },

    #[error("invalid bind address {bind}: {message}")]
    InvalidBind { bind: String, message: String },
}

pub fn validate_startup(config: &GatewayConfig) -> Result<(), StartupError> {
    let bind_ip: IpAddr = config
        .gateway
        .bind
        .parse()
        .map_err(|e: std::net::AddrParseError| StartupError::InvalidBind {
            bind: config.gateway.bind.clone(),
            message: e.to_string(),
        })?;

    let auth = ResolvedAuth::from_section(&config.gateway.auth);

    if auth.mode == AuthMode::None && !is_loopback_addr(bind_ip) {
        return Err(StartupError::OpenBindNotLoopback {
            bind: config.gateway.bind.clone(),
        });
    }

    if config.gateway.exposure.requires_password_auth()
        && !(auth.mode == AuthMode::Password && auth.password.is_some())
    {
        return Err(StartupError::ExposureRequiresPassword {
            exposure: format!("{:?}", config.gateway.exposure).to_lowercase(),
        });
    }

    match auth.mode {
        AuthMode::Token if auth.token.is_none() => {
            return Err(StartupError::MissingCredential {
                mode: "token".into(),
                var: TOKEN_ENV_VAR,
            });
        }
        AuthMode::Password if auth.password.is_none() => {
            return Err(StartupError::MissingCredential {
                mode: "password".into(),
                var: PASSWORD_ENV_VAR,
            });
        }
        _ => {}
    }

    Ok(())
}

/// Log a denial with full detail. The caller sends only "unauthorized".
pub fn log_denied(conn_id: &str, peer: Option<IpAddr>, failure: AuthFailure) {
    warn!(
        target: "auth",
        conn_id = %conn_id,
        peer = ?peer,
        reason = failure.log_reason(),
        "connection denied"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolved(mode: AuthMode) -> ResolvedAuth {
        ResolvedAuth {
            mode,
            token: Some("secret-token".into()),
            password: Some("secret-password".into()),
            allow_trusted_network: false,
        }
    }

    fn presented(token: Option<&str>, password: Option<&str>) -> AuthPayload {
        AuthPayload {
            token: token.map(String::from),
            password: password.map(String::from),
        }
    }

    #[test]
    fn test_timing_safe_eq() {
        assert!(timing_safe_eq(b"abc", b"abc"));
        assert!(!timing_safe_eq(b"abc", b"abd"));
        assert!(!timing_safe_eq(b"abc", b"abcd"));
        assert!(timing_safe_eq(b"", b""));
    }

    #[test]
    fn test_mode_none_allows() {
        let auth = resolved(AuthMode::None);
        assert_eq!(
            resolve(&auth, None, None),
            AuthDecision::Allow { method: "open" }
        );
    }

    #[test]
    fn test_token_match_and_mismatch() {
        let auth = resolved(AuthMode::Token);
        assert!(matches!(
            resolve(&auth, Some(&presented(Some("secret-token"), None)), None),
            AuthDecision::Allow { method: "token" }
        ));
        assert_eq!(
            resolve(&auth, Some(&presented(Some("wrong"), None)), None),
            AuthDecision::Deny(AuthFailure::TokenMismatch)
        );
        assert_eq!(
            resolve(&auth, None, None),
            AuthDecision::Deny(AuthFailure::MissingToken)
        );
    }

    #[test]
    fn test_password_mode() {
        let auth = resolved(AuthMode::Password);
        assert!(matches!(
            resolve(&auth, Some(&presented(None, Some("secret-password"))), None),
            AuthDecision::Allow { method: "password" }
        ));
        assert_eq!(
            resolve(&auth, Some(&presented(None, Some("nope"))), None),
            AuthDecision::Deny(AuthFailure::PasswordMismatch)
        );
    }

    #[test]
    fn test_no_credential_configured_denies() {
        let auth = ResolvedAuth {
            mode: AuthMode::Token,
            token: None,
            password: None,
            allow_trusted_network: false,
        };
        assert_eq!(
            resolve(&auth, Some(&presented(Some("anything"), None)), None),
            AuthDecision::Deny(AuthFailure::NoCredentialConfigured)
        );
    }

    #[test]
    fn test_trusted_network_loopback_only() {
        let mut auth = resolved(AuthMode::Token);
        auth.allow_trusted_network = true;
        let loopback: IpAddr = "127.0.0.1".parse().unwrap();
        let lan: IpAddr = "192.168.1.9".parse().unwrap();
        assert!(matches!(
            resolve(&auth, None, Some(loopback)),
            AuthDecision::Allow {
                method: "trusted-network"
            }
        ));
        assert_eq!(
            resolve(&auth, None, Some(lan)),
            AuthDecision::Deny(AuthFailure::MissingToken)
        );
    }

    #[test]
    fn test_is_loopback_addr_variants() {
        assert!(is_loopback_addr("127.0.0.1".parse().unwrap()));
        assert!(is_loopback_addr("127.1.2.3".parse().unwrap()));
        assert!(is_loopback_addr("::1".parse().unwrap()));
        assert!(is_loopback_addr("::ffff:127.0.0.1".parse().unwrap()));
        assert!(!is_loopback_addr("192.168.0.1".parse().unwrap()));
        assert!(!is_loopback_addr("fe80::1".parse().unwrap()));
    }

    #[test]
    fn test_startup_rejects_open_non_loopback_bind() {
        let config = GatewayConfig::from_value(&json!({
            "gateway": {"bind": "0.0.0.0", "auth": {"mode": "none"}}
        }))
        .unwrap();
        let err = validate_startup(&config).unwrap_err();
        assert!(matches!(err, StartupError::OpenBindNotLoopback { .. }));
    }

    #[test]
    fn test_startup_allows_open_loopback_bind() {
        let config = GatewayConfig::from_value(&json!({
            "gateway": {"bind": "127.0.0.1", "auth": {"mode": "none"}}
        }))
        .unwrap();
        assert!(validate_startup(&config).is_ok());
    }

    #[test]
    fn test_startup_exposure_requires_password() {
        let config = GatewayConfig::from_value(&json!({
            "gateway": {
                "bind": "127.0.0.1",
                "exposure": "public",
                "auth": {"mode": "token", "token": "t"}
            }
        }))
        .unwrap();
        let err = validate_startup(&config).unwrap_err();
        assert!(matches!(err, StartupError::ExposureRequiresPassword { .. }));

        let config = GatewayConfig::from_value(&json!({
            "gateway": {
                "bind": "127.0.0.1",
                "exposure": "public",
                "auth": {"mode": "password", "password": "pw"}
            }
        }))
        .unwrap();
        assert!(validate_startup(&config).is_ok());
    }

    // Both halves touch the same process-global env var, so they run as one
    // sequential test.
    #[test]
    fn test_token_env_fallback_and_missing_credential() {
        let section = AuthSection {
            mode: AuthMode::Token,
            token: None,
            password: None,
            allow_trusted_network: false,
        };

        {
            let _guard = crate::config::EnvVarGuard::set(TOKEN_ENV_VAR, "env-token");
            let auth = ResolvedAuth::from_section(&section);
            assert_eq!(auth.token.as_deref(), Some("env-token"));
        }

        let _guard = crate::config::EnvVarGuard::unset(TOKEN_ENV_VAR);
        let config = GatewayConfig::from_value(&json!({
            "gateway": {"bind": "127.0.0.1", "auth": {"mode": "token"}}
        }))
        .unwrap();
        let err = validate_startup(&config).unwrap_err();
        assert!(matches!(err, StartupError::MissingCredential { .. }));
    }
}
