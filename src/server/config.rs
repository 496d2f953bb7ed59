//! Gateway configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Default request header carrying the caller's session id.
pub const DEFAULT_SESSION_HEADER: &str = "X-Muster-Session-ID";

/// Settings for [`OAuthGateway`](super::gateway::OAuthGateway).
///
/// ```toml
/// base_url = "https://gateway.example.com"
/// session_ttl_secs = 86400
/// protected_paths = ["/mcp"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Public base URL, used to build the protected-resource metadata URL
    pub base_url: String,

    /// Header carrying the caller's session id
    #[serde(default = "default_session_header")]
    pub session_header: String,

    /// Paths mounted behind bearer validation when no dispatcher router is supplied
    #[serde(default = "default_protected_paths")]
    pub protected_paths: Vec<String>,

    /// Idle time after which a session entry is dropped
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,

    /// How often expired session entries are swept
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,

    /// Deadline for one SSO propagation run
    #[serde(default = "default_sso_timeout")]
    pub sso_timeout_secs: u64,

    /// Permit a plain-http `base_url` on a non-loopback host
    #[serde(default)]
    pub allow_insecure_http: bool,
}

fn default_session_header() -> String {
    DEFAULT_SESSION_HEADER.to_string()
}

fn default_protected_paths() -> Vec<String> {
    vec!["/mcp".to_string(), "/sse".to_string(), "/message".to_string()]
}

fn default_session_ttl() -> u64 {
    24 * 60 * 60
}

fn default_cleanup_interval() -> u64 {
    60 * 60
}

fn default_sso_timeout() -> u64 {
    60
}

impl GatewayConfig {
    /// Defaults for everything except the base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            session_header: default_session_header(),
            protected_paths: default_protected_paths(),
            session_ttl_secs: default_session_ttl(),
            cleanup_interval_secs: default_cleanup_interval(),
            sso_timeout_secs: default_sso_timeout(),
            allow_insecure_http: false,
        }
    }

    /// Load from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| Error::Configuration(format!("invalid gateway config: {}", e)))
    }

    /// Session entry TTL.
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    /// Sweep interval.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// SSO propagation deadline.
    pub fn sso_timeout(&self) -> Duration {
        Duration::from_secs(self.sso_timeout_secs)
    }

    /// Protected-resource metadata URL advertised in 401 challenges.
    pub fn resource_metadata_url(&self) -> String {
        format!(
            "{}/.well-known/oauth-protected-resource",
            self.base_url.trim_end_matches('/')
        )
    }

    /// Reject settings the gateway cannot run safely with.
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.base_url)
            .map_err(|e| Error::Configuration(format!("invalid base_url: {}", e)))?;

        match url.scheme() {
            "https" => {},
            "http" if self.allow_insecure_http || is_loopback(&url) => {},
            "http" => {
                return Err(Error::Configuration(format!(
                    "base_url must use https for non-loopback host {}",
                    url.host_str().unwrap_or_default()
                )));
            },
            other => {
                return Err(Error::Configuration(format!(
                    "unsupported base_url scheme: {}",
                    other
                )));
            },
        }

        if self.session_header.trim().is_empty() {
            return Err(Error::Configuration("session_header must not be empty".into()));
        }
        if let Some(path) = self.protected_paths.iter().find(|p| !p.starts_with('/')) {
            return Err(Error::Configuration(format!(
                "protected path must start with '/': {}",
                path
            )));
        }
        if self.session_ttl_secs == 0 {
            return Err(Error::Configuration("session_ttl_secs must be positive".into()));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(Error::Configuration(
                "cleanup_interval_secs must be positive".into(),
            ));
        }
        if self.sso_timeout_secs == 0 {
            return Err(Error::Configuration("sso_timeout_secs must be positive".into()));
        }
        Ok(())
    }
}

fn is_loopback(url: &Url) -> bool {
    matches!(
        url.host_str(),
        Some("localhost") | Some("127.0.0.1") | Some("[::1]")
    )
}
