//! Configuration types mapping to the TOML schema.
//!
//! ```toml
//! [client]
//! client_id = "my-native-app"
//! authorize_endpoint = "https://auth.example.com/oauth/authorize"
//! scope = "openid profile"
//!
//! [client.extra_params]
//! prompt = "consent"
//!
//! [loopback]
//! port = 0                 # 0 = ephemeral
//! fallback_ports = [8400, 8401]
//! callback_path = "/callback"
//!
//! [scheme]
//! app_id = "latchkey"
//! scheme = "latchkey"
//! callback_path = "callback"
//!
//! [flow]
//! backend = "loopback"     # or "scheme"
//! timeout_secs = 300       # 1 ..= 86400
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::{ConfigError, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g., project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct LatchkeyConfig {
    pub client: Option<ClientConfig>,
    pub loopback: Option<LoopbackSection>,
    pub scheme: Option<SchemeSection>,
    pub flow: Option<FlowSection>,
}

impl LatchkeyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Merge another config on top of this one (other takes priority).
    pub fn merge(&mut self, other: LatchkeyConfig) {
        match (&mut self.client, other.client) {
            (Some(base), Some(layer)) => base.merge(layer),
            (base @ None, layer) => *base = layer,
            (Some(_), None) => {}
        }
        if other.loopback.is_some() {
            self.loopback = other.loopback;
        }
        if other.scheme.is_some() {
            self.scheme = other.scheme;
        }
        if other.flow.is_some() {
            self.flow = other.flow;
        }
    }

    /// Effective loopback settings.
    pub fn loopback(&self) -> LoopbackSection {
        self.loopback.clone().unwrap_or_default()
    }

    /// Effective scheme settings.
    pub fn scheme(&self) -> SchemeSection {
        self.scheme.clone().unwrap_or_default()
    }

    /// Effective flow settings.
    pub fn flow(&self) -> FlowSection {
        self.flow.clone().unwrap_or_default()
    }

    /// Client settings, failing if the required fields are absent.
    pub fn require_client(&self) -> Result<ClientConfig> {
        let client = self.client.clone().unwrap_or_default();
        if client.client_id.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::MissingField {
                field: "client_id".to_string(),
                context: "[client]".to_string(),
            });
        }
        if client.authorize_endpoint.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::MissingField {
                field: "authorize_endpoint".to_string(),
                context: "[client]".to_string(),
            });
        }
        Ok(client)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

/// OAuth client settings for the authorize request.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub client_id: Option<String>,
    pub authorize_endpoint: Option<String>,
    pub scope: Option<String>,
    /// Extra authorize parameters, sent in key order.
    pub extra_params: BTreeMap<String, String>,
}

impl ClientConfig {
    fn merge(&mut self, other: ClientConfig) {
        if other.client_id.is_some() {
            self.client_id = other.client_id;
        }
        if other.authorize_endpoint.is_some() {
            self.authorize_endpoint = other.authorize_endpoint;
        }
        if other.scope.is_some() {
            self.scope = other.scope;
        }
        self.extra_params.extend(other.extra_params);
    }
}

/// Loopback listener settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoopbackSection {
    /// Preferred port. `0` lets the OS choose.
    pub port: u16,
    /// Ports to try, in order, when `port` is taken.
    pub fallback_ports: Vec<u16>,
    pub callback_path: String,
}

impl Default for LoopbackSection {
    fn default() -> Self {
        Self {
            port: 0,
            fallback_ports: Vec::new(),
            callback_path: "/callback".to_string(),
        }
    }
}

/// Custom URI scheme settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SchemeSection {
    /// Names the handler entry, instance lock, and relay endpoint.
    pub app_id: String,
    pub scheme: String,
    pub callback_path: String,
    /// Directory for the instance lock and relay socket.
    /// Default: a per-user `latchkey` dir under `$XDG_RUNTIME_DIR` or the
    /// user cache dir.
    pub runtime_dir: Option<PathBuf>,
    /// Write the desktop entry here instead of `$XDG_DATA_HOME/applications`,
    /// without making it the default handler. Ignored on Windows and macOS.
    pub applications_dir: Option<PathBuf>,
}

impl Default for SchemeSection {
    fn default() -> Self {
        Self {
            app_id: "latchkey".to_string(),
            scheme: "latchkey".to_string(),
            callback_path: "callback".to_string(),
            runtime_dir: None,
            applications_dir: None,
        }
    }
}

/// Longest accepted `timeout_secs`: one day.
pub const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Flow settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FlowSection {
    pub backend: BackendKind,
    /// How long to wait for the redirect.
    pub timeout_secs: u64,
}

impl Default for FlowSection {
    fn default() -> Self {
        Self {
            backend: BackendKind::Loopback,
            timeout_secs: 300,
        }
    }
}

impl FlowSection {
    /// `timeout_secs` as a duration, rejecting zero and anything over
    /// [`MAX_TIMEOUT_SECS`].
    pub fn timeout(&self) -> Result<Duration> {
        if !(1..=MAX_TIMEOUT_SECS).contains(&self.timeout_secs) {
            return Err(ConfigError::Invalid {
                field: "timeout_secs".to_string(),
                message: format!(
                    "{} is out of range (1..={} seconds)",
                    self.timeout_secs, MAX_TIMEOUT_SECS
                ),
            });
        }
        Ok(Duration::from_secs(self.timeout_secs))
    }
}

/// Which capture backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Loopback,
    Scheme,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Loopback => f.write_str("loopback"),
            BackendKind::Scheme => f.write_str("scheme"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "loopback" => Ok(BackendKind::Loopback),
            "scheme" | "custom-scheme" => Ok(BackendKind::Scheme),
            _ => Err(ConfigError::Invalid {
                field: "backend".to_string(),
                message: format!("unknown backend '{}'. Valid: loopback, scheme", s),
            }),
        }
    }
}
