//! Client options.
//!
//! Options can be built in code or loaded from a YAML file, with environment
//! variables applied on top.

use anyhow::Result;
use loom_wire::{Role, DEFAULT_MAX_CHUNK, DEFAULT_MAX_KEY};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

use crate::SessionError;

/// Which transport binding carries the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// One bidirectional QUIC stream
    #[default]
    Quic,
    /// A POST request body/response body pair over HTTP/3
    #[serde(alias = "http3")]
    H3,
}

impl FromStr for TransportKind {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "quic" => Ok(TransportKind::Quic),
            "h3" | "http3" => Ok(TransportKind::H3),
            other => Err(SessionError::Config(format!("unknown transport {:?}", other))),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Quic => f.write_str("quic"),
            TransportKind::H3 => f.write_str("h3"),
        }
    }
}

/// TLS policy for both transports
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    /// SNI / verification name; defaults to the host part of the address
    pub server_name: Option<String>,
    /// Accept any server certificate (development only)
    pub insecure_skip_verify: bool,
    /// PEM bundle of trusted roots; webpki roots when unset
    pub ca_file: Option<PathBuf>,
    /// Client certificate chain for mTLS
    pub cert_file: Option<PathBuf>,
    /// Client private key for mTLS
    pub key_file: Option<PathBuf>,
}

/// Reconnect supervisor policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Whether `recover` may re-establish the connection at all
    pub enabled: bool,
    /// Pause between failed attempts
    #[serde(with = "duration_str")]
    pub delay: Duration,
    /// Attempts before giving up; 0 retries forever
    pub max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            delay: Duration::from_secs(1),
            max_retries: 0,
        }
    }
}

impl ReconnectPolicy {
    /// Policy that never reconnects
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay between attempts; a zero delay falls back to one second
    pub fn effective_delay(&self) -> Duration {
        if self.delay.is_zero() {
            Duration::from_secs(1)
        } else {
            self.delay
        }
    }
}

/// Bounds on peer-declared lengths
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Longest accepted message key
    pub max_key: usize,
    /// Longest accepted chunk payload
    pub max_chunk: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_key: DEFAULT_MAX_KEY,
            max_chunk: DEFAULT_MAX_CHUNK,
        }
    }
}

/// Everything needed to (re-)establish a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientOptions {
    /// Broker address, `host:port`
    pub addr: String,
    /// Transport binding
    pub transport: TransportKind,
    /// TLS policy
    pub tls: TlsOptions,
    /// Client name sent in the handshake
    pub name: String,
    /// Room sent in the handshake
    pub room: String,
    /// Token sent in the handshake
    pub token: String,
    /// Reconnect supervisor policy
    pub reconnect: ReconnectPolicy,
    /// Decoder bounds
    pub limits: Limits,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            addr: "localhost:4433".to_string(),
            transport: TransportKind::default(),
            tls: TlsOptions::default(),
            name: String::new(),
            room: String::new(),
            token: String::new(),
            reconnect: ReconnectPolicy::default(),
            limits: Limits::default(),
        }
    }
}

impl ClientOptions {
    /// Options for `addr` with everything else defaulted
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Self::default()
        }
    }

    /// Fill in the name and room a session of `role` uses when none is set
    pub fn with_role_defaults(mut self, role: Role) -> Self {
        if self.name.is_empty() {
            self.name = match role {
                Role::Producer => "producer",
                Role::Consumer => "consumer",
            }
            .to_string();
        }
        if self.room.is_empty() {
            self.room = "default".to_string();
        }
        self
    }

    /// Reject options no transport can use
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.addr.is_empty() {
            return Err(SessionError::Config("address is empty".to_string()));
        }
        if self.limits.max_key == 0 || self.limits.max_chunk == 0 {
            return Err(SessionError::Config("limits must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Host part of `addr`, used as the default TLS server name
    pub fn host(&self) -> &str {
        let addr = self.addr.as_str();
        if let Some(rest) = addr.strip_prefix('[') {
            return rest.split(']').next().unwrap_or(rest);
        }
        match addr.rsplit_once(':') {
            Some((host, _port)) => host,
            None => addr,
        }
    }

    /// Server name presented during the TLS handshake
    pub fn server_name(&self) -> String {
        match &self.tls.server_name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => self.host().to_string(),
        }
    }

    /// Load options from a YAML file and environment variables.
    ///
    /// A missing or unparsable file falls back to defaults with a warning.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut options = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_yaml::from_str::<ClientOptions>(&content) {
                Ok(options) => {
                    info!("Loaded configuration from {:?}", path.as_ref());
                    options
                }
                Err(e) => {
                    warn!(
                        "Failed to parse config file {:?} ({}), using defaults",
                        path.as_ref(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path.as_ref());
                Self::default()
            }
        };

        options.apply_environment_overrides()?;
        Ok(options)
    }

    /// Apply `LOOM_*` environment variable overrides
    pub fn apply_environment_overrides(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("LOOM_ADDR") {
            info!("Address overridden by environment: {}", addr);
            self.addr = addr;
        }
        if let Ok(transport) = std::env::var("LOOM_TRANSPORT") {
            self.transport = transport.parse()?;
            info!("Transport overridden by environment: {}", self.transport);
        }
        if let Ok(name) = std::env::var("LOOM_NAME") {
            self.name = name;
        }
        if let Ok(room) = std::env::var("LOOM_ROOM") {
            self.room = room;
        }
        if let Ok(token) = std::env::var("LOOM_TOKEN") {
            self.token = token;
        }
        if let Ok(server_name) = std::env::var("LOOM_TLS_SERVER_NAME") {
            self.tls.server_name = Some(server_name);
        }
        if let Ok(insecure) = std::env::var("LOOM_TLS_INSECURE") {
            self.tls.insecure_skip_verify = matches!(insecure.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        Ok(())
    }
}

/// Durations as humantime strings ("1s", "250ms")
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
