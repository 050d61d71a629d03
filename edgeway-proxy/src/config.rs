//! Gateway configuration.
//!
//! One statically typed [`GatewayConfig`] is read from TOML. Every section has
//! its own defaults and its own `validate`, and [`GatewayConfig::validate`]
//! runs them in a fixed order.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use edgeway_core::time::serde_secs;
use edgeway_core::{HealthCheckPolicy, NodeSpec, PolicyError};

use crate::logging::LogSettings;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that was read.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML for [`GatewayConfig`].
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path that was parsed.
        path: PathBuf,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },
    /// The health check policy is unusable.
    #[error("invalid [nodes.health_check]: {0}")]
    Policy(#[from] PolicyError),
    /// A field holds an unusable value.
    #[error("invalid [{section}] {field}: {reason}")]
    Invalid {
        /// Section name.
        section: &'static str,
        /// Field name.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl ConfigError {
    fn invalid(section: &'static str, field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            section,
            field,
            reason: reason.into(),
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// HTTP listener.
    pub server: ServerConfig,
    /// The media server whose credentials are validated.
    pub origin: OriginConfig,
    /// Edge fleet and probing.
    pub nodes: NodesConfig,
    /// Signed URL parameters.
    pub access: AccessConfig,
    /// Structured access log.
    pub access_log: AccessLogConfig,
    /// Diagnostic logging.
    pub log: LogSettings,
    /// Administrative control socket.
    pub admin: AdminConfig,
}

impl GatewayConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section in order.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.origin.validate()?;
        self.nodes.validate()?;
        self.access.validate()?;
        self.access_log.validate()?;
        self.admin.validate()?;
        Ok(())
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the gateway listens on.
    pub listen: SocketAddr,
    /// Optional TLS termination.
    pub tls: Option<TlsConfig>,
    /// Time allowed for in-flight connections on shutdown.
    #[serde(with = "serde_secs")]
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8095)),
            tls: None,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(tls) = &self.tls {
            if tls.cert.as_os_str().is_empty() || tls.key.as_os_str().is_empty() {
                return Err(ConfigError::invalid(
                    "server.tls",
                    "cert/key",
                    "both paths are required",
                ));
            }
        }
        Ok(())
    }
}

/// PEM files for TLS termination.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// Certificate chain.
    pub cert: PathBuf,
    /// Private key in PKCS#8, PKCS#1 or SEC1 form.
    pub key: PathBuf,
}

/// Origin media server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OriginConfig {
    /// Base URL, e.g. `http://127.0.0.1:8096`.
    pub host: String,
    /// Endpoint answering 200 for a valid `api_key` and 401 otherwise.
    pub validate_path: String,
    /// Deadline for one credential check.
    #[serde(with = "serde_secs")]
    pub timeout: Duration,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            host: "http://127.0.0.1:8096".to_string(),
            validate_path: "/emby/System/Info".to_string(),
            timeout: Duration::from_secs(5),
        }
    }
}

impl OriginConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        url::Url::parse(&self.host)
            .map_err(|e| ConfigError::invalid("origin", "host", e.to_string()))?;
        if !self.validate_path.starts_with('/') {
            return Err(ConfigError::invalid("origin", "validate_path", "must start with '/'"));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::invalid("origin", "timeout", "must be greater than zero"));
        }
        Ok(())
    }
}

/// Where health probes are sent on each node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProbeTarget {
    /// Administrative port replacing the node's serving port.
    pub port: u16,
    /// Health path.
    pub path: String,
    /// Virtual host sent with every probe.
    pub host_header: String,
}

impl Default for ProbeTarget {
    fn default() -> Self {
        Self {
            port: 80,
            path: "/gtm-health".to_string(),
            host_header: "gtm-health".to_string(),
        }
    }
}

/// Fleet roster and probing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodesConfig {
    /// Probe cadence and hysteresis thresholds.
    pub health_check: HealthCheckPolicy,
    /// Probe destination.
    pub probe: ProbeTarget,
    /// The roster.
    pub list: Vec<NodeSpec>,
}

impl NodesConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.health_check.validate()?;
        if !self.probe.path.starts_with('/') {
            return Err(ConfigError::invalid("nodes.probe", "path", "must start with '/'"));
        }
        for node in &self.list {
            if node.name.is_empty() {
                return Err(ConfigError::invalid("nodes.list", "name", "must not be empty"));
            }
            url::Url::parse(&node.host).map_err(|e| {
                ConfigError::invalid("nodes.list", "host", format!("{}: {e}", node.name))
            })?;
        }
        Ok(())
    }
}

/// Signed URL and session parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// HMAC key for tokens and identity handles.
    pub secret: String,
    /// Lifetime of a minted URL and of each session extension.
    #[serde(with = "serde_secs")]
    pub token_ttl: Duration,
    /// How long an identity handle stays resolvable.
    #[serde(with = "serde_secs")]
    pub handle_ttl: Duration,
    /// Lifetime of a session entry in its cache.
    #[serde(with = "serde_secs")]
    pub session_ttl: Duration,
    /// How long a validated credential skips the origin check.
    #[serde(with = "serde_secs")]
    pub credential_ttl: Duration,
    /// Period of the background cache sweep.
    #[serde(with = "serde_secs")]
    pub sweep_period: Duration,
    /// Request path prefix handled by the mint endpoint.
    pub mint_prefix: String,
    /// Request path prefix steered straight to a healthy node.
    pub steer_prefix: String,
    /// Internal-facing prefix that minted URLs point at.
    pub internal_prefix: String,
    /// Edge-facing prefix used when redirecting to another node.
    pub edge_prefix: String,
    /// Failover redirects allowed before giving up.
    pub max_retries: u32,
    /// Header carrying the requesting node's host, preferred over `Host`.
    pub node_header: String,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            token_ttl: Duration::from_secs(5 * 60),
            handle_ttl: Duration::from_secs(10 * 60),
            session_ttl: Duration::from_secs(30 * 60),
            credential_ttl: Duration::from_secs(60 * 60),
            sweep_period: edgeway_core::cache::DEFAULT_SWEEP_PERIOD,
            mint_prefix: "/api/video-auth/".to_string(),
            steer_prefix: "/api/stream/".to_string(),
            internal_prefix: "/internal/".to_string(),
            edge_prefix: "/video/".to_string(),
            max_retries: 3,
            node_header: "X-Node-Host".to_string(),
        }
    }
}

impl AccessConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.secret.is_empty() {
            return Err(ConfigError::invalid("access", "secret", "must not be empty"));
        }
        if self.token_ttl.as_secs() == 0 {
            return Err(ConfigError::invalid("access", "token_ttl", "must be at least one second"));
        }
        if self.handle_ttl < self.token_ttl {
            return Err(ConfigError::invalid(
                "access",
                "handle_ttl",
                "must not be shorter than token_ttl",
            ));
        }
        if self.session_ttl < self.token_ttl {
            return Err(ConfigError::invalid(
                "access",
                "session_ttl",
                "must not be shorter than token_ttl",
            ));
        }
        if self.sweep_period.is_zero() {
            return Err(ConfigError::invalid("access", "sweep_period", "must be greater than zero"));
        }
        for (field, prefix) in [
            ("mint_prefix", &self.mint_prefix),
            ("steer_prefix", &self.steer_prefix),
            ("internal_prefix", &self.internal_prefix),
            ("edge_prefix", &self.edge_prefix),
        ] {
            if !prefix.starts_with('/') || !prefix.ends_with('/') {
                return Err(ConfigError::invalid("access", field, "must start and end with '/'"));
            }
        }
        Ok(())
    }
}

/// Structured access log output.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AccessLogConfig {
    /// Write records to `path`; statistics are kept either way.
    pub enabled: bool,
    /// JSON-lines output file.
    pub path: PathBuf,
}

impl Default for AccessLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::from("logs/access.log"),
        }
    }
}

impl AccessLogConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.path.as_os_str().is_empty() {
            return Err(ConfigError::invalid("access_log", "path", "required when enabled"));
        }
        Ok(())
    }
}

/// Control socket settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Serve the control socket.
    pub enabled: bool,
    /// Unix socket path.
    pub socket: PathBuf,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            socket: PathBuf::from("/tmp/edgeway-admin.sock"),
        }
    }
}

impl AdminConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.socket.as_os_str().is_empty() {
            return Err(ConfigError::invalid("admin", "socket", "required when enabled"));
        }
        Ok(())
    }
}
