//! Configuration loading and types for the block server.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct. Each subsection governs a different part of the
//! system: networking, token verification, cluster membership and timing,
//! logging, and metrics.

use anyhow::{bail, Context};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Token verification settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Cluster membership and consensus timing.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port. Overridden by the port of this node's own cluster address.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and the `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

/// Token verification settings.
///
/// Tokens are JWTs issued by the metadata service. With the default
/// `RS256` the service's public key is read from `public_key_path`; the
/// HMAC algorithms use `secret` instead.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// JWT algorithm name, e.g. `RS256` or `HS256`.
    #[serde(default = "default_algorithm")]
    pub algorithm: String,

    /// PEM-encoded public key for the RSA and EC algorithms.
    #[serde(default = "default_public_key_path")]
    pub public_key_path: String,

    /// Shared secret for the HMAC algorithms.
    #[serde(default)]
    pub secret: Option<String>,

    /// Required `iss` claim.
    #[serde(default = "default_issuer")]
    pub issuer: String,

    /// Claim carrying the principal ID.
    #[serde(default = "default_claim")]
    pub claim: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            public_key_path: default_public_key_path(),
            secret: None,
            issuer: default_issuer(),
            claim: default_claim(),
        }
    }
}

/// Cluster membership and consensus timing.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Ordered list of every member's address, this node included.
    #[serde(default)]
    pub peers: Vec<String>,

    /// File with one member address per line, used when `peers` is empty.
    #[serde(default)]
    pub peers_file: Option<String>,

    /// Position of this node in the member list.
    #[serde(default)]
    pub node_index: usize,

    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,

    #[serde(default = "default_election_timeout_max_ms")]
    pub election_timeout_max_ms: u64,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Per-RPC timeout for votes and heartbeats.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    /// How long a client write waits for its entry to commit.
    #[serde(default = "default_replication_timeout_ms")]
    pub replication_timeout_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            peers_file: None,
            node_index: 0,
            election_timeout_min_ms: default_election_timeout_min_ms(),
            election_timeout_max_ms: default_election_timeout_max_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            replication_timeout_ms: default_replication_timeout_ms(),
        }
    }
}

/// This node's address and the addresses of every other member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bootstrap {
    pub address: String,
    pub peers: Vec<String>,
}

impl Bootstrap {
    /// Port of this node's own address, if it carries one.
    pub fn port(&self) -> Option<u16> {
        let without_scheme = self
            .address
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.address);
        let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
        authority.rsplit_once(':')?.1.parse().ok()
    }
}

impl ClusterConfig {
    /// Resolve the member list and split off this node's address.
    ///
    /// With no members configured the node runs alone as `fallback`.
    pub fn bootstrap(&self, fallback: &str) -> anyhow::Result<Bootstrap> {
        let mut members = if !self.peers.is_empty() {
            self.peers.clone()
        } else if let Some(path) = &self.peers_file {
            load_peers_file(path)?
        } else {
            Vec::new()
        };

        if members.is_empty() {
            return Ok(Bootstrap {
                address: fallback.to_string(),
                peers: Vec::new(),
            });
        }
        if self.node_index >= members.len() {
            bail!(
                "node index {} out of range for {} cluster members",
                self.node_index,
                members.len()
            );
        }
        let address = members.remove(self.node_index);
        Ok(Bootstrap {
            address,
            peers: members,
        })
    }

    pub fn election_timeout(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.election_timeout_min_ms),
            Duration::from_millis(self.election_timeout_max_ms),
        )
    }

    /// Reject timing combinations that would make elections unstable.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.election_timeout_min_ms == 0 {
            bail!("cluster.election_timeout_min_ms must be positive");
        }
        if self.election_timeout_min_ms > self.election_timeout_max_ms {
            bail!(
                "cluster.election_timeout_min_ms ({}) exceeds election_timeout_max_ms ({})",
                self.election_timeout_min_ms,
                self.election_timeout_max_ms
            );
        }
        if self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            bail!(
                "cluster.heartbeat_interval_ms ({}) must be below election_timeout_min_ms ({})",
                self.heartbeat_interval_ms,
                self.election_timeout_min_ms
            );
        }
        if self.heartbeat_interval_ms == 0 || self.rpc_timeout_ms == 0 {
            bail!("cluster.heartbeat_interval_ms and rpc_timeout_ms must be positive");
        }
        if !self.peers.is_empty() && self.node_index >= self.peers.len() {
            bail!(
                "cluster.node_index {} out of range for {} peers",
                self.node_index,
                self.peers.len()
            );
        }
        Ok(())
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_algorithm() -> String {
    "RS256".to_string()
}

fn default_public_key_path() -> String {
    "public.pem".to_string()
}

fn default_issuer() -> String {
    "auth-server".to_string()
}

fn default_claim() -> String {
    "userID".to_string()
}

fn default_election_timeout_min_ms() -> u64 {
    500
}

fn default_election_timeout_max_ms() -> u64 {
    1000
}

fn default_heartbeat_interval_ms() -> u64 {
    100
}

fn default_rpc_timeout_ms() -> u64 {
    200
}

fn default_replication_timeout_ms() -> u64 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("parsing config {}", path.display()))?;
    Ok(config)
}

/// Read a member list: one address per line, blank lines and `#` comments
/// ignored.
pub fn load_peers_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<String>> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading peers file {}", path.display()))?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}
