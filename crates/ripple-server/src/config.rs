//! Server configuration.
//!
//! Configuration can be loaded from:
//! - A TOML configuration file (`ripple.toml` or well-known paths)
//! - Environment variables (`RIPPLE_HOST`, `RIPPLE_PORT`) for the bind address
//!
//! Durations are human strings (`"25s"`, `"1m30s"`).

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path of the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Application identifier. Required.
    #[serde(default)]
    pub app_id: String,

    /// Authorization callback URL. Required.
    #[serde(default)]
    pub auth_path: String,

    /// Script executed by the authorization worker. Required by the
    /// dispatcher collaborator.
    #[serde(default)]
    pub auth_script: String,

    /// Authorization worker pool size.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Connection ceiling.
    #[serde(default = "default_max_connections")]
    pub max_connections: i64,

    /// Cap on an authorization response body, in bytes.
    #[serde(default = "default_max_auth_body")]
    pub max_auth_body: usize,

    /// Authorization calls allowed in flight.
    #[serde(default = "default_max_concurrent_auth")]
    pub max_concurrent_auth: usize,

    /// Shard count; 0 selects `2 x CPU`. Clamped to `[4, 64]`.
    #[serde(default)]
    pub num_shards: usize,

    /// Handshake token-bucket refill rate per second. Negative disables.
    #[serde(default = "default_handshake_rate")]
    pub handshake_rate: f64,

    /// Handshake token-bucket burst.
    #[serde(default = "default_handshake_burst")]
    pub handshake_burst: u32,

    /// Interval between server pings.
    #[serde(default = "default_ping_period", with = "humantime_serde")]
    pub ping_period: Duration,

    /// Deadline for a single socket write.
    #[serde(default = "default_write_wait", with = "humantime_serde")]
    pub write_wait: Duration,

    /// Window in which the peer must show liveness.
    #[serde(default = "default_pong_wait", with = "humantime_serde")]
    pub pong_wait: Duration,

    /// Channel lifecycle webhook endpoint.
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Secret signing webhook bodies and sign-in payloads.
    #[serde(default)]
    pub webhook_secret: Option<String>,

    /// Redis `host:port` enabling the cluster broker.
    #[serde(default)]
    pub redis_host: Option<String>,

    /// Metrics exporter.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable the Prometheus exporter.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Exporter port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("RIPPLE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("RIPPLE_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_num_workers() -> usize {
    2
}

fn default_max_connections() -> i64 {
    10_000
}

fn default_max_auth_body() -> usize {
    16 * 1024
}

fn default_max_concurrent_auth() -> usize {
    100
}

fn default_handshake_rate() -> f64 {
    100.0
}

fn default_handshake_burst() -> u32 {
    50
}

fn default_ping_period() -> Duration {
    ripple_core::client::DEFAULT_PING_PERIOD
}

fn default_write_wait() -> Duration {
    ripple_core::client::DEFAULT_WRITE_WAIT
}

fn default_pong_wait() -> Duration {
    ripple_core::client::DEFAULT_PONG_WAIT
}

fn default_true() -> bool {
    true
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            websocket_path: default_ws_path(),
            app_id: String::new(),
            auth_path: String::new(),
            auth_script: String::new(),
            num_workers: default_num_workers(),
            max_connections: default_max_connections(),
            max_auth_body: default_max_auth_body(),
            max_concurrent_auth: default_max_concurrent_auth(),
            num_shards: 0,
            handshake_rate: default_handshake_rate(),
            handshake_burst: default_handshake_burst(),
            ping_period: default_ping_period(),
            write_wait: default_write_wait(),
            pong_wait: default_pong_wait(),
            webhook_url: None,
            webhook_secret: None,
            redis_host: None,
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or
    /// if required directives are missing.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "ripple.toml",
            "/etc/ripple/ripple.toml",
            "~/.config/ripple/ripple.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        bail!("no configuration file found (looked for {})", config_paths.join(", "))
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Check required directives.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first missing directive.
    pub fn validate(&self) -> Result<()> {
        if self.app_id.is_empty() {
            bail!("the 'app_id' directive is required");
        }
        if self.auth_path.is_empty() {
            bail!("the 'auth_path' directive is required");
        }
        if self.auth_script.is_empty() {
            bail!("the 'auth_script' directive is required");
        }
        Ok(())
    }

    /// Socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a valid address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", self.host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.max_connections, 10_000);
        assert_eq!(config.max_auth_body, 16 * 1024);
        assert_eq!(config.max_concurrent_auth, 100);
        assert_eq!(config.handshake_rate, 100.0);
        assert_eq!(config.handshake_burst, 50);
        assert_eq!(config.ping_period, Duration::from_secs(108));
        assert_eq!(config.pong_wait, Duration::from_secs(120));
        assert_eq!(config.write_wait, Duration::from_secs(10));
        assert!(config.metrics.enabled);
    }

    #[test]
    fn test_validate_requires_directives() {
        let mut config = Config::default();
        assert!(config.validate().is_err());

        config.app_id = "app".into();
        config.auth_path = "http://127.0.0.1:9001/broadcasting/auth".into();
        assert!(config.validate().is_err());

        config.auth_script = "auth.php".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_with_durations() {
        let toml_str = r#"
            app_id = "test-app"
            auth_path = "http://127.0.0.1:9001/auth"
            auth_script = "auth.php"
            max_connections = 500
            num_shards = 8
            ping_period = "25s"
            pong_wait = "1m"
            redis_host = "127.0.0.1:6379"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.app_id, "test-app");
        assert_eq!(config.max_connections, 500);
        assert_eq!(config.num_shards, 8);
        assert_eq!(config.ping_period, Duration::from_secs(25));
        assert_eq!(config.pong_wait, Duration::from_secs(60));
        assert_eq!(config.redis_host.as_deref(), Some("127.0.0.1:6379"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);
    }
}
