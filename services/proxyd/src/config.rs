//! Proxy configuration (env-driven).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use proxyd::proxy::{DEFAULT_BACKEND_PORT, DEFAULT_CONNECT_TIMEOUT};
use proxyd::{BootstrapConfig, ListenerConfig};

/// Proxy configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Inbound listen address (example: 0.0.0.0:443).
    pub listen_addr: SocketAddr,

    /// Bootstrap candidate hosts, in order.
    pub bootstrap_endpoints: Vec<String>,

    /// API server port on every backend.
    pub backend_port: u16,

    /// Backend dial timeout.
    pub connect_timeout: Duration,

    /// Interval between bootstrap probes.
    pub probe_interval: Duration,

    /// Bound on a single bootstrap probe.
    pub probe_timeout: Duration,

    /// Cluster CA bundle.
    pub trust_bundle: PathBuf,

    /// Admin credentials file awaited before discovery starts.
    pub credentials_file: PathBuf,

    /// Pod watch stream. Reads stdin when unset.
    pub watch_source: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = var("PROXYD_LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0:443".to_string())
            .parse::<SocketAddr>()
            .context("PROXYD_LISTEN_ADDR must be a socket address (host:port).")?;

        let bootstrap_endpoints: Vec<String> = var("PROXYD_BOOTSTRAP_ENDPOINTS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let backend_port: u16 = var("PROXYD_BACKEND_PORT")
            .map(|v| v.parse())
            .transpose()
            .context("PROXYD_BACKEND_PORT must be a port number.")?
            .unwrap_or(DEFAULT_BACKEND_PORT);

        let connect_timeout_ms: u64 = var("PROXYD_CONNECT_TIMEOUT_MS")
            .map(|v| v.parse())
            .transpose()
            .context("PROXYD_CONNECT_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT.as_millis() as u64);
        let connect_timeout = Duration::from_millis(connect_timeout_ms.max(1));

        let probe_interval_ms: u64 = var("PROXYD_PROBE_INTERVAL_MS")
            .map(|v| v.parse())
            .transpose()
            .context("PROXYD_PROBE_INTERVAL_MS must be an integer (milliseconds).")?
            .unwrap_or(1000);
        let probe_interval = Duration::from_millis(probe_interval_ms.max(50));

        let probe_timeout_ms: u64 = var("PROXYD_PROBE_TIMEOUT_MS")
            .map(|v| v.parse())
            .transpose()
            .context("PROXYD_PROBE_TIMEOUT_MS must be an integer (milliseconds).")?
            .unwrap_or(1000);
        let probe_timeout = Duration::from_millis(probe_timeout_ms.max(1));

        let trust_bundle = var("PROXYD_TRUST_BUNDLE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/etc/kubernetes/pki/ca.crt"));

        let credentials_file = var("PROXYD_CREDENTIALS_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/etc/kubernetes/admin.conf"));

        let watch_source = var("PROXYD_WATCH_SOURCE")
            .filter(|v| !v.is_empty() && v != "-")
            .map(PathBuf::from);

        let log_level = var("PROXYD_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            bootstrap_endpoints,
            backend_port,
            connect_timeout,
            probe_interval,
            probe_timeout,
            trust_bundle,
            credentials_file,
            watch_source,
            log_level,
        })
    }

    pub fn listener(&self) -> ListenerConfig {
        let mut listener = ListenerConfig::new(self.listen_addr);
        listener.backend_port = self.backend_port;
        listener.connect_timeout = self.connect_timeout;
        listener
    }

    pub fn bootstrap(&self) -> BootstrapConfig {
        BootstrapConfig {
            endpoints: self.bootstrap_endpoints.clone(),
            backend_port: self.backend_port,
            interval: self.probe_interval,
            probe_timeout: self.probe_timeout,
        }
    }
}
