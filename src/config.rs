use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use tracing::info;

pub const DNS_PORT: u16 = 53;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Upstream resolver, host name or IP.
    #[serde(default)]
    pub upstream: Option<String>,
    #[serde(default = "default_dns_port")]
    pub upstream_port: u16,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: IpAddr,
    #[serde(default = "default_dns_port")]
    pub listen_port: u16,
    /// Upstream receive timeout in milliseconds.
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
    /// How long the event loop waits for a datagram before housekeeping.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_flood_window_secs")]
    pub flood_window_secs: u64,
    /// Identical queries answered per window before the rest are dropped.
    #[serde(default = "default_flood_max_repeats")]
    pub flood_max_repeats: u32,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            upstream: None,
            upstream_port: default_dns_port(),
            listen_addr: default_listen_addr(),
            listen_port: default_dns_port(),
            upstream_timeout_ms: default_upstream_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            flood_window_secs: default_flood_window_secs(),
            flood_max_repeats: default_flood_max_repeats(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

/// Values given on the command line. Each one that is set wins over the
/// config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub upstream: Option<String>,
    pub upstream_port: Option<u16>,
    pub listen_port: Option<u16>,
    pub timeout_secs: Option<u64>,
}

impl Settings {
    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(upstream) = overrides.upstream {
            self.upstream = Some(upstream);
        }
        if let Some(port) = overrides.upstream_port {
            self.upstream_port = port;
        }
        if let Some(port) = overrides.listen_port {
            self.listen_port = port;
        }
        if let Some(secs) = overrides.timeout_secs {
            self.upstream_timeout_ms = secs.saturating_mul(1000);
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.upstream.as_deref() {
            None => anyhow::bail!("no upstream server configured"),
            Some(host) if host.trim().is_empty() => anyhow::bail!("upstream server is empty"),
            Some(_) => {}
        }
        if self.upstream_port == 0 {
            anyhow::bail!("upstream_port must be non-zero");
        }
        if self.listen_port == 0 {
            anyhow::bail!("listen_port must be non-zero");
        }
        if self.upstream_timeout_ms == 0 {
            anyhow::bail!("upstream_timeout_ms must be non-zero");
        }
        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be non-zero");
        }
        if self.flood_window_secs == 0 {
            anyhow::bail!("flood_window_secs must be non-zero");
        }
        Ok(())
    }

    pub fn listen_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr, self.listen_port)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn flood_window(&self) -> Duration {
        Duration::from_secs(self.flood_window_secs)
    }

    /// Resolves the upstream host once, preferring the first address returned.
    pub async fn resolve_upstream(&self) -> Result<SocketAddr> {
        let host = self
            .upstream
            .as_deref()
            .map(str::trim)
            .context("no upstream server configured")?;
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.upstream_port));
        }
        tokio::net::lookup_host((host, self.upstream_port))
            .await
            .with_context(|| format!("resolve upstream {host}"))?
            .next()
            .with_context(|| format!("upstream {host} has no addresses"))
    }
}

pub fn load_config(path: &Path) -> Result<Settings> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("read config file: {}", path.display()))?;
    let cfg: Settings = serde_json::from_str(&raw)
        .with_context(|| format!("parse config file: {}", path.display()))?;
    info!(target = "config", path = %path.display(), "config loaded");
    Ok(cfg)
}

/// Defaults, then the optional config file, then command-line overrides.
pub fn build_settings(path: Option<&Path>, overrides: Overrides) -> Result<Settings> {
    let mut cfg = match path {
        Some(path) => load_config(path)?,
        None => Settings::default(),
    };
    cfg.apply(overrides);
    cfg.validate()?;
    Ok(cfg)
}

fn default_dns_port() -> u16 {
    DNS_PORT
}

fn default_listen_addr() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_upstream_timeout_ms() -> u64 {
    5000
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_flood_window_secs() -> u64 {
    180
}

fn default_flood_max_repeats() -> u32 {
    6
}

fn default_cache_capacity() -> u64 {
    10_000
}
