use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

use crate::common::{Address, DialerConfig, TunnelError};
use crate::proxy::{Credentials, HopKind, HopSpec};

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default, alias = "LOGGER")]
    pub log: LogConfig,
    #[serde(default, alias = "PROXY_SERVERS")]
    pub proxy_servers: Vec<ProxyServerConfig>,
    #[serde(default)]
    pub dialer: DialerConfig,
    /// Per-hop handshake timeout in milliseconds. Unset = no limit.
    #[serde(default)]
    pub handshake_timeout_ms: Option<u64>,
    #[serde(default)]
    pub probe: ProbeConfig,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        for (idx, server) in self.proxy_servers.iter().enumerate() {
            if server.address.trim().is_empty() {
                anyhow::bail!("proxy server #{} has an empty address", idx);
            }
            if server.port == 0 {
                anyhow::bail!("proxy server #{} ({}) has port 0", idx, server.address);
            }
            server
                .to_hop()
                .map_err(|e| anyhow::Error::new(e).context(format!("proxy server #{}", idx)))?;
        }
        if self.probe.port == 0 {
            anyhow::bail!("probe port must not be 0");
        }
        if let Some(bind) = &self.dialer.bind_address {
            bind.parse::<std::net::IpAddr>()
                .map_err(|e| anyhow::anyhow!("invalid bind-address '{}': {}", bind, e))?;
        }
        Ok(())
    }

    /// The chain, in dialing order.
    pub fn hops(&self) -> Result<Vec<HopSpec>, TunnelError> {
        self.proxy_servers.iter().map(ProxyServerConfig::to_hop).collect()
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level", alias = "LEVEL")]
    pub level: String,
}

impl LogConfig {
    /// Map a configured level to a tracing filter directive. Accepts the
    /// tracing names as well as `WARNING` and `CRITICAL`; anything
    /// unrecognised logs everything.
    pub fn filter_directive(&self) -> &'static str {
        match self.level.trim().to_ascii_uppercase().as_str() {
            "TRACE" => "trace",
            "DEBUG" => "debug",
            "INFO" => "info",
            "WARN" | "WARNING" => "warn",
            "ERROR" | "CRITICAL" => "error",
            "OFF" => "off",
            _ => "trace",
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ProxyServerConfig {
    #[serde(rename = "type", alias = "TYPE")]
    pub kind: String,
    #[serde(alias = "ADDRESS")]
    pub address: String,
    #[serde(alias = "PORT")]
    pub port: u16,
    #[serde(default, alias = "AUTHENTICATION")]
    pub authentication: AuthenticationConfig,
}

impl ProxyServerConfig {
    pub fn to_hop(&self) -> Result<HopSpec, TunnelError> {
        let kind: HopKind = self.kind.parse()?;
        let mut hop = HopSpec::new(kind, Address::new(self.address.trim(), self.port));
        // an empty username means no credentials
        if !self.authentication.username.is_empty() {
            hop = hop.with_credentials(Credentials::new(
                self.authentication.username.clone(),
                self.authentication.password.clone(),
            ));
        }
        Ok(hop)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AuthenticationConfig {
    #[serde(default, alias = "USERNAME")]
    pub username: String,
    #[serde(default, alias = "PASSWORD")]
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_host")]
    pub host: String,
    #[serde(default = "default_probe_port")]
    pub port: u16,
}

impl ProbeConfig {
    pub fn target(&self) -> Address {
        Address::new(&self.host, self.port)
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            host: default_probe_host(),
            port: default_probe_port(),
        }
    }
}

fn default_probe_host() -> String {
    "www.google.com".to_string()
}

fn default_probe_port() -> u16 {
    80
}
