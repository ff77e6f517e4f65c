//! Physical connection establishment.
//!
//! The dialer opens the single TCP connection a tunnel session runs over:
//!
//! - Bind to a specific source address
//! - Connect timeout
//! - Keep-alive settings

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::Deserialize;
use tokio::net::TcpStream;
use tracing::debug;

/// Dialer configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DialerConfig {
    /// Bind to a specific source IP address.
    #[serde(rename = "bind-address")]
    pub bind_address: Option<String>,

    /// Connect timeout in milliseconds. Default: 30000.
    #[serde(rename = "connect-timeout")]
    pub connect_timeout_ms: Option<u64>,

    /// TCP keep-alive interval in seconds. 0 = disabled.
    #[serde(rename = "tcp-keep-alive")]
    pub tcp_keep_alive_secs: Option<u64>,
}

impl DialerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.unwrap_or(30_000))
    }

    fn bind_ip(&self) -> io::Result<Option<IpAddr>> {
        match &self.bind_address {
            None => Ok(None),
            Some(raw) => raw.parse::<IpAddr>().map(Some).map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid bind address '{}': {}", raw, e),
                )
            }),
        }
    }
}

/// Dialer that applies socket options and connects.
pub struct Dialer {
    config: DialerConfig,
}

impl Dialer {
    pub fn new(config: DialerConfig) -> Self {
        Self { config }
    }

    /// Create a dialer with default settings.
    pub fn default_dialer() -> Self {
        Self {
            config: DialerConfig::default(),
        }
    }

    /// Connect to the given address, applying all configured socket options.
    pub async fn connect(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let timeout = self.config.connect_timeout();

        let stream = tokio::time::timeout(timeout, self.connect_inner(addr))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect timeout after {:?} to {}", timeout, addr),
                )
            })??;

        self.apply_post_connect(&stream)?;

        debug!(
            addr = %addr,
            bind = self.config.bind_address.as_deref().unwrap_or("-"),
            "dialer connected"
        );

        Ok(stream)
    }

    /// Resolve `host` and connect to the first address it resolves to.
    /// The connect timeout covers resolution as well.
    pub async fn connect_host(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let timeout = self.config.connect_timeout();
        let addr = tokio::time::timeout(timeout, resolve_host(host, port))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("resolving {}:{} timed out after {:?}", host, port, timeout),
                )
            })??;
        self.connect(addr).await
    }

    async fn connect_inner(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            tokio::net::TcpSocket::new_v4()?
        } else {
            tokio::net::TcpSocket::new_v6()?
        };

        if let Some(ip) = self.config.bind_ip()? {
            socket.bind(SocketAddr::new(ip, 0))?;
        }

        socket.connect(addr).await
    }

    fn apply_post_connect(&self, stream: &TcpStream) -> io::Result<()> {
        if let Some(interval) = self.config.tcp_keep_alive_secs {
            if interval > 0 {
                let sock_ref = socket2::SockRef::from(stream);
                let keepalive =
                    socket2::TcpKeepalive::new().with_time(Duration::from_secs(interval));
                sock_ref.set_tcp_keepalive(&keepalive)?;
            }
        }

        // Handshakes are small request/reply exchanges
        stream.set_nodelay(true)?;

        Ok(())
    }
}

async fn resolve_host(host: &str, port: u16) -> io::Result<SocketAddr> {
    let addr_str = format!("{}:{}", host, port);
    let addrs = tokio::task::spawn_blocking(move || {
        use std::net::ToSocketAddrs;
        addr_str.to_socket_addrs()
    })
    .await
    .map_err(io::Error::other)??;
    addrs.into_iter().next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("DNS resolution failed for {}:{}", host, port),
        )
    })
}
