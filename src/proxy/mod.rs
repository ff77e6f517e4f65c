pub mod chain;
pub mod handshake;
pub mod negotiator;
pub mod session;
pub mod tunnel;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;

use crate::common::{Address, TunnelError};

pub use chain::{PlanStep, TunnelPlan};
pub use session::{EstablishedTunnel, SessionOptions, SessionState, TunnelSession};
pub use tunnel::{CloseReason, Transport, Tunnel, TunnelHandle};

/// 代理跳点协议类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HopKind {
    Http,
    Socks5,
}

impl HopKind {
    pub fn as_str(self) -> &'static str {
        match self {
            HopKind::Http => "HTTP",
            HopKind::Socks5 => "SOCKS5",
        }
    }
}

impl FromStr for HopKind {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(HopKind::Http),
            "socks5" => Ok(HopKind::Socks5),
            _ => Err(TunnelError::UnsupportedHopType(s.to_string())),
        }
    }
}

impl fmt::Display for HopKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 代理认证信息
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// One proxy server in the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopSpec {
    pub kind: HopKind,
    pub address: Address,
    pub credentials: Option<Credentials>,
}

impl HopSpec {
    pub fn new(kind: HopKind, address: Address) -> Self {
        Self {
            kind,
            address,
            credentials: None,
        }
    }

    pub fn http(address: Address) -> Self {
        Self::new(HopKind::Http, address)
    }

    pub fn socks5(address: Address) -> Self {
        Self::new(HopKind::Socks5, address)
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

/// The protocol that runs over an established tunnel.
///
/// Callbacks arrive in order: `connection_made` once, `data_received` for
/// the handshake leftovers (if any) and then for every chunk read from the
/// tunnel, and finally `connection_lost` once.
#[async_trait]
pub trait ApplicationProtocol: Send {
    async fn connection_made(&mut self, transport: &mut Transport);
    async fn data_received(&mut self, transport: &mut Transport, data: Bytes);
    async fn connection_lost(&mut self, _reason: CloseReason) {}
}

/// Creates the application protocol once a tunnel is established and is
/// told, exactly once, when a tunnel could not be established.
pub trait ApplicationFactory: Send + Sync + 'static {
    fn build_protocol(&self) -> Box<dyn ApplicationProtocol>;
    fn connection_failed(&self, error: TunnelError);
}
