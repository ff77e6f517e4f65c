use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use bytes::{BufMut, BytesMut};

use super::error::TunnelError;

/// 隧道目标地址（代理跳点或最终目标）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl Address {
    /// Classify `host` by literal inspection: IPv4 and IPv6 literals become
    /// `Ip`, everything else is kept verbatim as a domain name.
    pub fn new(host: &str, port: u16) -> Self {
        let trimmed = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if let Ok(v4) = trimmed.parse::<Ipv4Addr>() {
            return Address::Ip(SocketAddr::new(IpAddr::V4(v4), port));
        }
        if let Ok(v6) = trimmed.parse::<Ipv6Addr>() {
            return Address::Ip(SocketAddr::new(IpAddr::V6(v6), port));
        }
        Address::Domain(host.to_string(), port)
    }

    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    pub fn host(&self) -> String {
        match self {
            Address::Ip(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// 编码为 SOCKS5 地址格式 [ATYP][ADDR][PORT]
    ///
    /// Only IPv4 (`0x01`) and domain (`0x03`) targets are encoded; IPv6
    /// literals and domains longer than 255 bytes are refused.
    pub fn encode_socks5(&self, buf: &mut BytesMut) -> Result<(), TunnelError> {
        match self {
            Address::Ip(SocketAddr::V4(addr)) => {
                buf.put_u8(0x01);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::Ip(SocketAddr::V6(addr)) => {
                return Err(TunnelError::UnsupportedAddress(format!(
                    "IPv6 target {} cannot be requested from a SOCKS5 hop",
                    addr
                )));
            }
            Address::Domain(domain, port) => {
                let len = u8::try_from(domain.len()).map_err(|_| {
                    TunnelError::UnsupportedAddress(format!(
                        "domain name is {} bytes long, SOCKS5 allows at most 255",
                        domain.len()
                    ))
                })?;
                buf.put_u8(0x03);
                buf.put_u8(len);
                buf.put_slice(domain.as_bytes());
                buf.put_u16(*port);
            }
        }
        Ok(())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl FromStr for Address {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Address::Ip(addr));
        }
        if let Some((host, port_str)) = s.rsplit_once(':') {
            if let Ok(port) = port_str.parse::<u16>() {
                if !host.is_empty() {
                    return Ok(Address::new(host, port));
                }
            }
        }
        Err(TunnelError::Config(format!("invalid address: {}", s)))
    }
}
