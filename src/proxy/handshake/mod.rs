//! Per-hop handshake codecs.
//!
//! Codecs only encode requests and decode replies; they never touch a
//! socket. The negotiator feeds them its accumulated bytes and acts on the
//! returned [`HandshakeResult`].

pub mod http;
pub mod socks5;

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::common::{Address, TunnelError};

use super::{HopKind, HopSpec};

pub use http::HttpConnectCodec;
pub use socks5::Socks5Codec;

/// Outcome of decoding the bytes accumulated so far.
#[derive(Debug, PartialEq, Eq)]
pub enum HandshakeResult {
    /// The reply is incomplete; wait for more bytes.
    NeedMoreData,
    /// A reply step completed and the codec has the next request to write.
    Send(Bytes),
    /// The handshake is complete; the payload is every byte past the reply.
    Success(Bytes),
}

/// 握手编解码器，按跳点类型分派
#[derive(Debug)]
pub enum HandshakeCodec {
    Http(HttpConnectCodec),
    Socks5(Socks5Codec),
}

impl HandshakeCodec {
    pub fn new(hop: &HopSpec, target: Address) -> Self {
        match hop.kind {
            HopKind::Http => {
                HandshakeCodec::Http(HttpConnectCodec::new(target, hop.credentials.clone()))
            }
            HopKind::Socks5 => {
                if hop.credentials.is_some() {
                    debug!(hop = %hop.address, "socks5 credentials ignored, only no-auth is offered");
                }
                HandshakeCodec::Socks5(Socks5Codec::new(target))
            }
        }
    }

    pub fn kind(&self) -> HopKind {
        match self {
            HandshakeCodec::Http(_) => HopKind::Http,
            HandshakeCodec::Socks5(_) => HopKind::Socks5,
        }
    }

    /// The bytes written as soon as the hop becomes active.
    pub fn request(&self) -> Bytes {
        match self {
            HandshakeCodec::Http(codec) => codec.request(),
            HandshakeCodec::Socks5(codec) => codec.greeting(),
        }
    }

    /// Decode from the front of `buf`, removing the bytes that belong to the
    /// reply. On `Success` the remainder of `buf` is handed back as leftover
    /// and `buf` is left empty.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<HandshakeResult, TunnelError> {
        match self {
            HandshakeCodec::Http(codec) => codec.decode(buf),
            HandshakeCodec::Socks5(codec) => codec.decode(buf),
        }
    }

    pub fn is_complete(&self) -> bool {
        match self {
            HandshakeCodec::Http(codec) => codec.is_complete(),
            HandshakeCodec::Socks5(codec) => codec.is_complete(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::Credentials;

    #[test]
    fn dispatches_on_hop_kind() {
        let target = Address::new("example.com", 443);
        let http = HandshakeCodec::new(&HopSpec::http(Address::new("p", 1)), target.clone());
        assert_eq!(http.kind(), HopKind::Http);
        assert!(http.request().starts_with(b"CONNECT example.com:443 HTTP/1.0\r\n"));

        let socks = HandshakeCodec::new(
            &HopSpec::socks5(Address::new("p", 1)).with_credentials(Credentials::new("u", "p")),
            target,
        );
        assert_eq!(socks.kind(), HopKind::Socks5);
        assert_eq!(&socks.request()[..], &[0x05, 0x01, 0x00]);
        assert!(!socks.is_complete());
    }
}
