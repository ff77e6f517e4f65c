use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::common::{Address, TunnelError};

use super::HandshakeResult;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingMethodSelect,
    AwaitingConnectReply,
    Complete,
}

/// SOCKS5 CONNECT 握手（RFC 1928，仅无认证）
#[derive(Debug)]
pub struct Socks5Codec {
    target: Address,
    state: State,
}

impl Socks5Codec {
    pub fn new(target: Address) -> Self {
        Self {
            target,
            state: State::AwaitingMethodSelect,
        }
    }

    /// VER=5, NMETHODS=1, METHODS=[NO_AUTH]
    pub fn greeting(&self) -> Bytes {
        Bytes::from_static(&[SOCKS_VERSION, 0x01, METHOD_NO_AUTH])
    }

    pub fn connect_request(&self) -> Result<Bytes, TunnelError> {
        let mut req = BytesMut::with_capacity(64);
        req.put_u8(SOCKS_VERSION);
        req.put_u8(CMD_CONNECT);
        req.put_u8(0x00); // RSV
        self.target.encode_socks5(&mut req)?;
        Ok(req.freeze())
    }

    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<HandshakeResult, TunnelError> {
        match self.state {
            State::AwaitingMethodSelect => self.decode_method_select(buf),
            State::AwaitingConnectReply => self.decode_connect_reply(buf),
            State::Complete => Err(TunnelError::MalformedReply(
                "data fed to a completed SOCKS5 handshake".into(),
            )),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Complete
    }

    fn decode_method_select(&mut self, buf: &mut BytesMut) -> Result<HandshakeResult, TunnelError> {
        if buf.len() < 2 {
            return Ok(HandshakeResult::NeedMoreData);
        }
        if buf[0] != SOCKS_VERSION {
            return Err(TunnelError::MalformedReply(format!(
                "socks5: server returned unsupported version: 0x{:02x}",
                buf[0]
            )));
        }
        match buf[1] {
            METHOD_NO_AUTH => {}
            METHOD_NONE_ACCEPTABLE => {
                return Err(TunnelError::RejectedByProxy(
                    "socks5: server rejected all authentication methods".into(),
                ));
            }
            method => {
                return Err(TunnelError::MalformedReply(format!(
                    "socks5: server selected a method that was not offered: 0x{:02x}",
                    method
                )));
            }
        }
        buf.advance(2);

        let request = self.connect_request()?;
        self.state = State::AwaitingConnectReply;
        Ok(HandshakeResult::Send(request))
    }

    /// [VER][REP][RSV][ATYP][BND.ADDR][BND.PORT]
    fn decode_connect_reply(&mut self, buf: &mut BytesMut) -> Result<HandshakeResult, TunnelError> {
        if buf.len() < 2 {
            return Ok(HandshakeResult::NeedMoreData);
        }
        if buf[0] != SOCKS_VERSION {
            return Err(TunnelError::MalformedReply(format!(
                "socks5: invalid reply version: 0x{:02x}",
                buf[0]
            )));
        }
        if buf[1] != 0x00 {
            return Err(TunnelError::RejectedByProxy(format!(
                "socks5: request failed: {} (0x{:02x})",
                reply_reason(buf[1]),
                buf[1]
            )));
        }
        if buf.len() < 5 {
            return Ok(HandshakeResult::NeedMoreData);
        }

        let reply_len = match buf[3] {
            0x01 => 4 + 4 + 2,
            0x03 => 4 + 1 + buf[4] as usize + 2,
            0x04 => 4 + 16 + 2,
            atyp => {
                return Err(TunnelError::MalformedReply(format!(
                    "socks5: unsupported bind address type: 0x{:02x}",
                    atyp
                )));
            }
        };
        if buf.len() < reply_len {
            return Ok(HandshakeResult::NeedMoreData);
        }
        buf.advance(reply_len);

        self.state = State::Complete;
        Ok(HandshakeResult::Success(buf.split().freeze()))
    }
}

fn reply_reason(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}
