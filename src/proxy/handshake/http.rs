use base64::Engine;
use bytes::{Bytes, BytesMut};

use crate::common::{Address, TunnelError};
use crate::proxy::Credentials;

use super::HandshakeResult;

/// Upper bound on a CONNECT reply head.
pub const MAX_REPLY_HEAD: usize = 16 * 1024;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingHeaders,
    Complete,
}

/// HTTP CONNECT 握手
#[derive(Debug)]
pub struct HttpConnectCodec {
    target: Address,
    credentials: Option<Credentials>,
    state: State,
    /// Bytes before this offset are known not to start a terminator.
    scan_from: usize,
}

impl HttpConnectCodec {
    pub fn new(target: Address, credentials: Option<Credentials>) -> Self {
        Self {
            target,
            credentials,
            state: State::AwaitingHeaders,
            scan_from: 0,
        }
    }

    pub fn request(&self) -> Bytes {
        let mut request = format!("CONNECT {} HTTP/1.0\r\n", self.target);

        if let Some(creds) = &self.credentials {
            let token = base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", creds.username, creds.password));
            request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", token));
        }

        request.push_str("\r\n");
        Bytes::from(request)
    }

    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<HandshakeResult, TunnelError> {
        if self.state == State::Complete {
            return Err(TunnelError::MalformedReply(
                "data fed to a completed CONNECT handshake".into(),
            ));
        }

        let start = self.scan_from.min(buf.len());
        let Some(pos) = buf[start..]
            .windows(HEAD_TERMINATOR.len())
            .position(|w| w == HEAD_TERMINATOR)
            .map(|offset| start + offset)
        else {
            if buf.len() > MAX_REPLY_HEAD {
                return Err(TunnelError::MalformedReply(format!(
                    "CONNECT reply head exceeds {} bytes",
                    MAX_REPLY_HEAD
                )));
            }
            self.scan_from = buf.len().saturating_sub(HEAD_TERMINATOR.len() - 1);
            return Ok(HandshakeResult::NeedMoreData);
        };

        self.scan_from = 0;
        let head = buf.split_to(pos + HEAD_TERMINATOR.len());
        let status_end = head
            .windows(2)
            .position(|w| w == b"\r\n")
            .unwrap_or(head.len());
        let status_line = String::from_utf8_lossy(&head[..status_end]);

        // reason phrase may contain spaces
        let fields: Vec<&str> = status_line.splitn(3, ' ').collect();
        if fields.len() != 3 {
            return Err(TunnelError::MalformedReply(format!(
                "invalid CONNECT status line '{}'",
                status_line
            )));
        }
        if fields[1] != "200" {
            return Err(TunnelError::RejectedByProxy(format!(
                "HTTP status {}",
                fields[1]
            )));
        }

        self.state = State::Complete;
        Ok(HandshakeResult::Success(buf.split().freeze()))
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> HttpConnectCodec {
        HttpConnectCodec::new(Address::new("example.com", 443), None)
    }

    #[test]
    fn request_without_credentials() {
        assert_eq!(
            &codec().request()[..],
            b"CONNECT example.com:443 HTTP/1.0\r\n\r\n"
        );
    }

    #[test]
    fn request_with_basic_auth() {
        let codec = HttpConnectCodec::new(
            Address::new("10.0.0.5", 8080),
            Some(Credentials::new("user", "pass")),
        );
        assert_eq!(
            &codec.request()[..],
            &b"CONNECT 10.0.0.5:8080 HTTP/1.0\r\nProxy-Authorization: Basic dXNlcjpwYXNz\r\n\r\n"[..]
        );
    }

    #[test]
    fn success_keeps_payload_after_head() {
        let mut codec = codec();
        let mut buf = BytesMut::from(&b"HTTP/1.0 200 Connection Established\r\n\r\nHELLO"[..]);
        let result = codec.decode(&mut buf).unwrap();
        assert_eq!(result, HandshakeResult::Success(Bytes::from_static(b"HELLO")));
        assert!(buf.is_empty());
        assert!(codec.is_complete());
    }

    #[test]
    fn headers_after_status_are_ignored() {
        let mut codec = codec();
        let mut buf = BytesMut::from(
            &b"HTTP/1.1 200 OK\r\nProxy-Agent: test\r\nVia: 1.1 squid\r\n\r\n"[..],
        );
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            HandshakeResult::Success(Bytes::new())
        );
    }

    #[test]
    fn non_200_is_rejected() {
        let mut codec = codec();
        let mut buf = BytesMut::from(&b"HTTP/1.0 403 Forbidden\r\n\r\n"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, TunnelError::RejectedByProxy(ref r) if r.contains("403")));
        assert!(!codec.is_complete());
    }

    #[test]
    fn status_line_needs_three_fields() {
        let mut codec = codec();
        let mut buf = BytesMut::from(&b"HTTP/1.0 200\r\n\r\n"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, TunnelError::MalformedReply(_)));
    }

    #[test]
    fn incomplete_head_needs_more_data() {
        let mut codec = codec();
        let mut buf = BytesMut::from(&b"HTTP/1.0 200 Connection Established\r\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), HandshakeResult::NeedMoreData);
        assert_eq!(codec.decode(&mut buf).unwrap(), HandshakeResult::NeedMoreData);

        buf.extend_from_slice(b"\r");
        assert_eq!(codec.decode(&mut buf).unwrap(), HandshakeResult::NeedMoreData);

        buf.extend_from_slice(b"\nX");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            HandshakeResult::Success(Bytes::from_static(b"X"))
        );
    }

    #[test]
    fn byte_at_a_time_resumes_scan() {
        let mut codec = codec();
        let reply = b"HTTP/1.0 200 Connection Established\r\nVia: x\r\n\r\nZ";
        let mut buf = BytesMut::new();
        for (i, byte) in reply[..reply.len() - 2].iter().enumerate() {
            buf.extend_from_slice(&[*byte]);
            assert_eq!(codec.decode(&mut buf).unwrap(), HandshakeResult::NeedMoreData);
            assert_eq!(codec.scan_from, (i + 1).saturating_sub(3));
        }
        buf.extend_from_slice(&reply[reply.len() - 2..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            HandshakeResult::Success(Bytes::from_static(b"Z"))
        );
        assert_eq!(codec.scan_from, 0);
    }

    #[test]
    fn oversized_head_is_malformed() {
        let mut codec = codec();
        let mut buf = BytesMut::from(&b"HTTP/1.0 200 OK\r\n"[..]);
        buf.extend_from_slice(&vec![b'a'; MAX_REPLY_HEAD]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, TunnelError::MalformedReply(_)));
    }
}
