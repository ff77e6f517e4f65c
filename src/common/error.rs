use thiserror::Error;

/// Why a tunnel session failed. Every variant is fatal for its session.
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("connect to {target} failed: {source}")]
    ConnectFailure {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed reply: {0}")]
    MalformedReply(String),

    #[error("rejected by proxy: {0}")]
    RejectedByProxy(String),

    #[error("unsupported hop type: {0}")]
    UnsupportedHopType(String),

    #[error("connection closed before the tunnel was established")]
    PeerClosed,

    #[error("unsupported target address: {0}")]
    UnsupportedAddress(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(#[source] std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,

    #[error("config error: {0}")]
    Config(String),
}

impl TunnelError {
    pub(crate) fn timed_out(target: &impl std::fmt::Display, phase: &str) -> Self {
        TunnelError::ConnectFailure {
            target: target.to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("{} timed out", phase),
            ),
        }
    }

    /// Classify an I/O error on the tunnel connection before it is
    /// established. Resets, aborts, broken pipes and truncated reads all
    /// mean the peer went away.
    pub(crate) fn from_transport(e: std::io::Error) -> Self {
        if is_peer_gone(&e) {
            TunnelError::PeerClosed
        } else {
            TunnelError::Io(e)
        }
    }

    /// Same as [`TunnelError::from_transport`] for the TLS upgrade.
    pub(crate) fn from_tls(e: std::io::Error) -> Self {
        if is_peer_gone(&e) {
            TunnelError::PeerClosed
        } else {
            TunnelError::TlsHandshake(e)
        }
    }

    /// Get the kind/category of this error.
    pub fn kind(&self) -> TunnelErrorKind {
        match self {
            TunnelError::ConnectFailure { .. } => TunnelErrorKind::ConnectFailure,
            TunnelError::MalformedReply(_) => TunnelErrorKind::MalformedReply,
            TunnelError::RejectedByProxy(_) => TunnelErrorKind::RejectedByProxy,
            TunnelError::UnsupportedHopType(_) => TunnelErrorKind::UnsupportedHopType,
            TunnelError::PeerClosed => TunnelErrorKind::PeerClosed,
            TunnelError::UnsupportedAddress(_) => TunnelErrorKind::UnsupportedAddress,
            TunnelError::TlsHandshake(_) => TunnelErrorKind::TlsHandshake,
            TunnelError::Io(_) => TunnelErrorKind::Io,
            TunnelError::Cancelled => TunnelErrorKind::Cancelled,
            TunnelError::Config(_) => TunnelErrorKind::Config,
        }
    }

    /// Whether the failure happened before any hop could be reached.
    pub fn is_connect_failure(&self) -> bool {
        self.kind() == TunnelErrorKind::ConnectFailure
    }
}

fn is_peer_gone(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        e.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
    )
}

/// Lightweight error category for pattern matching without borrowing the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelErrorKind {
    ConnectFailure,
    MalformedReply,
    RejectedByProxy,
    UnsupportedHopType,
    PeerClosed,
    UnsupportedAddress,
    TlsHandshake,
    Io,
    Cancelled,
    Config,
}

impl TunnelErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TunnelErrorKind::ConnectFailure => "CONNECT_FAILED",
            TunnelErrorKind::MalformedReply => "MALFORMED_REPLY",
            TunnelErrorKind::RejectedByProxy => "REJECTED",
            TunnelErrorKind::UnsupportedHopType => "UNSUPPORTED_HOP",
            TunnelErrorKind::PeerClosed => "PEER_CLOSED",
            TunnelErrorKind::UnsupportedAddress => "UNSUPPORTED_ADDR",
            TunnelErrorKind::TlsHandshake => "TLS_FAILED",
            TunnelErrorKind::Io => "IO",
            TunnelErrorKind::Cancelled => "CANCELLED",
            TunnelErrorKind::Config => "CONFIG",
        }
    }
}

impl From<TunnelError> for std::io::Error {
    fn from(e: TunnelError) -> Self {
        match e {
            TunnelError::Io(inner) => inner,
            TunnelError::ConnectFailure { source, .. } => source,
            other => std::io::Error::other(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_mapping() {
        assert_eq!(TunnelError::PeerClosed.kind(), TunnelErrorKind::PeerClosed);
        assert_eq!(
            TunnelError::RejectedByProxy("HTTP status 403".into()).kind().as_str(),
            "REJECTED"
        );
        let io = std::io::Error::from(std::io::ErrorKind::BrokenPipe);
        assert_eq!(TunnelError::from(io).kind(), TunnelErrorKind::Io);
    }

    #[test]
    fn transport_errors_from_a_vanished_peer_are_peer_closed() {
        use std::io::{Error, ErrorKind};
        for kind in [
            ErrorKind::ConnectionReset,
            ErrorKind::ConnectionAborted,
            ErrorKind::BrokenPipe,
            ErrorKind::UnexpectedEof,
        ] {
            assert_eq!(
                TunnelError::from_transport(Error::from(kind)).kind(),
                TunnelErrorKind::PeerClosed
            );
            assert_eq!(
                TunnelError::from_tls(Error::from(kind)).kind(),
                TunnelErrorKind::PeerClosed
            );
        }
        assert_eq!(
            TunnelError::from_transport(Error::from(ErrorKind::PermissionDenied)).kind(),
            TunnelErrorKind::Io
        );
        assert_eq!(
            TunnelError::from_tls(Error::new(ErrorKind::InvalidData, "bad certificate")).kind(),
            TunnelErrorKind::TlsHandshake
        );
    }

    #[test]
    fn timed_out_is_connect_failure() {
        let err = TunnelError::timed_out(&"proxy.local:8080", "handshake");
        assert!(err.is_connect_failure());
        let io: std::io::Error = err.into();
        assert_eq!(io.kind(), std::io::ErrorKind::TimedOut);
    }

    #[test]
    fn display_includes_reason() {
        let err = TunnelError::MalformedReply("bad status line".into());
        assert_eq!(err.to_string(), "malformed reply: bad status line");
    }
}
