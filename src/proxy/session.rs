use std::io;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::{Dialer, DialerConfig, PrefixedStream, ProxyStream, TlsContext, TunnelError};

use super::chain::TunnelPlan;
use super::negotiator::HopNegotiator;

/// 隧道会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Negotiating(usize),
    TlsUpgrading,
    Established,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Established | SessionState::Failed)
    }
}

/// Per-connection knobs shared by every session a tunnel starts.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub dialer: DialerConfig,
    /// Applied separately to each hop handshake and to the TLS handshake.
    pub handshake_timeout: Option<Duration>,
    pub tls: Option<TlsContext>,
}

/// A negotiated tunnel, ready for the application protocol.
pub struct EstablishedTunnel {
    pub stream: ProxyStream,
    /// Bytes that arrived behind the last handshake reply. They precede
    /// anything else read from `stream`.
    pub leftover: Bytes,
}

impl EstablishedTunnel {
    /// Fold the leftover bytes back in front of the stream.
    pub fn into_stream(self) -> ProxyStream {
        PrefixedStream::wrap(self.leftover, self.stream)
    }
}

/// One chain negotiation over one physical connection.
pub struct TunnelSession {
    plan: TunnelPlan,
    options: SessionOptions,
    cancel: CancellationToken,
    state: SessionState,
    current_hop: usize,
    pending: Bytes,
}

impl TunnelSession {
    pub fn new(plan: TunnelPlan, options: SessionOptions) -> Self {
        Self {
            plan,
            options,
            cancel: CancellationToken::new(),
            state: SessionState::Connecting,
            current_hop: 0,
            pending: Bytes::new(),
        }
    }

    /// Cancelling `token` closes the connection and fails the session.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Number of hops that have finished their handshake.
    pub fn current_hop(&self) -> usize {
        self.current_hop
    }

    pub fn plan(&self) -> &TunnelPlan {
        &self.plan
    }

    /// Drive the session to `Established` or `Failed`. A session runs once;
    /// calling this again after a terminal state is an error.
    pub async fn establish(&mut self) -> Result<EstablishedTunnel, TunnelError> {
        if self.state.is_terminal() {
            return Err(TunnelError::Io(io::Error::other(
                "tunnel session has already finished",
            )));
        }

        let cancel = self.cancel.clone();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TunnelError::Cancelled),
            result = self.run() => result,
        };

        match result {
            Ok(tunnel) => {
                self.state = SessionState::Established;
                info!(
                    target = %self.plan.target(),
                    hops = self.plan.len(),
                    leftover = tunnel.leftover.len(),
                    "tunnel established"
                );
                Ok(tunnel)
            }
            Err(e) => {
                warn!(
                    target = %self.plan.target(),
                    state = ?self.state,
                    kind = e.kind().as_str(),
                    error = %e,
                    "tunnel failed"
                );
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    async fn run(&mut self) -> Result<EstablishedTunnel, TunnelError> {
        self.state = SessionState::Connecting;
        let first = self.plan.first_dial().clone();
        debug!(dial = %first, hops = self.plan.len(), "opening connection");

        let dialer = Dialer::new(self.options.dialer.clone());
        let tcp = dialer
            .connect_host(&first.host(), first.port())
            .await
            .map_err(|source| TunnelError::ConnectFailure {
                target: first.to_string(),
                source,
            })?;
        let mut stream: ProxyStream = Box::new(tcp);

        for index in 0..self.plan.len() {
            let step = &self.plan.steps()[index];
            self.state = SessionState::Negotiating(index);

            let negotiator = HopNegotiator::new(index, &step.hop, step.tunnel_target.clone());
            let pending = std::mem::take(&mut self.pending);
            let outcome = match self.options.handshake_timeout {
                Some(limit) => {
                    match tokio::time::timeout(limit, negotiator.negotiate(&mut stream, pending)).await
                    {
                        Ok(outcome) => outcome,
                        Err(_) => Err(TunnelError::timed_out(&step.hop.address, "handshake")),
                    }
                }
                None => negotiator.negotiate(&mut stream, pending).await,
            };

            match outcome {
                Ok(leftover) => {
                    self.pending = leftover;
                    self.current_hop = index + 1;
                }
                Err(e) => {
                    let _ = stream.shutdown().await;
                    return Err(e);
                }
            }
        }

        if let Some(tls) = self.options.tls.clone() {
            self.state = SessionState::TlsUpgrading;
            // anything behind the last reply belongs to the TLS layer
            let raw = PrefixedStream::wrap(std::mem::take(&mut self.pending), stream);
            stream = match self.options.handshake_timeout {
                Some(limit) => tokio::time::timeout(limit, tls.connect(raw))
                    .await
                    .map_err(|_| TunnelError::timed_out(self.plan.target(), "TLS handshake"))??,
                None => tls.connect(raw).await?,
            };
        }

        Ok(EstablishedTunnel {
            stream,
            leftover: std::mem::take(&mut self.pending),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Address;
    use crate::proxy::HopSpec;
    use std::net::SocketAddr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn empty_chain_connects_directly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = Address::Ip(listener.local_addr().unwrap());

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"banner").await.unwrap();
        });

        let mut session = TunnelSession::new(TunnelPlan::new(&[], &target), SessionOptions::default());
        let tunnel = session.establish().await.unwrap();
        assert_eq!(session.state(), SessionState::Established);
        assert_eq!(session.current_hop(), 0);
        assert!(tunnel.leftover.is_empty());

        let mut stream = tunnel.into_stream();
        let mut buf = [0u8; 6];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"banner");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_failure_fails_session() {
        // bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap();
        drop(listener);

        let hops = vec![HopSpec::http(Address::Ip(dead))];
        let plan = TunnelPlan::new(&hops, &Address::new("example.com", 80));
        let mut session = TunnelSession::new(plan, SessionOptions::default());

        let err = session.establish().await.err().unwrap();
        assert!(err.is_connect_failure());
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(session.current_hop(), 0);

        // terminal: a second attempt does not dial again
        assert!(session.establish().await.is_err());
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn handshake_timeout_is_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy = listener.local_addr().unwrap();

        // accepts but never answers
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 128];
            let _ = sock.read(&mut buf).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let hops = vec![HopSpec::http(Address::Ip(proxy))];
        let plan = TunnelPlan::new(&hops, &Address::new("example.com", 80));
        let options = SessionOptions {
            handshake_timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        let mut session = TunnelSession::new(plan, options);

        let err = session.establish().await.err().unwrap();
        assert!(err.is_connect_failure());
        assert_eq!(session.state(), SessionState::Failed);
        server.abort();
    }

    /// Accepts one connection, reads the request, optionally answers and
    /// reads once more, then aborts the connection with a reset.
    async fn resetting_peer(reply: &'static [u8]) -> (SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let _ = sock.read(&mut buf).await.unwrap();
            if !reply.is_empty() {
                sock.write_all(reply).await.unwrap();
                // wait for whatever the client sends next
                let _ = sock.read(&mut buf).await;
            }
            socket2::SockRef::from(&sock)
                .set_linger(Some(Duration::ZERO))
                .unwrap();
            drop(sock);
        });
        (addr, server)
    }

    #[tokio::test]
    async fn reset_during_hop_handshake_is_peer_closed() {
        let (proxy, server) = resetting_peer(b"").await;

        let hops = vec![HopSpec::http(Address::Ip(proxy))];
        let plan = TunnelPlan::new(&hops, &Address::new("example.com", 80));
        let mut session = TunnelSession::new(plan, SessionOptions::default());

        let err = session.establish().await.err().unwrap();
        assert!(matches!(err, TunnelError::PeerClosed), "got {:?}", err);
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(session.current_hop(), 0);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn reset_during_tls_upgrade_is_peer_closed() {
        let (proxy, server) =
            resetting_peer(b"HTTP/1.0 200 Connection Established\r\n\r\n").await;

        let hops = vec![HopSpec::http(Address::Ip(proxy))];
        let plan = TunnelPlan::new(&hops, &Address::new("example.com", 443));
        let options = SessionOptions {
            tls: Some(TlsContext::for_host("example.com", false).unwrap()),
            handshake_timeout: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let mut session = TunnelSession::new(plan, options);

        let err = session.establish().await.err().unwrap();
        assert!(matches!(err, TunnelError::PeerClosed), "got {:?}", err);
        assert_eq!(session.current_hop(), 1);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn cancel_fails_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let hops = vec![HopSpec::socks5(Address::Ip(proxy))];
        let plan = TunnelPlan::new(&hops, &Address::new("example.com", 80));
        let token = CancellationToken::new();
        let mut session = TunnelSession::new(plan, SessionOptions::default()).with_cancel(token.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let err = session.establish().await.err().unwrap();
        assert!(matches!(err, TunnelError::Cancelled));
        assert_eq!(session.state(), SessionState::Failed);
        canceller.await.unwrap();
        server.abort();
    }
}
