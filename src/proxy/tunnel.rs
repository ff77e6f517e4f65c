use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::common::{Address, ProxyStream, TlsContext, TunnelError};
use crate::config::types::Config;

use super::chain::TunnelPlan;
use super::session::{EstablishedTunnel, SessionOptions, TunnelSession};
use super::{ApplicationFactory, ApplicationProtocol, HopSpec};

const READ_CHUNK: usize = 16 * 1024;

/// A configured proxy chain. Every `connect*` call negotiates a fresh
/// session over a fresh connection.
#[derive(Debug, Clone)]
pub struct Tunnel {
    hops: Arc<[HopSpec]>,
    options: SessionOptions,
}

impl Tunnel {
    pub fn new(hops: Vec<HopSpec>) -> Self {
        Self {
            hops: hops.into(),
            options: SessionOptions::default(),
        }
    }

    /// A direct connection, no proxies.
    pub fn direct() -> Self {
        Self::new(Vec::new())
    }

    pub fn from_config(config: &Config) -> Result<Self, TunnelError> {
        let mut tunnel = Self::new(config.hops()?);
        tunnel.options.dialer = config.dialer.clone();
        tunnel.options.handshake_timeout = config.handshake_timeout();
        Ok(tunnel)
    }

    pub fn with_tls(mut self, tls: TlsContext) -> Self {
        self.options.tls = Some(tls);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.options.dialer.connect_timeout_ms =
            Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.options.handshake_timeout = Some(timeout);
        self
    }

    pub fn with_bind_address(mut self, bind: std::net::IpAddr) -> Self {
        self.options.dialer.bind_address = Some(bind.to_string());
        self
    }

    pub fn hops(&self) -> &[HopSpec] {
        &self.hops
    }

    pub fn session(&self, target: &Address) -> TunnelSession {
        TunnelSession::new(TunnelPlan::new(&self.hops, target), self.options.clone())
    }

    /// Negotiate the chain and return the stream, leftover bytes first.
    pub async fn connect_stream(&self, target: &Address) -> Result<ProxyStream, TunnelError> {
        let tunnel = self.session(target).establish().await?;
        Ok(tunnel.into_stream())
    }

    /// Negotiate in the background and hand the result to `factory`:
    /// `build_protocol` on success, `connection_failed` (once) otherwise.
    pub fn connect(&self, target: Address, factory: Arc<dyn ApplicationFactory>) -> TunnelHandle {
        let cancel = CancellationToken::new();
        let session = self.session(&target).with_cancel(cancel.clone());
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            drive(session, factory, token).await;
        });

        TunnelHandle { cancel, task }
    }
}

/// Handle to a session started with [`Tunnel::connect`].
pub struct TunnelHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TunnelHandle {
    /// Close the connection, whatever stage the session has reached.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Wait until the session and its application protocol are done.
    pub async fn join(self) -> Result<(), tokio::task::JoinError> {
        self.task.await
    }
}

/// Why the application protocol's connection ended.
#[derive(Debug)]
pub enum CloseReason {
    /// The protocol asked for the close through [`Transport::close`].
    Local,
    /// The remote end closed the tunnel.
    PeerClosed,
    /// The tunnel handle was closed.
    Cancelled,
    Error(io::Error),
}

/// Write side of an established tunnel, as seen by the application protocol.
pub struct Transport {
    stream: ProxyStream,
    closing: bool,
}

impl Transport {
    fn new(stream: ProxyStream) -> Self {
        Self {
            stream,
            closing: false,
        }
    }

    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.closing {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "transport is closing",
            ));
        }
        self.stream.write_all(data).await?;
        self.stream.flush().await
    }

    /// Close once the current callback returns.
    pub fn close(&mut self) {
        self.closing = true;
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }
}

async fn drive(mut session: TunnelSession, factory: Arc<dyn ApplicationFactory>, cancel: CancellationToken) {
    match session.establish().await {
        Ok(tunnel) => {
            let protocol = factory.build_protocol();
            deliver(tunnel, protocol, cancel).await;
        }
        Err(e) => factory.connection_failed(e),
    }
}

/// Run the application protocol until the tunnel closes.
async fn deliver(tunnel: EstablishedTunnel, mut protocol: Box<dyn ApplicationProtocol>, cancel: CancellationToken) {
    let EstablishedTunnel { stream, leftover } = tunnel;
    let mut transport = Transport::new(stream);

    protocol.connection_made(&mut transport).await;
    if !leftover.is_empty() && !transport.is_closing() {
        protocol.data_received(&mut transport, leftover).await;
    }

    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    let reason = loop {
        if transport.is_closing() {
            break CloseReason::Local;
        }
        buf.reserve(READ_CHUNK);
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => break CloseReason::Cancelled,
            read = transport.stream.read_buf(&mut buf) => read,
        };
        match read {
            Ok(0) => break CloseReason::PeerClosed,
            Ok(_) => {
                let data = buf.split().freeze();
                protocol.data_received(&mut transport, data).await;
            }
            Err(e) => {
                warn!(error = %e, "tunnel read failed");
                break CloseReason::Error(e);
            }
        }
    };

    let _ = transport.stream.shutdown().await;
    debug!(reason = ?reason, "tunnel connection closed");
    protocol.connection_lost(reason).await;
}
