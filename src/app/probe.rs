//! Connectivity probe run over a tunnel.
//!
//! Sends `HEAD /` to the target and checks the response status line. A
//! 200 or 3xx redirect (300 to 307) counts as working; anything else, a
//! malformed response, or a connection that ends before a response, does
//! not.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::common::{Address, TunnelError};
use crate::proxy::{ApplicationFactory, ApplicationProtocol, CloseReason, Transport, Tunnel};

const MAX_RESPONSE_HEAD: usize = 64 * 1024;
const ACCEPTED_STATUS: &[&str] = &[
    "200", "300", "301", "302", "303", "304", "305", "306", "307",
];

/// Result of one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ok { status: u16 },
    NotOk { reason: String },
}

impl ProbeOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, ProbeOutcome::Ok { .. })
    }

    fn not_ok(reason: impl Into<String>) -> Self {
        ProbeOutcome::NotOk {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeOutcome::Ok { .. } => f.write_str("test OK"),
            ProbeOutcome::NotOk { .. } => f.write_str("test NOT OK"),
        }
    }
}

/// Delivers the outcome once; later reports are dropped.
struct Reporter {
    tx: Mutex<Option<oneshot::Sender<ProbeOutcome>>>,
}

impl Reporter {
    fn report(&self, outcome: ProbeOutcome) {
        let sender = self
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(tx) = sender {
            match &outcome {
                ProbeOutcome::Ok { status } => info!(status, "test OK"),
                ProbeOutcome::NotOk { reason } => info!(reason = reason.as_str(), "test NOT OK"),
            }
            let _ = tx.send(outcome);
        }
    }
}

/// Parse a complete response head. `None` means the head is not complete yet.
fn check_response(head: &[u8]) -> Option<ProbeOutcome> {
    let end = head.windows(4).position(|w| w == b"\r\n\r\n")?;
    let head = String::from_utf8_lossy(&head[..end]);
    let status_line = head.split("\r\n").next().unwrap_or_default();

    let fields: Vec<&str> = status_line.splitn(3, ' ').collect();
    if fields.len() != 3 {
        return Some(ProbeOutcome::not_ok(format!(
            "malformed status line: {:?}",
            status_line
        )));
    }
    let code = fields[1];
    if !ACCEPTED_STATUS.contains(&code) {
        return Some(ProbeOutcome::not_ok(format!("status {}", code)));
    }
    match code.parse::<u16>() {
        Ok(status) => Some(ProbeOutcome::Ok { status }),
        Err(_) => Some(ProbeOutcome::not_ok(format!("status {}", code))),
    }
}

/// The `HEAD /` application protocol.
pub struct HeadProbe {
    host: String,
    buffer: BytesMut,
    answered: bool,
    reporter: Arc<Reporter>,
}

#[async_trait]
impl ApplicationProtocol for HeadProbe {
    async fn connection_made(&mut self, transport: &mut Transport) {
        let request = format!("HEAD / HTTP/1.1\r\nHost: {}\r\n\r\n", self.host);
        debug!(host = %self.host, "sending probe request");
        if let Err(e) = transport.write(request.as_bytes()).await {
            warn!(error = %e, "probe request write failed");
            self.answered = true;
            self.reporter
                .report(ProbeOutcome::not_ok(format!("write failed: {}", e)));
            transport.close();
        }
    }

    async fn data_received(&mut self, transport: &mut Transport, data: Bytes) {
        if self.answered {
            return;
        }
        self.buffer.extend_from_slice(&data);

        let outcome = match check_response(&self.buffer) {
            Some(outcome) => outcome,
            None if self.buffer.len() > MAX_RESPONSE_HEAD => {
                ProbeOutcome::not_ok("response head too large")
            }
            None => return,
        };
        self.answered = true;
        self.reporter.report(outcome);
        transport.close();
    }

    async fn connection_lost(&mut self, reason: CloseReason) {
        if !self.answered {
            self.reporter.report(ProbeOutcome::not_ok(format!(
                "connection closed before a response: {:?}",
                reason
            )));
        }
    }
}

/// Builds [`HeadProbe`]s and turns tunnel failures into `NOT OK`.
pub struct ProbeFactory {
    host: String,
    reporter: Arc<Reporter>,
}

impl ProbeFactory {
    pub fn new(host: impl Into<String>) -> (Arc<Self>, oneshot::Receiver<ProbeOutcome>) {
        let (tx, rx) = oneshot::channel();
        let factory = Arc::new(Self {
            host: host.into(),
            reporter: Arc::new(Reporter {
                tx: Mutex::new(Some(tx)),
            }),
        });
        (factory, rx)
    }
}

impl ApplicationFactory for ProbeFactory {
    fn build_protocol(&self) -> Box<dyn ApplicationProtocol> {
        Box::new(HeadProbe {
            host: self.host.clone(),
            buffer: BytesMut::new(),
            answered: false,
            reporter: self.reporter.clone(),
        })
    }

    fn connection_failed(&self, error: TunnelError) {
        warn!(kind = error.kind().as_str(), error = %error, "probe tunnel failed");
        self.reporter
            .report(ProbeOutcome::not_ok(format!("tunnel failed: {}", error)));
    }
}

/// Probe `target` through `tunnel`. `limit` bounds the whole run.
pub async fn run_probe(tunnel: &Tunnel, target: Address, limit: Option<Duration>) -> ProbeOutcome {
    let (factory, outcome) = ProbeFactory::new(target.host());
    let handle = tunnel.connect(target, factory);

    let result = match limit {
        Some(limit) => match tokio::time::timeout(limit, outcome).await {
            Ok(result) => result,
            Err(_) => {
                handle.close();
                return ProbeOutcome::not_ok("probe timed out");
            }
        },
        None => outcome.await,
    };

    handle.close();
    let _ = handle.join().await;
    result.unwrap_or_else(|_| ProbeOutcome::not_ok("probe ended without a result"))
}
