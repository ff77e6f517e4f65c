use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::common::{Address, TunnelError};

use super::handshake::{HandshakeCodec, HandshakeResult};
use super::HopSpec;

const READ_CHUNK: usize = 4096;

/// Drives one hop's handshake over the shared connection.
///
/// `negotiate` consumes the negotiator, so it reports success or failure
/// exactly once and cannot touch the connection afterwards.
#[derive(Debug)]
pub struct HopNegotiator {
    index: usize,
    hop: Address,
    target: Address,
    codec: HandshakeCodec,
    buffer: BytesMut,
}

impl HopNegotiator {
    pub fn new(index: usize, hop: &HopSpec, target: Address) -> Self {
        Self {
            index,
            hop: hop.address.clone(),
            codec: HandshakeCodec::new(hop, target.clone()),
            target,
            buffer: BytesMut::new(),
        }
    }

    /// Write the request, then decode `pending` followed by whatever the hop
    /// sends until the reply is complete. Returns the bytes that followed the
    /// reply.
    pub async fn negotiate<S>(mut self, stream: &mut S, pending: Bytes) -> Result<Bytes, TunnelError>
    where
        S: AsyncRead + AsyncWrite + Unpin + ?Sized,
    {
        debug!(
            hop = self.index,
            proxy = %self.hop,
            kind = %self.codec.kind(),
            target = %self.target,
            "negotiating hop"
        );

        let request = self.codec.request();
        write_flush(stream, &request).await?;

        self.buffer.extend_from_slice(&pending);

        loop {
            match self.codec.decode(&mut self.buffer)? {
                HandshakeResult::Success(leftover) => {
                    debug!(
                        hop = self.index,
                        proxy = %self.hop,
                        leftover = leftover.len(),
                        "hop tunnel open"
                    );
                    return Ok(leftover);
                }
                HandshakeResult::Send(next) => {
                    write_flush(stream, &next).await?;
                }
                HandshakeResult::NeedMoreData => {
                    self.buffer.reserve(READ_CHUNK);
                    let n = stream
                        .read_buf(&mut self.buffer)
                        .await
                        .map_err(TunnelError::from_transport)?;
                    if n == 0 {
                        debug!(hop = self.index, proxy = %self.hop, "hop closed during handshake");
                        return Err(TunnelError::PeerClosed);
                    }
                    trace!(hop = self.index, bytes = n, "handshake bytes received");
                }
            }
        }
    }
}

async fn write_flush<S>(stream: &mut S, data: &[u8]) -> Result<(), TunnelError>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    stream
        .write_all(data)
        .await
        .map_err(TunnelError::from_transport)?;
    stream.flush().await.map_err(TunnelError::from_transport)
}
