use std::any::Any;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// 隧道流类型别名：任何实现了 AsyncRead + AsyncWrite + Send + Unpin 的类型
pub type ProxyStream = Box<dyn AsyncStream>;

/// 异步流 trait，组合 AsyncRead + AsyncWrite
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {
    fn as_any(&self) -> &dyn Any;
}

/// 为所有满足约束的类型自动实现 AsyncStream
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> AsyncStream for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// 带前缀缓冲的流：先读取握手剩余的数据，然后读取底层流
///
/// Handshake leftovers are replayed through this wrapper so the next layer
/// sees them before any byte that arrives later on the connection.
pub struct PrefixedStream {
    prefix: Bytes,
    inner: ProxyStream,
}

impl PrefixedStream {
    pub fn new(prefix: Bytes, inner: ProxyStream) -> Self {
        Self { prefix, inner }
    }

    /// Wrap only when there is something to replay.
    pub fn wrap(prefix: Bytes, inner: ProxyStream) -> ProxyStream {
        if prefix.is_empty() {
            inner
        } else {
            Box::new(Self::new(prefix, inner))
        }
    }

    pub fn prefix_remaining(&self) -> usize {
        self.prefix.len()
    }
}

impl AsyncRead for PrefixedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.prefix.is_empty() {
            let to_copy = self.prefix.len().min(buf.remaining());
            let chunk = self.prefix.split_to(to_copy);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrefixedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn prefix_is_read_before_inner() {
        let (client, mut server) = tokio::io::duplex(64);
        server.write_all(b" world").await.unwrap();
        drop(server);

        let mut stream = PrefixedStream::wrap(Bytes::from_static(b"hello"), Box::new(client));
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn prefix_split_across_small_reads() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);

        let mut stream = PrefixedStream::new(Bytes::from_static(b"abcdef"), Box::new(client));
        let mut small = [0u8; 4];
        let n = stream.read(&mut small).await.unwrap();
        assert_eq!(&small[..n], b"abcd");
        assert_eq!(stream.prefix_remaining(), 2);
        let n = stream.read(&mut small).await.unwrap();
        assert_eq!(&small[..n], b"ef");
        assert_eq!(stream.read(&mut small).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn empty_prefix_is_not_wrapped() {
        let (client, _server) = tokio::io::duplex(64);
        let stream = PrefixedStream::wrap(Bytes::new(), Box::new(client));
        assert!((*stream).as_any().downcast_ref::<PrefixedStream>().is_none());

        let (client, _server) = tokio::io::duplex(64);
        let stream = PrefixedStream::wrap(Bytes::from_static(b"x"), Box::new(client));
        assert!((*stream).as_any().downcast_ref::<PrefixedStream>().is_some());
    }
}
