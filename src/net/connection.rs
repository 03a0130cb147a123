use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// An unencrypted byte stream — TCP or Unix socket.
pub enum PlainStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl AsyncRead for PlainStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PlainStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            PlainStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PlainStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            PlainStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            PlainStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PlainStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            PlainStream::Unix(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            PlainStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            PlainStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// The stream a Connection currently speaks over. TLS upgrade swaps the
/// variant in place.
enum Stream {
    Plain(PlainStream),
    ServerTls(Box<tokio_rustls::server::TlsStream<PlainStream>>),
    ClientTls(Box<tokio_rustls::client::TlsStream<PlainStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Stream::ServerTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
            Stream::ClientTls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Stream::ServerTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
            Stream::ClientTls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_flush(cx),
            Stream::ServerTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
            Stream::ClientTls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Stream::ServerTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
            Stream::ClientTls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Buffered connection endpoint with a queued outbound side.
///
/// Writers `queue` chunks and `flush` drains them in order, retaining any
/// unsent remainder; readers `recv` up to a bounded amount. The same wrapper
/// fronts plain TCP, Unix sockets, and both TLS directions, so the protocol
/// handler never cares which it holds.
pub struct Connection {
    stream: Option<Stream>,
    queue: VecDeque<Bytes>,
    closed: bool,
    tag: &'static str,
}

impl Connection {
    pub fn from_plain(stream: PlainStream, tag: &'static str) -> Self {
        Self {
            stream: Some(Stream::Plain(stream)),
            queue: VecDeque::new(),
            closed: false,
            tag,
        }
    }

    pub fn from_tcp(stream: TcpStream, tag: &'static str) -> Self {
        Self::from_plain(PlainStream::Tcp(stream), tag)
    }

    pub fn tag(&self) -> &'static str {
        self.tag
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn has_buffer(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Read up to `max` bytes. `Ok(None)` means the peer closed; a pending
    /// read simply parks on the reactor until the descriptor is readable.
    pub async fn recv(&mut self, max: usize) -> io::Result<Option<Bytes>> {
        if self.closed {
            return Ok(None);
        }
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return Ok(None),
        };
        let mut buf = BytesMut::with_capacity(max);
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            self.closed = true;
            return Ok(None);
        }
        Ok(Some(buf.freeze()))
    }

    /// Append a chunk to the outbound queue. Nothing hits the wire until
    /// `flush`.
    pub fn queue(&mut self, data: Bytes) {
        if !data.is_empty() {
            self.queue.push_back(data);
        }
    }

    /// Write queued chunks in order. A partially written chunk keeps its
    /// unsent remainder at the front of the queue. Returns bytes written.
    pub async fn flush(&mut self) -> io::Result<usize> {
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return Ok(0),
        };
        let mut written = 0;
        while let Some(chunk) = self.queue.front_mut() {
            let n = stream.write(chunk).await?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            written += n;
            if n == chunk.len() {
                self.queue.pop_front();
            } else {
                chunk.advance(n);
            }
        }
        stream.flush().await?;
        Ok(written)
    }

    /// Graceful close: TLS close_notify where applicable, then transport
    /// shutdown. Errors are ignored — the peer may already be gone.
    pub async fn shutdown(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            let _ = stream.shutdown().await;
        }
        self.closed = true;
    }

    /// After a `CONNECT`, re-point this connection at a TLS server session
    /// over the same transport. The handler observes nothing but the
    /// upgraded mode.
    pub async fn upgrade_server_tls(&mut self, acceptor: &TlsAcceptor) -> io::Result<()> {
        let plain = self.take_plain()?;
        let tls = acceptor.accept(plain).await?;
        self.stream = Some(Stream::ServerTls(Box::new(tls)));
        Ok(())
    }

    /// TLS client handshake toward the upstream, replacing the plain
    /// transport in place.
    pub async fn upgrade_client_tls(
        &mut self,
        connector: &TlsConnector,
        server_name: ServerName<'static>,
    ) -> io::Result<()> {
        let plain = self.take_plain()?;
        let tls = connector.connect(server_name, plain).await?;
        self.stream = Some(Stream::ClientTls(Box::new(tls)));
        Ok(())
    }

    fn take_plain(&mut self) -> io::Result<PlainStream> {
        match self.stream.take() {
            Some(Stream::Plain(plain)) => Ok(plain),
            other => {
                self.stream = other;
                Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "connection is already TLS-wrapped",
                ))
            }
        }
    }
}
