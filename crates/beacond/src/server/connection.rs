//! Subscriber connections that the hub can close from outside the HTTP stack.
//!
//! hyper drives each accepted connection on a task of its own. A response
//! body blocked on a client that stopped reading is never polled again, so
//! ending the subscription stream alone cannot reach that connection.
//! Every accepted socket therefore carries a [`CancellationToken`].
//! Cancelling it fails the next read or write, and hyper then drops the
//! connection and closes the socket.

use std::future::Future;
use std::io::{self, IoSlice};
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::connect_info::Connected;
use axum::serve::{IncomingStream, Listener};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFutureOwned};
use tracing::{debug, error};

/// Pause after an accept error that is not specific to one connection
const ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// TCP listener whose accepted sockets share a parent close token.
pub struct ConnectionListener {
    inner: TcpListener,
    connections: CancellationToken,
}

impl ConnectionListener {
    /// Wraps `inner`. Cancelling `connections` closes every accepted socket.
    pub fn new(inner: TcpListener, connections: CancellationToken) -> Self {
        Self { inner, connections }
    }
}

impl Listener for ConnectionListener {
    type Io = ConnectionStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.inner.accept().await {
                Ok((stream, addr)) => {
                    let close = self.connections.child_token();
                    return (ConnectionStream::new(stream, close), addr);
                }
                Err(e) if is_connection_error(&e) => {
                    debug!(error = %e, "Connection failed during accept");
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}

/// An accepted socket that fails all I/O once its token is cancelled.
///
/// Dropping the stream cancels the token too, so anything waiting on it
/// learns that the connection is gone.
pub struct ConnectionStream {
    inner: TcpStream,
    close: CancellationToken,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
    _on_drop: DropGuard,
}

impl ConnectionStream {
    fn new(inner: TcpStream, close: CancellationToken) -> Self {
        Self {
            inner,
            closed: Box::pin(close.clone().cancelled_owned()),
            _on_drop: close.clone().drop_guard(),
            close,
        }
    }

    /// Returns the token that closes this connection.
    pub fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }

    /// Ready with the error to report once the connection is closed;
    /// otherwise registers the waker for cancellation.
    fn poll_closed(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        if self.close.is_cancelled() || self.closed.as_mut().poll(cx).is_ready() {
            Poll::Ready(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection closed by hub",
            ))
        } else {
            Poll::Pending
        }
    }
}

impl AsyncRead for ConnectionStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Poll::Ready(e) = self.poll_closed(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ConnectionStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Poll::Ready(e) = self.poll_closed(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        if let Poll::Ready(e) = self.poll_closed(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Poll::Ready(e) = self.poll_closed(cx) {
            return Poll::Ready(Err(e));
        }
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Per-connection data made available to handlers.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub remote_addr: SocketAddr,
    close: CancellationToken,
}

impl ConnectionInfo {
    /// Returns the token that closes this connection.
    pub fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }
}

impl Connected<IncomingStream<'_, ConnectionListener>> for ConnectionInfo {
    fn connect_info(stream: IncomingStream<'_, ConnectionListener>) -> Self {
        Self {
            remote_addr: *stream.remote_addr(),
            close: stream.io().close_token(),
        }
    }
}
