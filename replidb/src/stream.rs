use std::io::{self, Write};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// A stream accepted or dialed by a node: TCP, or a local-domain socket
/// for in-process clients.
#[derive(Debug)]
pub enum NodeStream {
    Tcp(tokio::net::TcpStream),
    #[cfg(unix)]
    Local(tokio::net::UnixStream),
}

macro_rules! for_each_stream {
    ($stream:expr, |$var:ident| $operation:expr) => {{
        match $stream {
            NodeStream::Tcp($var) => $operation,
            #[cfg(unix)]
            NodeStream::Local($var) => $operation,
        }
    }};
}

impl NodeStream {
    /// Human-readable peer description for log records.
    pub fn peer_label(&self) -> String {
        match self {
            NodeStream::Tcp(stream) => stream
                .peer_addr()
                .map_or_else(|_| "tcp:unknown".to_owned(), |addr| addr.to_string()),
            #[cfg(unix)]
            NodeStream::Local(_) => "local".to_owned(),
        }
    }
}

impl From<tokio::net::TcpStream> for NodeStream {
    fn from(stream: tokio::net::TcpStream) -> Self {
        Self::Tcp(stream)
    }
}

#[cfg(unix)]
impl From<tokio::net::UnixStream> for NodeStream {
    fn from(stream: tokio::net::UnixStream) -> Self {
        Self::Local(stream)
    }
}

impl AsyncRead for NodeStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        for_each_stream!(self.get_mut(), |stream| Pin::new(stream).poll_read(cx, buf))
    }
}

impl AsyncWrite for NodeStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        for_each_stream!(self.get_mut(), |stream| Pin::new(stream).poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        for_each_stream!(self.get_mut(), |stream| Pin::new(stream).poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        for_each_stream!(self.get_mut(), |stream| Pin::new(stream).poll_shutdown(cx))
    }
}

/// The blocking counterpart of [`NodeStream`], produced by dialers on a
/// worker thread where no runtime is available yet.
#[derive(Debug)]
pub enum StdStream {
    Tcp(std::net::TcpStream),
    #[cfg(unix)]
    Local(std::os::unix::net::UnixStream),
}

impl StdStream {
    /// Registers the descriptor with the current runtime. Must be called
    /// from the loop thread.
    pub fn into_tokio(self) -> io::Result<NodeStream> {
        match self {
            StdStream::Tcp(stream) => {
                stream.set_nonblocking(true)?;
                Ok(NodeStream::Tcp(tokio::net::TcpStream::from_std(stream)?))
            }
            #[cfg(unix)]
            StdStream::Local(stream) => {
                stream.set_nonblocking(true)?;
                Ok(NodeStream::Local(tokio::net::UnixStream::from_std(stream)?))
            }
        }
    }
}

impl From<std::net::TcpStream> for StdStream {
    fn from(stream: std::net::TcpStream) -> Self {
        Self::Tcp(stream)
    }
}

#[cfg(unix)]
impl From<std::os::unix::net::UnixStream> for StdStream {
    fn from(stream: std::os::unix::net::UnixStream) -> Self {
        Self::Local(stream)
    }
}

impl Write for StdStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            StdStream::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            StdStream::Local(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            StdStream::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            StdStream::Local(stream) => stream.flush(),
        }
    }
}
