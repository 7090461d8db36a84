//! Outbound peer dialing.
//!
//! The dialer supplied by the embedder may block for seconds on DNS and
//! the TCP handshake, so it must never run on the loop thread: every dial
//! is shipped to the blocking worker pool, and the dialer can only be
//! invoked with a [`DialCx`] token that the dispatcher alone constructs
//! there. Completion resumes on the loop thread, exactly once.

use std::io::{self, Write as _};
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;

use crate::bind_addr::BindAddr;
use crate::config::NodeId;
use crate::stream::{NodeStream, StdStream};
use crate::wire;

/// Proof that the caller is on a blocking worker. Only the dispatcher
/// creates one, which keeps user dialers off the event loop.
pub struct DialCx(());

/// User-pluggable dialer: blocks until a stream to `address` is
/// established or fails. The returned descriptor must be a connected TCP
/// or local-domain stream.
pub trait ConnectFunc: Send + Sync + 'static {
    fn connect(&self, cx: &DialCx, address: &str) -> io::Result<StdStream>;
}

impl<F> ConnectFunc for F
where
    F: Fn(&DialCx, &str) -> io::Result<StdStream> + Send + Sync + 'static,
{
    fn connect(&self, cx: &DialCx, address: &str) -> io::Result<StdStream> {
        self(cx, address)
    }
}

/// Every dial failure collapses into this one status; the underlying
/// cause is kept for the logs.
#[derive(Debug, Error)]
#[error("could not establish a connection to {address}")]
pub struct DialError {
    pub address: String,
    #[source]
    pub source: io::Error,
}

/// The built-in dialer: resolves the endpoint syntax and connects
/// directly. Unparseable addresses surface as connection failures, not as
/// misuse, since the peer address comes from cluster configuration.
pub(crate) struct DefaultConnect;

impl ConnectFunc for DefaultConnect {
    fn connect(&self, _cx: &DialCx, address: &str) -> io::Result<StdStream> {
        let parsed = BindAddr::parse(address)
            .map_err(|error| io::Error::new(io::ErrorKind::ConnectionRefused, error))?;

        match parsed {
            BindAddr::Tcp { .. } => {
                let addr = parsed.resolve()?;
                Ok(StdStream::Tcp(std::net::TcpStream::connect(addr)?))
            }
            #[cfg(target_os = "linux")]
            BindAddr::Local { path: Some(path) } => {
                use std::os::linux::net::SocketAddrExt as _;

                let addr = std::os::unix::net::SocketAddr::from_abstract_name(path.as_bytes())?;
                Ok(StdStream::Local(std::os::unix::net::UnixStream::connect_addr(&addr)?))
            }
            BindAddr::Local { .. } => Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "local-domain address cannot be dialed here",
            )),
        }
    }
}

/// Dials `address` on the worker pool and performs the outbound
/// handshake: the protocol preface, then a connect frame identifying this
/// node. Resolves on the loop thread with the connected stream or a
/// [`DialError`]; failed dials close their descriptor on the worker.
#[instrument("dial", skip_all, fields(peer = peer_id, address = %address))]
pub(crate) async fn establish(
    connect: Arc<dyn ConnectFunc>,
    self_id: NodeId,
    self_address: String,
    peer_id: NodeId,
    address: String,
) -> Result<NodeStream, DialError> {
    let worker_address = address.clone();

    let work = tokio::task::spawn_blocking(move || -> Result<StdStream, io::Error> {
        let cx = DialCx(());
        let mut stream = connect.connect(&cx, &worker_address)?;

        let mut buf = BytesMut::new();
        wire::encode_preface(&mut buf);
        wire::encode_connect(self_id, &self_address, &mut buf);

        // A failure drops `stream`, closing the descriptor.
        stream.write_all(&buf)?;
        stream.flush()?;

        Ok(stream)
    });

    let outcome = match work.await {
        Ok(outcome) => outcome,
        Err(join_error) => Err(io::Error::other(join_error)),
    };

    outcome
        .and_then(StdStream::into_tokio)
        .map_err(|source| {
            debug!(error = format!("{source:#}"), %address, "dial failed");
            DialError { address, source }
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_dialer_rejects_bad_syntax_as_no_connection() {
        let cx = DialCx(());
        let error = DefaultConnect.connect(&cx, "").unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_dial_resolves_exactly_once_with_the_error() {
        let connect: Arc<dyn ConnectFunc> = Arc::new(|_: &DialCx, _: &str| -> io::Result<StdStream> {
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "nobody home"))
        });

        let error = establish(connect, 1, "127.0.0.1:9001".to_owned(), 2, "127.0.0.1:9002".to_owned())
            .await
            .unwrap_err();

        assert_eq!(error.address, "127.0.0.1:9002");
        assert_eq!(error.source.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test(flavor = "multi_thread")]
    async fn dial_performs_the_outbound_handshake() {
        use tokio::io::AsyncReadExt as _;

        let (listener, effective) = crate::local::bind_abstract(None).unwrap();
        listener.set_nonblocking(true).unwrap();
        let listener = tokio::net::UnixListener::from_std(listener).unwrap();

        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut preface = [0u8; 8];
            stream.read_exact(&mut preface).await.unwrap();
            crate::wire::check_preface(preface).unwrap();

            let mut head = [0u8; crate::wire::Header::SIZE];
            stream.read_exact(&mut head).await.unwrap();
            let header = crate::wire::Header::decode(head).unwrap();
            assert_eq!(header.kind, crate::wire::FRAME_CONNECT);

            let mut body = vec![0u8; header.body_len()];
            stream.read_exact(&mut body).await.unwrap();
            crate::wire::decode_connect(&body).unwrap()
        });

        let connect: Arc<dyn ConnectFunc> = Arc::new(DefaultConnect);
        let stream = establish(connect, 7, "127.0.0.1:9007".to_owned(), 8, effective)
            .await
            .unwrap();

        let (id, address) = accept.await.unwrap();
        assert_eq!(id, 7);
        assert_eq!(address, "127.0.0.1:9007");
        drop(stream);
    }
}
