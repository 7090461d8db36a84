//! The transport adapter sitting between the consensus engine and the
//! node's networking: the engine sees four operations (`init`, `listen`,
//! `connect`, `close`), while the node feeds it inbound peer streams that
//! the connection layer demultiplexed off the shared listening port.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::NodeId;
use crate::dial::{self, ConnectFunc, DefaultConnect, DialError};
use crate::stream::NodeStream;

/// An inbound peer-replication stream, delivered to the consensus engine
/// in accept order.
pub struct PeerConn {
    pub id: NodeId,
    pub address: String,
    pub stream: NodeStream,
}

/// The engine's end of the accept channel, handed out by
/// [`RaftProxy::listen`].
pub struct PeerListener(mpsc::UnboundedReceiver<PeerConn>);

impl PeerListener {
    /// Next inbound peer stream; `None` once the adapter is closed and
    /// the backlog is drained.
    pub async fn accept(&mut self) -> Option<PeerConn> {
        self.0.recv().await
    }
}

struct Inner {
    id: NodeId,
    address: String,
    accept_tx: Option<mpsc::UnboundedSender<PeerConn>>,
    connect: Arc<dyn ConnectFunc>,
}

/// Cheaply cloneable handle; one adapter per node, shared between the
/// consensus engine, the connection layer, and the node controller.
#[derive(Clone)]
pub struct RaftProxy {
    inner: Arc<Mutex<Inner>>,
}

impl RaftProxy {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                id: 0,
                address: String::new(),
                accept_tx: None,
                connect: Arc::new(DefaultConnect),
            })),
        }
    }

    /// Stores the node's identity and self-advertised address, later sent
    /// in every outbound handshake. Called once before [`Self::listen`];
    /// idempotent.
    pub fn init(&self, id: NodeId, address: &str) {
        let mut inner = self.inner.lock();
        inner.id = id;
        inner.address = address.to_owned();
    }

    /// Begins delivering inbound peer streams. The returned listener is
    /// the accept callback of the transport contract: streams arriving
    /// while no listener is installed (before this call, or after
    /// [`Self::close`]) are dropped.
    pub fn listen(&self) -> PeerListener {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().accept_tx = Some(tx);
        PeerListener(rx)
    }

    /// Dials a peer on the worker pool and performs the outbound
    /// handshake. The returned future resolves exactly once, on the loop
    /// thread, with the connected stream or a no-connection error.
    pub fn connect(
        &self,
        peer_id: NodeId,
        address: &str,
    ) -> impl Future<Output = Result<NodeStream, DialError>> + Send + 'static {
        let (connect, self_id, self_address) = {
            let inner = self.inner.lock();
            (Arc::clone(&inner.connect), inner.id, inner.address.clone())
        };

        dial::establish(connect, self_id, self_address, peer_id, address.to_owned())
    }

    /// Stops accept deliveries; subsequent inbound peer streams are
    /// closed and dropped. Synchronous, like the rest of the contract.
    pub fn close(&self) {
        self.inner.lock().accept_tx = None;
    }

    /// Entry point for the connection layer: forwards a demultiplexed
    /// peer stream to the engine, or closes it when nobody listens.
    pub fn accept(&self, id: NodeId, address: String, stream: NodeStream) {
        let tx = self.inner.lock().accept_tx.clone();

        match tx {
            Some(tx) => {
                if let Err(rejected) = tx.send(PeerConn { id, address, stream }) {
                    let conn = rejected.0;
                    debug!(peer = conn.id, "peer listener is gone; dropping inbound stream");
                }
            }
            None => {
                debug!(peer = id, "no peer listener installed; dropping inbound stream");
            }
        }
    }

    pub(crate) fn set_connect_func(&self, connect: Arc<dyn ConnectFunc>) {
        self.inner.lock().connect = connect;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn pair() -> NodeStream {
        let (left, right) = std::os::unix::net::UnixStream::pair().unwrap();
        left.set_nonblocking(true).unwrap();
        drop(right);
        NodeStream::Local(tokio::net::UnixStream::from_std(left).unwrap())
    }

    #[tokio::test]
    async fn accepts_are_delivered_in_order() {
        let proxy = RaftProxy::new();
        let mut listener = proxy.listen();

        proxy.accept(2, "a".to_owned(), pair());
        proxy.accept(3, "b".to_owned(), pair());

        assert_eq!(listener.accept().await.unwrap().id, 2);
        assert_eq!(listener.accept().await.unwrap().id, 3);
    }

    #[tokio::test]
    async fn accept_without_listener_drops_the_stream() {
        let proxy = RaftProxy::new();
        // No listener yet.
        proxy.accept(2, "a".to_owned(), pair());

        let mut listener = proxy.listen();
        proxy.close();
        // Closed again: dropped, not queued.
        proxy.accept(3, "b".to_owned(), pair());

        assert!(listener.accept().await.is_none());
    }
}
