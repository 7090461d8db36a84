//! One task per accepted stream. The first bytes decide what the stream
//! is: peer-replication streams identify themselves with a connect frame
//! right after the preface and are detached into the transport adapter;
//! everything else is a client and goes to the client handler.

use std::sync::Arc;

use anyhow::Context as _;
use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt as _;
use tokio::sync::Notify;

use crate::handler::{ClientHandler, ClientStream};
use crate::proxy::RaftProxy;
use crate::registry::{ConnId, RegistryHandle};
use crate::stream::NodeStream;
use crate::wire;

pub(crate) struct Conn {
    pub(crate) id: ConnId,
    pub(crate) stream: NodeStream,
    pub(crate) proxy: RaftProxy,
    pub(crate) handler: Arc<dyn ClientHandler>,
    pub(crate) registry: RegistryHandle,
    pub(crate) kill: Arc<Notify>,
}

impl Conn {
    #[instrument("conn", skip_all, fields(id = self.id, peer = %self.stream.peer_label()))]
    pub(crate) async fn run(self) {
        let Conn {
            id,
            stream,
            proxy,
            handler,
            registry,
            kill,
        } = self;

        let outcome = tokio::select! {
            outcome = serve(stream, &proxy, handler.as_ref()) => outcome,
            _ = kill.notified() => Ok(()),
        };

        if let Err(error) = outcome {
            debug!(error = format!("{error:#}"), "connection ended with an error");
        }

        // The registry may already be gone while the node shuts down.
        if let Err(error) = registry.remove(id).await {
            debug!(error = format!("{error:#}"), "couldn't unregister connection");
        }
    }
}

async fn serve(mut stream: NodeStream, proxy: &RaftProxy, handler: &dyn ClientHandler) -> anyhow::Result<()> {
    let mut preface = [0u8; 8];
    stream
        .read_exact(&mut preface)
        .await
        .context("couldn't read the protocol preface")?;
    wire::check_preface(preface)?;

    let mut head = [0u8; wire::Header::SIZE];
    stream
        .read_exact(&mut head)
        .await
        .context("couldn't read the first frame header")?;
    let header = wire::Header::decode(head)?;

    if header.kind == wire::FRAME_CONNECT {
        let mut body = vec![0u8; header.body_len()];
        stream
            .read_exact(&mut body)
            .await
            .context("couldn't read the connect frame")?;
        let (peer_id, peer_address) = wire::decode_connect(&body)?;

        trace!(peer_id, %peer_address, "inbound peer-replication stream");
        proxy.accept(peer_id, peer_address, stream);
        return Ok(());
    }

    // A client: hand the stream over with the header we consumed.
    handler
        .serve(ClientStream {
            stream,
            leftover: replay_header(&head),
        })
        .await
}

fn replay_header(head: &[u8; wire::Header::SIZE]) -> Bytes {
    let mut leftover = BytesMut::with_capacity(wire::Header::SIZE);
    leftover.extend_from_slice(head);
    leftover.freeze()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::BufMut as _;
    use tokio::io::AsyncWriteExt as _;

    use super::*;

    fn socket_pair() -> (NodeStream, tokio::net::UnixStream) {
        let (server, client) = tokio::net::UnixStream::pair().unwrap();
        (NodeStream::Local(server), client)
    }

    struct RecordingHandler {
        served: Mutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl ClientHandler for RecordingHandler {
        async fn serve(&self, client: ClientStream) -> anyhow::Result<()> {
            self.served.lock().unwrap().push(client.leftover);
            Ok(())
        }
    }

    #[tokio::test]
    async fn connect_frame_detaches_the_stream_to_the_proxy() {
        let proxy = RaftProxy::new();
        let mut peers = proxy.listen();
        let handler = Arc::new(RecordingHandler {
            served: Mutex::new(Vec::new()),
        });

        let (server, mut client) = socket_pair();

        let mut buf = BytesMut::new();
        wire::encode_preface(&mut buf);
        wire::encode_connect(42, "10.1.1.2:9001", &mut buf);
        client.write_all(&buf).await.unwrap();

        serve(server, &proxy, handler.as_ref()).await.unwrap();

        let peer = peers.accept().await.unwrap();
        assert_eq!(peer.id, 42);
        assert_eq!(peer.address, "10.1.1.2:9001");
        assert!(handler.served.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn other_frames_reach_the_client_handler_with_the_header() {
        let proxy = RaftProxy::new();
        let handler = Arc::new(RecordingHandler {
            served: Mutex::new(Vec::new()),
        });

        let (server, mut client) = socket_pair();

        let mut buf = BytesMut::new();
        wire::encode_preface(&mut buf);
        let header = wire::Header {
            words: 1,
            kind: 0x10,
            flags: 0,
            extra: 0,
        };
        header.encode(&mut buf);
        buf.put_u64_le(0); // frame body, left for the handler
        client.write_all(&buf).await.unwrap();

        serve(server, &proxy, handler.as_ref()).await.unwrap();

        let served = handler.served.lock().unwrap();
        assert_eq!(served.len(), 1);
        let replayed = wire::Header::decode(served[0].as_ref().try_into().unwrap()).unwrap();
        assert_eq!(replayed, header);
    }

    #[tokio::test]
    async fn bad_preface_fails_the_connection() {
        let proxy = RaftProxy::new();
        let handler = Arc::new(RecordingHandler {
            served: Mutex::new(Vec::new()),
        });

        let (server, mut client) = socket_pair();
        client.write_all(&0xbad0_bad0u64.to_le_bytes()).await.unwrap();

        let error = serve(server, &proxy, handler.as_ref()).await.unwrap_err();
        assert!(error.downcast_ref::<wire::FrameError>().is_some());
    }
}
