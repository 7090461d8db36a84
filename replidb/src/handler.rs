use async_trait::async_trait;
use bytes::Bytes;

use crate::stream::NodeStream;

/// A demultiplexed client connection: the stream positioned right after
/// the protocol preface, plus any bytes the demultiplexer had to consume
/// to make its decision (the first frame header, re-played verbatim).
pub struct ClientStream {
    pub stream: NodeStream,
    pub leftover: Bytes,
}

/// Serves SQL clients once a connection has been identified as such.
///
/// Request parsing, statement execution and response framing live in the
/// embedding database engine; the node only routes streams here.
#[async_trait]
pub trait ClientHandler: Send + Sync + 'static {
    async fn serve(&self, client: ClientStream) -> anyhow::Result<()>;
}

/// Default handler for nodes that have no serving layer wired in: the
/// stream is closed right away.
pub(crate) struct DrainHandler;

#[async_trait]
impl ClientHandler for DrainHandler {
    async fn serve(&self, client: ClientStream) -> anyhow::Result<()> {
        warn!(peer = %client.stream.peer_label(), "no client handler installed; closing connection");
        Ok(())
    }
}
