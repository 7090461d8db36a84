//! Interface of the replication state machine: the component that applies
//! committed log entries (WAL frames of the replicated databases) to the
//! local SQL state. Implemented by the embedding database engine.

use bytes::Bytes;

/// A committed log entry handed down by the consensus engine.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub data: Bytes,
}

pub trait ReplicationFsm: Send + 'static {
    /// Applies one committed entry. Runs on the loop thread.
    fn apply(&mut self, entry: &LogEntry) -> anyhow::Result<()>;

    /// Captures the current state for snapshotting.
    fn snapshot(&mut self) -> anyhow::Result<Bytes>;

    /// Replaces the current state with a snapshot.
    fn restore(&mut self, snapshot: Bytes) -> anyhow::Result<()>;
}
