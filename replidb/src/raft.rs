//! Interface of the consensus engine this node drives.
//!
//! The engine itself (leader election, log persistence, snapshotting) is
//! an external library; the node hands it a transport adapter, the
//! replication FSM and the data directory, and drives its lifecycle.

use async_trait::async_trait;
use camino::Utf8PathBuf;
use thiserror::Error;

use crate::config::{NodeId, Tuning};
use crate::fsm::ReplicationFsm;
use crate::proxy::RaftProxy;

#[derive(Debug, Error)]
pub enum RaftError {
    /// A configuration already exists; bootstrap is a one-time operation.
    #[error("a cluster configuration already exists")]
    CantBootstrap,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One member of a cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationEntry {
    pub id: NodeId,
    pub address: String,
    pub voter: bool,
}

/// A cluster membership set, as persisted by the consensus engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    entries: Vec<ConfigurationEntry>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: NodeId, address: impl Into<String>, voter: bool) {
        self.entries.push(ConfigurationEntry {
            id,
            address: address.into(),
            voter,
        });
    }

    pub fn entries(&self) -> &[ConfigurationEntry] {
        &self.entries
    }
}

/// Everything the engine needs at start: the transport adapter it
/// consumes for peer I/O, the state machine applying committed entries,
/// the directory it owns for persistence, and the timing knobs.
pub struct RaftContext {
    pub transport: RaftProxy,
    pub fsm: Box<dyn ReplicationFsm>,
    pub data_dir: Utf8PathBuf,
    pub tuning: Tuning,
}

/// The consensus engine contract, as consumed by the node controller.
///
/// `bootstrap` and `recover` run on the caller's thread while the node is
/// stopped; `start` and `close` run on the loop thread.
#[async_trait]
pub trait Raft: Send + 'static {
    /// Creates the initial cluster configuration, failing with
    /// [`RaftError::CantBootstrap`] when one already exists.
    fn bootstrap(&mut self, configuration: Configuration) -> Result<(), RaftError>;

    /// Overwrites the persisted configuration. Operator action; see
    /// [`crate::Node::recover`].
    fn recover(&mut self, configuration: Configuration) -> Result<(), RaftError>;

    /// Brings the engine up on the loop thread. Once this returns the
    /// engine is expected to have installed its accept listener via
    /// [`RaftProxy::listen`].
    async fn start(&mut self, context: RaftContext) -> Result<(), RaftError>;

    /// Winds the engine down; peer I/O stops before this returns.
    async fn close(&mut self);
}
