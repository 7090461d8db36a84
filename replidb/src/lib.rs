//! Node orchestration core for a replicated embedded-SQL database.
//!
//! A [`Node`] participates in a cluster that jointly maintains a set of
//! SQL databases, replicating state changes (write-ahead-log frames)
//! through a consensus engine. This crate covers the node lifecycle, the
//! transport adapter bridging the consensus engine to the network, and
//! the intake/dispatch machinery for the shared listening endpoint; the
//! consensus engine, the replication state machine and the SQL serving
//! layer are plugged in behind traits.

#[macro_use]
extern crate tracing;

pub mod bind_addr;
pub mod config;
pub mod dial;
pub mod fsm;
pub mod handler;
pub mod node;
pub mod proxy;
pub mod raft;
pub mod stream;
pub mod vfs;
pub mod wire;

mod conn;
mod listener;
#[cfg(unix)]
mod local;
mod registry;

pub use bind_addr::{BadBindAddr, BindAddr};
pub use config::{NodeConfig, NodeId, Tuning, BOOTSTRAP_NODE_ID};
pub use dial::{ConnectFunc, DialCx, DialError};
pub use fsm::{LogEntry, ReplicationFsm};
pub use handler::{ClientHandler, ClientStream};
pub use node::{Node, NodeBuilder, NodeError, NodeInfo};
pub use proxy::{PeerConn, PeerListener, RaftProxy};
pub use raft::{Configuration, ConfigurationEntry, Raft, RaftContext, RaftError};
pub use stream::{NodeStream, StdStream};
pub use vfs::Vfs;
