use std::time::Duration;

use camino::Utf8PathBuf;

/// Identifies a node within its cluster. Positive, unique, and stable
/// across restarts; the bootstrap node must use [`BOOTSTRAP_NODE_ID`].
pub type NodeId = u64;

/// The identity that bootstraps a fresh cluster.
pub const BOOTSTRAP_NODE_ID: NodeId = 1;

/// Smallest accepted one-way network latency: 500 microseconds.
pub(crate) const MIN_NETWORK_LATENCY_NS: u64 = 500 * 1000;

/// Static per-node configuration, fixed at build time.
///
/// `address` is what peers and clients dial to reach this node; `data_dir`
/// is handed through to the consensus engine, which owns everything
/// persisted there.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub id: NodeId,
    pub address: String,
    pub data_dir: Utf8PathBuf,
}

/// Consensus timing and snapshotting knobs handed to the engine at start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tuning {
    pub election_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub snapshot_threshold: u64,
    pub snapshot_trailing: u64,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            election_timeout: Duration::from_millis(3000),
            heartbeat_timeout: Duration::from_millis(500),
            snapshot_threshold: 1024,
            snapshot_trailing: 8192,
        }
    }
}

impl Tuning {
    /// Derives the consensus timeouts from an average one-way network
    /// latency: heartbeat = 1.5x the latency in whole milliseconds,
    /// election = 15x. Returns false when the latency is below the
    /// accepted minimum, leaving the tuning untouched.
    #[must_use]
    pub(crate) fn set_network_latency(&mut self, nanoseconds: u64) -> bool {
        if nanoseconds < MIN_NETWORK_LATENCY_NS {
            return false;
        }

        let milliseconds = nanoseconds / (1000 * 1000);
        self.heartbeat_timeout = Duration::from_millis((milliseconds * 15) / 10);
        self.election_timeout = Duration::from_millis(milliseconds * 15);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_below_minimum_is_rejected() {
        let mut tuning = Tuning::default();
        assert!(!tuning.set_network_latency(100_000));
        assert_eq!(tuning, Tuning::default());
    }

    #[test]
    fn latency_derives_both_timeouts() {
        let mut tuning = Tuning::default();
        assert!(tuning.set_network_latency(1_000_000_000));
        assert_eq!(tuning.heartbeat_timeout, Duration::from_millis(1500));
        assert_eq!(tuning.election_timeout, Duration::from_millis(15_000));
    }

    #[test]
    fn sub_millisecond_latency_truncates() {
        let mut tuning = Tuning::default();
        assert!(tuning.set_network_latency(500_000));
        assert_eq!(tuning.heartbeat_timeout, Duration::from_millis(0));
        assert_eq!(tuning.election_timeout, Duration::from_millis(0));
    }
}
