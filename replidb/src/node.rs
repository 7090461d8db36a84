//! The node controller: owns every subsystem, runs the event loop on a
//! dedicated thread, and coordinates start/ready/stop with the caller's
//! thread.

use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use camino::Utf8PathBuf;
use parking_lot::Mutex;
use replidb_task::{StopHandle, StopSignal, TaskSet};
use thiserror::Error;

use crate::bind_addr::{BadBindAddr, BindAddr};
use crate::config::{NodeConfig, NodeId, Tuning, BOOTSTRAP_NODE_ID};
use crate::dial::ConnectFunc;
use crate::fsm::ReplicationFsm;
use crate::handler::{ClientHandler, DrainHandler};
use crate::listener::{BoundListener, NodeListener};
use crate::proxy::RaftProxy;
use crate::raft::{Configuration, Raft, RaftContext, RaftError};
use crate::registry::{registry_channel, ConnRegistryTask, RegistryHandle, RegistryReceiver};
use crate::vfs::Vfs;

/// How long the stop path waits for client connections to wind down
/// before tearing the loop down anyway.
const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a dropped runtime may keep reaping its blocking workers.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum NodeError {
    /// A precondition was violated: reconfiguring a running node, a
    /// malformed bind address, a latency below the accepted minimum.
    #[error("node used incorrectly: {0}")]
    Misuse(&'static str),

    #[error("invalid bind address: {0}")]
    BadBindAddress(#[from] BadBindAddr),

    /// Everything else: socket and bind failures, loop setup failures,
    /// consensus engine failures.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl NodeError {
    /// True for the "library used incorrectly" class of failures.
    pub fn is_misuse(&self) -> bool {
        matches!(self, NodeError::Misuse(_) | NodeError::BadBindAddress(_))
    }
}

/// One surviving cluster member handed to [`Node::recover`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub address: String,
}

pub struct NodeBuilder {
    id: NodeId,
    address: String,
    data_dir: Utf8PathBuf,
    raft: Option<Box<dyn Raft>>,
    fsm: Option<Box<dyn ReplicationFsm>>,
    handler: Option<Arc<dyn ClientHandler>>,
}

impl NodeBuilder {
    /// The consensus engine this node drives. Required.
    #[must_use]
    pub fn raft(mut self, raft: impl Raft) -> Self {
        self.raft = Some(Box::new(raft));
        self
    }

    /// The replication state machine applying committed WAL frames.
    /// Required.
    #[must_use]
    pub fn fsm(mut self, fsm: impl ReplicationFsm) -> Self {
        self.fsm = Some(Box::new(fsm));
        self
    }

    /// The layer serving SQL clients. Optional; without one, client
    /// connections are closed on arrival.
    #[must_use]
    pub fn handler(mut self, handler: impl ClientHandler) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn build(self) -> Result<Node, NodeError> {
        if self.id < BOOTSTRAP_NODE_ID {
            return Err(NodeError::Misuse("node id must be a positive integer"));
        }

        let raft = self.raft.ok_or(NodeError::Misuse("a consensus engine is required"))?;
        let fsm = self.fsm.ok_or(NodeError::Misuse("a replication FSM is required"))?;

        let config = NodeConfig {
            id: self.id,
            address: self.address,
            data_dir: self.data_dir,
        };
        let vfs = Vfs::new(&config);

        Ok(Node {
            config,
            tuning: Tuning::default(),
            vfs,
            proxy: RaftProxy::new(),
            handler: self.handler.unwrap_or_else(|| Arc::new(DrainHandler)),
            raft: Some(raft),
            fsm: Some(fsm),
            bind: None,
            running: Arc::new(Mutex::new(false)),
            registry: None,
            state: NodeState::Stopped,
        })
    }
}

struct BoundState {
    /// Consumed when the loop thread takes over; a node is bound once.
    listener: Option<BoundListener>,
    address: String,
}

enum NodeState {
    Stopped,
    Running {
        stop_handle: StopHandle,
        thread: std::thread::JoinHandle<LoopExit>,
    },
}

/// A single database node: participates in the cluster's consensus,
/// accepts client and peer connections on one listening endpoint, and is
/// driven from the owning thread through `start`/`stop`.
pub struct Node {
    config: NodeConfig,
    tuning: Tuning,
    vfs: Vfs,
    proxy: RaftProxy,
    handler: Arc<dyn ClientHandler>,
    raft: Option<Box<dyn Raft>>,
    fsm: Option<Box<dyn ReplicationFsm>>,
    bind: Option<BoundState>,
    running: Arc<Mutex<bool>>,
    registry: Option<RegistryHandle>,
    state: NodeState,
}

impl Node {
    /// Starts building a node. `id` must be unique in the cluster and
    /// stable across restarts; the very first node of a new cluster must
    /// use id 1. `address` is what peers and clients dial to reach this
    /// node; `data_dir` is where the consensus engine persists its state.
    pub fn builder(id: NodeId, address: impl Into<String>, data_dir: impl Into<Utf8PathBuf>) -> NodeBuilder {
        NodeBuilder {
            id,
            address: address.into(),
            data_dir: data_dir.into(),
            raft: None,
            fsm: None,
            handler: None,
        }
    }

    pub fn id(&self) -> NodeId {
        self.config.id
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    /// The virtual file system the embedding SQL engine should register
    /// for this node's databases.
    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    fn is_started(&self) -> bool {
        matches!(self.state, NodeState::Running { .. })
    }

    /// Parses and binds the endpoint the node will listen on. Must be
    /// called before `start`; the effective endpoint is then available
    /// from [`Self::bind_address`] (for `"@"` the kernel picks the path).
    pub fn set_bind_address(&mut self, address: &str) -> Result<(), NodeError> {
        if self.is_started() {
            return Err(NodeError::Misuse("cannot change the bind address of a running node"));
        }

        let parsed = BindAddr::parse(address)?;
        let (listener, effective) = BoundListener::bind(&parsed, address)?;

        self.bind = Some(BoundState {
            listener: Some(listener),
            address: effective,
        });

        Ok(())
    }

    /// The effective bound endpoint, if any.
    pub fn bind_address(&self) -> Option<&str> {
        self.bind.as_ref().map(|bound| bound.address.as_str())
    }

    /// Replaces the built-in dialer used for outbound peer connections.
    /// Must be called before `start`.
    pub fn set_connect_func(&mut self, connect: impl ConnectFunc) -> Result<(), NodeError> {
        if self.is_started() {
            return Err(NodeError::Misuse("cannot change the dialer of a running node"));
        }

        self.proxy.set_connect_func(Arc::new(connect));
        Ok(())
    }

    /// Derives the consensus heartbeat and election timeouts from the
    /// average one-way network latency, in nanoseconds (at least 500 µs).
    /// Must be called before `start`.
    pub fn set_network_latency(&mut self, nanoseconds: u64) -> Result<(), NodeError> {
        if self.is_started() {
            return Err(NodeError::Misuse("cannot tune a running node"));
        }

        if !self.tuning.set_network_latency(nanoseconds) {
            return Err(NodeError::Misuse("network latency must be at least 500 microseconds"));
        }

        Ok(())
    }

    /// Number of live client connections. Zero while stopped.
    pub fn num_connections(&self) -> usize {
        self.registry
            .as_ref()
            .and_then(|registry| registry.blocking_count().ok())
            .unwrap_or(0)
    }

    /// Starts the node: bootstraps the cluster when this is node 1 and no
    /// configuration exists yet, spawns the loop thread, and returns once
    /// the loop is ready to accept connections.
    pub fn start(&mut self) -> Result<(), NodeError> {
        if self.is_started() {
            return Err(NodeError::Misuse("node is already started"));
        }

        let bound = self.bind.as_mut().ok_or(NodeError::Misuse("bind address is not set"))?;
        if bound.listener.is_none() {
            return Err(NodeError::Misuse("a stopped node cannot be restarted"));
        }

        if self.config.id == BOOTSTRAP_NODE_ID {
            let raft = self
                .raft
                .as_mut()
                .ok_or(NodeError::Misuse("consensus engine is not available"))?;

            let mut configuration = Configuration::new();
            configuration.add(self.config.id, &self.config.address, true);

            match raft.bootstrap(configuration) {
                Ok(()) => info!(id = self.config.id, "bootstrapped a new cluster configuration"),
                Err(RaftError::CantBootstrap) => debug!("cluster configuration already exists"),
                Err(error) => {
                    return Err(anyhow::Error::new(error)
                        .context("couldn't bootstrap the cluster")
                        .into())
                }
            }
        }

        let listener = bound.listener.take().ok_or(NodeError::Misuse("a stopped node cannot be restarted"))?;
        let raft = self.raft.take().ok_or(NodeError::Misuse("consensus engine is not available"))?;
        let fsm = self.fsm.take().ok_or(NodeError::Misuse("a stopped node cannot be restarted"))?;

        self.proxy.init(self.config.id, &self.config.address);

        let (stop_handle, stop_signal) = StopHandle::new();
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (registry_handle, registry_rx) = registry_channel();

        let context = LoopContext {
            listener,
            raft,
            fsm,
            proxy: self.proxy.clone(),
            handler: Arc::clone(&self.handler),
            registry: registry_handle.clone(),
            registry_rx,
            running: Arc::clone(&self.running),
            ready: ready_tx,
            stop: stop_signal,
            data_dir: self.config.data_dir.clone(),
            tuning: self.tuning,
        };

        let thread = std::thread::Builder::new()
            .name(format!("replidb-node-{}", self.config.id))
            .spawn(move || run_loop(context))
            .context("couldn't spawn the node loop thread")?;

        // Block until the loop posts ready (also posted on startup
        // failure, so this cannot hang on a broken engine).
        let ready = ready_rx.recv();

        if ready.is_err() || !*self.running.lock() {
            let exit = thread
                .join()
                .map_err(|_| anyhow::anyhow!("the node loop thread panicked during startup"))?;
            self.raft = Some(exit.raft);
            let error = exit
                .result
                .err()
                .unwrap_or_else(|| anyhow::anyhow!("node failed to start"));
            return Err(NodeError::Internal(error.context("node failed to start")));
        }

        self.registry = Some(registry_handle);
        self.state = NodeState::Running { stop_handle, thread };

        Ok(())
    }

    /// Stops the node: closes client connections and the consensus
    /// engine, tears the loop down, and joins the loop thread.
    pub fn stop(&mut self) -> Result<(), NodeError> {
        let NodeState::Running { stop_handle, thread } = std::mem::replace(&mut self.state, NodeState::Stopped)
        else {
            return Err(NodeError::Misuse("node is not running"));
        };

        info!(id = self.config.id, "stopping node");

        {
            // The flag goes down before the wake, so anything observing
            // the stop signal also observes running == false.
            let mut running = self.running.lock();
            *running = false;
            stop_handle.signal();
        }

        self.registry = None;

        let exit = thread
            .join()
            .map_err(|_| anyhow::anyhow!("the node loop thread panicked"))?;
        self.raft = Some(exit.raft);

        exit.result.map_err(NodeError::Internal)
    }

    /// Overwrites the persisted cluster configuration with an
    /// operator-supplied membership, for hand-reforming a cluster that
    /// lost its majority. The node must be stopped; see the consensus
    /// engine's documentation for the full recovery procedure.
    pub fn recover(&mut self, infos: &[NodeInfo]) -> Result<(), NodeError> {
        if self.is_started() {
            return Err(NodeError::Misuse("cannot recover a running node"));
        }

        let raft = self
            .raft
            .as_mut()
            .ok_or(NodeError::Misuse("consensus engine is not available"))?;

        let mut configuration = Configuration::new();
        for info in infos {
            configuration.add(info.id, &info.address, true);
        }

        raft.recover(configuration)
            .map_err(|error| anyhow::Error::new(error).context("couldn't recover the configuration"))?;

        Ok(())
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if self.is_started() {
            warn!(id = self.config.id, "node dropped while running; stopping it");
            if let Err(error) = self.stop() {
                error!(error = format!("{error:#}"), "couldn't stop the node on drop");
            }
        }
    }
}

struct LoopContext {
    listener: BoundListener,
    raft: Box<dyn Raft>,
    fsm: Box<dyn ReplicationFsm>,
    proxy: RaftProxy,
    handler: Arc<dyn ClientHandler>,
    registry: RegistryHandle,
    registry_rx: RegistryReceiver,
    running: Arc<Mutex<bool>>,
    ready: std_mpsc::Sender<()>,
    stop: StopSignal,
    data_dir: Utf8PathBuf,
    tuning: Tuning,
}

struct LoopExit {
    result: anyhow::Result<()>,
    raft: Box<dyn Raft>,
}

fn run_loop(context: LoopContext) -> LoopExit {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            let _ = context.ready.send(());
            return LoopExit {
                result: Err(anyhow::Error::new(error).context("couldn't build the loop runtime")),
                raft: context.raft,
            };
        }
    };

    let exit = runtime.block_on(loop_main(context));

    // Backstop for detached connection tasks and stray blocking work.
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);

    exit
}

async fn loop_main(context: LoopContext) -> LoopExit {
    let LoopContext {
        listener,
        mut raft,
        fsm,
        proxy,
        handler,
        registry,
        registry_rx,
        running,
        ready,
        stop,
        data_dir,
        tuning,
    } = context;

    let (tasks_stop, tasks_signal) = StopHandle::new();
    let mut tasks = TaskSet::new();

    tasks.spawn(
        "connection registry",
        ConnRegistryTask::new(registry_rx).run(tasks_signal.clone()),
    );
    tasks.spawn(
        "node listener",
        NodeListener::new(listener, proxy.clone(), handler, registry.clone()).run(tasks_signal),
    );

    let raft_context = RaftContext {
        transport: proxy.clone(),
        fsm,
        data_dir,
        tuning,
    };

    if let Err(error) = raft.start(raft_context).await {
        // Post ready anyway: the caller unblocks, sees running == false,
        // and start surfaces the failure.
        let _ = ready.send(());
        drop(tasks);
        return LoopExit {
            result: Err(anyhow::Error::new(error).context("consensus engine failed to start")),
            raft,
        };
    }

    // The loop is up: release the caller.
    *running.lock() = true;
    let _ = ready.send(());

    trace!("node loop is ready");

    stop.stopped().await;

    // Stop sequence: connections first, then the engine, then the
    // listener and registry.
    if let Err(error) = registry.kill_all().await {
        debug!(error = format!("{error:#}"), "couldn't signal connections to stop");
    }

    tokio::select! {
        result = registry.wait_drained() => {
            if let Err(error) = result {
                debug!(error = format!("{error:#}"), "couldn't await connection drain");
            }
        }
        _ = tokio::time::sleep(STOP_DRAIN_TIMEOUT) => {
            warn!("some connections didn't close in time");
        }
    }

    raft.close().await;
    proxy.close();

    tasks_stop.signal();
    tasks.join_all().await;

    LoopExit {
        result: Ok(()),
        raft,
    }
}
