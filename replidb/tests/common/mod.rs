//! Test fixture: nodes wired to a stub consensus engine and a no-op
//! replication FSM, standing in for the external libraries.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use replidb::{
    Configuration, LogEntry, Node, NodeId, Raft, RaftContext, RaftError, RaftProxy, ReplicationFsm, Tuning,
};

/// Everything the stub engine observed, for assertions.
#[derive(Default)]
pub struct EngineState {
    pub bootstrapped: Option<Configuration>,
    pub recovered: Option<Configuration>,
    pub started: bool,
    pub closed: bool,
    pub tuning: Option<Tuning>,
    pub transport: Option<RaftProxy>,
    pub peers: Vec<(NodeId, String)>,
}

pub struct StubRaft {
    state: Arc<Mutex<EngineState>>,
    fail_start: bool,
    accept_task: Option<tokio::task::JoinHandle<()>>,
}

impl StubRaft {
    pub fn new(state: Arc<Mutex<EngineState>>) -> Self {
        Self {
            state,
            fail_start: false,
            accept_task: None,
        }
    }

    pub fn failing(state: Arc<Mutex<EngineState>>) -> Self {
        Self {
            state,
            fail_start: true,
            accept_task: None,
        }
    }
}

#[async_trait]
impl Raft for StubRaft {
    fn bootstrap(&mut self, configuration: Configuration) -> Result<(), RaftError> {
        let mut state = self.state.lock().unwrap();
        if state.bootstrapped.is_some() {
            return Err(RaftError::CantBootstrap);
        }
        state.bootstrapped = Some(configuration);
        Ok(())
    }

    fn recover(&mut self, configuration: Configuration) -> Result<(), RaftError> {
        self.state.lock().unwrap().recovered = Some(configuration);
        Ok(())
    }

    async fn start(&mut self, context: RaftContext) -> Result<(), RaftError> {
        if self.fail_start {
            return Err(RaftError::Other(anyhow::anyhow!("stub engine start failure")));
        }

        let mut listener = context.transport.listen();
        let state = Arc::clone(&self.state);
        self.accept_task = Some(tokio::spawn(async move {
            while let Some(peer) = listener.accept().await {
                state.lock().unwrap().peers.push((peer.id, peer.address));
            }
        }));

        let mut state = self.state.lock().unwrap();
        state.started = true;
        state.tuning = Some(context.tuning);
        state.transport = Some(context.transport);

        Ok(())
    }

    async fn close(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        self.state.lock().unwrap().closed = true;
    }
}

pub struct NoopFsm;

impl ReplicationFsm for NoopFsm {
    fn apply(&mut self, _entry: &LogEntry) -> anyhow::Result<()> {
        Ok(())
    }

    fn snapshot(&mut self) -> anyhow::Result<Bytes> {
        Ok(Bytes::new())
    }

    fn restore(&mut self, _snapshot: Bytes) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct TestNode {
    pub node: Node,
    pub state: Arc<Mutex<EngineState>>,
    _data_dir: tempfile::TempDir,
}

pub fn test_node(id: NodeId, address: &str) -> TestNode {
    build_node(id, address, StubRaft::new)
}

pub fn failing_node(id: NodeId, address: &str) -> TestNode {
    build_node(id, address, StubRaft::failing)
}

fn build_node(id: NodeId, address: &str, engine: fn(Arc<Mutex<EngineState>>) -> StubRaft) -> TestNode {
    let data_dir = tempfile::tempdir().expect("couldn't create a temporary data directory");
    let state = Arc::new(Mutex::new(EngineState::default()));

    let node = Node::builder(id, address, data_dir.path().to_str().expect("non-UTF-8 temp path"))
        .raft(engine(Arc::clone(&state)))
        .fsm(NoopFsm)
        .build()
        .expect("couldn't build the node");

    TestNode {
        node,
        state,
        _data_dir: data_dir,
    }
}

/// Polls `condition` until it holds or five seconds elapse.
pub fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Connects to a node's abstract local-domain endpoint from this process.
#[cfg(target_os = "linux")]
pub fn connect_local(endpoint: &str) -> std::os::unix::net::UnixStream {
    use std::os::linux::net::SocketAddrExt as _;

    let name = endpoint.strip_prefix('@').expect("not a local-domain endpoint");
    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())
        .expect("couldn't build the abstract address");
    std::os::unix::net::UnixStream::connect_addr(&addr).expect("couldn't connect to the node")
}
