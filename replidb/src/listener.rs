//! Listening socket ownership and the intake policy for accepted streams.
//!
//! Sockets are bound (and put in the listen state, backlog 128) when the
//! bind address is configured, before any event loop exists; the accept
//! loop proper only starts on the loop thread, where the std sockets are
//! registered with the runtime.

use std::sync::Arc;

use anyhow::Context as _;
use replidb_task::StopSignal;
use tokio::sync::Notify;

use crate::bind_addr::BindAddr;
use crate::conn::Conn;
use crate::handler::ClientHandler;
#[cfg(unix)]
use crate::local;
use crate::proxy::RaftProxy;
use crate::registry::RegistryHandle;
use crate::stream::NodeStream;

/// A bound, listening socket held between `set_bind_address` and start.
pub(crate) enum BoundListener {
    Tcp(std::net::TcpListener),
    #[cfg(unix)]
    Local(std::os::unix::net::UnixListener),
}

impl BoundListener {
    /// Binds the parsed endpoint and returns the listener together with
    /// the effective endpoint string: the caller's own string for the
    /// network family, the kernel-reported `@`-prefixed name for the
    /// local-domain family.
    pub(crate) fn bind(addr: &BindAddr, requested: &str) -> anyhow::Result<(Self, String)> {
        match addr {
            BindAddr::Tcp { .. } => {
                let socket_addr = addr.resolve().context("couldn't resolve the bind address")?;
                let listener =
                    std::net::TcpListener::bind(socket_addr).context("couldn't bind the TCP listener")?;
                Ok((BoundListener::Tcp(listener), requested.to_owned()))
            }
            #[cfg(unix)]
            BindAddr::Local { path } => {
                let (listener, effective) =
                    local::bind_abstract(path.as_deref()).context("couldn't bind the local-domain listener")?;
                Ok((BoundListener::Local(listener), effective))
            }
            #[cfg(not(unix))]
            BindAddr::Local { .. } => anyhow::bail!("local-domain endpoints are not supported on this platform"),
        }
    }

    /// Registers the socket with the current runtime. Loop thread only.
    fn into_async(self) -> anyhow::Result<AsyncListener> {
        match self {
            BoundListener::Tcp(listener) => {
                listener.set_nonblocking(true)?;
                Ok(AsyncListener::Tcp(tokio::net::TcpListener::from_std(listener)?))
            }
            #[cfg(unix)]
            BoundListener::Local(listener) => {
                listener.set_nonblocking(true)?;
                Ok(AsyncListener::Local(tokio::net::UnixListener::from_std(listener)?))
            }
        }
    }
}

enum AsyncListener {
    Tcp(tokio::net::TcpListener),
    #[cfg(unix)]
    Local(tokio::net::UnixListener),
}

/// The accept-loop task: applies the intake policy to every accepted
/// stream and spawns a connection for the survivors.
pub(crate) struct NodeListener {
    bound: BoundListener,
    intake: Intake,
}

impl NodeListener {
    pub(crate) fn new(
        bound: BoundListener,
        proxy: RaftProxy,
        handler: Arc<dyn ClientHandler>,
        registry: RegistryHandle,
    ) -> Self {
        Self {
            bound,
            intake: Intake {
                proxy,
                handler,
                registry,
                next_conn_id: 0,
            },
        }
    }

    pub(crate) async fn run(self, stop: StopSignal) -> anyhow::Result<()> {
        tokio::select! {
            result = self.accept_loop() => result,
            _ = stop.stopped() => Ok(()),
        }
    }

    async fn accept_loop(self) -> anyhow::Result<()> {
        let NodeListener { bound, mut intake } = self;
        let listener = bound.into_async().context("couldn't register the listener")?;

        match listener {
            AsyncListener::Tcp(listener) => loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        if let Err(error) = stream.set_nodelay(true) {
                            debug!(%error, "set_nodelay failed");
                        }
                        debug!(peer = %peer_addr, "accepted TCP stream");
                        intake.admit(NodeStream::Tcp(stream)).await;
                    }
                    Err(error) => error!(%error, "failed to accept connection"),
                }
            },
            #[cfg(unix)]
            AsyncListener::Local(listener) => loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        // Local-domain endpoints serve in-process clients
                        // only; anybody else is turned away at the door.
                        let peer_pid = stream.peer_cred().ok().and_then(|cred| cred.pid());
                        if !local::is_own_process(peer_pid) {
                            warn!(?peer_pid, "rejecting local-domain stream from another process");
                            continue;
                        }
                        debug!("accepted local-domain stream");
                        intake.admit(NodeStream::Local(stream)).await;
                    }
                    Err(error) => error!(%error, "failed to accept connection"),
                }
            },
        }
    }
}

struct Intake {
    proxy: RaftProxy,
    handler: Arc<dyn ClientHandler>,
    registry: RegistryHandle,
    next_conn_id: u64,
}

impl Intake {
    async fn admit(&mut self, stream: NodeStream) {
        let id = self.next_conn_id;
        self.next_conn_id += 1;

        let kill = Arc::new(Notify::new());
        if let Err(error) = self.registry.insert(id, Arc::clone(&kill)).await {
            // Registration failed: close the stream instead of serving it.
            error!(error = format!("{error:#}"), "couldn't register connection");
            return;
        }

        let conn = Conn {
            id,
            stream,
            proxy: self.proxy.clone(),
            handler: Arc::clone(&self.handler),
            registry: self.registry.clone(),
            kill,
        };

        // Detached: the connection unregisters itself, and the loop
        // runtime reaps anything left at shutdown.
        let _ = tokio::task::spawn(conn.run());
    }
}
