//! Book-keeping for live client connections, kept by an actor task on the
//! loop thread so the stop path can reach every connection.

use core::fmt;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context as _;
use replidb_task::StopSignal;
use tap::Pipe as _;
use tokio::sync::{mpsc, oneshot, Notify};

pub(crate) type ConnId = u64;

enum RegistryMessage {
    Insert {
        id: ConnId,
        kill: Arc<Notify>,
    },
    Remove {
        id: ConnId,
    },
    Count {
        channel: oneshot::Sender<usize>,
    },
    /// Wake every connection's kill notify.
    KillAll,
    /// Resolves once the registry is empty.
    WaitDrained {
        channel: oneshot::Sender<()>,
    },
}

impl fmt::Debug for RegistryMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryMessage::Insert { id, kill: _ } => {
                f.debug_struct("Insert").field("id", id).finish_non_exhaustive()
            }
            RegistryMessage::Remove { id } => f.debug_struct("Remove").field("id", id).finish(),
            RegistryMessage::Count { channel: _ } => f.debug_struct("Count").finish_non_exhaustive(),
            RegistryMessage::KillAll => f.debug_struct("KillAll").finish(),
            RegistryMessage::WaitDrained { channel: _ } => f.debug_struct("WaitDrained").finish_non_exhaustive(),
        }
    }
}

#[derive(Clone)]
pub(crate) struct RegistryHandle(mpsc::Sender<RegistryMessage>);

impl RegistryHandle {
    pub(crate) async fn insert(&self, id: ConnId, kill: Arc<Notify>) -> anyhow::Result<()> {
        self.0
            .send(RegistryMessage::Insert { id, kill })
            .await
            .ok()
            .context("couldn't send Insert message")
    }

    pub(crate) async fn remove(&self, id: ConnId) -> anyhow::Result<()> {
        self.0
            .send(RegistryMessage::Remove { id })
            .await
            .ok()
            .context("couldn't send Remove message")
    }

    pub(crate) async fn count(&self) -> anyhow::Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.0
            .send(RegistryMessage::Count { channel: tx })
            .await
            .ok()
            .context("couldn't send Count message")?;
        rx.await.context("couldn't receive connection count")
    }

    /// Blocking variant for the controlling thread. Must not be called
    /// from async context.
    pub(crate) fn blocking_count(&self) -> anyhow::Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.0
            .blocking_send(RegistryMessage::Count { channel: tx })
            .ok()
            .context("couldn't send Count message")?;
        rx.blocking_recv().context("couldn't receive connection count")
    }

    pub(crate) async fn kill_all(&self) -> anyhow::Result<()> {
        self.0
            .send(RegistryMessage::KillAll)
            .await
            .ok()
            .context("couldn't send KillAll message")
    }

    pub(crate) async fn wait_drained(&self) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.0
            .send(RegistryMessage::WaitDrained { channel: tx })
            .await
            .ok()
            .context("couldn't send WaitDrained message")?;
        rx.await.context("couldn't receive drained notification")
    }
}

pub(crate) struct RegistryReceiver(mpsc::Receiver<RegistryMessage>);

pub(crate) fn registry_channel() -> (RegistryHandle, RegistryReceiver) {
    mpsc::channel(64).pipe(|(tx, rx)| (RegistryHandle(tx), RegistryReceiver(rx)))
}

pub(crate) struct ConnRegistryTask {
    rx: RegistryReceiver,
    conns: HashMap<ConnId, Arc<Notify>>,
    drain_waiters: Vec<oneshot::Sender<()>>,
}

impl ConnRegistryTask {
    pub(crate) fn new(rx: RegistryReceiver) -> Self {
        Self {
            rx,
            conns: HashMap::new(),
            drain_waiters: Vec::new(),
        }
    }

    fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::Insert { id, kill } => {
                self.conns.insert(id, kill);
            }
            RegistryMessage::Remove { id } => {
                self.conns.remove(&id);
                self.flush_drain_waiters();
            }
            RegistryMessage::Count { channel } => {
                let _ = channel.send(self.conns.len());
            }
            RegistryMessage::KillAll => {
                for kill in self.conns.values() {
                    // notify_one leaves a permit, so a connection that has
                    // not reached its select yet still observes the kill.
                    kill.notify_one();
                }
            }
            RegistryMessage::WaitDrained { channel } => {
                self.drain_waiters.push(channel);
                self.flush_drain_waiters();
            }
        }
    }

    fn flush_drain_waiters(&mut self) {
        if self.conns.is_empty() {
            for waiter in self.drain_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    pub(crate) async fn run(mut self, stop: StopSignal) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                message = self.rx.0.recv() => {
                    match message {
                        Some(message) => self.handle_message(message),
                        None => break,
                    }
                }
                _ = stop.stopped() => break,
            }
        }

        Ok(())
    }
}
