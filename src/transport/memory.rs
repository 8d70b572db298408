//! In-process connections
//!
//! Used to wire a device link straight into a relay without sockets, and
//! by the test suite to play the remote peer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Connection, Connector, DEFAULT_QUEUE};
use crate::{Error, Result};

/// Create two connected ends
#[must_use]
pub fn pair() -> (Connection, Connection) {
    let (a_tx, a_rx) = mpsc::channel(DEFAULT_QUEUE);
    let (b_tx, b_rx) = mpsc::channel(DEFAULT_QUEUE);
    (Connection::new(a_tx, b_rx), Connection::new(b_tx, a_rx))
}

/// Accepting side of a [`MemoryConnector`]
#[derive(Debug)]
pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<Connection>,
}

impl MemoryListener {
    /// Wait for the next connection
    pub async fn accept(&mut self) -> Option<Connection> {
        self.incoming.recv().await
    }
}

/// Connector handing the remote end of each connection to a [`MemoryListener`]
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    outgoing: mpsc::UnboundedSender<Connection>,
    refusing: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

impl MemoryConnector {
    #[must_use]
    pub fn new() -> (Self, MemoryListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                outgoing: tx,
                refusing: Arc::new(AtomicBool::new(false)),
                attempts: Arc::new(AtomicUsize::new(0)),
            },
            MemoryListener { incoming: rx },
        )
    }

    /// Make subsequent connects fail (or succeed again)
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Total connect attempts, successful or not
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Connection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if self.refusing.load(Ordering::SeqCst) {
            return Err(Error::Transport("connection refused".to_string()));
        }

        let (local, remote) = pair();
        self.outgoing
            .send(remote)
            .map_err(|_| Error::Transport("listener closed".to_string()))?;
        Ok(local)
    }

    fn endpoint(&self) -> String {
        "memory".to_string()
    }
}
